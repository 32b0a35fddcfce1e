//! Session lifecycle management.
//!
//! The session manager owns every live session: its PTY, client roster,
//! history buffer, orphan timer, and fan-out. Lookup goes through a global
//! registry lock held only for the index operation; all per-session state
//! sits behind one per-session mutex, so one slow session never stalls
//! another. Outbound frames are enqueued with `try_send` — a client whose
//! queue cannot accept is treated as a failed transport and removed from
//! every session it is attached to.

use crate::config::ServerConfig;
use crate::session::history::HistoryBuffer;
use crate::session::pty::PtyHandle;
use shmux_core::messages::{CloseReason, ServerMessage, SessionFilter, SessionInfo, SessionKind};
use shmux_core::{ShmuxError, ShmuxResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outbound frame queue for one connected client.
pub type ClientSender = mpsc::Sender<ServerMessage>;

/// Capacity/timer knobs the manager enforces.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_sessions_total: usize,
    pub max_clients_per_session: usize,
    pub history_size: usize,
    pub history_enabled: bool,
    pub orphan_timeout: Duration,
    /// `None` disables idle reaping.
    pub idle_timeout: Option<Duration>,
}

impl From<&ServerConfig> for SessionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_sessions_total: config.max_sessions_total,
            max_clients_per_session: config.max_clients_per_session,
            history_size: config.history_size,
            history_enabled: config.history_enabled,
            orphan_timeout: Duration::from_millis(config.orphan_timeout),
            idle_timeout: (config.idle_timeout > 0)
                .then(|| Duration::from_millis(config.idle_timeout)),
        }
    }
}

/// Everything needed to register a freshly spawned PTY as a session.
pub struct SessionSpec {
    pub id: String,
    pub kind: SessionKind,
    pub pty: PtyHandle,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub owner_id: String,
    pub owner_tx: ClientSender,
    pub container: Option<String>,
    pub label: Option<String>,
    pub allow_join: bool,
    pub enable_history: bool,
}

/// One attached client.
struct ClientRecord {
    sender: ClientSender,
    #[allow(dead_code)]
    joined_at: Instant,
    last_activity: Instant,
}

/// Mutable per-session state, serialized by the session mutex.
struct SessionShared {
    roster: HashMap<String, ClientRecord>,
    accepting: bool,
    cols: u16,
    rows: u16,
    history: HistoryBuffer,
    orphaned_at: Option<Instant>,
    orphan_timer: Option<JoinHandle<()>>,
    last_activity: Instant,
    closed: bool,
}

/// A shared terminal: PTY plus roster, history, and lifecycle state.
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub shell: String,
    pub cwd: String,
    pub container: Option<String>,
    pub label: Option<String>,
    pub owner_id: String,
    /// Unix milliseconds.
    pub created_at: u64,
    pub history_enabled: bool,
    pty: PtyHandle,
    shared: Mutex<SessionShared>,
}

/// Manages all active sessions.
pub struct SessionManager {
    limits: SessionLimits,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    client_sessions: RwLock<HashMap<String, HashSet<String>>>,
    /// Client ids whose outbound queue failed; drained by a background
    /// task that removes them everywhere.
    failed_tx: mpsc::UnboundedSender<String>,
}

impl SessionManager {
    /// Create a manager and start its transport-failure reaper task.
    pub fn new(limits: SessionLimits) -> Arc<Self> {
        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel::<String>();
        let manager = Arc::new(Self {
            limits,
            sessions: RwLock::new(HashMap::new()),
            client_sessions: RwLock::new(HashMap::new()),
            failed_tx,
        });

        let weak: Weak<SessionManager> = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(client_id) = failed_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                warn!(client_id = %client_id, "client transport failed, detaching everywhere");
                manager.remove_client_everywhere(&client_id).await;
            }
        });

        manager
    }

    /// Register a spawned PTY as a new session with `owner` as its first
    /// roster member, emit `spawned` to the owner, and start the output
    /// pump. Fails with `CapacityExhausted` at the global session cap.
    pub async fn create(self: &Arc<Self>, spec: SessionSpec) -> ShmuxResult<SessionInfo> {
        let SessionSpec {
            id,
            kind,
            pty,
            mut output,
            shell,
            cwd,
            cols,
            rows,
            owner_id,
            owner_tx,
            container,
            label,
            allow_join,
            enable_history,
        } = spec;

        let history_enabled = enable_history && self.limits.history_enabled;
        let now = Instant::now();

        let session = {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.limits.max_sessions_total {
                if let Err(e) = pty.kill() {
                    debug!(error = %e, "pty kill after capacity rejection");
                }
                return Err(ShmuxError::CapacityExhausted(format!(
                    "session limit ({}) reached",
                    self.limits.max_sessions_total
                )));
            }

            let mut roster = HashMap::new();
            roster.insert(
                owner_id.clone(),
                ClientRecord {
                    sender: owner_tx.clone(),
                    joined_at: now,
                    last_activity: now,
                },
            );

            let session = Arc::new(Session {
                id: id.clone(),
                kind,
                shell: shell.clone(),
                cwd: cwd.clone(),
                container: container.clone(),
                label,
                owner_id: owner_id.clone(),
                created_at: unix_millis(),
                history_enabled,
                pty,
                shared: Mutex::new(SessionShared {
                    roster,
                    accepting: allow_join,
                    cols,
                    rows,
                    history: HistoryBuffer::new(if history_enabled {
                        self.limits.history_size
                    } else {
                        0
                    }),
                    orphaned_at: None,
                    orphan_timer: None,
                    last_activity: now,
                    closed: false,
                }),
            });
            sessions.insert(id.clone(), session.clone());
            session
        };

        self.client_sessions
            .write()
            .await
            .entry(owner_id.clone())
            .or_default()
            .insert(id.clone());

        // Queue `spawned` ahead of any PTY output so the owner observes it
        // first. The pump starts only after this.
        let info = {
            let shared = session.shared.lock().await;
            if owner_tx
                .try_send(ServerMessage::Spawned {
                    session_id: id.clone(),
                    shell,
                    cwd,
                    cols,
                    rows,
                    container,
                })
                .is_err()
            {
                let _ = self.failed_tx.send(owner_id.clone());
            }
            self.session_info_locked(&session, &shared)
        };

        info!(session_id = %id, kind = kind.as_str(), owner = %owner_id, "session created");

        let manager = self.clone();
        let pump_session = session.clone();
        let session_id = id;
        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                manager.handle_output(&session_id, &chunk).await;
            }
            match pump_session.pty.wait().await {
                Ok(code) => manager.handle_exit(&session_id, code).await,
                Err(e) => {
                    // The child can no longer be reaped; force-close.
                    warn!(session_id = %session_id, error = %e, "pty wait failed");
                    manager.close_session(&session_id, CloseReason::Error).await;
                }
            }
        });

        Ok(info)
    }

    /// Look up a session by id.
    pub async fn get(&self, session_id: &str) -> ShmuxResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ShmuxError::SessionNotFound(session_id.to_string()))
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Number of live sessions whose recorded owner is `client_id`.
    pub async fn owned_by(&self, client_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.owner_id == client_id)
            .count()
    }

    /// List sessions, optionally filtered by kind, container, or
    /// accepting-only.
    pub async fn list(&self, filter: Option<&SessionFilter>) -> Vec<SessionInfo> {
        let snapshot: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(snapshot.len());
        for session in snapshot {
            let shared = session.shared.lock().await;
            if shared.closed {
                continue;
            }
            if let Some(filter) = filter {
                if let Some(kind) = filter.kind {
                    if session.kind != kind {
                        continue;
                    }
                }
                if let Some(ref container) = filter.container {
                    if session.container.as_deref() != Some(container.as_str()) {
                        continue;
                    }
                }
                if let Some(accepting) = filter.accepting {
                    if shared.accepting != accepting {
                        continue;
                    }
                }
            }
            out.push(self.session_info_locked(&session, &shared));
        }
        out
    }

    /// Public snapshot of one session.
    pub async fn info(&self, session_id: &str) -> ShmuxResult<SessionInfo> {
        let session = self.get(session_id).await?;
        let shared = session.shared.lock().await;
        Ok(self.session_info_locked(&session, &shared))
    }

    /// Attach a client. On success the joiner's `joined` frame (with the
    /// history snapshot, when requested) and the `client_joined` broadcast
    /// are queued under the session lock, so the snapshot plus subsequent
    /// live frames form a gapless stream.
    pub async fn add_client(
        self: &Arc<Self>,
        session_id: &str,
        client_id: &str,
        sender: ClientSender,
        request_history: bool,
        history_limit: Option<usize>,
    ) -> ShmuxResult<()> {
        let session = self.get(session_id).await?;
        let mut failed: Vec<String> = Vec::new();

        {
            let mut shared = session.shared.lock().await;
            if shared.closed {
                return Err(ShmuxError::SessionNotFound(session_id.to_string()));
            }
            if !shared.accepting {
                return Err(ShmuxError::NotAccepting(session_id.to_string()));
            }
            if shared.roster.len() >= self.limits.max_clients_per_session
                && !shared.roster.contains_key(client_id)
            {
                return Err(ShmuxError::RosterFull(session_id.to_string()));
            }

            if let Some(timer) = shared.orphan_timer.take() {
                timer.abort();
            }
            shared.orphaned_at = None;

            let now = Instant::now();
            shared.roster.insert(
                client_id.to_string(),
                ClientRecord {
                    sender: sender.clone(),
                    joined_at: now,
                    last_activity: now,
                },
            );
            let count = shared.roster.len();

            let history = if request_history && session.history_enabled {
                let bytes = shared.history.snapshot(history_limit);
                Some(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                None
            };

            let info = self.session_info_locked(&session, &shared);
            if sender
                .try_send(ServerMessage::Joined {
                    session_id: session_id.to_string(),
                    session: info,
                    history,
                })
                .is_err()
            {
                // The joiner cannot accept frames; undo the insert. If this
                // join was reclaiming an orphan, the roster is empty again
                // and the reclaim timer must come back.
                shared.roster.remove(client_id);
                if shared.roster.is_empty() && !shared.closed {
                    self.arm_orphan_timer(session_id, &mut shared);
                }
                return Err(ShmuxError::Transport(format!(
                    "client {client_id} queue not accepting"
                )));
            }

            for (id, record) in &shared.roster {
                if id == client_id {
                    continue;
                }
                if record
                    .sender
                    .try_send(ServerMessage::ClientJoined {
                        session_id: session_id.to_string(),
                        client_count: count,
                    })
                    .is_err()
                {
                    failed.push(id.clone());
                }
            }
        }

        self.client_sessions
            .write()
            .await
            .entry(client_id.to_string())
            .or_default()
            .insert(session_id.to_string());

        info!(session_id, client_id, "client joined session");

        for id in failed {
            let _ = self.failed_tx.send(id);
        }
        Ok(())
    }

    /// Detach a client. No-op (returns false) if the client is not a
    /// roster member. An emptied roster transitions the session into the
    /// orphaned state and arms the reclaim timer.
    pub async fn remove_client(self: &Arc<Self>, session_id: &str, client_id: &str) -> bool {
        let Ok(session) = self.get(session_id).await else {
            return false;
        };
        let mut failed: Vec<String> = Vec::new();

        let removed = {
            let mut shared = session.shared.lock().await;
            if shared.roster.remove(client_id).is_none() {
                return false;
            }
            let count = shared.roster.len();

            for (id, record) in &shared.roster {
                if record
                    .sender
                    .try_send(ServerMessage::ClientLeft {
                        session_id: session_id.to_string(),
                        client_count: count,
                    })
                    .is_err()
                {
                    failed.push(id.clone());
                }
            }

            if shared.roster.is_empty() && !shared.closed {
                self.arm_orphan_timer(session_id, &mut shared);
            }
            true
        };

        {
            let mut clients = self.client_sessions.write().await;
            if let Some(set) = clients.get_mut(client_id) {
                set.remove(session_id);
                if set.is_empty() {
                    clients.remove(client_id);
                }
            }
        }

        info!(session_id, client_id, "client left session");

        for id in failed {
            let _ = self.failed_tx.send(id);
        }
        removed
    }

    /// Detach a client from every session it is attached to. Used on
    /// transport closure.
    pub async fn remove_client_everywhere(self: &Arc<Self>, client_id: &str) {
        let session_ids: Vec<String> = self
            .client_sessions
            .read()
            .await
            .get(client_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        for session_id in session_ids {
            self.remove_client(&session_id, client_id).await;
        }

        self.client_sessions.write().await.remove(client_id);
    }

    /// Forward client keystrokes to the session's PTY. The client must be
    /// a roster member.
    pub async fn write(&self, session_id: &str, client_id: &str, data: Vec<u8>) -> ShmuxResult<()> {
        let session = self.get(session_id).await?;
        {
            let mut shared = session.shared.lock().await;
            let now = Instant::now();
            let record = shared
                .roster
                .get_mut(client_id)
                .ok_or_else(|| ShmuxError::NotJoined(session_id.to_string()))?;
            record.last_activity = now;
            shared.last_activity = now;
        }
        session.pty.write(data).await
    }

    /// Resize the session's terminal. Any roster member may resize; the
    /// last writer wins. No frame is emitted to clients.
    pub async fn resize(
        &self,
        session_id: &str,
        client_id: &str,
        cols: u16,
        rows: u16,
    ) -> ShmuxResult<()> {
        let session = self.get(session_id).await?;
        {
            let mut shared = session.shared.lock().await;
            if !shared.roster.contains_key(client_id) {
                return Err(ShmuxError::NotJoined(session_id.to_string()));
            }
            shared.cols = cols;
            shared.rows = rows;
            shared.last_activity = Instant::now();
        }
        session.pty.resize(cols, rows)
    }

    /// Owner-gated close. A non-owner requester is detached instead and
    /// the session stays up; returns whether the session was closed.
    pub async fn close(
        self: &Arc<Self>,
        session_id: &str,
        requester_client_id: &str,
    ) -> ShmuxResult<bool> {
        let session = self.get(session_id).await?;
        if session.owner_id != requester_client_id {
            self.remove_client(session_id, requester_client_id).await;
            return Ok(false);
        }
        self.close_session(session_id, CloseReason::OwnerClosed).await;
        Ok(true)
    }

    /// Copy of the session's history, optionally limited to the last
    /// `limit` bytes.
    pub async fn snapshot_history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> ShmuxResult<Vec<u8>> {
        let session = self.get(session_id).await?;
        let shared = session.shared.lock().await;
        Ok(shared.history.snapshot(limit))
    }

    /// Enter the orphaned state: stamp `orphaned_at` and arm the reclaim
    /// timer. Caller holds the session lock and has verified the roster
    /// is empty.
    fn arm_orphan_timer(self: &Arc<Self>, session_id: &str, shared: &mut SessionShared) {
        shared.orphaned_at = Some(Instant::now());
        let weak = Arc::downgrade(self);
        let orphan_id = session_id.to_string();
        let timeout = self.limits.orphan_timeout;
        shared.orphan_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = weak.upgrade() {
                manager
                    .close_session_impl(&orphan_id, CloseReason::OrphanTimeout, true)
                    .await;
            }
        }));
        debug!(session_id, "session orphaned, reclaim timer armed");
    }

    /// Tear a session down: broadcast `session_closed{reason}`, kill the
    /// PTY, cancel the orphan timer, drop every index entry.
    pub async fn close_session(self: &Arc<Self>, session_id: &str, reason: CloseReason) {
        self.close_session_impl(session_id, reason, false).await;
    }

    async fn close_session_impl(
        self: &Arc<Self>,
        session_id: &str,
        reason: CloseReason,
        only_if_orphaned: bool,
    ) {
        let session = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get(session_id).cloned() else {
                return;
            };
            if only_if_orphaned {
                // The timer may have lost a race with a rejoin.
                let shared = session.shared.lock().await;
                if !shared.roster.is_empty() || shared.closed {
                    return;
                }
            }
            sessions.remove(session_id);
            session
        };

        let members: Vec<String> = {
            let mut shared = session.shared.lock().await;
            shared.closed = true;
            if let Some(timer) = shared.orphan_timer.take() {
                timer.abort();
            }
            let mut failed = Vec::new();
            for (id, record) in &shared.roster {
                if record
                    .sender
                    .try_send(ServerMessage::SessionClosed {
                        session_id: session_id.to_string(),
                        reason,
                    })
                    .is_err()
                {
                    failed.push(id.clone());
                }
            }
            for id in failed {
                let _ = self.failed_tx.send(id);
            }
            let members = shared.roster.keys().cloned().collect();
            shared.roster.clear();
            members
        };

        {
            let mut clients = self.client_sessions.write().await;
            for member in &members {
                if let Some(set) = clients.get_mut(member) {
                    set.remove(session_id);
                    if set.is_empty() {
                        clients.remove(member);
                    }
                }
            }
        }

        if let Err(e) = session.pty.kill() {
            debug!(session_id, error = %e, "pty kill on close");
        }

        info!(session_id, reason = ?reason, "session closed");
    }

    /// Close every session. Used on server shutdown.
    pub async fn cleanup(self: &Arc<Self>) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.close_session(&id, CloseReason::Cleanup).await;
        }
    }

    /// One sweep of the idle reaper: sessions whose last activity is older
    /// than the idle timeout receive `exit{-1}` then
    /// `session_closed{idle_timeout}` and are torn down.
    pub async fn reap_idle(self: &Arc<Self>) {
        let Some(idle_timeout) = self.limits.idle_timeout else {
            return;
        };

        let snapshot: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        for session in snapshot {
            let expired = {
                let shared = session.shared.lock().await;
                !shared.closed && shared.last_activity.elapsed() >= idle_timeout
            };
            if !expired {
                continue;
            }

            {
                let shared = session.shared.lock().await;
                let mut failed = Vec::new();
                for (id, record) in &shared.roster {
                    if record
                        .sender
                        .try_send(ServerMessage::Exit {
                            session_id: session.id.clone(),
                            exit_code: -1,
                        })
                        .is_err()
                    {
                        failed.push(id.clone());
                    }
                }
                for id in failed {
                    let _ = self.failed_tx.send(id);
                }
            }

            warn!(session_id = %session.id, "session idle timeout");
            self.close_session(&session.id, CloseReason::IdleTimeout).await;
        }
    }

    /// PTY output entry point: update activity, append to history, fan out
    /// to the roster — atomically with respect to joins, so every client
    /// observes the same ordered stream.
    async fn handle_output(self: &Arc<Self>, session_id: &str, chunk: &[u8]) {
        let Ok(session) = self.get(session_id).await else {
            return;
        };
        let text = String::from_utf8_lossy(chunk).into_owned();
        let mut failed: Vec<String> = Vec::new();

        {
            let mut shared = session.shared.lock().await;
            shared.last_activity = Instant::now();
            if session.history_enabled {
                shared.history.append(text.as_bytes());
            }
            for (id, record) in &shared.roster {
                if record
                    .sender
                    .try_send(ServerMessage::Data {
                        session_id: session_id.to_string(),
                        data: text.clone(),
                    })
                    .is_err()
                {
                    failed.push(id.clone());
                }
            }
        }

        for id in failed {
            let _ = self.failed_tx.send(id);
        }
    }

    /// Child exit entry point: fan out `exit{code}` then tear down with
    /// reason `process_exit`. Reported at most once; a session already
    /// torn down (owner close, timeout, cleanup) is skipped.
    async fn handle_exit(self: &Arc<Self>, session_id: &str, code: i32) {
        let Ok(session) = self.get(session_id).await else {
            return;
        };

        {
            let shared = session.shared.lock().await;
            let mut failed = Vec::new();
            for (id, record) in &shared.roster {
                if record
                    .sender
                    .try_send(ServerMessage::Exit {
                        session_id: session_id.to_string(),
                        exit_code: code,
                    })
                    .is_err()
                {
                    failed.push(id.clone());
                }
            }
            for id in failed {
                let _ = self.failed_tx.send(id);
            }
        }

        self.close_session(session_id, CloseReason::ProcessExit).await;
    }

    fn session_info_locked(&self, session: &Session, shared: &SessionShared) -> SessionInfo {
        SessionInfo {
            session_id: session.id.clone(),
            kind: session.kind,
            shell: session.shell.clone(),
            cwd: session.cwd.clone(),
            cols: shared.cols,
            rows: shared.rows,
            created_at: session.created_at,
            container: session.container.clone(),
            client_count: shared.roster.len(),
            accepting: shared.accepting,
            owner_id: Some(session.owner_id.clone()),
            label: session.label.clone(),
            history_enabled: session.history_enabled,
        }
    }
}

/// Canonical session id: `term-<unix-millis>-<random>`.
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let random: [u8; 4] = rng.gen();
    format!("term-{}-{}", unix_millis(), hex::encode(random))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
