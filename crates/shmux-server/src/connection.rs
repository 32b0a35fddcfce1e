//! Per-client connection handling.
//!
//! One [`ClientConnection`] per WebSocket: decodes inbound frames, keeps
//! the authentication state, consults the permission gate for every
//! operation except `auth`, and routes to the session manager. All
//! outbound frames — direct replies and session broadcasts alike — go
//! through the connection's single ordered queue.

use crate::auth::{AuthCredentials, ConnectionMeta, Decision, Operation};
use crate::config::ServerConfig;
use crate::docker::{self, ContainerPattern};
use crate::session::manager::{generate_session_id, ClientSender, SessionManager, SessionSpec};
use crate::session::pty::{PtyHandle, SpawnProfile};
use futures_util::{SinkExt, StreamExt};
use shmux_core::messages::{
    ClientMessage, JoinOptions, ServerInfo, ServerMessage, SessionKind, SpawnOptions, UserContext,
};
use shmux_core::{ShmuxError, ShmuxResult};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Outbound queue depth per client. A client that cannot drain this many
/// frames is treated as a failed transport.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Default history replay size when a join requests history without a
/// limit.
const DEFAULT_HISTORY_LIMIT: usize = 50_000;

/// Routing state for one connected client.
pub struct ClientConnection {
    client_id: String,
    config: Arc<ServerConfig>,
    manager: Arc<SessionManager>,
    container_patterns: Arc<Vec<ContainerPattern>>,
    user: Option<UserContext>,
    tx: ClientSender,
}

impl ClientConnection {
    /// Build the handler plus the receiving end of its outbound queue.
    /// `user` is the result of connection-time authentication, if any.
    pub fn new(
        client_id: String,
        config: Arc<ServerConfig>,
        manager: Arc<SessionManager>,
        container_patterns: Arc<Vec<ContainerPattern>>,
        user: Option<UserContext>,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        (
            Self {
                client_id,
                config,
                manager,
                container_patterns,
                user,
                tx,
            },
            rx,
        )
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queue an outbound frame. Returns false when the transport is gone.
    fn queue(&self, msg: ServerMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    fn queue_error(&self, session_id: Option<String>, error: impl Into<String>) {
        self.queue(ServerMessage::Error {
            session_id,
            error: error.into(),
        });
    }

    /// The `server_info` frame for the current auth state.
    pub fn server_info(&self) -> ServerMessage {
        ServerMessage::ServerInfo {
            info: ServerInfo {
                docker_enabled: self.config.allow_container_exec,
                allowed_shells: self.config.allowed_shells.clone(),
                default_shell: self.config.default_shell.clone(),
                default_container_shell: Some(self.config.default_container_shell.clone()),
                auth_enabled: Some(self.config.auth_provider.is_some()),
                require_auth: Some(self.config.require_auth),
                user: self.user.clone(),
            },
        }
    }

    /// Consult the permission gate. `None` means allowed; a denial frame
    /// has already been queued otherwise.
    async fn gate(&self, op: Operation) -> bool {
        let Some(ref provider) = self.config.auth_provider else {
            return true;
        };

        let anonymous;
        let user = match self.user {
            Some(ref user) => Some(user),
            None if self.config.allow_anonymous => {
                anonymous = provider.anonymous_user();
                anonymous.as_ref()
            }
            None => None,
        };

        match provider.check(user, op).await {
            Decision::Allow => true,
            Decision::Deny { reason } => {
                debug!(client_id = %self.client_id, operation = op.as_str(), reason = %reason, "operation denied");
                self.queue(ServerMessage::PermissionDenied {
                    operation: op.as_str().to_string(),
                    permission: Some(op.as_str().to_string()),
                    error: reason,
                });
                false
            }
        }
    }

    /// Handle one decoded inbound frame.
    pub async fn handle(&mut self, msg: ClientMessage) {
        // Under require_auth an unauthenticated client may only send auth.
        if self.config.require_auth
            && self.user.is_none()
            && !matches!(msg, ClientMessage::Auth { .. })
        {
            self.queue_error(None, "authentication required");
            return;
        }

        match msg {
            // Auth is handled locally and never gated.
            ClientMessage::Auth { token, headers, data } => {
                self.handle_auth(AuthCredentials {
                    token,
                    headers,
                    data,
                })
                .await;
            }
            ClientMessage::Spawn { options } => {
                if self.gate(Operation::SpawnSession).await {
                    self.handle_spawn(options).await;
                }
            }
            ClientMessage::Data { session_id, data } => {
                if self.gate(Operation::WriteSession).await {
                    if let Err(e) = self
                        .manager
                        .write(&session_id, &self.client_id, data.into_bytes())
                        .await
                    {
                        self.queue_error(Some(session_id), e.to_string());
                    }
                }
            }
            ClientMessage::Resize {
                session_id,
                cols,
                rows,
            } => {
                if self.gate(Operation::ResizeSession).await {
                    if cols == 0 || rows == 0 {
                        self.queue_error(Some(session_id), "invalid terminal size");
                        return;
                    }
                    if let Err(e) = self
                        .manager
                        .resize(&session_id, &self.client_id, cols, rows)
                        .await
                    {
                        self.queue_error(Some(session_id), e.to_string());
                    }
                }
            }
            ClientMessage::Close { session_id } => {
                if self.gate(Operation::CloseSession).await {
                    if let Err(e) = self.manager.close(&session_id, &self.client_id).await {
                        self.queue_error(Some(session_id), e.to_string());
                    }
                }
            }
            ClientMessage::Join { options } => {
                if self.gate(Operation::JoinSession).await {
                    self.handle_join(options).await;
                }
            }
            ClientMessage::Leave { session_id } => {
                if self.gate(Operation::LeaveSession).await {
                    self.manager.remove_client(&session_id, &self.client_id).await;
                    self.queue(ServerMessage::Left { session_id });
                }
            }
            ClientMessage::ListSessions { filter } => {
                if self.gate(Operation::ListSessions).await {
                    let sessions = self.manager.list(filter.as_ref()).await;
                    self.queue(ServerMessage::SessionList { sessions });
                }
            }
            ClientMessage::ListContainers => {
                if self.gate(Operation::ListContainers).await {
                    self.handle_list_containers().await;
                }
            }
        }
    }

    async fn handle_auth(&mut self, creds: AuthCredentials) {
        let Some(provider) = self.config.auth_provider.clone() else {
            self.queue(ServerMessage::AuthResponse {
                success: false,
                error: Some("authentication is not enabled".into()),
                user: None,
            });
            return;
        };

        match provider.authenticate_message(&creds).await {
            Ok(user) => {
                info!(client_id = %self.client_id, user_id = %user.user_id, "client authenticated");
                self.user = Some(user.clone());
                self.queue(ServerMessage::AuthResponse {
                    success: true,
                    error: None,
                    user: Some(user),
                });
                let refreshed = self.server_info();
                self.queue(refreshed);
            }
            Err(e) => {
                debug!(client_id = %self.client_id, error = %e, "authentication failed");
                self.queue(ServerMessage::AuthResponse {
                    success: false,
                    error: Some(e.to_string()),
                    user: None,
                });
            }
        }
    }

    async fn handle_spawn(&mut self, options: SpawnOptions) {
        let owned = self.manager.owned_by(&self.client_id).await;
        if owned >= self.config.max_sessions_per_client {
            self.queue_error(
                None,
                format!(
                    "session limit per client ({}) reached",
                    self.config.max_sessions_per_client
                ),
            );
            return;
        }

        let cols = options.cols.unwrap_or(80);
        let rows = options.rows.unwrap_or(24);
        if cols == 0 || rows == 0 {
            self.queue_error(None, "invalid terminal size");
            return;
        }

        let (profile, kind, shell, cwd) = match self.build_profile(&options) {
            Ok(parts) => parts,
            Err(e) => {
                self.queue_error(None, e.to_string());
                return;
            }
        };

        let (pty, output) = match PtyHandle::spawn(&profile, cols, rows) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "spawn failed");
                self.queue_error(None, e.to_string());
                return;
            }
        };

        let spec = SessionSpec {
            id: generate_session_id(),
            kind,
            pty,
            output,
            shell,
            cwd,
            cols,
            rows,
            owner_id: self.client_id.clone(),
            owner_tx: self.tx.clone(),
            container: options.container.clone(),
            label: options.label.clone(),
            allow_join: options.allow_join,
            enable_history: options.enable_history,
        };

        // On success the manager queues the `spawned` frame itself, ahead
        // of any PTY output.
        if let Err(e) = self.manager.create(spec).await {
            self.queue_error(None, e.to_string());
        }
    }

    /// Validate spawn options against the whitelists and build the spawn
    /// profile for one of the three session kinds.
    fn build_profile(
        &self,
        options: &SpawnOptions,
    ) -> ShmuxResult<(SpawnProfile, SessionKind, String, String)> {
        if let Some(ref container) = options.container {
            if !self.config.allow_container_exec {
                return Err(ShmuxError::Other("container sessions are disabled".into()));
            }
            if !docker::container_allowed(&self.container_patterns, container, container) {
                return Err(ShmuxError::Other(format!(
                    "container not allowed: {container}"
                )));
            }

            if options.attach_mode {
                let profile = SpawnProfile::container_attach(
                    &self.config.container_runtime_path,
                    container,
                );
                let shell = self.config.container_runtime_path.clone();
                return Ok((profile, SessionKind::ContainerAttach, shell, "/".into()));
            }

            let shell = options
                .container_shell
                .clone()
                .unwrap_or_else(|| self.config.default_container_shell.clone());
            let cwd = options.container_cwd.clone().unwrap_or_else(|| "/".into());
            let profile = SpawnProfile::container_exec(
                &self.config.container_runtime_path,
                container,
                &shell,
                options.container_user.as_deref(),
                options.container_cwd.as_deref(),
                options.env.as_ref(),
            );
            return Ok((profile, SessionKind::ContainerExec, shell, cwd));
        }

        let shell = options
            .shell
            .clone()
            .unwrap_or_else(|| self.config.default_shell.clone());
        if !self.config.shell_allowed(&shell) {
            return Err(ShmuxError::Other(format!("shell not allowed: {shell}")));
        }

        let cwd = options
            .cwd
            .clone()
            .or_else(|| self.config.default_cwd.clone())
            .or_else(|| dirs::home_dir().map(|p| p.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "/".into());
        if !self.config.cwd_allowed(&cwd) {
            return Err(ShmuxError::Other(format!(
                "working directory not allowed: {cwd}"
            )));
        }

        let profile = SpawnProfile::local_shell(&shell, Some(&cwd), options.env.as_ref());
        Ok((profile, SessionKind::Local, shell, cwd))
    }

    async fn handle_join(&mut self, options: JoinOptions) {
        let JoinOptions {
            session_id,
            request_history,
            history_limit,
        } = options;

        let limit = if request_history {
            Some(history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        } else {
            None
        };

        match self
            .manager
            .add_client(
                &session_id,
                &self.client_id,
                self.tx.clone(),
                request_history,
                limit,
            )
            .await
        {
            Ok(()) => {
                // Provoke a prompt refresh for the joiner.
                if let Err(e) = self
                    .manager
                    .write(&session_id, &self.client_id, b"\n".to_vec())
                    .await
                {
                    debug!(session_id = %session_id, error = %e, "prompt refresh write failed");
                }
            }
            Err(e) => self.queue_error(Some(session_id), e.to_string()),
        }
    }

    async fn handle_list_containers(&self) {
        if !self.config.allow_container_exec {
            self.queue_error(None, "container support is disabled");
            return;
        }
        match docker::list_containers(
            &self.config.container_runtime_path,
            &self.container_patterns,
        )
        .await
        {
            Ok(containers) => {
                self.queue(ServerMessage::ContainerList { containers });
            }
            Err(e) => self.queue_error(None, e.to_string()),
        }
    }
}

/// Drive one accepted WebSocket connection to completion.
///
/// Runs connection-time authentication, emits `server_info`, then loops
/// over inbound frames and the outbound queue until the transport closes,
/// an outbound write fails, or the server shuts down. Cleanup detaches the
/// client everywhere and fires the policy's disconnect hook.
pub async fn serve(
    mut ws: WebSocketStream<TcpStream>,
    meta: ConnectionMeta,
    client_id: String,
    config: Arc<ServerConfig>,
    manager: Arc<SessionManager>,
    container_patterns: Arc<Vec<ContainerPattern>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let user = match config.auth_provider {
        Some(ref provider) => provider.authenticate_connection(&meta).await,
        None => None,
    };
    if let Some(ref user) = user {
        info!(client_id = %client_id, user_id = %user.user_id, "connection authenticated");
    }

    let (mut conn, mut outbound_rx) = ClientConnection::new(
        client_id.clone(),
        config.clone(),
        manager.clone(),
        container_patterns,
        user,
    );

    let hello = conn.server_info();
    if send_frame(&mut ws, &hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(client_id = %client_id, "shutdown signal, closing connection");
                break;
            }

            Some(msg) = outbound_rx.recv() => {
                if send_frame(&mut ws, &msg).await.is_err() {
                    debug!(client_id = %client_id, "outbound write failed");
                    break;
                }
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => conn.handle(msg).await,
                            Err(e) => {
                                conn.queue_error(None, format!("invalid message: {e}"));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client_id = %client_id, "connection closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary and pong frames are ignored.
                    }
                    Some(Err(e)) => {
                        debug!(client_id = %client_id, error = %e, "connection error");
                        break;
                    }
                }
            }
        }
    }

    manager.remove_client_everywhere(&client_id).await;
    if let Some(ref provider) = config.auth_provider {
        provider.on_disconnect(&client_id).await;
    }
    info!(client_id = %client_id, "connection finished");
}

async fn send_frame(
    ws: &mut WebSocketStream<TcpStream>,
    msg: &ServerMessage,
) -> ShmuxResult<()> {
    let text = serde_json::to_string(msg)?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| ShmuxError::Transport(format!("websocket send failed: {e}")))
}
