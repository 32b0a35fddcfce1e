//! Server host: accepts WebSocket connections and wires up the session
//! manager, permission gate, and connection handlers.

use crate::auth::ConnectionMeta;
use crate::config::ServerConfig;
use crate::connection;
use crate::docker::ContainerPattern;
use crate::session::manager::{SessionLimits, SessionManager};
use shmux_core::{ShmuxError, ShmuxResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

/// Idle sweeper granularity.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A running terminal gateway.
pub struct TerminalServer {
    config: Arc<ServerConfig>,
    manager: Arc<SessionManager>,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
    sweeper_task: JoinHandle<()>,
}

impl TerminalServer {
    /// Bind on the configured port and start accepting connections.
    pub async fn bind(config: ServerConfig) -> ShmuxResult<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
            .parse()
            .map_err(|e| ShmuxError::Config(format!("invalid address: {e}")))?;
        Self::bind_addr(config, addr).await
    }

    /// Bind on an explicit address (port 0 picks an ephemeral port).
    pub async fn bind_addr(config: ServerConfig, addr: SocketAddr) -> ShmuxResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ShmuxError::Transport(format!("bind failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ShmuxError::Transport(format!("local_addr failed: {e}")))?;

        let config = Arc::new(config);
        let manager = SessionManager::new(SessionLimits::from(config.as_ref()));
        let container_patterns: Arc<Vec<ContainerPattern>> = Arc::new(
            config
                .allowed_container_patterns
                .iter()
                .map(|p| ContainerPattern::compile(p))
                .collect(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        let sweeper_manager = manager.clone();
        let sweeper_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                sweeper_manager.reap_idle().await;
            }
        });

        let accept_config = config.clone();
        let accept_manager = manager.clone();
        let accept_patterns = container_patterns.clone();
        let accept_shutdown = shutdown_tx.clone();
        let next_client_id = Arc::new(AtomicU64::new(1));
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let n = next_client_id.fetch_add(1, Ordering::Relaxed);
                        let client_id = format!("client-{n}");
                        debug!(remote = %peer, client_id = %client_id, "connection accepted");
                        let config = accept_config.clone();
                        let manager = accept_manager.clone();
                        let patterns = accept_patterns.clone();
                        let shutdown_rx = accept_shutdown.subscribe();
                        tokio::spawn(async move {
                            handle_connection(
                                stream,
                                client_id,
                                config,
                                manager,
                                patterns,
                                shutdown_rx,
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "tcp accept failed");
                    }
                }
            }
        });

        info!(
            addr = %local_addr,
            path = %config.ws_path,
            docker = config.allow_container_exec,
            auth = config.auth_provider.is_some(),
            "terminal gateway listening"
        );

        Ok(Self {
            config,
            manager,
            local_addr,
            shutdown_tx,
            accept_task,
            sweeper_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Stop accepting, cancel the sweeper, close every session, and notify
    /// connected clients. Best effort only; no delivery guarantees during
    /// shutdown.
    pub async fn shutdown(self) {
        info!("shutting down terminal gateway");
        let _ = self.shutdown_tx.send(());
        self.sweeper_task.abort();
        self.accept_task.abort();
        self.manager.cleanup().await;
    }
}

/// Upgrade one TCP connection to WebSocket and hand it to a connection
/// handler. The upgrade request must target the configured path; its
/// headers and query parameters become the transport metadata for
/// connection-time authentication.
async fn handle_connection(
    stream: TcpStream,
    client_id: String,
    config: Arc<ServerConfig>,
    manager: Arc<SessionManager>,
    patterns: Arc<Vec<ContainerPattern>>,
    shutdown_rx: broadcast::Receiver<()>,
) {
    let expected_path = config.ws_path.clone();
    let mut meta = ConnectionMeta::default();

    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != expected_path {
            let mut not_found = ErrorResponse::new(Some("not found".to_string()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                meta.headers
                    .insert(name.as_str().to_lowercase(), value.to_string());
            }
        }
        if let Some(query) = req.uri().query() {
            for pair in query.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    meta.query.insert(k.to_string(), v.to_string());
                }
            }
        }
        Ok(response)
    };

    match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => {
            connection::serve(ws, meta, client_id, config, manager, patterns, shutdown_rx).await;
        }
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "websocket handshake failed");
        }
    }
}
