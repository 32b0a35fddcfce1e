use thiserror::Error;

/// Errors produced by the shmux protocol and server layers.
#[derive(Debug, Error)]
pub enum ShmuxError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("not joined to session: {0}")]
    NotJoined(String),

    #[error("session is not accepting new clients: {0}")]
    NotAccepting(String),

    #[error("session is at its client capacity: {0}")]
    RosterFull(String),

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ShmuxError {
    fn from(e: serde_json::Error) -> Self {
        ShmuxError::InvalidMessage(e.to_string())
    }
}

pub type ShmuxResult<T> = Result<T, ShmuxError>;
