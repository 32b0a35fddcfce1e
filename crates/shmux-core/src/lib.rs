//! shmux-core: Shared protocol library for the shmux terminal gateway.
//!
//! Provides the JSON wire message types, the workspace error type, and the
//! HMAC claims token used by the signed-token auth provider.

pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use error::{ShmuxError, ShmuxResult};
pub use messages::{
    ClientMessage, CloseReason, ContainerInfo, ServerInfo, ServerMessage, SessionFilter,
    SessionInfo, SessionKind, SpawnOptions,
};
pub use token::{generate_secret, sign_claims, verify_claims, TokenClaims};
