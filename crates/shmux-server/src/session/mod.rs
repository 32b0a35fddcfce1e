//! Session multiplexing: PTY-backed terminals shared by many clients.

pub mod history;
pub mod manager;
pub mod pty;

pub use manager::{SessionLimits, SessionManager, SessionSpec};
pub use pty::{PtyHandle, SpawnProfile};
