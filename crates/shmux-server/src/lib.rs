//! shmux-server: multiplexed terminal gateway.
//!
//! Exposes PTY-backed shell sessions over WebSocket so that many clients can
//! concurrently drive, share, and rejoin the same interactive terminal. The
//! binary in `main.rs` is a thin wrapper over [`server::TerminalServer`].

pub mod auth;
pub mod config;
pub mod connection;
pub mod docker;
pub mod server;
pub mod session;
