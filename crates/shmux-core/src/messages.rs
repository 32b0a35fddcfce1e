//! JSON wire protocol for the shmux terminal gateway.
//!
//! Every frame is a JSON object with a mandatory `type` tag. PTY bytes and
//! client keystrokes travel as JSON strings; payloads may contain arbitrary
//! UTF-8 including escape sequences. The message set is closed: anything
//! that does not decode into [`ClientMessage`] is rejected by the
//! connection handler.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What kind of child process backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    Local,
    ContainerExec,
    ContainerAttach,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::ContainerExec => "container-exec",
            Self::ContainerAttach => "container-attach",
        }
    }
}

/// Why a session was torn down, as broadcast in `session_closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    OrphanTimeout,
    OwnerClosed,
    ProcessExit,
    Error,
    IdleTimeout,
    Cleanup,
}

/// An authenticated (or anonymous) user as carried in `auth_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl UserContext {
    /// Whether this user holds `permission` or the `admin` superset.
    pub fn permits(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission || p == "admin")
    }
}

fn default_true() -> bool {
    true
}

/// Options accepted by the `spawn` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnOptions {
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub container: Option<String>,
    pub container_shell: Option<String>,
    pub container_user: Option<String>,
    pub container_cwd: Option<String>,
    #[serde(default)]
    pub attach_mode: bool,
    pub label: Option<String>,
    #[serde(default = "default_true")]
    pub allow_join: bool,
    #[serde(default = "default_true")]
    pub enable_history: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            shell: None,
            cwd: None,
            env: None,
            cols: None,
            rows: None,
            container: None,
            container_shell: None,
            container_user: None,
            container_cwd: None,
            attach_mode: false,
            label: None,
            allow_join: true,
            enable_history: true,
        }
    }
}

/// Options accepted by the `join` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinOptions {
    pub session_id: String,
    #[serde(default)]
    pub request_history: bool,
    #[serde(default)]
    pub history_limit: Option<usize>,
}

/// Filter for `list_sessions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFilter {
    #[serde(rename = "type")]
    pub kind: Option<SessionKind>,
    pub container: Option<String>,
    pub accepting: Option<bool>,
}

/// Public snapshot of one session, as listed and as returned on join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    /// Unix milliseconds.
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub client_count: usize,
    pub accepting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub history_enabled: bool,
}

/// One row from the container runtime's `ps` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: ContainerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Paused,
    Exited,
    Unknown,
}

impl ContainerState {
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            _ => Self::Unknown,
        }
    }
}

/// Capabilities advertised in `server_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub docker_enabled: bool,
    pub allowed_shells: Vec<String>,
    pub default_shell: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_container_shell: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_auth: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserContext>,
}

/// Frames a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        headers: Option<HashMap<String, String>>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    Spawn {
        options: SpawnOptions,
    },
    Data {
        session_id: String,
        data: String,
    },
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    Close {
        session_id: String,
    },
    Join {
        options: JoinOptions,
    },
    Leave {
        session_id: String,
    },
    ListSessions {
        #[serde(default)]
        filter: Option<SessionFilter>,
    },
    ListContainers,
}

/// Frames the server may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ServerInfo {
        info: ServerInfo,
    },
    AuthResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<UserContext>,
    },
    PermissionDenied {
        operation: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission: Option<String>,
        error: String,
    },
    Spawned {
        session_id: String,
        shell: String,
        cwd: String,
        cols: u16,
        rows: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        container: Option<String>,
    },
    Data {
        session_id: String,
        data: String,
    },
    Exit {
        session_id: String,
        exit_code: i32,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: String,
    },
    ContainerList {
        containers: Vec<ContainerInfo>,
    },
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    Joined {
        session_id: String,
        session: SessionInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        history: Option<String>,
    },
    Left {
        session_id: String,
    },
    ClientJoined {
        session_id: String,
        client_count: usize,
    },
    ClientLeft {
        session_id: String,
        client_count: usize,
    },
    SessionClosed {
        session_id: String,
        reason: CloseReason,
    },
}
