//! Permission gate: pluggable policy consulted before every inbound
//! operation.
//!
//! A policy is an [`AuthProvider`]: optional connection-time and
//! credentials-message authentication, a mandatory permission check, an
//! optional anonymous-default accessor, and a disconnect hook. The `auth`
//! frame itself is never gated.

mod providers;
mod token;

pub use providers::{
    AllowAllProvider, CompositeProvider, CookieSessionProvider, RoleTableProvider, TableUser,
};
pub use token::TokenProvider;

use async_trait::async_trait;
use shmux_core::messages::UserContext;
use shmux_core::{ShmuxError, ShmuxResult};
use std::collections::HashMap;

/// The closed set of gated operations. `Admin` is strictly stronger than
/// any other: a user holding the `admin` permission passes every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SpawnSession,
    WriteSession,
    ResizeSession,
    CloseSession,
    JoinSession,
    LeaveSession,
    ListSessions,
    ListContainers,
    Admin,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnSession => "spawn_session",
            Self::WriteSession => "write_session",
            Self::ResizeSession => "resize_session",
            Self::CloseSession => "close_session",
            Self::JoinSession => "join_session",
            Self::LeaveSession => "leave_session",
            Self::ListSessions => "list_sessions",
            Self::ListContainers => "list_containers",
            Self::Admin => "admin",
        }
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Transport metadata available at connection time: the upgrade request's
/// headers (keys lowercased) and query parameters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

impl ConnectionMeta {
    /// Bearer token from the `Authorization` header or a `token` query
    /// parameter.
    pub fn bearer_token(&self) -> Option<&str> {
        if let Some(auth) = self.headers.get("authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                return Some(token);
            }
        }
        self.query.get("token").map(|s| s.as_str())
    }

    /// A named cookie from the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        let header = self.headers.get("cookie")?;
        header.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then_some(v)
        })
    }
}

/// Credentials carried by an `auth` frame.
#[derive(Debug, Clone, Default)]
pub struct AuthCredentials {
    pub token: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub data: Option<serde_json::Value>,
}

/// A pluggable authentication and authorization policy.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Authenticate from transport metadata when the connection opens.
    async fn authenticate_connection(&self, _meta: &ConnectionMeta) -> Option<UserContext> {
        None
    }

    /// Authenticate an explicit `auth` credentials message.
    async fn authenticate_message(&self, _creds: &AuthCredentials) -> ShmuxResult<UserContext> {
        Err(ShmuxError::AuthFailed(
            "credential authentication not supported".into(),
        ))
    }

    /// Decide whether `user` may perform `op`.
    async fn check(&self, user: Option<&UserContext>, op: Operation) -> Decision;

    /// The anonymous default user, handed to unauthenticated clients when
    /// anonymous access is allowed.
    fn anonymous_user(&self) -> Option<UserContext> {
        None
    }

    /// Called once when a client's transport closes.
    async fn on_disconnect(&self, _client_id: &str) {}
}

/// Shared allow/deny logic for providers that gate purely on the user's
/// granted permission strings.
pub(crate) fn check_permission_set(user: Option<&UserContext>, op: Operation) -> Decision {
    match user {
        None => Decision::deny("not authenticated"),
        Some(user) if user.permits(op.as_str()) => Decision::Allow,
        Some(_) => Decision::deny(format!("missing permission: {}", op.as_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_from_header_and_query() {
        let mut meta = ConnectionMeta::default();
        assert!(meta.bearer_token().is_none());
        meta.query.insert("token".into(), "qtok".into());
        assert_eq!(meta.bearer_token(), Some("qtok"));
        meta.headers
            .insert("authorization".into(), "Bearer htok".into());
        assert_eq!(meta.bearer_token(), Some("htok"));
    }

    #[test]
    fn cookie_parsing() {
        let mut meta = ConnectionMeta::default();
        meta.headers
            .insert("cookie".into(), "a=1; session=s3cret; b=2".into());
        assert_eq!(meta.cookie("session"), Some("s3cret"));
        assert_eq!(meta.cookie("missing"), None);
    }

    #[test]
    fn permission_set_check() {
        let user = UserContext {
            user_id: "u".into(),
            username: None,
            permissions: vec!["join_session".into()],
            metadata: None,
        };
        assert!(check_permission_set(Some(&user), Operation::JoinSession).is_allow());
        assert!(!check_permission_set(Some(&user), Operation::SpawnSession).is_allow());
        assert!(!check_permission_set(None, Operation::ListSessions).is_allow());
    }
}
