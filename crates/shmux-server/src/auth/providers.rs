//! Concrete permission-gate policies.

use super::{
    check_permission_set, AuthCredentials, AuthProvider, ConnectionMeta, Decision, Operation,
};
use async_trait::async_trait;
use shmux_core::messages::UserContext;
use shmux_core::{ShmuxError, ShmuxResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Grants every operation to everyone. The default when no policy is
/// configured.
#[derive(Debug, Default)]
pub struct AllowAllProvider;

#[async_trait]
impl AuthProvider for AllowAllProvider {
    async fn check(&self, _user: Option<&UserContext>, _op: Operation) -> Decision {
        Decision::Allow
    }
}

/// One user entry in the in-memory role table.
#[derive(Debug, Clone)]
pub struct TableUser {
    pub password: Option<String>,
    pub roles: Vec<String>,
    pub username: Option<String>,
}

/// Role-mapped in-memory table: user → roles → permissions.
#[derive(Debug, Default)]
pub struct RoleTableProvider {
    users: HashMap<String, TableUser>,
    roles: HashMap<String, Vec<String>>,
    anonymous_permissions: Vec<String>,
}

impl RoleTableProvider {
    pub fn new(
        users: HashMap<String, TableUser>,
        roles: HashMap<String, Vec<String>>,
        anonymous_permissions: Vec<String>,
    ) -> Self {
        Self {
            users,
            roles,
            anonymous_permissions,
        }
    }

    fn permissions_for(&self, user: &TableUser) -> Vec<String> {
        let mut perms = Vec::new();
        for role in &user.roles {
            if let Some(role_perms) = self.roles.get(role) {
                for p in role_perms {
                    if !perms.contains(p) {
                        perms.push(p.clone());
                    }
                }
            }
        }
        perms
    }
}

#[async_trait]
impl AuthProvider for RoleTableProvider {
    async fn authenticate_message(&self, creds: &AuthCredentials) -> ShmuxResult<UserContext> {
        let data = creds
            .data
            .as_ref()
            .ok_or_else(|| ShmuxError::AuthFailed("missing credentials".into()))?;
        let user_id = data
            .get("user_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ShmuxError::AuthFailed("missing user_id".into()))?;
        let entry = self
            .users
            .get(user_id)
            .ok_or_else(|| ShmuxError::AuthFailed("unknown user".into()))?;

        if let Some(ref expected) = entry.password {
            let supplied = data.get("password").and_then(|v| v.as_str());
            if supplied != Some(expected.as_str()) {
                return Err(ShmuxError::AuthFailed("invalid password".into()));
            }
        }

        Ok(UserContext {
            user_id: user_id.to_string(),
            username: entry.username.clone(),
            permissions: self.permissions_for(entry),
            metadata: None,
        })
    }

    async fn check(&self, user: Option<&UserContext>, op: Operation) -> Decision {
        check_permission_set(user, op)
    }

    fn anonymous_user(&self) -> Option<UserContext> {
        Some(UserContext {
            user_id: "anonymous".into(),
            username: None,
            permissions: self.anonymous_permissions.clone(),
            metadata: None,
        })
    }
}

/// Session-cookie lookup: the transport's cookie header names a key in a
/// server-side session map.
#[derive(Debug)]
pub struct CookieSessionProvider {
    cookie_name: String,
    sessions: RwLock<HashMap<String, UserContext>>,
}

impl CookieSessionProvider {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a server-side session (e.g. minted by an external login
    /// flow).
    pub fn insert_session(&self, cookie_value: impl Into<String>, user: UserContext) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(cookie_value.into(), user);
        }
    }

    pub fn remove_session(&self, cookie_value: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(cookie_value);
        }
    }
}

#[async_trait]
impl AuthProvider for CookieSessionProvider {
    async fn authenticate_connection(&self, meta: &ConnectionMeta) -> Option<UserContext> {
        let value = meta.cookie(&self.cookie_name)?;
        let sessions = self.sessions.read().ok()?;
        sessions.get(value).cloned()
    }

    async fn check(&self, user: Option<&UserContext>, op: Operation) -> Decision {
        check_permission_set(user, op)
    }
}

/// Try-in-order composition of policies. Authentication stops at the first
/// provider that succeeds; a permission check passes if any provider
/// allows, otherwise the last denial is returned.
pub struct CompositeProvider {
    providers: Vec<Arc<dyn AuthProvider>>,
}

impl CompositeProvider {
    pub fn new(providers: Vec<Arc<dyn AuthProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl AuthProvider for CompositeProvider {
    async fn authenticate_connection(&self, meta: &ConnectionMeta) -> Option<UserContext> {
        for provider in &self.providers {
            if let Some(user) = provider.authenticate_connection(meta).await {
                return Some(user);
            }
        }
        None
    }

    async fn authenticate_message(&self, creds: &AuthCredentials) -> ShmuxResult<UserContext> {
        let mut last_err = ShmuxError::AuthFailed("no providers configured".into());
        for provider in &self.providers {
            match provider.authenticate_message(creds).await {
                Ok(user) => return Ok(user),
                Err(e) => {
                    debug!(error = %e, "composite provider candidate rejected credentials");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn check(&self, user: Option<&UserContext>, op: Operation) -> Decision {
        let mut last = Decision::deny("no providers configured");
        for provider in &self.providers {
            match provider.check(user, op).await {
                Decision::Allow => return Decision::Allow,
                deny => last = deny,
            }
        }
        last
    }

    fn anonymous_user(&self) -> Option<UserContext> {
        self.providers.iter().find_map(|p| p.anonymous_user())
    }

    async fn on_disconnect(&self, client_id: &str) {
        for provider in &self.providers {
            provider.on_disconnect(client_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoleTableProvider {
        let mut users = HashMap::new();
        users.insert(
            "alice".to_string(),
            TableUser {
                password: Some("s3cret".into()),
                roles: vec!["operator".into()],
                username: Some("Alice".into()),
            },
        );
        let mut roles = HashMap::new();
        roles.insert(
            "operator".to_string(),
            vec!["spawn_session".into(), "join_session".into(), "list_sessions".into()],
        );
        RoleTableProvider::new(users, roles, vec!["list_sessions".into()])
    }

    fn creds(user: &str, password: &str) -> AuthCredentials {
        AuthCredentials {
            token: None,
            headers: None,
            data: Some(serde_json::json!({ "user_id": user, "password": password })),
        }
    }

    #[tokio::test]
    async fn allow_all_allows_everything() {
        let p = AllowAllProvider;
        assert!(p.check(None, Operation::SpawnSession).await.is_allow());
        assert!(p.check(None, Operation::Admin).await.is_allow());
    }

    #[tokio::test]
    async fn role_table_authenticates_and_maps_roles() {
        let p = table();
        let user = p.authenticate_message(&creds("alice", "s3cret")).await.unwrap();
        assert_eq!(user.user_id, "alice");
        assert!(user.permits("spawn_session"));
        assert!(!user.permits("close_session"));
        assert!(p.check(Some(&user), Operation::JoinSession).await.is_allow());
        assert!(!p.check(Some(&user), Operation::ListContainers).await.is_allow());
    }

    #[tokio::test]
    async fn role_table_rejects_bad_password_and_unknown_user() {
        let p = table();
        assert!(p.authenticate_message(&creds("alice", "wrong")).await.is_err());
        assert!(p.authenticate_message(&creds("bob", "s3cret")).await.is_err());
    }

    #[tokio::test]
    async fn role_table_anonymous_set() {
        let p = table();
        let anon = p.anonymous_user().unwrap();
        assert!(p.check(Some(&anon), Operation::ListSessions).await.is_allow());
        assert!(!p.check(Some(&anon), Operation::SpawnSession).await.is_allow());
    }

    #[tokio::test]
    async fn cookie_provider_looks_up_session_map() {
        let p = CookieSessionProvider::new("sid");
        p.insert_session(
            "abc",
            UserContext {
                user_id: "carol".into(),
                username: None,
                permissions: vec!["admin".into()],
                metadata: None,
            },
        );

        let mut meta = ConnectionMeta::default();
        meta.headers.insert("cookie".into(), "sid=abc".into());
        let user = p.authenticate_connection(&meta).await.unwrap();
        assert_eq!(user.user_id, "carol");

        meta.headers.insert("cookie".into(), "sid=nope".into());
        assert!(p.authenticate_connection(&meta).await.is_none());
    }

    #[tokio::test]
    async fn composite_first_success_wins() {
        let cookie = Arc::new(CookieSessionProvider::new("sid"));
        let composite = CompositeProvider::new(vec![cookie.clone(), Arc::new(table())]);

        // Cookie provider cannot answer message credentials; the table can.
        let user = composite
            .authenticate_message(&creds("alice", "s3cret"))
            .await
            .unwrap();
        assert_eq!(user.user_id, "alice");

        // Any provider allowing is enough.
        assert!(composite
            .check(Some(&user), Operation::SpawnSession)
            .await
            .is_allow());
        assert!(!composite
            .check(Some(&user), Operation::CloseSession)
            .await
            .is_allow());
    }
}
