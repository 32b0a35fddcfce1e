//! Signed-token policy: bearer tokens are HMAC claims tokens minted with a
//! shared secret (see `shmux_core::token`).

use super::{
    check_permission_set, AuthCredentials, AuthProvider, ConnectionMeta, Decision, Operation,
};
use async_trait::async_trait;
use shmux_core::messages::UserContext;
use shmux_core::{verify_claims, ShmuxError, ShmuxResult};
use tracing::debug;

pub struct TokenProvider {
    secret: Vec<u8>,
    anonymous_permissions: Vec<String>,
}

impl TokenProvider {
    pub fn new(secret: Vec<u8>, anonymous_permissions: Vec<String>) -> Self {
        Self {
            secret,
            anonymous_permissions,
        }
    }

    fn user_from_token(&self, token: &str) -> ShmuxResult<UserContext> {
        let claims = verify_claims(&self.secret, token)?;
        Ok(UserContext {
            user_id: claims.user_id,
            username: claims.username,
            permissions: claims.permissions,
            metadata: None,
        })
    }
}

#[async_trait]
impl AuthProvider for TokenProvider {
    async fn authenticate_connection(&self, meta: &ConnectionMeta) -> Option<UserContext> {
        let token = meta.bearer_token()?;
        match self.user_from_token(token) {
            Ok(user) => Some(user),
            Err(e) => {
                debug!(error = %e, "connection token rejected");
                None
            }
        }
    }

    async fn authenticate_message(&self, creds: &AuthCredentials) -> ShmuxResult<UserContext> {
        let token = creds
            .token
            .as_deref()
            .ok_or_else(|| ShmuxError::AuthFailed("missing token".into()))?;
        self.user_from_token(token)
            .map_err(|e| ShmuxError::AuthFailed(e.to_string()))
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

#[cfg(test)]
mod tests {
    use super::*;
    use shmux_core::{generate_secret, sign_claims, TokenClaims};

    fn provider_and_token() -> (TokenProvider, String) {
        let secret = generate_secret().unwrap();
        let token = sign_claims(
            &secret,
            &TokenClaims {
                user_id: "dave".into(),
                username: Some("Dave".into()),
                permissions: vec!["spawn_session".into(), "write_session".into()],
                exp: None,
            },
        )
        .unwrap();
        (TokenProvider::new(secret, vec![]), token)
    }

    #[tokio::test]
    async fn message_token_accepted() {
        let (provider, token) = provider_and_token();
        let creds = AuthCredentials {
            token: Some(token),
            ..Default::default()
        };
        let user = provider.authenticate_message(&creds).await.unwrap();
        assert_eq!(user.user_id, "dave");
        assert!(provider
            .check(Some(&user), Operation::SpawnSession)
            .await
            .is_allow());
        assert!(!provider
            .check(Some(&user), Operation::CloseSession)
            .await
            .is_allow());
    }

    #[tokio::test]
    async fn connection_token_via_header() {
        let (provider, token) = provider_and_token();
        let mut meta = ConnectionMeta::default();
        meta.headers
            .insert("authorization".into(), format!("Bearer {token}"));
        let user = provider.authenticate_connection(&meta).await.unwrap();
        assert_eq!(user.user_id, "dave");
    }

    #[tokio::test]
    async fn garbage_token_rejected() {
        let (provider, _) = provider_and_token();
        let creds = AuthCredentials {
            token: Some("not.a.token".into()),
            ..Default::default()
        };
        assert!(provider.authenticate_message(&creds).await.is_err());

        let mut meta = ConnectionMeta::default();
        meta.query.insert("token".into(), "junk".into());
        assert!(provider.authenticate_connection(&meta).await.is_none());
    }
}
