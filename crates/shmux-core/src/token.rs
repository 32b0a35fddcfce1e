//! HMAC-signed claims tokens.
//!
//! A bearer token carries the user id and permission set so the gateway can
//! authenticate without a user database. Format:
//! `base64url(claims JSON) "." base64url(HMAC-SHA256 over the claims)`.

use crate::error::{ShmuxError, ShmuxResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::hmac;
use serde::{Deserialize, Serialize};

/// The signed claims inside a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Expiry as unix seconds. Absent = no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sign `claims` with `secret`, producing a bearer token string.
pub fn sign_claims(secret: &[u8], claims: &TokenClaims) -> ShmuxResult<String> {
    let payload = serde_json::to_vec(claims)?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &payload);
    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&payload),
        URL_SAFE_NO_PAD.encode(tag.as_ref())
    ))
}

/// Verify a bearer token against `secret` and return its claims.
///
/// Checks the HMAC signature first, then the expiry.
pub fn verify_claims(secret: &[u8], token: &str) -> ShmuxResult<TokenClaims> {
    let (payload_b64, tag_b64) = token
        .split_once('.')
        .ok_or_else(|| ShmuxError::Token("malformed token".into()))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| ShmuxError::Token("malformed token payload".into()))?;
    let tag = URL_SAFE_NO_PAD
        .decode(tag_b64)
        .map_err(|_| ShmuxError::Token("malformed token signature".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &payload, &tag)
        .map_err(|_| ShmuxError::Token("invalid token signature".into()))?;

    let claims: TokenClaims = serde_json::from_slice(&payload)
        .map_err(|e| ShmuxError::Token(format!("invalid claims: {e}")))?;

    if let Some(exp) = claims.exp {
        if now_secs() > exp {
            return Err(ShmuxError::Token("token expired".into()));
        }
    }

    Ok(claims)
}

/// Generate a random shared secret (32 bytes).
pub fn generate_secret() -> ShmuxResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| ShmuxError::Token("RNG failure".into()))?;
    Ok(secret)
}
