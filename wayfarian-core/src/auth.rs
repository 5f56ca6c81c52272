//! Bearer token verification.
//!
//! Tokens are opaque to every component except this one: a base64url
//! payload (`{"sub":..,"name":..,"exp":..}`) plus an HMAC-SHA256 signature
//! over that payload, both base64url-joined with a `.`. `HmacSha256` is
//! built the same way the protocol test harness builds it — `Hmac::<Sha256>
//! ::new_from_slice` — just reused here as the actual verifier rather than
//! a test fixture (§10).

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    sub: String,
    name: String,
    exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthContext, TokenError>;
}

pub struct HmacTokenVerifier {
    key: Vec<u8>,
    max_age: chrono::Duration,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>, max_age_secs: u64) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
            max_age: chrono::Duration::seconds(max_age_secs as i64),
        }
    }

    /// Build a signed token for use in tests and the issuing side of a
    /// local dev harness; production issuance lives outside this crate.
    pub fn sign(&self, user_id: &str, display_name: &str, issued_at: DateTime<Utc>) -> String {
        let payload = TokenPayload {
            sub: user_id.to_string(),
            name: display_name.to_string(),
            exp: (issued_at + self.max_age).timestamp(),
        };
        let payload_json = serde_json::to_vec(&payload).expect("token payload always serializes");
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);
        let signature = self.sign_bytes(payload_b64.as_bytes());
        format!("{payload_b64}.{signature}")
    }

    fn sign_bytes(&self, bytes: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(bytes);
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl TokenVerifier for HmacTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AuthContext, TokenError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;

        let expected = self.sign_bytes(payload_b64.as_bytes());
        if expected.as_bytes() != signature_b64.as_bytes() {
            return Err(TokenError::BadSignature);
        }

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let payload: TokenPayload =
            serde_json::from_slice(&payload_json).map_err(|_| TokenError::Malformed)?;

        if payload.exp < Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(AuthContext {
            user_id: payload.sub,
            display_name: payload.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_verifies() {
        let verifier = HmacTokenVerifier::new("secret", 3_600);
        let token = verifier.sign("user-1", "Ada", Utc::now());
        let ctx = verifier.verify(&token).await.expect("verifies");
        assert_eq!(ctx.user_id, "user-1");
        assert_eq!(ctx.display_name, "Ada");
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let signer = HmacTokenVerifier::new("secret", 3_600);
        let token = signer.sign("user-1", "Ada", Utc::now());
        let verifier = HmacTokenVerifier::new("other-secret", 3_600);
        assert!(matches!(
            verifier.verify(&token).await,
            Err(TokenError::BadSignature)
        ));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let verifier = HmacTokenVerifier::new("secret", 1);
        let token = verifier.sign("user-1", "Ada", Utc::now() - chrono::Duration::seconds(10));
        assert!(matches!(
            verifier.verify(&token).await,
            Err(TokenError::Expired)
        ));
    }

    #[tokio::test]
    async fn malformed_token_is_rejected() {
        let verifier = HmacTokenVerifier::new("secret", 3_600);
        assert!(matches!(
            verifier.verify("not-a-token").await,
            Err(TokenError::Malformed)
        ));
    }
}
