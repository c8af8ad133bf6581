//! Publisher authentication and upload-token issuance.
//!
//! The identity verifier is an external collaborator: the core hands it a
//! bearer token and gets back `{uid, claims}` or a failure. Deployments that
//! set `EXPO_ACCESS_TOKEN` get the built-in static verifier; everything else
//! is denied unless the request arrives from localhost (dev mode).
//!
//! Upload tokens are HS256 JWTs binding subject, expiry, action, and the
//! exact target file path, so `/uploadLocalFile` can refuse any write whose
//! resolved path differs from what was signed.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;

/// The only action an upload token may authorize.
pub const UPLOAD_ACTION: &str = "uploadLocalFile";
const UPLOAD_SUBJECT: &str = "publisher";

// ─── Upload tokens ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadTokenClaims {
    pub sub: String,
    pub action: String,
    #[serde(rename = "filePath")]
    pub file_path: String,
    pub exp: u64,
}

pub fn issue_upload_token(secret: &str, file_path: &str, ttl: Duration) -> Result<String> {
    let exp = chrono::Utc::now().timestamp() as u64 + ttl.as_secs();
    let claims = UploadTokenClaims {
        sub: UPLOAD_SUBJECT.to_string(),
        action: UPLOAD_ACTION.to_string(),
        file_path: file_path.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("failed to sign upload token")
}

/// Decode and validate an upload token: signature, expiry, subject, action.
/// The caller still has to compare `file_path` against the resolved target.
pub fn verify_upload_token(secret: &str, token: &str) -> Result<UploadTokenClaims> {
    let data = decode::<UploadTokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .context("invalid upload token")?;
    if data.claims.sub != UPLOAD_SUBJECT {
        bail!("upload token has wrong subject");
    }
    if data.claims.action != UPLOAD_ACTION {
        bail!("upload token has wrong action");
    }
    Ok(data.claims)
}

// ─── Identity verifier ────────────────────────────────────────────────────────

/// The authenticated caller, as reported by the identity verifier.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub uid: String,
    pub claims: serde_json::Value,
}

/// External identity-verifier contract. The core treats tokens as opaque;
/// any failure maps to 401 at the HTTP layer.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify_bearer_token(&self, token: &str) -> Result<AuthUser>;
}

/// Verifier backed by the single static `EXPO_ACCESS_TOKEN`.
pub struct AccessTokenVerifier {
    expected: String,
}

#[async_trait]
impl IdentityVerifier for AccessTokenVerifier {
    async fn verify_bearer_token(&self, token: &str) -> Result<AuthUser> {
        // Constant-time-ish comparison; the token is high-entropy so a simple
        // length check first does not leak anything useful.
        if token.len() == self.expected.len()
            && token
                .bytes()
                .zip(self.expected.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
        {
            Ok(AuthUser {
                uid: "access-token".to_string(),
                claims: serde_json::json!({}),
            })
        } else {
            bail!("access token mismatch")
        }
    }
}

/// Verifier used when no publisher credential is configured.
pub struct DenyAllVerifier;

#[async_trait]
impl IdentityVerifier for DenyAllVerifier {
    async fn verify_bearer_token(&self, _token: &str) -> Result<AuthUser> {
        bail!("no publisher credential configured")
    }
}

pub fn verifier_from_config(config: &ServerConfig) -> Arc<dyn IdentityVerifier> {
    match &config.expo_access_token {
        Some(token) => Arc::new(AccessTokenVerifier {
            expected: token.clone(),
        }),
        None => Arc::new(DenyAllVerifier),
    }
}

/// Dev-mode short-circuit: requests whose Host resolves to localhost skip
/// the verifier entirely.
pub fn is_localhost_host(host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_token_roundtrip_binds_path() {
        let token =
            issue_upload_token("secret", "updates/main/1.0.0/u1/a.png", Duration::from_secs(60))
                .unwrap();
        let claims = verify_upload_token("secret", &token).unwrap();
        assert_eq!(claims.file_path, "updates/main/1.0.0/u1/a.png");
        assert_eq!(claims.action, UPLOAD_ACTION);
    }

    #[test]
    fn upload_token_rejects_wrong_secret() {
        let token = issue_upload_token("secret", "updates/x", Duration::from_secs(60)).unwrap();
        assert!(verify_upload_token("other-secret", &token).is_err());
    }

    #[tokio::test]
    async fn static_verifier_accepts_only_the_configured_token() {
        let verifier = AccessTokenVerifier {
            expected: "tok-123".to_string(),
        };
        assert!(verifier.verify_bearer_token("tok-123").await.is_ok());
        assert!(verifier.verify_bearer_token("tok-124").await.is_err());
        assert!(verifier.verify_bearer_token("tok").await.is_err());
    }

    #[test]
    fn localhost_hosts_are_recognized() {
        assert!(is_localhost_host("localhost:3000"));
        assert!(is_localhost_host("127.0.0.1"));
        assert!(!is_localhost_host("updates.example.com"));
    }
}
