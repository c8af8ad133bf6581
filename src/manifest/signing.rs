//! RSA-SHA256 manifest signing.
//!
//! Clients that send `expo-expect-signature` get the JSON body signed with
//! the server's private key; the signature travels as
//! `sig="<base64>", keyid="main"`. The key is lazy-read from local disk or
//! the configured bucket (`KEYS_STORAGE_TYPE`) on first use. A missing key
//! degrades to unsigned responses with a logged warning — never a failure.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::config::{KeysStorageType, ServerConfig};
use crate::store::UpdateStore;

/// Bucket key of the private key when `KEYS_STORAGE_TYPE` is not local.
const BUCKET_PRIVATE_KEY: &str = "keys/private-key.pem";
const KEY_ID: &str = "main";

pub struct ManifestSigner {
    key: OnceCell<Option<Arc<SigningKey<Sha256>>>>,
}

impl Default for ManifestSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestSigner {
    pub fn new() -> Self {
        Self {
            key: OnceCell::new(),
        }
    }

    /// Sign `body`, or return `None` when no usable key is configured.
    pub async fn signature_header(
        &self,
        config: &ServerConfig,
        store: &Arc<dyn UpdateStore>,
        body: &str,
    ) -> Option<String> {
        let key = self
            .key
            .get_or_init(|| load_signing_key(config.clone(), Arc::clone(store)))
            .await
            .as_ref()?;
        let signature = key.sign(body.as_bytes());
        Some(format!(
            "sig=\"{}\", keyid=\"{KEY_ID}\"",
            BASE64_STANDARD.encode(signature.to_bytes())
        ))
    }
}

async fn load_signing_key(
    config: ServerConfig,
    store: Arc<dyn UpdateStore>,
) -> Option<Arc<SigningKey<Sha256>>> {
    let pem = match config.keys_storage_type {
        KeysStorageType::Local => {
            let path = match &config.private_key_path {
                Some(path) => path.clone(),
                None => {
                    warn!("no private key configured — manifests will be unsigned");
                    return None;
                }
            };
            match tokio::fs::read_to_string(&path).await {
                Ok(pem) => pem,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "private key unreadable — manifests will be unsigned");
                    return None;
                }
            }
        }
        KeysStorageType::S3 | KeysStorageType::Firebase => {
            match store.read_object(BUCKET_PRIVATE_KEY).await {
                Ok(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(pem) => pem,
                    Err(_) => {
                        warn!(key = BUCKET_PRIVATE_KEY, "private key is not UTF-8 — manifests will be unsigned");
                        return None;
                    }
                },
                Err(e) => {
                    warn!(key = BUCKET_PRIVATE_KEY, error = %e, "private key unreadable — manifests will be unsigned");
                    return None;
                }
            }
        }
    };

    match parse_private_key(&pem) {
        Ok(key) => Some(Arc::new(SigningKey::new(key))),
        Err(e) => {
            warn!(error = %e, "private key failed to parse — manifests will be unsigned");
            None
        }
    }
}

fn parse_private_key(pem: &str) -> anyhow::Result<RsaPrivateKey> {
    if pem.contains("BEGIN RSA PRIVATE KEY") {
        Ok(RsaPrivateKey::from_pkcs1_pem(pem)?)
    } else {
        Ok(RsaPrivateKey::from_pkcs8_pem(pem)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::VerifyingKey;
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::signature::Verifier;

    #[test]
    fn signature_verifies_with_the_public_half() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let signing = SigningKey::<Sha256>::new(private.clone());
        let verifying = VerifyingKey::<Sha256>::new(private.to_public_key());

        let body = r#"{"id":"abc"}"#;
        let signature = signing.sign(body.as_bytes());
        verifying.verify(body.as_bytes(), &signature).unwrap();
    }

    #[test]
    fn pem_parse_accepts_pkcs8() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pem = private
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        assert!(parse_private_key(&pem).is_ok());
    }
}
