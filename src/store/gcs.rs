//! Cloud-bucket store over the GCS JSON API (Firebase Storage buckets are
//! plain GCS buckets underneath).
//!
//! Authentication follows the service-account flow: an RS256 assertion is
//! exchanged at the token endpoint for a short-lived access token, which is
//! cached until shortly before expiry. Upload URLs are service-relative
//! (`/uploadLocalFile` + path-bound token), the same shape the local store
//! uses, since this API has no native presigned PUTs without extra key
//! distribution.

use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::io::StreamReader;

use super::{
    ObjectStream, RuntimeVersionInfo, StoreError, UpdateFolder, UpdateLocator, UpdateStore,
    UploadRequest, UPDATES_PREFIX,
};
use crate::config::ServerConfig;

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1";
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

#[derive(Debug, Deserialize)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: String,
    updated: Option<DateTime<Utc>>,
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct GcsStore {
    http: reqwest::Client,
    bucket: String,
    service_account: Option<ServiceAccount>,
    token: RwLock<Option<CachedToken>>,
    base_url: String,
    jwt_secret: String,
}

impl GcsStore {
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let bucket = config
            .firebase_storage_bucket
            .clone()
            .ok_or_else(|| anyhow::anyhow!("firebase store requires FIREBASE_STORAGE_BUCKET"))?;
        let jwt_secret = config
            .jwt_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("firebase store requires JWT_SECRET"))?;

        let service_account = match &config.firebase_service_account {
            Some(encoded) => {
                let json = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| anyhow::anyhow!("FIREBASE_SERVICE_ACCOUNT is not base64: {e}"))?;
                Some(serde_json::from_slice::<ServiceAccount>(&json)?)
            }
            None => None,
        };

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            bucket,
            service_account,
            token: RwLock::new(None),
            base_url: config.base_url.clone(),
            jwt_secret,
        })
    }

    /// Current access token, refreshed through the service-account assertion
    /// flow when absent or within a minute of expiry. `None` when running
    /// against a public bucket without credentials.
    async fn access_token(&self) -> Result<Option<String>, StoreError> {
        let Some(account) = &self.service_account else {
            return Ok(None);
        };

        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Utc::now() + ChronoDuration::seconds(60) {
                    return Ok(Some(token.access_token.clone()));
                }
            }
        }

        let now = Utc::now();
        let claims = serde_json::json!({
            "iss": account.client_email,
            "scope": STORAGE_SCOPE,
            "aud": account.token_uri,
            "iat": now.timestamp(),
            "exp": (now + ChronoDuration::hours(1)).timestamp(),
        });
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(StoreError::backend)?;
        let assertion = encode(&Header::new(jsonwebtoken::Algorithm::RS256), &claims, &key)
            .map_err(StoreError::backend)?;

        let response: TokenResponse = self
            .http
            .post(&account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await
            .map_err(StoreError::backend)?
            .error_for_status()
            .map_err(StoreError::backend)?
            .json()
            .await
            .map_err(StoreError::backend)?;

        let expires_at = now + ChronoDuration::seconds(response.expires_in);
        let access_token = response.access_token.clone();
        *self.token.write().await = Some(CachedToken {
            access_token: response.access_token,
            expires_at,
        });
        Ok(Some(access_token))
    }

    async fn authorized(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, StoreError> {
        Ok(match self.access_token().await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{STORAGE_API}/b/{}/o/{}",
            self.bucket,
            utf8_percent_encode(key, NON_ALPHANUMERIC)
        )
    }

    /// Page through a listing. With `delimiter`, `prefixes` carries the
    /// direct children; without it, `items` carries the recursive objects.
    async fn list_page_set(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<(Vec<GcsObject>, Vec<String>), StoreError> {
        let mut items = Vec::new();
        let mut prefixes = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query: Vec<(&str, String)> = vec![("prefix", prefix.to_string())];
            if let Some(d) = delimiter {
                query.push(("delimiter", d.to_string()));
            }
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let builder = self
                .http
                .get(format!("{STORAGE_API}/b/{}/o", self.bucket))
                .query(&query);
            let response: ListResponse = self
                .authorized(builder)
                .await?
                .send()
                .await
                .map_err(StoreError::backend)?
                .error_for_status()
                .map_err(StoreError::backend)?
                .json()
                .await
                .map_err(StoreError::backend)?;

            items.extend(response.items);
            prefixes.extend(response.prefixes);
            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok((items, prefixes))
    }

    /// Recursive listing as `(relative key, updated)` pairs.
    async fn objects_under(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Option<DateTime<Utc>>)>, StoreError> {
        let (items, _) = self.list_page_set(prefix, None).await?;
        Ok(items
            .into_iter()
            .filter_map(|object| {
                let relative = object.name.strip_prefix(prefix)?;
                if relative.is_empty() {
                    return None;
                }
                Some((relative.to_string(), object.updated))
            })
            .collect())
    }
}

#[async_trait]
impl UpdateStore for GcsStore {
    async fn list_branches(&self) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{UPDATES_PREFIX}/");
        let (_, prefixes) = self.list_page_set(&prefix, Some("/")).await?;
        let mut branches: Vec<String> = prefixes
            .iter()
            .filter_map(|p| {
                let name = p.strip_prefix(&prefix)?.trim_end_matches('/');
                (!name.is_empty()).then(|| name.to_string())
            })
            .collect();
        branches.sort();
        Ok(branches)
    }

    async fn list_runtime_versions(
        &self,
        branch: &str,
    ) -> Result<Vec<RuntimeVersionInfo>, StoreError> {
        let prefix = format!("{UPDATES_PREFIX}/{branch}/");
        Ok(super::fold_runtime_versions(self.objects_under(&prefix).await?))
    }

    async fn list_updates(
        &self,
        branch: &str,
        runtime_version: &str,
    ) -> Result<Vec<UpdateFolder>, StoreError> {
        let prefix = format!("{UPDATES_PREFIX}/{branch}/{runtime_version}/");
        Ok(super::fold_update_folders(self.objects_under(&prefix).await?))
    }

    async fn get_file(
        &self,
        locator: &UpdateLocator,
        file_name: &str,
    ) -> Result<ObjectStream, StoreError> {
        let key = locator.object_key(file_name);
        let builder = self
            .http
            .get(format!("{}?alt=media", self.object_url(&key)));
        let response = self
            .authorized(builder)
            .await?
            .send()
            .await
            .map_err(StoreError::backend)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key));
        }
        let response = response.error_for_status().map_err(StoreError::backend)?;
        let content_length = response.content_length();
        let stream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other)),
        );
        Ok(ObjectStream {
            content_length,
            reader: Box::new(StreamReader::new(stream)),
        })
    }

    async fn read_object(&self, key: &str) -> Result<Bytes, StoreError> {
        let builder = self
            .http
            .get(format!("{}?alt=media", self.object_url(key)));
        let response = self
            .authorized(builder)
            .await?
            .send()
            .await
            .map_err(StoreError::backend)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.to_string()));
        }
        response
            .error_for_status()
            .map_err(StoreError::backend)?
            .bytes()
            .await
            .map_err(StoreError::backend)
    }

    async fn write_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let content_type = mime_guess::from_path(key)
            .first_or_octet_stream()
            .to_string();
        let builder = self
            .http
            .post(format!("{UPLOAD_API}/b/{}/o", self.bucket))
            .query(&[("uploadType", "media"), ("name", key)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body);
        self.authorized(builder)
            .await?
            .send()
            .await
            .map_err(StoreError::backend)?
            .error_for_status()
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let builder = self.http.delete(self.object_url(key));
        let response = self
            .authorized(builder)
            .await?
            .send()
            .await
            .map_err(StoreError::backend)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.to_string()));
        }
        response.error_for_status().map_err(StoreError::backend)?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut names: Vec<String> = self
            .objects_under(&prefix)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn request_upload_urls(
        &self,
        locator: &UpdateLocator,
        file_names: &[String],
    ) -> Result<Vec<UploadRequest>, StoreError> {
        super::service_upload_urls(&self.base_url, &self.jwt_secret, locator, file_names)
    }
}
