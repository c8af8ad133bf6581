//! Object-store abstraction over the flat update namespace.
//!
//! Every backend serves the same key space:
//! `updates/<branch>/<runtimeVersion>/<updateId>/<fileName>`, with file names
//! allowed to contain `/`. Discovery walks that hierarchy with
//! delimiter-scoped listings. The backend is picked once at startup from
//! `STORAGE_MODE` and never changes at runtime.

pub mod gcs;
pub mod local;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::config::{ServerConfig, StorageMode};

/// Root prefix of the update namespace.
pub const UPDATES_PREFIX: &str = "updates";
/// Root prefix of download telemetry records.
pub const DOWNLOADS_PREFIX: &str = "downloads";

pub const METADATA_FILE: &str = "metadata.json";
pub const LEGACY_METADATA_FILE: &str = "update-metadata.json";
pub const LEGACY_BUNDLE_FILE: &str = "bundle.js";
pub const EXPO_CONFIG_FILE: &str = "expoConfig.json";
pub const ROLLBACK_FILE: &str = "rollback";
pub const CHECK_MARKER: &str = ".check";

/// Marker spellings honored by the active/inactive predicate. Publishers have
/// written all four variants over the years, so both reader and writer handle
/// the full set.
pub const ACTIVE_MARKERS: [&str; 4] = ["active", ".active", "assets/active", "assets/.active"];
pub const INACTIVE_MARKERS: [&str; 4] =
    ["inactive", ".inactive", "assets/inactive", "assets/.inactive"];

/// Absolute expiry for signed upload URLs.
pub const UPLOAD_URL_TTL: Duration = Duration::from_secs(15 * 60);
/// Ambient timeout for any single store listing.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    /// Typed absence — the only error the store layer translates rather than
    /// surfaces verbatim.
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("store listing timed out after {}s", LIST_TIMEOUT.as_secs())]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Wrap a listing future with the ambient 30-second timeout.
pub async fn with_list_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(LIST_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

// ─── Key space ────────────────────────────────────────────────────────────────

/// Identity of one update folder: `(branch, runtimeVersion, updateId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpdateLocator {
    pub branch: String,
    pub runtime_version: String,
    pub update_id: String,
}

impl UpdateLocator {
    pub fn new(
        branch: impl Into<String>,
        runtime_version: impl Into<String>,
        update_id: impl Into<String>,
    ) -> Self {
        Self {
            branch: branch.into(),
            runtime_version: runtime_version.into(),
            update_id: update_id.into(),
        }
    }

    /// `updates/<branch>/<rv>/<updateId>` — the folder prefix.
    pub fn prefix(&self) -> String {
        format!(
            "{UPDATES_PREFIX}/{}/{}/{}",
            self.branch, self.runtime_version, self.update_id
        )
    }

    /// `updates/<branch>/<rv>/<updateId>/<fileName>`. File names keep any
    /// embedded `/`, so subdirectories inside an update are legal.
    pub fn object_key(&self, file_name: &str) -> String {
        format!("{}/{}", self.prefix(), file_name)
    }

    /// `downloads/<branch>/<rv>/<updateId>` — telemetry prefix.
    pub fn downloads_prefix(&self) -> String {
        format!(
            "{DOWNLOADS_PREFIX}/{}/{}/{}",
            self.branch, self.runtime_version, self.update_id
        )
    }
}

/// Read-side tolerance for publishers that mis-normalize asset paths.
/// Candidates are tried in order; writers never apply these transforms.
pub fn read_path_candidates(name: &str) -> Vec<String> {
    let mut candidates = vec![name.to_string()];
    if let Some(rest) = name.strip_prefix("assets/") {
        candidates.push(rest.to_string());
    }
    if let Some(rest) = name.strip_prefix("_expo/") {
        candidates.push(rest.to_string());
    }
    if let Some(last) = name.rsplit('/').next() {
        if !candidates.iter().any(|c| c == last) {
            candidates.push(last.to_string());
        }
    }
    candidates
}

// ─── Result types ─────────────────────────────────────────────────────────────

/// One update folder as the store sees it: its id, a best-effort creation
/// timestamp, and the relative paths of every object inside it.
#[derive(Debug, Clone)]
pub struct UpdateFolder {
    pub update_id: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<String>,
}

impl UpdateFolder {
    pub fn contains(&self, name: &str) -> bool {
        self.files.iter().any(|f| f == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVersionInfo {
    pub runtime_version: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub number_of_updates: usize,
}

/// One entry in a `requestUploadUrl` response batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub request_upload_url: String,
    pub file_name: String,
    pub file_path: String,
}

/// One recorded manifest download, parsed from
/// `downloads/<branch>/<rv>/<updateId>/<clientId>_<ts>.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub client_id: String,
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// A readable object body. Dropping the reader releases the handle.
pub struct ObjectStream {
    pub content_length: Option<u64>,
    pub reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

// ─── The store trait ──────────────────────────────────────────────────────────

/// Uniform interface over the update namespace.
///
/// Backends implement discovery, streaming reads, raw object access, and
/// upload-URL signing; folder deletion, marker discipline, existence checks,
/// and download telemetry are derived from the raw operations so every
/// backend behaves identically.
#[async_trait]
pub trait UpdateStore: Send + Sync {
    /// Direct children of `updates/`.
    async fn list_branches(&self) -> Result<Vec<String>, StoreError>;

    /// Direct children of `updates/<branch>/`, with per-version update
    /// counts and timestamp bounds. Missing branch yields an empty list.
    async fn list_runtime_versions(
        &self,
        branch: &str,
    ) -> Result<Vec<RuntimeVersionInfo>, StoreError>;

    /// Direct children of `updates/<branch>/<rv>/`, each with its full file
    /// listing. Missing runtime version yields an empty list.
    async fn list_updates(
        &self,
        branch: &str,
        runtime_version: &str,
    ) -> Result<Vec<UpdateFolder>, StoreError>;

    /// Stream one object out of an update folder. `NotFound` is a distinct
    /// error; callers apply [`read_path_candidates`] on top of this.
    async fn get_file(
        &self,
        locator: &UpdateLocator,
        file_name: &str,
    ) -> Result<ObjectStream, StoreError>;

    /// Read a raw object by absolute key (used for key material and
    /// telemetry records that live outside `updates/`).
    async fn read_object(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Write a raw object by absolute key. Partial writes must not become
    /// visible under the final key.
    async fn write_object(&self, key: &str, body: Bytes) -> Result<(), StoreError>;

    async fn delete_object(&self, key: &str) -> Result<(), StoreError>;

    /// All keys under `prefix`, relative to it (recursive, no delimiter).
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Signed, time-bounded PUT URLs for a batch of files. Any single
    /// failure fails the whole batch.
    async fn request_upload_urls(
        &self,
        locator: &UpdateLocator,
        file_names: &[String],
    ) -> Result<Vec<UploadRequest>, StoreError>;

    /// Signed GET URL for CDN-style redirects, if this backend supports
    /// them. `None` means the caller should stream the bytes itself.
    async fn signed_download_url(
        &self,
        _locator: &UpdateLocator,
        _file_name: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    // ─── Derived operations ──────────────────────────────────────────────

    /// Collect an object into memory (hashing, metadata parsing).
    async fn get_file_bytes(
        &self,
        locator: &UpdateLocator,
        file_name: &str,
    ) -> Result<Bytes, StoreError> {
        let mut stream = self.get_file(locator, file_name).await?;
        let mut buf = Vec::with_capacity(stream.content_length.unwrap_or(0) as usize);
        stream.reader.read_to_end(&mut buf).await?;
        Ok(buf.into())
    }

    async fn file_exists(
        &self,
        locator: &UpdateLocator,
        file_name: &str,
    ) -> Result<bool, StoreError> {
        match self.get_file(locator, file_name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn upload_file(
        &self,
        locator: &UpdateLocator,
        file_name: &str,
        body: Bytes,
    ) -> Result<(), StoreError> {
        self.write_object(&locator.object_key(file_name), body).await
    }

    /// Remove the whole update folder, marker files included.
    async fn delete_folder(&self, locator: &UpdateLocator) -> Result<(), StoreError> {
        let prefix = locator.prefix();
        for name in self.list_objects(&prefix).await? {
            self.delete_object(&format!("{prefix}/{name}")).await?;
        }
        Ok(())
    }

    /// Flip the active/inactive markers. Writes the new marker first, then
    /// removes every opposite spelling; if we crash in between, the reader
    /// predicate still yields a deterministic answer.
    async fn set_update_state(
        &self,
        locator: &UpdateLocator,
        active: bool,
    ) -> Result<(), StoreError> {
        let (write_name, remove) = if active {
            ("active", INACTIVE_MARKERS)
        } else {
            ("inactive", ACTIVE_MARKERS)
        };
        self.write_object(&locator.object_key(write_name), Bytes::new())
            .await?;
        for marker in remove {
            if let Err(e) = self.delete_object(&locator.object_key(marker)).await {
                if !e.is_not_found() {
                    warn!(key = %locator.object_key(marker), error = %e, "marker removal failed");
                }
            }
        }
        Ok(())
    }

    /// Best-effort download telemetry write.
    async fn record_download(
        &self,
        locator: &UpdateLocator,
        client_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let ts = Utc::now().timestamp_millis();
        let key = format!("{}/{client_id}_{ts}.json", locator.downloads_prefix());
        self.write_object(&key, Bytes::from(serde_json::to_vec(payload).unwrap_or_default()))
            .await
    }

    /// Recorded downloads for one update; empty when unsupported.
    async fn list_downloads(
        &self,
        locator: &UpdateLocator,
    ) -> Result<Vec<DownloadRecord>, StoreError> {
        let names = match self.list_objects(&locator.downloads_prefix()).await {
            Ok(names) => names,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(names
            .iter()
            .filter_map(|name| parse_download_record(name))
            .collect())
    }
}

/// Build service-relative upload URLs for backends without native URL
/// signing: each URL routes the PUT back through `/uploadLocalFile` with a
/// token binding the exact target path.
pub(crate) fn service_upload_urls(
    base_url: &str,
    jwt_secret: &str,
    locator: &UpdateLocator,
    file_names: &[String],
) -> Result<Vec<UploadRequest>, StoreError> {
    let mut requests = Vec::with_capacity(file_names.len());
    for file_name in file_names {
        let file_path = locator.object_key(file_name);
        let token = crate::auth::issue_upload_token(jwt_secret, &file_path, UPLOAD_URL_TTL)
            .map_err(StoreError::backend)?;
        requests.push(UploadRequest {
            request_upload_url: format!("{base_url}/uploadLocalFile?token={token}"),
            file_name: file_name.clone(),
            file_path,
        });
    }
    Ok(requests)
}

/// Aggregate a recursive branch listing (`<rv>/<updateId>/<file>` relative
/// keys) into per-runtime-version summaries.
pub(crate) fn fold_runtime_versions(
    objects: Vec<(String, Option<DateTime<Utc>>)>,
) -> Vec<RuntimeVersionInfo> {
    use std::collections::BTreeMap;
    let mut versions: BTreeMap<String, BTreeMap<String, Option<DateTime<Utc>>>> = BTreeMap::new();
    for (relative, modified) in objects {
        let mut segments = relative.splitn(3, '/');
        let (Some(version), Some(update_id), Some(_file)) =
            (segments.next(), segments.next(), segments.next())
        else {
            continue;
        };
        let slot = versions
            .entry(version.to_string())
            .or_default()
            .entry(update_id.to_string())
            .or_insert(None);
        if let Some(modified) = modified {
            if slot.map_or(true, |current| modified < current) {
                *slot = Some(modified);
            }
        }
    }
    versions
        .into_iter()
        .map(|(runtime_version, updates)| {
            let mut created_at: Option<DateTime<Utc>> = None;
            let mut last_updated_at: Option<DateTime<Utc>> = None;
            for (update_id, modified) in &updates {
                let ts = created_at_from_id(update_id, *modified);
                created_at = Some(created_at.map_or(ts, |c| c.min(ts)));
                last_updated_at = Some(last_updated_at.map_or(ts, |c| c.max(ts)));
            }
            RuntimeVersionInfo {
                runtime_version,
                created_at,
                last_updated_at,
                number_of_updates: updates.len(),
            }
        })
        .collect()
}

/// Aggregate a recursive scope listing (`<updateId>/<file>` relative keys)
/// into update folders.
pub(crate) fn fold_update_folders(
    objects: Vec<(String, Option<DateTime<Utc>>)>,
) -> Vec<UpdateFolder> {
    use std::collections::BTreeMap;
    let mut folders: BTreeMap<String, (Vec<String>, Option<DateTime<Utc>>)> = BTreeMap::new();
    for (relative, modified) in objects {
        let Some((update_id, file)) = relative.split_once('/') else {
            continue;
        };
        let entry = folders.entry(update_id.to_string()).or_default();
        entry.0.push(file.to_string());
        if let Some(modified) = modified {
            if entry.1.map_or(true, |current| modified < current) {
                entry.1 = Some(modified);
            }
        }
    }
    folders
        .into_iter()
        .map(|(update_id, (mut files, modified))| {
            files.sort();
            let created_at = created_at_from_id(&update_id, modified);
            UpdateFolder {
                update_id,
                created_at,
                files,
            }
        })
        .collect()
}

/// Best-effort creation timestamp for an update folder: millisecond-epoch
/// update ids carry their own, anything else falls back to object timestamps.
pub fn created_at_from_id(update_id: &str, fallback: Option<DateTime<Utc>>) -> DateTime<Utc> {
    update_id
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .or(fallback)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_millis(0).unwrap())
}

fn parse_download_record(name: &str) -> Option<DownloadRecord> {
    let stem = name.strip_suffix(".json")?;
    let (client_id, ts) = stem.rsplit_once('_')?;
    let downloaded_at = ts
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis);
    Some(DownloadRecord {
        client_id: client_id.to_string(),
        downloaded_at,
    })
}

// ─── Factory ──────────────────────────────────────────────────────────────────

/// Build the store selected by configuration.
pub async fn from_config(config: &ServerConfig) -> anyhow::Result<Arc<dyn UpdateStore>> {
    match config.storage_mode {
        StorageMode::Local => Ok(Arc::new(local::LocalStore::new(config)?)),
        StorageMode::S3 => Ok(Arc::new(s3::S3Store::new(config).await?)),
        StorageMode::Firebase => Ok(Arc::new(gcs::GcsStore::new(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_preserves_embedded_slashes() {
        let locator = UpdateLocator::new("main", "1.0.0", "build-5-abc");
        assert_eq!(
            locator.object_key("bundles/ios.hbc"),
            "updates/main/1.0.0/build-5-abc/bundles/ios.hbc"
        );
    }

    #[test]
    fn read_path_candidates_orders_transforms() {
        assert_eq!(
            read_path_candidates("assets/icon.png"),
            vec!["assets/icon.png", "icon.png"]
        );
        assert_eq!(
            read_path_candidates("_expo/static/js/ios/x.js"),
            vec!["_expo/static/js/ios/x.js", "static/js/ios/x.js", "x.js"]
        );
        // A bare file name yields just itself.
        assert_eq!(read_path_candidates("icon.png"), vec!["icon.png"]);
    }

    #[test]
    fn download_record_parses_client_and_timestamp() {
        let record = parse_download_record("device-1_1700000000000.json").unwrap();
        assert_eq!(record.client_id, "device-1");
        assert!(record.downloaded_at.is_some());
        assert!(parse_download_record("garbage").is_none());
    }

    fn ts(ms: i64) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(ms)
    }

    #[test]
    fn runtime_version_fold_counts_updates_and_bounds_timestamps() {
        let objects = vec![
            ("1.0.0/u1/metadata.json".to_string(), ts(1_000)),
            ("1.0.0/u1/bundle.hbc".to_string(), ts(2_000)),
            ("1.0.0/u2/metadata.json".to_string(), ts(5_000)),
            ("2.0.0/u3/metadata.json".to_string(), ts(9_000)),
            ("stray-file".to_string(), ts(0)),
        ];
        let versions = fold_runtime_versions(objects);
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].runtime_version, "1.0.0");
        assert_eq!(versions[0].number_of_updates, 2);
        assert_eq!(versions[0].created_at, ts(1_000));
        assert_eq!(versions[0].last_updated_at, ts(5_000));
        assert_eq!(versions[1].runtime_version, "2.0.0");
        assert_eq!(versions[1].number_of_updates, 1);
    }

    #[test]
    fn update_folder_fold_groups_files_and_prefers_id_timestamps() {
        let objects = vec![
            ("u1/metadata.json".to_string(), ts(4_000)),
            ("u1/assets/logo.png".to_string(), ts(3_000)),
            ("1700000000000/metadata.json".to_string(), ts(1_000)),
        ];
        let folders = fold_update_folders(objects);
        assert_eq!(folders.len(), 2);

        let by_mtime = folders.iter().find(|f| f.update_id == "u1").unwrap();
        assert_eq!(by_mtime.files, vec!["assets/logo.png", "metadata.json"]);
        assert_eq!(by_mtime.created_at, ts(3_000).unwrap());

        // Millisecond-epoch ids carry their own timestamp.
        let by_id = folders.iter().find(|f| f.update_id == "1700000000000").unwrap();
        assert_eq!(by_id.created_at, ts(1_700_000_000_000).unwrap());
    }
}
