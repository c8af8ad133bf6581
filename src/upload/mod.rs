//! Publish-side coordination: allocating update ids, issuing upload URL
//! batches, and finalizing uploaded updates.
//!
//! Begin-upload is all-or-nothing: a URL-signing failure anywhere in the
//! batch rolls back the stub so no partial update id survives. Finalize
//! verifies every file the metadata enumerates, deletes the folder on
//! verification failure, and refuses (406) content that hash-matches the
//! current latest update.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::ContentCache;
use crate::config::ServerConfig;
use crate::manifest::{self, UpdateManifest};
use crate::metadata::{self, stub_metadata, Platform};
use crate::registry::UpdateRegistry;
use crate::store::{
    read_path_candidates, UpdateLocator, UpdateStore, CHECK_MARKER, METADATA_FILE, UPDATES_PREFIX,
};

#[derive(Debug, Error)]
pub enum PublishError {
    /// Bad request shape: missing parameters, empty file list, unknown
    /// platform.
    #[error("{0}")]
    Validation(String),
    /// Missing, malformed, or expired upload token.
    #[error("{0}")]
    Auth(String),
    /// Finalize-time verification failed; the update folder has already
    /// been deleted when this surfaces.
    #[error("update verification failed: {0}")]
    BadUpdate(String),
    /// The uploaded content hash-matches the current latest update.
    #[error("update is identical to the current latest")]
    Duplicate,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginUploadResponse {
    pub update_id: String,
    pub upload_requests: Vec<crate::store::UploadRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginUploadBody {
    #[serde(default)]
    pub file_names: Vec<String>,
}

pub struct UploadCoordinator {
    store: Arc<dyn UpdateStore>,
    cache: Arc<ContentCache>,
    registry: Arc<UpdateRegistry>,
    config: Arc<ServerConfig>,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn UpdateStore>,
        cache: Arc<ContentCache>,
        registry: Arc<UpdateRegistry>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            config,
        }
    }

    /// Allocate a new update id, persist the metadata stub, and sign one
    /// upload URL per distinct file.
    pub async fn begin_upload(
        &self,
        branch: &str,
        runtime_version: &str,
        platform: Option<&str>,
        build_number: Option<&str>,
        commit_hash: Option<&str>,
        file_names: &[String],
    ) -> Result<BeginUploadResponse, PublishError> {
        let mut distinct: Vec<String> = Vec::with_capacity(file_names.len());
        for name in file_names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if !distinct.iter().any(|existing| existing == name) {
                distinct.push(name.to_string());
            }
        }
        if distinct.is_empty() {
            return Err(PublishError::Validation("fileNames must not be empty".into()));
        }

        let update_id = Uuid::new_v4().to_string();
        let locator = UpdateLocator::new(branch, runtime_version, &update_id);

        // Stub metadata first, so the update is immediately readable.
        let stub = stub_metadata(commit_hash, build_number, platform);
        let stub_bytes =
            serde_json::to_vec(&stub).context("failed to serialize stub metadata")?;
        self.store
            .upload_file(&locator, METADATA_FILE, Bytes::from(stub_bytes))
            .await
            .context("failed to write stub metadata")?;

        let upload_requests = match self.store.request_upload_urls(&locator, &distinct).await {
            Ok(requests) => requests,
            Err(e) => {
                // All-or-nothing: no persisted state survives a batch failure.
                if let Err(cleanup) = self.store.delete_folder(&locator).await {
                    warn!(update = %update_id, error = %cleanup, "stub cleanup failed");
                }
                return Err(PublishError::Other(
                    anyhow::Error::from(e).context("upload URL batch failed"),
                ));
            }
        };

        self.registry
            .invalidate_scope(branch, runtime_version, &update_id)
            .await;

        info!(branch, runtime_version, update = %update_id, files = distinct.len(), "upload started");
        Ok(BeginUploadResponse {
            update_id,
            upload_requests,
        })
    }

    /// Verify a finished upload and promote it, or remove it.
    pub async fn finalize_upload(
        &self,
        branch: &str,
        runtime_version: &str,
        update_id: &str,
        platform: Platform,
    ) -> Result<(), PublishError> {
        let locator = UpdateLocator::new(branch, runtime_version, update_id);

        // The canonical metadata replaced the stub; drop every cached view
        // of this scope before reading anything back.
        self.registry
            .invalidate_scope(branch, runtime_version, update_id)
            .await;

        let created_at = self
            .registry
            .annotated_updates(branch, runtime_version)
            .await
            .map_err(PublishError::Other)?
            .iter()
            .find(|entry| entry.update_id == update_id)
            .map(|entry| entry.created_at);
        let Some(created_at) = created_at else {
            return Err(PublishError::Validation(format!(
                "unknown update id '{update_id}'"
            )));
        };

        let loaded =
            match metadata::load(self.store.as_ref(), &self.cache, &locator, created_at).await {
                Ok(loaded) => loaded,
                Err(e) => return self.reject_update(&locator, e.to_string()).await,
            };

        if let Err(missing) = self.verify_enumerated_files(&locator, &loaded.metadata).await? {
            return self.reject_update(&locator, missing).await;
        }

        // Compare against the latest update this one would supersede.
        let previous = self
            .registry
            .select_candidates(branch, runtime_version, None)
            .await
            .map_err(PublishError::Other)?
            .into_iter()
            .find(|candidate| candidate.update_id != update_id);

        if let Some(previous) = previous {
            if let Some((new_manifest, old_manifest)) = self
                .manifests_for_comparison(branch, runtime_version, update_id, &previous.update_id, platform)
                .await
            {
                if manifests_hash_equal(&new_manifest, &old_manifest) {
                    info!(branch, runtime_version, update = %update_id, "duplicate content — removing");
                    if let Err(e) = self.store.delete_folder(&locator).await {
                        warn!(update = %update_id, error = %e, "duplicate cleanup failed");
                    }
                    self.registry
                        .invalidate_scope(branch, runtime_version, update_id)
                        .await;
                    return Err(PublishError::Duplicate);
                }
            }
        }

        self.store
            .upload_file(&locator, CHECK_MARKER, Bytes::new())
            .await
            .context("failed to write check marker")?;
        self.registry
            .invalidate_scope(branch, runtime_version, update_id)
            .await;

        info!(branch, runtime_version, update = %update_id, "update published");
        Ok(())
    }

    /// Write an uploaded file to the exact path a token authorized.
    pub async fn accept_local_upload(
        &self,
        token: &str,
        body: Bytes,
    ) -> Result<String, PublishError> {
        let secret = self
            .config
            .jwt_secret
            .as_deref()
            .ok_or_else(|| PublishError::Validation("local uploads are not configured".into()))?;
        let claims = crate::auth::verify_upload_token(secret, token)
            .map_err(|e| PublishError::Auth(e.to_string()))?;

        // The token is the only source of the target path; refuse anything
        // outside the update namespace.
        if !claims.file_path.starts_with(&format!("{UPDATES_PREFIX}/"))
            || claims.file_path.split('/').any(|part| part == ".." || part.is_empty())
        {
            return Err(PublishError::Validation(format!(
                "token path '{}' is outside the update namespace",
                claims.file_path
            )));
        }

        self.store
            .write_object(&claims.file_path, body)
            .await
            .context("failed to store uploaded file")?;
        Ok(claims.file_path)
    }

    async fn reject_update(
        &self,
        locator: &UpdateLocator,
        reason: String,
    ) -> Result<(), PublishError> {
        warn!(update = %locator.update_id, %reason, "finalize verification failed — deleting update");
        if let Err(e) = self.store.delete_folder(locator).await {
            warn!(update = %locator.update_id, error = %e, "failed-update cleanup failed");
        }
        self.registry
            .invalidate_scope(&locator.branch, &locator.runtime_version, &locator.update_id)
            .await;
        Err(PublishError::BadUpdate(reason))
    }

    /// Every file the metadata enumerates must exist (read-side path
    /// tolerance applies). Returns `Ok(Err(reason))` on a missing file so
    /// store failures stay distinguishable from verification failures.
    async fn verify_enumerated_files(
        &self,
        locator: &UpdateLocator,
        metadata: &crate::metadata::MetadataObject,
    ) -> Result<Result<(), String>, PublishError> {
        let mut required: Vec<&str> = Vec::new();
        for platform in [Platform::Ios, Platform::Android] {
            let Some(platform_metadata) = metadata.file_metadata.platform(platform) else {
                continue;
            };
            if platform_metadata.bundle.is_empty() {
                continue;
            }
            required.push(&platform_metadata.bundle);
            for asset in &platform_metadata.assets {
                required.push(&asset.path);
            }
        }
        if required.is_empty() {
            return Ok(Err("metadata declares no bundle for any platform".into()));
        }

        for path in required {
            let mut found = false;
            for candidate in read_path_candidates(path) {
                if self
                    .store
                    .file_exists(locator, &candidate)
                    .await
                    .map_err(|e| PublishError::Other(e.into()))?
                {
                    found = true;
                    break;
                }
            }
            if !found {
                return Ok(Err(format!("declared file '{path}' was not uploaded")));
            }
        }
        Ok(Ok(()))
    }

    /// Assemble both manifests for the duplicate check. `None` when either
    /// side cannot produce one (legacy or rollback updates are never
    /// considered duplicates).
    async fn manifests_for_comparison(
        &self,
        branch: &str,
        runtime_version: &str,
        new_id: &str,
        previous_id: &str,
        platform: Platform,
    ) -> Option<(UpdateManifest, UpdateManifest)> {
        let entries = self
            .registry
            .annotated_updates(branch, runtime_version)
            .await
            .ok()?;
        let new_entry = entries.iter().find(|e| e.update_id == new_id)?;
        let previous_entry = entries.iter().find(|e| e.update_id == previous_id)?;

        let new_manifest = self.manifest_for(new_entry, platform).await?;
        let previous_manifest = self.manifest_for(previous_entry, platform).await?;
        Some((new_manifest, previous_manifest))
    }

    async fn manifest_for(
        &self,
        entry: &crate::registry::UpdateEntry,
        platform: Platform,
    ) -> Option<UpdateManifest> {
        let loaded = metadata::load(
            self.store.as_ref(),
            &self.cache,
            &entry.locator(),
            entry.created_at,
        )
        .await
        .ok()?;
        manifest::assemble(&self.store, &self.cache, &self.config, entry, &loaded, platform)
            .await
            .ok()
    }
}

/// Two manifests describe the same content when the launch-asset hash and
/// the ordered asset hash list agree.
pub fn manifests_hash_equal(a: &UpdateManifest, b: &UpdateManifest) -> bool {
    a.launch_asset.hash == b.launch_asset.hash
        && a.assets.len() == b.assets.len()
        && a.assets
            .iter()
            .zip(b.assets.iter())
            .all(|(x, y)| x.hash == y.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestAsset, ManifestExtra};

    fn manifest(launch_hash: &str, asset_hashes: &[&str]) -> UpdateManifest {
        let asset = |hash: &str| ManifestAsset {
            hash: hash.to_string(),
            key: "k".to_string(),
            file_extension: ".png".to_string(),
            content_type: "image/png".to_string(),
            url: "http://x".to_string(),
        };
        UpdateManifest {
            id: "id".to_string(),
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
            runtime_version: "1.0.0".to_string(),
            metadata: serde_json::json!({}),
            extra: ManifestExtra {
                expo_client: serde_json::Value::Null,
                branch: "main".to_string(),
                build_number: None,
            },
            launch_asset: asset(launch_hash),
            assets: asset_hashes.iter().map(|h| asset(h)).collect(),
        }
    }

    #[test]
    fn hash_equality_compares_launch_and_ordered_assets() {
        assert!(manifests_hash_equal(
            &manifest("L", &["a", "b"]),
            &manifest("L", &["a", "b"])
        ));
        assert!(!manifests_hash_equal(
            &manifest("L", &["a", "b"]),
            &manifest("L", &["b", "a"])
        ));
        assert!(!manifests_hash_equal(
            &manifest("L1", &["a"]),
            &manifest("L2", &["a"])
        ));
        assert!(!manifests_hash_equal(
            &manifest("L", &["a"]),
            &manifest("L", &["a", "b"])
        ));
    }
}
