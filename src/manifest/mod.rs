//! Manifest assembly.
//!
//! Given a selected update, its metadata, and a platform, produce the
//! Expo-compatible manifest: the launch asset plus every declared asset,
//! each named by URL and content hash. Per-asset work (store read, SHA-256,
//! MD5) is independent, so it fans out one task per asset and joins before
//! responding; the first error fails the whole manifest and cancels the
//! remaining siblings.

pub mod multipart;
pub mod signing;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::SecondsFormat;
use futures_util::future::try_join_all;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::cache::{keys, ContentCache};
use crate::config::ServerConfig;
use crate::metadata::{LoadedMetadata, Platform};
use crate::registry::UpdateEntry;
use crate::store::{read_path_candidates, StoreError, UpdateStore, EXPO_CONFIG_FILE, ROLLBACK_FILE};

pub const LAUNCH_ASSET_CONTENT_TYPE: &str = "application/javascript";
pub const LAUNCH_ASSET_EXTENSION: &str = ".bundle";

// ─── Outgoing shapes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAsset {
    /// base64url(SHA-256(content)), unpadded.
    pub hash: String,
    /// Lowercase hex MD5 of the content — the client's cache key.
    pub key: String,
    pub file_extension: String,
    pub content_type: String,
    /// Absolute URL of the asset endpoint, naming the key that actually
    /// resolved (not necessarily the metadata's original spelling).
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestExtra {
    pub expo_client: serde_json::Value,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    /// Deterministic UUID derived from the metadata content hash.
    pub id: String,
    /// UTC ISO-8601, millisecond precision.
    pub created_at: String,
    pub runtime_version: String,
    pub metadata: serde_json::Value,
    pub extra: ManifestExtra,
    pub launch_asset: ManifestAsset,
    pub assets: Vec<ManifestAsset>,
}

// ─── Directives ───────────────────────────────────────────────────────────────

pub fn no_update_available_directive() -> serde_json::Value {
    serde_json::json!({ "type": "noUpdateAvailable" })
}

pub fn rollback_directive(commit_time: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "rollback",
        "parameters": { "commitTime": commit_time },
    })
}

/// Read the `rollback` file and lift it into a directive. The stored file
/// carries the parameters verbatim; the commit time is honored wherever the
/// publisher put it.
pub async fn load_rollback_directive(
    store: &dyn UpdateStore,
    entry: &UpdateEntry,
) -> Result<serde_json::Value> {
    let bytes = store.get_file_bytes(&entry.locator(), ROLLBACK_FILE).await?;
    let parsed: serde_json::Value =
        serde_json::from_slice(&bytes).context("malformed rollback file")?;
    let commit_time = parsed
        .pointer("/parameters/commitTime")
        .or_else(|| parsed.get("commitTime"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Ok(rollback_directive(&commit_time))
}

// ─── Assembly ─────────────────────────────────────────────────────────────────

/// Build the full manifest for one update and platform.
pub async fn assemble(
    store: &Arc<dyn UpdateStore>,
    cache: &ContentCache,
    config: &ServerConfig,
    entry: &UpdateEntry,
    loaded: &LoadedMetadata,
    platform: Platform,
) -> Result<UpdateManifest> {
    let cache_key = keys::manifest(
        &entry.branch,
        &entry.runtime_version,
        &entry.update_id,
        platform.as_str(),
    );
    if let Some(cached) = cache.get::<UpdateManifest>(&cache_key).await {
        return Ok(cached);
    }

    let platform_metadata = loaded
        .metadata
        .file_metadata
        .platform(platform)
        .with_context(|| format!("metadata has no {} entry", platform.as_str()))?;
    if platform_metadata.bundle.is_empty() {
        bail!("metadata declares no {} bundle", platform.as_str());
    }

    let assets = try_join_all(platform_metadata.assets.iter().map(|asset| {
        shape_manifest_asset(store, cache, config, entry, &asset.path, &asset.ext, false, platform)
    }))
    .await?;

    let launch_asset = shape_manifest_asset(
        store,
        cache,
        config,
        entry,
        &platform_metadata.bundle,
        "js",
        true,
        platform,
    )
    .await?;

    let expo_client = load_expo_client_config(store.as_ref(), entry, config).await;

    let manifest = UpdateManifest {
        id: loaded.manifest_id()?.to_string(),
        created_at: loaded
            .created_at
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        runtime_version: entry.runtime_version.clone(),
        metadata: serde_json::json!({}),
        extra: ManifestExtra {
            expo_client,
            branch: entry.branch.clone(),
            build_number: entry.build_number.clone(),
        },
        launch_asset,
        assets,
    };

    cache.put(&cache_key, &manifest).await;
    Ok(manifest)
}

/// The embedded client config, passed through untouched when the publisher
/// shipped one; otherwise a minimal config naming the application id.
async fn load_expo_client_config(
    store: &dyn UpdateStore,
    entry: &UpdateEntry,
    config: &ServerConfig,
) -> serde_json::Value {
    match store.get_file_bytes(&entry.locator(), EXPO_CONFIG_FILE).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
        Err(_) => serde_json::json!({
            "extra": { "eas": { "projectId": config.expo_app_id } },
        }),
    }
}

/// Hash one asset and shape its manifest record. Memoized per resolved
/// update + path; the cached value is the full record.
#[allow(clippy::too_many_arguments)]
pub async fn shape_manifest_asset(
    store: &Arc<dyn UpdateStore>,
    cache: &ContentCache,
    config: &ServerConfig,
    entry: &UpdateEntry,
    path: &str,
    ext: &str,
    is_launch_asset: bool,
    platform: Platform,
) -> Result<ManifestAsset> {
    let cache_key = keys::asset(&entry.branch, &entry.runtime_version, &entry.update_id, path);
    if let Some(cached) = cache.get::<ManifestAsset>(&cache_key).await {
        return Ok(cached);
    }

    let (bytes, resolved_path) = resolve_asset_bytes(store.as_ref(), entry, path).await?;

    let hash = URL_SAFE_NO_PAD.encode(Sha256::digest(&bytes));
    let key = hex::encode(Md5::digest(&bytes));

    let (file_extension, content_type) = if is_launch_asset {
        (
            LAUNCH_ASSET_EXTENSION.to_string(),
            LAUNCH_ASSET_CONTENT_TYPE.to_string(),
        )
    } else {
        (
            format!(".{ext}"),
            mime_guess::from_ext(ext).first_or_octet_stream().to_string(),
        )
    };

    let asset = ManifestAsset {
        hash,
        key,
        file_extension,
        content_type,
        url: format!(
            "{}?asset={}&runtimeVersion={}&platform={}",
            config.asset_endpoint(),
            resolved_path,
            entry.runtime_version,
            platform.as_str()
        ),
    };

    cache.put(&cache_key, &asset).await;
    Ok(asset)
}

/// Fetch asset bytes, walking the read-side fallback paths. Returns the
/// bytes together with the key that actually resolved.
pub async fn resolve_asset_bytes(
    store: &dyn UpdateStore,
    entry: &UpdateEntry,
    path: &str,
) -> Result<(bytes::Bytes, String)> {
    let locator = entry.locator();
    for candidate in read_path_candidates(path) {
        match store.get_file_bytes(&locator, &candidate).await {
            Ok(bytes) => return Ok((bytes, candidate)),
            Err(StoreError::NotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    bail!("asset '{path}' not found in {}", locator.prefix())
}
