//! Process-local content cache.
//!
//! Two inner caches with different lifetimes sit behind one facade:
//! pointer-style entries ("latest update for a scope", dashboard listings)
//! expire after 30 minutes, while content-addressed entries (parsed
//! metadata, shaped assets, assembled manifests) live until evicted or
//! explicitly invalidated by a write.
//!
//! The cache is never authoritative. Every consumer treats a miss as
//! "recompute", so cache failures are swallowed into miss semantics and no
//! error ever propagates out of this module.

use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const POINTER_TTL: Duration = Duration::from_secs(30 * 60);
const CONTENT_CAPACITY: u64 = 50_000;
const POINTER_CAPACITY: u64 = 10_000;

pub struct ContentCache {
    pointer: Cache<String, Arc<serde_json::Value>>,
    content: Cache<String, Arc<serde_json::Value>>,
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentCache {
    pub fn new() -> Self {
        Self {
            pointer: Cache::builder()
                .max_capacity(POINTER_CAPACITY)
                .time_to_live(POINTER_TTL)
                .support_invalidation_closures()
                .build(),
            content: Cache::builder()
                .max_capacity(CONTENT_CAPACITY)
                .support_invalidation_closures()
                .build(),
        }
    }

    fn route(&self, key: &str) -> &Cache<String, Arc<serde_json::Value>> {
        // Content-addressed prefixes; everything else is a pointer entry.
        if key.starts_with("metadata:") || key.starts_with("manifest:") || key.starts_with("asset:")
        {
            &self.content
        } else {
            &self.pointer
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.route(key).get(key).await?;
        match serde_json::from_value(value.as_ref().clone()) {
            Ok(typed) => Some(typed),
            Err(e) => {
                debug!(key, error = %e, "cache entry failed to decode — treating as miss");
                None
            }
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(json) => {
                self.route(key)
                    .insert(key.to_string(), Arc::new(json))
                    .await;
            }
            Err(e) => debug!(key, error = %e, "cache entry failed to encode — skipping"),
        }
    }

    /// Drop every pointer entry that could change the update-selection
    /// decision for `(branch, runtimeVersion)`: the latest-update pointers
    /// (all build-number variants), the branch list, and both listing views.
    pub async fn invalidate_scope(&self, branch: &str, runtime_version: &str) {
        let latest_prefix = format!("lastUpdate:{branch}:{runtime_version}");
        let _ = self
            .pointer
            .invalidate_entries_if(move |key, _| key.starts_with(&latest_prefix));
        self.pointer.invalidate(keys::BRANCHES).await;
        self.pointer.invalidate(&keys::runtime_versions(branch)).await;
        self.pointer
            .invalidate(&keys::updates(branch, runtime_version))
            .await;
    }

    /// Drop the content-addressed entries of one update folder.
    pub async fn invalidate_update(&self, branch: &str, runtime_version: &str, update_id: &str) {
        for prefix in ["metadata", "manifest", "asset"] {
            let key_prefix = format!("{prefix}:{branch}:{runtime_version}:{update_id}");
            let _ = self
                .content
                .invalidate_entries_if(move |key, _| key.starts_with(&key_prefix));
        }
    }
}

/// Structured cache-key builders. Keys are plain strings so an external
/// key-value backend could replace the in-process cache without a schema
/// change.
pub mod keys {
    pub const BRANCHES: &str = "branches";

    pub fn latest_update(branch: &str, runtime_version: &str, build_number: Option<&str>) -> String {
        match build_number {
            Some(build) => format!("lastUpdate:{branch}:{runtime_version}:{build}"),
            None => format!("lastUpdate:{branch}:{runtime_version}"),
        }
    }

    pub fn metadata(branch: &str, runtime_version: &str, update_id: &str) -> String {
        format!("metadata:{branch}:{runtime_version}:{update_id}")
    }

    pub fn manifest(branch: &str, runtime_version: &str, update_id: &str, platform: &str) -> String {
        format!("manifest:{branch}:{runtime_version}:{update_id}:{platform}")
    }

    pub fn asset(branch: &str, runtime_version: &str, update_id: &str, asset_path: &str) -> String {
        format!("asset:{branch}:{runtime_version}:{update_id}:{asset_path}")
    }

    pub fn runtime_versions(branch: &str) -> String {
        format!("runtimeVersions:{branch}")
    }

    pub fn updates(branch: &str, runtime_version: &str) -> String {
        format!("updates:{branch}:{runtime_version}")
    }
}
