//! Update discovery, eligibility, ordering, and selection.
//!
//! The registry is the only component that decides *which* update a client
//! gets. It enumerates update folders in a `(branch, runtimeVersion)` scope,
//! drops invalid and inactive ones, orders the survivors by effective
//! recency, and refines by build number when the client supplies one.
//! Selections are memoized behind the latest-update cache key and
//! invalidated by any write that could change the decision.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{keys, ContentCache};
use crate::metadata;
use crate::store::{
    with_list_timeout, UpdateFolder, UpdateLocator, UpdateStore, ACTIVE_MARKERS, INACTIVE_MARKERS,
    LEGACY_BUNDLE_FILE, LEGACY_METADATA_FILE, METADATA_FILE, ROLLBACK_FILE,
};

// ─── Entry ────────────────────────────────────────────────────────────────────

/// One annotated update in a scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEntry {
    pub branch: String,
    pub runtime_version: String,
    pub update_id: String,
    pub created_at: DateTime<Utc>,
    /// Raw build-number string: extracted from the update id, else taken
    /// from the update's metadata.
    pub build_number: Option<String>,
    pub commit_hash: Option<String>,
    pub platform: Option<String>,
    pub active: bool,
    /// Relative paths of every object in the folder.
    pub files: Vec<String>,
}

impl UpdateEntry {
    pub fn locator(&self) -> UpdateLocator {
        UpdateLocator::new(&self.branch, &self.runtime_version, &self.update_id)
    }

    pub fn is_rollback(&self) -> bool {
        self.files.iter().any(|f| f == ROLLBACK_FILE)
    }

    /// Integer build number, via the extraction rule over the update id and
    /// then the metadata-supplied string.
    pub fn build_value(&self) -> Option<i64> {
        extract_build_number(&self.update_id)
            .or_else(|| self.build_number.as_deref().and_then(extract_build_number))
    }
}

// ─── Predicates ───────────────────────────────────────────────────────────────

/// An update folder is usable when it carries real metadata, the legacy
/// metadata spelling, a bare legacy bundle, or a rollback directive.
pub fn is_valid(files: &[String]) -> bool {
    files.iter().any(|f| {
        f == METADATA_FILE || f == LEGACY_METADATA_FILE || f == LEGACY_BUNDLE_FILE
            || f == ROLLBACK_FILE
    })
}

/// Active-marker precedence: any active marker wins, otherwise any inactive
/// marker disables the update, otherwise the default is active.
pub fn is_active(files: &[String]) -> bool {
    if files.iter().any(|f| ACTIVE_MARKERS.contains(&f.as_str())) {
        return true;
    }
    if files.iter().any(|f| INACTIVE_MARKERS.contains(&f.as_str())) {
        return false;
    }
    true
}

/// Extraction rule shared by update ids and the `expo-build-number` extra
/// param: `build-<N>[-...]` yields N, a bare integer yields itself,
/// everything else has no build number.
pub fn extract_build_number(s: &str) -> Option<i64> {
    if let Some(rest) = s.strip_prefix("build-") {
        let digits = rest.split('-').next().unwrap_or(rest);
        return digits.parse().ok();
    }
    s.parse().ok()
}

fn order_newest_first(entries: &mut [UpdateEntry]) {
    entries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.update_id.cmp(&a.update_id))
    });
}

// ─── Registry ─────────────────────────────────────────────────────────────────

pub struct UpdateRegistry {
    store: Arc<dyn UpdateStore>,
    cache: Arc<ContentCache>,
}

impl UpdateRegistry {
    pub fn new(store: Arc<dyn UpdateStore>, cache: Arc<ContentCache>) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn UpdateStore> {
        &self.store
    }

    /// All branches, memoized behind the branches-list key.
    pub async fn branches(&self) -> Result<Vec<String>> {
        if let Some(cached) = self.cache.get::<Vec<String>>(keys::BRANCHES).await {
            return Ok(cached);
        }
        let branches = with_list_timeout(self.store.list_branches()).await?;
        self.cache.put(keys::BRANCHES, &branches).await;
        Ok(branches)
    }

    /// Runtime versions of one branch, memoized per branch.
    pub async fn runtime_versions(
        &self,
        branch: &str,
    ) -> Result<Vec<crate::store::RuntimeVersionInfo>> {
        let cache_key = keys::runtime_versions(branch);
        if let Some(cached) = self
            .cache
            .get::<Vec<crate::store::RuntimeVersionInfo>>(&cache_key)
            .await
        {
            return Ok(cached);
        }
        let versions = with_list_timeout(self.store.list_runtime_versions(branch)).await?;
        self.cache.put(&cache_key, &versions).await;
        Ok(versions)
    }

    /// Every update in the scope, annotated with activity and build number.
    /// Memoized behind the scope's updates-list key.
    pub async fn annotated_updates(
        &self,
        branch: &str,
        runtime_version: &str,
    ) -> Result<Vec<UpdateEntry>> {
        let cache_key = keys::updates(branch, runtime_version);
        if let Some(cached) = self.cache.get::<Vec<UpdateEntry>>(&cache_key).await {
            return Ok(cached);
        }

        let folders =
            with_list_timeout(self.store.list_updates(branch, runtime_version)).await?;
        let mut entries = Vec::with_capacity(folders.len());
        for folder in folders {
            entries.push(self.annotate(branch, runtime_version, folder).await);
        }
        order_newest_first(&mut entries);

        self.cache.put(&cache_key, &entries).await;
        Ok(entries)
    }

    async fn annotate(
        &self,
        branch: &str,
        runtime_version: &str,
        folder: UpdateFolder,
    ) -> UpdateEntry {
        let mut entry = UpdateEntry {
            branch: branch.to_string(),
            runtime_version: runtime_version.to_string(),
            update_id: folder.update_id,
            created_at: folder.created_at,
            build_number: None,
            commit_hash: None,
            platform: None,
            active: is_active(&folder.files),
            files: folder.files,
        };

        if extract_build_number(&entry.update_id).is_some() {
            entry.build_number = Some(entry.update_id.clone());
        } else if entry
            .files
            .iter()
            .any(|f| f == METADATA_FILE || f == LEGACY_METADATA_FILE)
        {
            // Fall back to the metadata's declared build number; tolerate a
            // broken metadata.json here, validity is judged elsewhere.
            match metadata::load(
                self.store.as_ref(),
                &self.cache,
                &entry.locator(),
                entry.created_at,
            )
            .await
            {
                Ok(loaded) => {
                    entry.build_number = loaded.metadata.build_number();
                    entry.commit_hash = loaded.metadata.commit_hash();
                    entry.platform = loaded.metadata.platform_hint();
                }
                Err(e) => debug!(update = %entry.update_id, error = %e, "metadata annotation skipped"),
            }
        }

        entry
    }

    /// Ordered survivors for a manifest request: valid, active, newest
    /// first, with the build-number refinement applied when the client
    /// supplies one. The head of the list is the selection.
    pub async fn select_candidates(
        &self,
        branch: &str,
        runtime_version: &str,
        requested_build: Option<&str>,
    ) -> Result<Vec<UpdateEntry>> {
        let cache_key = keys::latest_update(branch, runtime_version, requested_build);
        if let Some(cached) = self.cache.get::<Vec<UpdateEntry>>(&cache_key).await {
            return Ok(cached);
        }

        let mut survivors: Vec<UpdateEntry> = self
            .annotated_updates(branch, runtime_version)
            .await?
            .into_iter()
            .filter(|e| is_valid(&e.files) && e.active)
            .collect();
        order_newest_first(&mut survivors);

        if let Some(requested) = requested_build.and_then(extract_build_number) {
            let best = survivors
                .iter()
                .enumerate()
                .filter_map(|(i, e)| e.build_value().map(|b| (i, b)))
                .filter(|(_, b)| *b <= requested)
                .max_by_key(|(_, b)| *b)
                .map(|(i, _)| i);
            if let Some(index) = best {
                let chosen = survivors.remove(index);
                survivors.insert(0, chosen);
            }
            // No qualifying build number anywhere: fall through to recency.
        }

        self.cache.put(&cache_key, &survivors).await;
        Ok(survivors)
    }

    /// The single selected update, if any.
    pub async fn select_update(
        &self,
        branch: &str,
        runtime_version: &str,
        requested_build: Option<&str>,
    ) -> Result<Option<UpdateEntry>> {
        Ok(self
            .select_candidates(branch, runtime_version, requested_build)
            .await?
            .into_iter()
            .next())
    }

    /// Candidates for asset resolution: active survivors first, then — as a
    /// read-time tolerance for older clients — valid but inactive updates.
    /// The manifest path never uses the inactive tail.
    pub async fn asset_candidates(
        &self,
        branch: &str,
        runtime_version: &str,
    ) -> Result<Vec<UpdateEntry>> {
        let all = self.annotated_updates(branch, runtime_version).await?;
        let mut active: Vec<UpdateEntry> = Vec::new();
        let mut inactive: Vec<UpdateEntry> = Vec::new();
        for entry in all.into_iter().filter(|e| is_valid(&e.files)) {
            if entry.active {
                active.push(entry);
            } else {
                inactive.push(entry);
            }
        }
        order_newest_first(&mut active);
        order_newest_first(&mut inactive);
        active.extend(inactive);
        Ok(active)
    }

    /// Fire the invalidation set for a write in this scope.
    pub async fn invalidate_scope(&self, branch: &str, runtime_version: &str, update_id: &str) {
        self.cache.invalidate_scope(branch, runtime_version).await;
        self.cache
            .invalidate_update(branch, runtime_version, update_id)
            .await;
    }

    /// Flip an update's state and invalidate everything the flip could
    /// affect. Marker write failures are surfaced; removal failures were
    /// already logged by the store.
    pub async fn set_update_state(
        &self,
        locator: &UpdateLocator,
        active: bool,
    ) -> Result<()> {
        self.store.set_update_state(locator, active).await?;
        self.invalidate_scope(&locator.branch, &locator.runtime_version, &locator.update_id)
            .await;
        Ok(())
    }

    /// Best-effort download telemetry, detached and time-boxed.
    pub fn record_download_detached(&self, locator: UpdateLocator, client_id: String) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let payload = serde_json::json!({
                "clientId": client_id,
                "downloadedAt": Utc::now().to_rfc3339(),
            });
            let write = store.record_download(&locator, &client_id, &payload);
            match tokio::time::timeout(std::time::Duration::from_secs(5), write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "download record failed"),
                Err(_) => warn!("download record timed out"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn validity_requires_metadata_bundle_or_rollback() {
        assert!(is_valid(&strings(&["metadata.json"])));
        assert!(is_valid(&strings(&["update-metadata.json"])));
        assert!(is_valid(&strings(&["bundle.js"])));
        assert!(is_valid(&strings(&["rollback"])));
        assert!(!is_valid(&strings(&["random.png", "assets/logo.png"])));
        assert!(!is_valid(&[]));
    }

    #[test]
    fn active_predicate_truth_table() {
        // All sixteen present/absent combinations of the four root markers:
        // any active marker wins, else any inactive marker loses, else active.
        let markers = ["active", ".active", "inactive", ".inactive"];
        for mask in 0u8..16 {
            let files: Vec<String> = markers
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, m)| m.to_string())
                .collect();
            let has_active = mask & 0b0011 != 0;
            let has_inactive = mask & 0b1100 != 0;
            let expected = has_active || !has_inactive;
            assert_eq!(is_active(&files), expected, "mask {mask:#06b}");
        }
    }

    #[test]
    fn markers_in_assets_subdirectory_count() {
        assert!(!is_active(&strings(&["assets/inactive", "metadata.json"])));
        assert!(is_active(&strings(&["assets/.active", "inactive"])));
    }

    #[test]
    fn build_number_extraction() {
        assert_eq!(extract_build_number("build-5-abc-def"), Some(5));
        assert_eq!(extract_build_number("build-42"), Some(42));
        assert_eq!(extract_build_number("17"), Some(17));
        assert_eq!(extract_build_number("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(extract_build_number("build-x-abc"), None);
        assert_eq!(extract_build_number("v1.2.3"), None);
        assert_eq!(extract_build_number(""), None);
    }

    fn entry(update_id: &str, created_at_ms: i64, active: bool) -> UpdateEntry {
        UpdateEntry {
            branch: "main".to_string(),
            runtime_version: "1.0.0".to_string(),
            update_id: update_id.to_string(),
            created_at: DateTime::<Utc>::from_timestamp_millis(created_at_ms).unwrap(),
            build_number: None,
            commit_hash: None,
            platform: None,
            active,
            files: strings(&["metadata.json"]),
        }
    }

    #[test]
    fn ordering_is_created_at_desc_with_id_tiebreak() {
        let mut entries = vec![
            entry("build-1-aaa", 1000, true),
            entry("build-3-zzz", 3000, true),
            entry("build-2-bbb", 3000, true),
        ];
        order_newest_first(&mut entries);
        assert_eq!(entries[0].update_id, "build-3-zzz");
        assert_eq!(entries[1].update_id, "build-2-bbb");
        assert_eq!(entries[2].update_id, "build-1-aaa");
    }

    // ─── Selection against a real store ──────────────────────────────────

    use crate::config::{KeysStorageType, ServerConfig, StorageMode};
    use crate::store::local::LocalStore;
    use tempfile::TempDir;

    fn seed(dir: &TempDir, relative: &str, bytes: &[u8]) {
        let path = dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn registry_over(dir: &TempDir) -> UpdateRegistry {
        let config = ServerConfig {
            base_url: "http://localhost:3000".to_string(),
            port: 3000,
            storage_mode: StorageMode::Local,
            local_bucket_base_path: dir.path().to_path_buf(),
            s3_bucket_name: None,
            aws_region: None,
            firebase_project_id: None,
            firebase_storage_bucket: None,
            firebase_service_account: None,
            jwt_secret: Some("secret".to_string()),
            expo_app_id: "app".to_string(),
            expo_access_token: None,
            admin_password: None,
            private_key_path: None,
            public_key_path: None,
            keys_storage_type: KeysStorageType::Local,
        };
        let store = Arc::new(LocalStore::new(&config).unwrap());
        UpdateRegistry::new(store, Arc::new(ContentCache::new()))
    }

    #[tokio::test]
    async fn selection_refines_by_requested_build() {
        let dir = TempDir::new().unwrap();
        for id in ["build-3-a", "build-5-b", "build-9-c"] {
            seed(&dir, &format!("updates/main/1.0.0/{id}/metadata.json"), b"{}");
        }
        let registry = registry_over(&dir);

        // Exact and between-build requests pick the largest build <= B.
        let head = registry
            .select_update("main", "1.0.0", Some("build-5"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.update_id, "build-5-b");

        let head = registry
            .select_update("main", "1.0.0", Some("build-4"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.update_id, "build-3-a");

        // No qualifying build: fall through to the newest survivor.
        let newest = registry
            .select_update("main", "1.0.0", None)
            .await
            .unwrap()
            .unwrap();
        let below_all = registry
            .select_update("main", "1.0.0", Some("build-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(below_all.update_id, newest.update_id);

        // Monotonicity: raising the requested build never lowers the
        // selected build.
        let mut last = 0;
        for requested in ["build-3", "build-5", "build-9"] {
            let selected = registry
                .select_update("main", "1.0.0", Some(requested))
                .await
                .unwrap()
                .unwrap();
            let build = selected.build_value().unwrap();
            assert!(build >= last, "selection regressed at {requested}");
            last = build;
        }
    }

    #[tokio::test]
    async fn selection_filters_invalid_and_inactive_folders() {
        let dir = TempDir::new().unwrap();
        seed(&dir, "updates/main/1.0.0/build-1-junk/random.png", b"x");
        seed(&dir, "updates/main/1.0.0/build-2-off/metadata.json", b"{}");
        seed(&dir, "updates/main/1.0.0/build-2-off/inactive", b"");
        let registry = registry_over(&dir);

        let selected = registry.select_update("main", "1.0.0", None).await.unwrap();
        assert!(selected.is_none());

        // The asset path still sees the inactive folder.
        let candidates = registry.asset_candidates("main", "1.0.0").await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].update_id, "build-2-off");
    }

    #[tokio::test]
    async fn legacy_metadata_spelling_feeds_annotation() {
        let dir = TempDir::new().unwrap();
        seed(
            &dir,
            "updates/main/1.0.0/20ab11ce-55fe-4eff-91b7-8e2fc3b87111/update-metadata.json",
            br#"{"version":0,"bundler":"metro","fileMetadata":{"ios":{"bundle":"bundle.hbc","assets":[]}},"extra":{"updateCode":"build-4"}}"#,
        );
        let registry = registry_over(&dir);

        let entries = registry.annotated_updates("main", "1.0.0").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].build_number.as_deref(), Some("build-4"));
        assert_eq!(entries[0].build_value(), Some(4));
    }
}
