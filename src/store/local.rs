//! Filesystem-backed store.
//!
//! Keys map 1:1 onto paths under `LOCAL_BUCKET_BASE_PATH`. Upload URLs point
//! back at this service's own `/uploadLocalFile` endpoint carrying an HS256
//! token that binds the exact target path.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use super::{
    created_at_from_id, ObjectStream, RuntimeVersionInfo, StoreError, UpdateFolder, UpdateLocator,
    UpdateStore, UploadRequest,
};
use crate::config::ServerConfig;

pub struct LocalStore {
    base_path: PathBuf,
    base_url: String,
    jwt_secret: String,
}

impl LocalStore {
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let jwt_secret = config
            .jwt_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("local store requires JWT_SECRET"))?;
        Ok(Self {
            base_path: config.local_bucket_base_path.clone(),
            base_url: config.base_url.clone(),
            jwt_secret,
        })
    }

    /// Join `key` under the base path, refusing traversal components.
    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(StoreError::Backend(format!(
                        "illegal object key '{key}'"
                    )))
                }
            }
        }
        Ok(self.base_path.join(relative))
    }

    /// Names of the direct child directories of `dir`; empty if missing.
    async fn child_dirs(&self, dir: &Path) -> Result<Vec<String>, StoreError> {
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Every file under `dir`, as `/`-separated paths relative to it.
    async fn walk_files(&self, dir: &Path) -> Result<Vec<String>, StoreError> {
        let mut files = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let mut reader = match tokio::fs::read_dir(&current).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = reader.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(dir) {
                    files.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn dir_modified(&self, dir: &Path) -> Option<DateTime<Utc>> {
        let meta = tokio::fs::metadata(dir).await.ok()?;
        meta.modified().ok().map(DateTime::<Utc>::from)
    }
}

#[async_trait]
impl UpdateStore for LocalStore {
    async fn list_branches(&self) -> Result<Vec<String>, StoreError> {
        self.child_dirs(&self.base_path.join(super::UPDATES_PREFIX))
            .await
    }

    async fn list_runtime_versions(
        &self,
        branch: &str,
    ) -> Result<Vec<RuntimeVersionInfo>, StoreError> {
        let branch_dir = self.resolve(&format!("{}/{branch}", super::UPDATES_PREFIX))?;
        let mut versions = Vec::new();
        for version in self.child_dirs(&branch_dir).await? {
            let version_dir = branch_dir.join(&version);
            let updates = self.child_dirs(&version_dir).await?;
            let mut created_at: Option<DateTime<Utc>> = None;
            let mut last_updated_at: Option<DateTime<Utc>> = None;
            for update_id in &updates {
                let modified = self.dir_modified(&version_dir.join(update_id)).await;
                let ts = created_at_from_id(update_id, modified);
                created_at = Some(created_at.map_or(ts, |c| c.min(ts)));
                last_updated_at = Some(last_updated_at.map_or(ts, |c| c.max(ts)));
            }
            versions.push(RuntimeVersionInfo {
                runtime_version: version,
                created_at,
                last_updated_at,
                number_of_updates: updates.len(),
            });
        }
        Ok(versions)
    }

    async fn list_updates(
        &self,
        branch: &str,
        runtime_version: &str,
    ) -> Result<Vec<UpdateFolder>, StoreError> {
        let scope_dir =
            self.resolve(&format!("{}/{branch}/{runtime_version}", super::UPDATES_PREFIX))?;
        let mut updates = Vec::new();
        for update_id in self.child_dirs(&scope_dir).await? {
            let update_dir = scope_dir.join(&update_id);
            let files = self.walk_files(&update_dir).await?;
            let created_at =
                created_at_from_id(&update_id, self.dir_modified(&update_dir).await);
            updates.push(UpdateFolder {
                update_id,
                created_at,
                files,
            });
        }
        Ok(updates)
    }

    async fn get_file(
        &self,
        locator: &UpdateLocator,
        file_name: &str,
    ) -> Result<ObjectStream, StoreError> {
        let key = locator.object_key(file_name);
        let path = self.resolve(&key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key))
            }
            Err(e) => return Err(e.into()),
        };
        let content_length = file.metadata().await.ok().map(|m| m.len());
        Ok(ObjectStream {
            content_length,
            reader: Box::new(file),
        })
    }

    async fn read_object(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes.into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write to a sibling temp file and rename, so a torn write never
        // becomes visible under the final key.
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.resolve(prefix)?;
        self.walk_files(&dir).await
    }

    async fn delete_folder(&self, locator: &UpdateLocator) -> Result<(), StoreError> {
        let dir = self.resolve(&locator.prefix())?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn request_upload_urls(
        &self,
        locator: &UpdateLocator,
        file_names: &[String],
    ) -> Result<Vec<UploadRequest>, StoreError> {
        super::service_upload_urls(&self.base_url, &self.jwt_secret, locator, file_names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeysStorageType, StorageMode};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            base_url: "http://localhost:3000".to_string(),
            port: 3000,
            storage_mode: StorageMode::Local,
            local_bucket_base_path: dir.path().to_path_buf(),
            s3_bucket_name: None,
            aws_region: None,
            firebase_project_id: None,
            firebase_storage_bucket: None,
            firebase_service_account: None,
            jwt_secret: Some("test-secret".to_string()),
            expo_app_id: "app".to_string(),
            expo_access_token: None,
            admin_password: None,
            private_key_path: None,
            public_key_path: None,
            keys_storage_type: KeysStorageType::Local,
        }
    }

    #[tokio::test]
    async fn listings_are_empty_for_missing_scopes() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(&test_config(&dir)).unwrap();
        assert!(store.list_branches().await.unwrap().is_empty());
        assert!(store.list_runtime_versions("main").await.unwrap().is_empty());
        assert!(store.list_updates("main", "1.0.0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_list_read_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(&test_config(&dir)).unwrap();
        let locator = UpdateLocator::new("main", "1.0.0", "1700000000000");

        store
            .upload_file(&locator, "bundles/ios.hbc", Bytes::from_static(b"bundle"))
            .await
            .unwrap();
        store
            .upload_file(&locator, "metadata.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let updates = store.list_updates("main", "1.0.0").await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].update_id, "1700000000000");
        assert!(updates[0].contains("bundles/ios.hbc"));
        assert!(updates[0].contains("metadata.json"));

        let bytes = store.get_file_bytes(&locator, "bundles/ios.hbc").await.unwrap();
        assert_eq!(&bytes[..], b"bundle");

        store.delete_folder(&locator).await.unwrap();
        assert!(store.list_updates("main", "1.0.0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_file_miss_is_typed_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(&test_config(&dir)).unwrap();
        let locator = UpdateLocator::new("main", "1.0.0", "u1");
        let err = store.get_file(&locator, "missing.png").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(&test_config(&dir)).unwrap();
        let locator = UpdateLocator::new("main", "1.0.0", "u1");
        let err = store.get_file(&locator, "../../etc/passwd").await.unwrap_err();
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn state_markers_are_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(&test_config(&dir)).unwrap();
        let locator = UpdateLocator::new("main", "1.0.0", "u1");
        store
            .upload_file(&locator, "metadata.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        store.set_update_state(&locator, false).await.unwrap();
        let files = store.list_objects(&locator.prefix()).await.unwrap();
        assert!(files.contains(&"inactive".to_string()));
        assert!(!files.contains(&"active".to_string()));

        store.set_update_state(&locator, true).await.unwrap();
        let files = store.list_objects(&locator.prefix()).await.unwrap();
        assert!(files.contains(&"active".to_string()));
        assert!(!files.contains(&"inactive".to_string()));
    }

    #[tokio::test]
    async fn upload_urls_bind_the_exact_target_path() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(&test_config(&dir)).unwrap();
        let locator = UpdateLocator::new("main", "1.0.0", "u1");
        let requests = store
            .request_upload_urls(&locator, &["assets/logo.png".to_string()])
            .await
            .unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].file_path, "updates/main/1.0.0/u1/assets/logo.png");
        assert!(requests[0]
            .request_upload_url
            .starts_with("http://localhost:3000/uploadLocalFile?token="));
    }
}
