//! S3-compatible store.
//!
//! Discovery uses delimiter-scoped `ListObjectsV2` calls; upload URLs are
//! native presigned PUTs with a content-type binding, downloads can redirect
//! through presigned GETs.

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{
    ObjectStream, RuntimeVersionInfo, StoreError, UpdateFolder, UpdateLocator, UpdateStore,
    UploadRequest, UPDATES_PREFIX, UPLOAD_URL_TTL,
};
use crate::config::ServerConfig;

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let bucket = config
            .s3_bucket_name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("s3 store requires S3_BUCKET_NAME"))?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.aws_region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        Ok(Self {
            client: Client::new(&sdk_config),
            bucket,
        })
    }

    /// Common prefixes directly under `prefix` (one delimiter level), with
    /// the trailing `/` stripped.
    async fn child_prefixes(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut children = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .delimiter("/")
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(StoreError::backend)?;
            for common in page.common_prefixes() {
                if let Some(p) = common.prefix() {
                    let name = p
                        .strip_prefix(prefix)
                        .unwrap_or(p)
                        .trim_end_matches('/')
                        .to_string();
                    if !name.is_empty() {
                        children.push(name);
                    }
                }
            }
        }
        children.sort();
        Ok(children)
    }

    /// Every object under `prefix`, as `(relative key, last modified)`.
    async fn objects_under(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Option<DateTime<Utc>>)>, StoreError> {
        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(StoreError::backend)?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let Some(relative) = key.strip_prefix(prefix) else {
                    continue;
                };
                if relative.is_empty() {
                    continue;
                }
                let modified = object
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0));
                objects.push((relative.to_string(), modified));
            }
        }
        Ok(objects)
    }
}

#[async_trait]
impl UpdateStore for S3Store {
    async fn list_branches(&self) -> Result<Vec<String>, StoreError> {
        self.child_prefixes(&format!("{UPDATES_PREFIX}/")).await
    }

    async fn list_runtime_versions(
        &self,
        branch: &str,
    ) -> Result<Vec<RuntimeVersionInfo>, StoreError> {
        // One recursive listing per branch; versions, update counts, and
        // timestamp bounds all come out of the same page set.
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
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    StoreError::NotFound(key.clone())
                } else {
                    StoreError::backend(service)
                }
            })?;
        let content_length = resp.content_length().map(|l| l as u64);
        Ok(ObjectStream {
            content_length,
            reader: Box::new(resp.body.into_async_read()),
        })
    }

    async fn file_exists(
        &self,
        locator: &UpdateLocator,
        file_name: &str,
    ) -> Result<bool, StoreError> {
        let key = locator.object_key(file_name);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(StoreError::backend(service))
                }
            }
        }
    }

    async fn read_object(&self, key: &str) -> Result<Bytes, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::backend(service)
                }
            })?;
        let data = resp.body.collect().await.map_err(StoreError::backend)?;
        Ok(data.into_bytes())
    }

    async fn write_object(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StoreError::backend(e.into_service_error()))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::backend(e.into_service_error()))?;
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
        let presigning = PresigningConfig::expires_in(UPLOAD_URL_TTL)
            .map_err(StoreError::backend)?;
        let mut requests = Vec::with_capacity(file_names.len());
        for file_name in file_names {
            let file_path = locator.object_key(file_name);
            let content_type = mime_guess::from_path(file_name)
                .first_or_octet_stream()
                .to_string();
            let presigned = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&file_path)
                .content_type(content_type)
                .presigned(presigning.clone())
                .await
                .map_err(|e| StoreError::backend(e.into_service_error()))?;
            requests.push(UploadRequest {
                request_upload_url: presigned.uri().to_string(),
                file_name: file_name.clone(),
                file_path,
            });
        }
        Ok(requests)
    }

    async fn signed_download_url(
        &self,
        locator: &UpdateLocator,
        file_name: &str,
    ) -> Result<Option<String>, StoreError> {
        let presigning = PresigningConfig::expires_in(UPLOAD_URL_TTL)
            .map_err(StoreError::backend)?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(locator.object_key(file_name))
            .presigned(presigning)
            .await
            .map_err(|e| StoreError::backend(e.into_service_error()))?;
        Ok(Some(presigned.uri().to_string()))
    }
}
