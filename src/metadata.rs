//! `metadata.json` loading and the content-hash identity of an update.
//!
//! The identity is the SHA-256 of the file's bytes exactly as stored —
//! re-reading without mutation always yields the same id, and any edit to
//! the metadata changes it. The manifest id is that hash reshaped into a
//! well-formed UUID.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cache::{keys, ContentCache};
use crate::store::{StoreError, UpdateLocator, UpdateStore, LEGACY_METADATA_FILE, METADATA_FILE};

// ─── Platform ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ios" => Some(Self::Ios),
            "android" => Some(Self::Android),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }
}

// ─── Metadata shapes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AssetRef {
    pub path: String,
    #[serde(default)]
    pub ext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlatformMetadata {
    #[serde(default)]
    pub bundle: String,
    #[serde(default)]
    pub assets: Vec<AssetRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ios: Option<PlatformMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub android: Option<PlatformMetadata>,
}

impl FileMetadata {
    pub fn platform(&self, platform: Platform) -> Option<&PlatformMetadata> {
        match platform {
            Platform::Ios => self.ios.as_ref(),
            Platform::Android => self.android.as_ref(),
        }
    }
}

/// The stored `metadata.json` shape. `extra` is a bag of unknown keys; the
/// accessors below tolerate missing or mis-typed fields by treating them as
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataObject {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub bundler: String,
    #[serde(rename = "fileMetadata", default)]
    pub file_metadata: FileMetadata,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl MetadataObject {
    fn extra_str(&self, key: &str) -> Option<String> {
        match self.extra.get(key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// `extra.buildNumber`, falling back to the publisher CLI's legacy
    /// `extra.updateCode` spelling.
    pub fn build_number(&self) -> Option<String> {
        self.extra_str("buildNumber")
            .or_else(|| self.extra_str("updateCode"))
    }

    pub fn commit_hash(&self) -> Option<String> {
        self.extra_str("commitHash")
    }

    pub fn platform_hint(&self) -> Option<String> {
        self.extra_str("platform")
    }
}

/// Stub written at upload-begin time so the update is immediately readable.
pub fn stub_metadata(
    commit_hash: Option<&str>,
    build_number: Option<&str>,
    platform: Option<&str>,
) -> MetadataObject {
    let mut extra = serde_json::Map::new();
    if let Some(commit) = commit_hash {
        extra.insert("commitHash".to_string(), commit.into());
    }
    if let Some(build) = build_number {
        extra.insert("updateCode".to_string(), build.into());
    }
    if let Some(platform) = platform {
        extra.insert("platform".to_string(), platform.into());
    }
    MetadataObject {
        version: 0,
        bundler: "metro".to_string(),
        file_metadata: FileMetadata {
            ios: Some(PlatformMetadata::default()),
            android: Some(PlatformMetadata::default()),
        },
        extra: serde_json::Value::Object(extra),
    }
}

// ─── Loaded metadata ──────────────────────────────────────────────────────────

/// Parsed metadata plus the stable identity of its bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedMetadata {
    pub metadata: MetadataObject,
    /// `hex(SHA256(bytes of metadata.json))`.
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl LoadedMetadata {
    /// The manifest id this metadata produces.
    pub fn manifest_id(&self) -> Result<Uuid> {
        convert_sha256_hash_to_uuid(&self.id)
    }
}

/// Load and cache the update's metadata, preferring `metadata.json` and
/// falling back to the legacy `update-metadata.json` spelling. A missing
/// file, malformed JSON, or an absent bundle for the requested platform is
/// a hard failure for this update only — callers skip it and move to the
/// next candidate.
pub async fn load(
    store: &dyn UpdateStore,
    cache: &ContentCache,
    locator: &UpdateLocator,
    created_at: DateTime<Utc>,
) -> Result<LoadedMetadata> {
    let cache_key = keys::metadata(&locator.branch, &locator.runtime_version, &locator.update_id);
    if let Some(cached) = cache.get::<LoadedMetadata>(&cache_key).await {
        return Ok(cached);
    }

    let bytes = match store.get_file_bytes(locator, METADATA_FILE).await {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => store
            .get_file_bytes(locator, LEGACY_METADATA_FILE)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(key) => {
                    anyhow::anyhow!("update has no metadata.json ({key})")
                }
                other => anyhow::Error::from(other),
            })?,
        Err(other) => return Err(other.into()),
    };

    let id = hex::encode(Sha256::digest(&bytes));
    let metadata: MetadataObject = serde_json::from_slice(&bytes)
        .with_context(|| format!("malformed metadata.json in {}", locator.prefix()))?;

    let loaded = LoadedMetadata {
        metadata,
        id,
        created_at,
    };
    cache.put(&cache_key, &loaded).await;
    Ok(loaded)
}

/// Reshape a SHA-256 hex digest into a well-formed UUID: the first sixteen
/// bytes with the version and variant bits forced, hyphenated by the uuid
/// formatter.
pub fn convert_sha256_hash_to_uuid(hash_hex: &str) -> Result<Uuid> {
    if hash_hex.len() < 32 {
        bail!("hash too short for uuid conversion: {hash_hex}");
    }
    let raw = hex::decode(&hash_hex[..32]).context("hash is not hex")?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&raw);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Ok(Uuid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_conversion_is_deterministic_and_well_formed() {
        let hash = hex::encode(Sha256::digest(b"some metadata"));
        let a = convert_sha256_hash_to_uuid(&hash).unwrap();
        let b = convert_sha256_hash_to_uuid(&hash).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 4);
        // RFC 4122 variant
        assert_eq!(a.as_bytes()[8] & 0xc0, 0x80);
    }

    #[test]
    fn uuid_conversion_differs_per_content() {
        let a = convert_sha256_hash_to_uuid(&hex::encode(Sha256::digest(b"a"))).unwrap();
        let b = convert_sha256_hash_to_uuid(&hex::encode(Sha256::digest(b"b"))).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn uuid_conversion_rejects_short_input() {
        assert!(convert_sha256_hash_to_uuid("abcd").is_err());
    }

    #[test]
    fn extra_accessors_tolerate_missing_and_mistyped_fields() {
        let metadata: MetadataObject = serde_json::from_str(
            r#"{"version":0,"bundler":"metro","fileMetadata":{},"extra":{"buildNumber":7,"commitHash":["not","a","string"]}}"#,
        )
        .unwrap();
        assert_eq!(metadata.build_number().as_deref(), Some("7"));
        assert_eq!(metadata.commit_hash(), None);

        let stub = stub_metadata(Some("abc123"), Some("build-6"), Some("ios"));
        assert_eq!(stub.build_number().as_deref(), Some("build-6"));
        assert_eq!(stub.commit_hash().as_deref(), Some("abc123"));
        assert_eq!(stub.bundler, "metro");
    }

    #[test]
    fn platform_parse_round_trips() {
        assert_eq!(Platform::parse("ios"), Some(Platform::Ios));
        assert_eq!(Platform::parse("android"), Some(Platform::Android));
        assert_eq!(Platform::parse("windows"), None);
        assert_eq!(Platform::Ios.as_str(), "ios");
    }
}
