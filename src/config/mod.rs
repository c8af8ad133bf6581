use anyhow::{bail, Context, Result};
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_LOCAL_BUCKET_BASE_PATH: &str = "./data";

/// Which object-store backend serves update folders.
///
/// Selected once at startup from `STORAGE_MODE` (or its legacy alias
/// `BUCKET_TYPE`) and never changed at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Local,
    S3,
    Firebase,
}

impl StorageMode {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "firebase" | "gcs" => Ok(Self::Firebase),
            other => bail!("unknown storage mode '{other}' (expected local, s3, or firebase)"),
        }
    }
}

/// Where the RSA manifest-signing keypair is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeysStorageType {
    Local,
    S3,
    Firebase,
}

impl KeysStorageType {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "firebase" | "gcs" => Ok(Self::Firebase),
            other => bail!("unknown keys storage type '{other}'"),
        }
    }
}

/// Server configuration, read once at startup.
///
/// Priority: CLI / env var > built-in default. Integration tests construct
/// this struct directly instead of going through the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Absolute URL this server is reachable at; used to construct asset
    /// URLs inside manifests and service-relative upload URLs.
    pub base_url: String,
    /// HTTP listen port (`PORT`, default 3000).
    pub port: u16,
    pub storage_mode: StorageMode,
    /// Root directory of the local store (`LOCAL_BUCKET_BASE_PATH`).
    pub local_bucket_base_path: PathBuf,
    pub s3_bucket_name: Option<String>,
    pub aws_region: Option<String>,
    pub firebase_project_id: Option<String>,
    pub firebase_storage_bucket: Option<String>,
    /// Base64-encoded service-account JSON (`FIREBASE_SERVICE_ACCOUNT`).
    pub firebase_service_account: Option<String>,
    /// HMAC secret for service-relative upload tokens. Required whenever
    /// uploads are routed back through `/uploadLocalFile` (local and
    /// firebase modes).
    pub jwt_secret: Option<String>,
    /// Expo application id, embedded in the manifest's client config.
    pub expo_app_id: String,
    /// Static publisher bearer token (`EXPO_ACCESS_TOKEN`). None disables
    /// the static verifier.
    pub expo_access_token: Option<String>,
    /// Dashboard password — consumed by the external admin UI; carried here
    /// so the dashboard collaborator can read it from one place.
    pub admin_password: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub public_key_path: Option<PathBuf>,
    pub keys_storage_type: KeysStorageType,
}

impl ServerConfig {
    /// Build config from the process environment.
    ///
    /// `BASE_URL` and `EXPO_APP_ID` are hard requirements; storage-specific
    /// variables are validated against the selected `STORAGE_MODE` so a
    /// misconfigured deployment fails at startup, not on first request.
    pub fn from_env() -> Result<Self> {
        let base_url = require_env("BASE_URL")?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let port = match std::env::var("PORT") {
            Ok(v) => v.parse::<u16>().context("PORT is not a valid port number")?,
            Err(_) => DEFAULT_PORT,
        };

        let storage_mode = match optional_env("STORAGE_MODE").or_else(|| optional_env("BUCKET_TYPE"))
        {
            Some(v) => StorageMode::parse(&v)?,
            None => StorageMode::Local,
        };

        let keys_storage_type = match optional_env("KEYS_STORAGE_TYPE") {
            Some(v) => KeysStorageType::parse(&v)?,
            None => KeysStorageType::Local,
        };

        let config = Self {
            base_url,
            port,
            storage_mode,
            local_bucket_base_path: optional_env("LOCAL_BUCKET_BASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_BUCKET_BASE_PATH)),
            s3_bucket_name: optional_env("S3_BUCKET_NAME"),
            aws_region: optional_env("AWS_REGION"),
            firebase_project_id: optional_env("FIREBASE_PROJECT_ID"),
            firebase_storage_bucket: optional_env("FIREBASE_STORAGE_BUCKET"),
            firebase_service_account: optional_env("FIREBASE_SERVICE_ACCOUNT"),
            jwt_secret: optional_env("JWT_SECRET"),
            expo_app_id: require_env("EXPO_APP_ID")?,
            expo_access_token: optional_env("EXPO_ACCESS_TOKEN"),
            admin_password: optional_env("ADMIN_PASSWORD"),
            private_key_path: optional_env("PRIVATE_LOCAL_EXPO_KEY_PATH").map(PathBuf::from),
            public_key_path: optional_env("PUBLIC_LOCAL_EXPO_KEY_PATH").map(PathBuf::from),
            keys_storage_type,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.storage_mode {
            StorageMode::Local | StorageMode::Firebase => {
                // These modes route uploads back through /uploadLocalFile,
                // which is gated by HS256 tokens.
                if self.jwt_secret.is_none() {
                    bail!(
                        "JWT_SECRET is required in {:?} storage mode",
                        self.storage_mode
                    );
                }
            }
            StorageMode::S3 => {}
        }

        match self.storage_mode {
            StorageMode::S3 if self.s3_bucket_name.is_none() => {
                bail!("S3_BUCKET_NAME is required in s3 storage mode");
            }
            StorageMode::Firebase if self.firebase_storage_bucket.is_none() => {
                bail!("FIREBASE_STORAGE_BUCKET is required in firebase storage mode");
            }
            _ => {}
        }

        Ok(())
    }

    /// Absolute URL of the asset endpoint, used when shaping manifest assets.
    pub fn asset_endpoint(&self) -> String {
        format!("{}/api/update/assets", self.base_url)
    }
}

fn require_env(name: &str) -> Result<String> {
    optional_env(name).with_context(|| format!("{name} environment variable is required"))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
