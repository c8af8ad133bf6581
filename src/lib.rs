pub mod auth;
pub mod cache;
pub mod config;
pub mod manifest;
pub mod metadata;
pub mod registry;
pub mod rest;
pub mod store;
pub mod upload;

use std::sync::Arc;

use anyhow::Result;

use auth::IdentityVerifier;
use cache::ContentCache;
use config::ServerConfig;
use manifest::signing::ManifestSigner;
use registry::UpdateRegistry;
use store::UpdateStore;
use upload::UploadCoordinator;

/// Shared application state passed to every route handler.
///
/// Everything here is init-once: configuration, the chosen store, the cache
/// handle, and the lazily-read signing key. Tests swap the store and the
/// identity verifier by constructing the context from parts.
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn UpdateStore>,
    pub cache: Arc<ContentCache>,
    pub registry: Arc<UpdateRegistry>,
    pub coordinator: Arc<UploadCoordinator>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub signer: ManifestSigner,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire the context from explicit parts.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn UpdateStore>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let cache = Arc::new(ContentCache::new());
        let registry = Arc::new(UpdateRegistry::new(Arc::clone(&store), Arc::clone(&cache)));
        let coordinator = Arc::new(UploadCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&config),
        ));
        Arc::new(Self {
            config,
            store,
            cache,
            registry,
            coordinator,
            verifier,
            signer: ManifestSigner::new(),
            started_at: std::time::Instant::now(),
        })
    }

    /// Build the full context from configuration: store selected by
    /// `STORAGE_MODE`, verifier by `EXPO_ACCESS_TOKEN`.
    pub async fn from_config(config: ServerConfig) -> Result<Arc<Self>> {
        let store = store::from_config(&config).await?;
        let verifier = auth::verifier_from_config(&config);
        Ok(Self::new(config, store, verifier))
    }
}
