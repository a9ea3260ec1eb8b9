use std::sync::Arc;

use moka::future::Cache;

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::registry::{Loader, RegistryHandle};
use crate::store::Store;

/// Permission-evaluation results are cheap to recompute but looked up on
/// every request; a short-lived cache avoids re-walking the registry's
/// permission index under steady load, the same shape as the teacher's
/// `OrgMembershipCache`.
pub type PermissionCache = Cache<String, Arc<Vec<crate::registry::model::PermissionDef>>>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub registry: RegistryHandle,
    pub http_client: reqwest::Client,
    pub permission_cache: PermissionCache,
}

impl AppState {
    pub async fn build(config: AppConfig) -> AppResult<Self> {
        let store = Store::connect(&config)
            .await
            .map_err(|error| crate::error::AppError::Internal(format!("database connection failed: {error}")))?;
        let store = Arc::new(store);
        crate::migrator::ensure_catalog_tables(&store).await?;

        let registry = {
            let loader = Loader::new(&store);
            loader.load().await.unwrap_or_default_registry()
        };

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.webhook_attempt_timeout_ms))
            .build()
            .map_err(|error| crate::error::AppError::Internal(format!("http client build failed: {error}")))?;

        let permission_cache = Cache::builder()
            .max_capacity(1_000)
            .time_to_live(std::time::Duration::from_secs(30))
            .build();

        Ok(Self {
            config: Arc::new(config),
            store,
            registry: RegistryHandle::new(registry),
            http_client,
            permission_cache,
        })
    }

    /// Re-queries every catalog table and atomically publishes the result.
    /// Called after any admin metadata mutation (spec §4.1).
    pub async fn reload_registry(&self) -> AppResult<()> {
        let loader = Loader::new(&self.store);
        let registry = loader.load().await?;
        self.registry.publish(registry);
        self.permission_cache.invalidate_all();
        Ok(())
    }
}

/// Startup must not fail outright if the catalog tables are empty on a
/// fresh database (the migrator creates them but they start with zero
/// rows); an empty registry is valid, just a no-op one.
trait RegistryLoadExt {
    fn unwrap_or_default_registry(self) -> crate::registry::Registry;
}

impl RegistryLoadExt for AppResult<crate::registry::Registry> {
    fn unwrap_or_default_registry(self) -> crate::registry::Registry {
        match self {
            Ok(registry) => registry,
            Err(error) => {
                tracing::warn!(error = %error, "registry load failed at startup, starting empty");
                crate::registry::Registry::default()
            }
        }
    }
}
