use anyhow::{Context, Result};
use db::SqliteStore;
use genbatch_core::{StateStore, TaskSource};
use remote::{GenerationClient, RecordsClient};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{secret_from_env, BackendKind, GenbatchConfig, GeneratorConfig};

const STORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Task source and state store selected by `[store] backend`.
pub struct Backend {
    pub source: Arc<dyn TaskSource>,
    pub store: Arc<dyn StateStore>,
    sqlite: Option<SqliteStore>,
}

impl Backend {
    pub async fn open(config: &GenbatchConfig, dir: &Path) -> Result<Self> {
        match config.store.backend {
            BackendKind::Sqlite => {
                let url = config.database_url(dir);
                let pool = db::open(&url)
                    .await
                    .with_context(|| format!("Failed to open database {}", url))?;
                let store = SqliteStore::new(pool);
                tracing::debug!(%url, "Opened sqlite store");
                Ok(Self {
                    source: Arc::new(store.clone()),
                    store: Arc::new(store.clone()),
                    sqlite: Some(store),
                })
            }
            BackendKind::Rest => {
                let http = reqwest::Client::builder()
                    .timeout(STORE_REQUEST_TIMEOUT)
                    .build()
                    .context("Failed to build HTTP client")?;
                let mut client = RecordsClient::with_client(&config.store.rest_url, http);
                match secret_from_env(&config.store.api_key_env) {
                    Some(key) => client = client.with_api_key(key),
                    None => tracing::warn!(
                        var = %config.store.api_key_env,
                        "No records API key set, sending unauthenticated requests"
                    ),
                }
                tracing::debug!(url = %config.store.rest_url, "Using records service");
                Ok(Self {
                    source: Arc::new(client.clone()),
                    store: Arc::new(client),
                    sqlite: None,
                })
            }
        }
    }

    /// The local store, when the backend is sqlite.
    pub fn sqlite(&self) -> Option<&SqliteStore> {
        self.sqlite.as_ref()
    }
}

pub fn generator(config: &GeneratorConfig) -> GenerationClient {
    let client = GenerationClient::new(&config.url)
        .with_timeout(Duration::from_secs(config.timeout_secs));
    match secret_from_env(&config.api_key_env) {
        Some(key) => client.with_api_key(key),
        None => client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genbatch_core::Scope;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_backend_starts_empty() {
        let dir = TempDir::new().unwrap();
        let config = GenbatchConfig::default();

        let backend = Backend::open(&config, dir.path()).await.unwrap();
        assert!(backend.sqlite().is_some());
        backend.store.health_check().await.unwrap();

        let stats = backend.store.get_stats(&Scope::new("default")).await.unwrap();
        assert_eq!(stats.total, 0);
        assert!(dir.path().join(&config.store.database).exists());
    }

    #[tokio::test]
    async fn test_rest_backend_has_no_local_store() {
        let dir = TempDir::new().unwrap();
        let mut config = GenbatchConfig::default();
        config.store.backend = BackendKind::Rest;

        let backend = Backend::open(&config, dir.path()).await.unwrap();
        assert!(backend.sqlite().is_none());
        assert!(!dir.path().join(&config.store.database).exists());
    }
}
