//! Backend selection
//!
//! Opens exactly one backend from [`DatabaseConfig`]; the rest of the
//! program only ever sees the resulting [`SharedStore`].

use membersys_core::config::{DatabaseConfig, WideColumnConfig, WideColumnEngineKind};
use membersys_core::{Result, SharedClock};
use std::sync::Arc;
use tracing::info;

use crate::call::StoreOptions;
use crate::trait_::SharedStore;
use crate::wide_column::{MemoryEngine, WideColumnStore};

fn wide_column_options(config: &WideColumnConfig) -> StoreOptions {
    StoreOptions {
        timeout: config.timeout(),
        retry: config.retry_policy(),
        listing_consistency: config.listing_consistency,
    }
}

/// Open the store named by `config`
pub async fn open_store(config: &DatabaseConfig, clock: SharedClock) -> Result<SharedStore> {
    let store: SharedStore = match config {
        DatabaseConfig::WideColumn(wc) => match wc.engine {
            WideColumnEngineKind::Memory => {
                let engine = Arc::new(MemoryEngine::new(clock.clone()));
                Arc::new(WideColumnStore::new(engine, clock, wide_column_options(wc)))
            }
            WideColumnEngineKind::Cassandra => open_cassandra(wc, clock).await?,
        },
        DatabaseConfig::Relational(rel) => open_relational(rel, clock).await?,
    };
    info!(backend = store.backend_name(), "record store opened");
    Ok(store)
}

#[cfg(feature = "cassandra")]
async fn open_cassandra(config: &WideColumnConfig, clock: SharedClock) -> Result<SharedStore> {
    let engine = Arc::new(crate::wide_column::ScyllaEngine::connect(config).await?);
    Ok(Arc::new(WideColumnStore::new(engine, clock, wide_column_options(config))))
}

#[cfg(not(feature = "cassandra"))]
async fn open_cassandra(_config: &WideColumnConfig, _clock: SharedClock) -> Result<SharedStore> {
    Err(membersys_core::StoreError::InvalidArgument(
        "wide-column engine `cassandra` requires the `cassandra` feature".to_string(),
    ))
}

#[cfg(feature = "sqlite")]
async fn open_relational(
    config: &membersys_core::config::RelationalConfig,
    clock: SharedClock,
) -> Result<SharedStore> {
    Ok(Arc::new(crate::sqlite::SqliteStore::open(config, clock).await?))
}

#[cfg(not(feature = "sqlite"))]
async fn open_relational(
    _config: &membersys_core::config::RelationalConfig,
    _clock: SharedClock,
) -> Result<SharedStore> {
    Err(membersys_core::StoreError::InvalidArgument(
        "relational backend requires the `sqlite` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use membersys_core::config::RelationalConfig;
    use membersys_core::system_clock;

    #[tokio::test]
    async fn test_memory_engine() {
        let store = open_store(&DatabaseConfig::WideColumn(WideColumnConfig::memory()), system_clock())
            .await
            .unwrap();
        assert_eq!(store.backend_name(), "wide_column");
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_relational() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig::Relational(RelationalConfig::new(dir.path().join("m.db")));
        let store = open_store(&config, system_clock()).await.unwrap();
        assert_eq!(store.backend_name(), "relational");
    }

    #[cfg(not(feature = "cassandra"))]
    #[tokio::test]
    async fn test_cassandra_needs_feature() {
        let mut config = WideColumnConfig::memory();
        config.engine = WideColumnEngineKind::Cassandra;
        config.hosts = vec!["127.0.0.1:9042".to_string()];
        let err = open_store(&DatabaseConfig::WideColumn(config), system_clock())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), membersys_core::ErrorKind::InvalidArgument);
    }
}
