//! # Endpoint Config Store
//!
//! The persisted store contract the registry depends on, and its SQLite
//! implementation.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌──────────┐  open() ok          ┌──────────┐                        │
//! │   │  CLOSED  │────────────────────►│   OPEN   │◄──┐                    │
//! │   └────┬─────┘                     └────┬─────┘   │                    │
//! │        │ open() failed                  │ close() │ create() ok        │
//! │        ▼                                ▼         │                    │
//! │   create()  ──────────────────────────────────────┘                    │
//! │                                                                         │
//! │   Every data operation on a CLOSED store fails with NotOpen.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Implementations must be safe under concurrent calls.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::pool::{Database, DbConfig};
use discovery_core::{EndpointConfig, EndpointConfigMap, EndpointId};

// =============================================================================
// Store Contract
// =============================================================================

/// Durable map `EndpointId → EndpointConfig`.
#[async_trait]
pub trait EndpointConfigStore: Send + Sync {
    /// Creates (or recreates) the backing storage and leaves it open.
    async fn create(&self) -> StoreResult<()>;

    /// Opens existing storage. Fails if it was never created.
    async fn open(&self) -> StoreResult<()>;

    async fn close(&self);

    async fn store(&self, endpoint_id: &str, config: &EndpointConfig) -> StoreResult<()>;

    /// Stores every entry, all or nothing.
    async fn store_all(&self, configs: &EndpointConfigMap) -> StoreResult<()>;

    async fn load_all(&self) -> StoreResult<EndpointConfigMap>;

    async fn load(&self, endpoint_id: &str) -> StoreResult<Option<EndpointConfig>>;

    async fn erase(&self, endpoint_id: &str) -> StoreResult<()>;

    /// Erases every listed id, all or nothing. Unknown ids are ignored.
    async fn erase_all(&self, endpoint_ids: &[EndpointId]) -> StoreResult<()>;

    /// Removes every entry.
    async fn clear(&self) -> StoreResult<()>;
}

// =============================================================================
// SQLite Implementation
// =============================================================================

/// [`EndpointConfigStore`] backed by a SQLite database.
pub struct SqliteEndpointStore {
    config: DbConfig,
    db: RwLock<Option<Database>>,
}

impl SqliteEndpointStore {
    /// Creates a closed store for the given database.
    pub fn new(config: DbConfig) -> Self {
        SqliteEndpointStore {
            config,
            db: RwLock::new(None),
        }
    }

    /// True when the store is open.
    pub async fn is_open(&self) -> bool {
        self.db.read().await.is_some()
    }

    /// Clones the open database handle so no lock is held during queries.
    async fn database(&self) -> StoreResult<Database> {
        self.db.read().await.clone().ok_or(StoreError::NotOpen)
    }

    async fn replace(&self, db: Database) {
        let previous = self.db.write().await.replace(db);
        if let Some(previous) = previous {
            previous.close().await;
        }
    }
}

#[async_trait]
impl EndpointConfigStore for SqliteEndpointStore {
    async fn create(&self) -> StoreResult<()> {
        info!(path = %self.config.database_path.display(), "Creating endpoint config store");

        let config = self.config.clone().create_if_missing(true).run_migrations(true);
        let db = Database::new(config).await?;
        self.replace(db).await;
        Ok(())
    }

    async fn open(&self) -> StoreResult<()> {
        let config = self.config.clone().create_if_missing(false).run_migrations(false);
        let db = Database::new(config).await?;

        match db.endpoint_configs().table_exists().await {
            Ok(true) => {}
            Ok(false) => {
                db.close().await;
                return Err(StoreError::SchemaMissing("endpoint_configs".to_string()));
            }
            Err(e) => {
                db.close().await;
                return Err(e);
            }
        }

        // Picks up migrations added after the store was created.
        db.run_migrations().await?;

        info!(path = %self.config.database_path.display(), "Opened endpoint config store");
        self.replace(db).await;
        Ok(())
    }

    async fn close(&self) {
        let db = self.db.write().await.take();
        match db {
            Some(db) => db.close().await,
            None => debug!("Endpoint config store already closed"),
        }
    }

    async fn store(&self, endpoint_id: &str, config: &EndpointConfig) -> StoreResult<()> {
        self.database().await?.endpoint_configs().upsert(endpoint_id, config).await
    }

    async fn store_all(&self, configs: &EndpointConfigMap) -> StoreResult<()> {
        self.database().await?.endpoint_configs().upsert_all(configs).await
    }

    async fn load_all(&self) -> StoreResult<EndpointConfigMap> {
        self.database().await?.endpoint_configs().get_all().await
    }

    async fn load(&self, endpoint_id: &str) -> StoreResult<Option<EndpointConfig>> {
        self.database().await?.endpoint_configs().get(endpoint_id).await
    }

    async fn erase(&self, endpoint_id: &str) -> StoreResult<()> {
        if !self.database().await?.endpoint_configs().delete(endpoint_id).await? {
            debug!(endpoint_id = %endpoint_id, "Erase of unknown endpoint ignored");
        }
        Ok(())
    }

    async fn erase_all(&self, endpoint_ids: &[EndpointId]) -> StoreResult<()> {
        let removed = self.database().await?.endpoint_configs().delete_all(endpoint_ids).await?;
        if removed < endpoint_ids.len() as u64 {
            warn!(
                requested = endpoint_ids.len(),
                removed, "Some erased endpoints were not stored"
            );
        }
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        let removed = self.database().await?.endpoint_configs().clear().await?;
        info!(removed, "Cleared endpoint config store");
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str) -> EndpointConfig {
        EndpointConfig::from_raw(format!("{{\"endpointId\":\"{}\"}}", id))
    }

    #[tokio::test]
    async fn test_operations_require_open_store() {
        let store = SqliteEndpointStore::new(DbConfig::in_memory());

        assert!(!store.is_open().await);
        assert!(matches!(store.load_all().await, Err(StoreError::NotOpen)));
        assert!(matches!(store.store("e1", &config("e1")).await, Err(StoreError::NotOpen)));
    }

    #[tokio::test]
    async fn test_open_falls_back_to_create() {
        let store = SqliteEndpointStore::new(DbConfig::in_memory());

        assert!(store.open().await.is_err());
        store.create().await.unwrap();
        assert!(store.is_open().await);
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_load_erase() {
        let store = SqliteEndpointStore::new(DbConfig::in_memory());
        store.create().await.unwrap();

        store.store("e1", &config("e1")).await.unwrap();
        let mut batch = EndpointConfigMap::new();
        batch.insert("e2".into(), config("e2"));
        batch.insert("e3".into(), config("e3"));
        store.store_all(&batch).await.unwrap();

        assert_eq!(store.load("e2").await.unwrap(), Some(config("e2")));
        assert_eq!(store.load_all().await.unwrap().len(), 3);

        store.erase("e1").await.unwrap();
        store.erase("never-stored").await.unwrap();
        store.erase_all(&["e2".to_string()]).await.unwrap();

        let left = store.load_all().await.unwrap();
        assert_eq!(left.keys().cloned().collect::<Vec<_>>(), vec!["e3".to_string()]);

        store.clear().await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());

        store.close().await;
        store.close().await;
        assert!(matches!(store.load("e3").await, Err(StoreError::NotOpen)));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let name = format!("discovery-store-reopen-{}.db", std::process::id());
        let path = std::env::temp_dir().join(name);
        let _ = std::fs::remove_file(&path);

        let store = SqliteEndpointStore::new(DbConfig::new(&path));
        assert!(store.open().await.is_err());
        store.create().await.unwrap();
        store.store("e1", &config("e1")).await.unwrap();
        store.close().await;

        let reopened = SqliteEndpointStore::new(DbConfig::new(&path));
        reopened.open().await.unwrap();
        assert_eq!(reopened.load("e1").await.unwrap(), Some(config("e1")));
        reopened.close().await;

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }
}
