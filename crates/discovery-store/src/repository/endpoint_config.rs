//! # Endpoint Config Repository
//!
//! One row per acknowledged endpoint, keyed by endpoint id.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  on_discovery_completed(add, delete)                                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  INSERT INTO endpoint_configs ... ON CONFLICT DO UPDATE (× n)   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  DELETE FROM endpoint_configs WHERE endpoint_id = ? (× m)       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::StoreResult;
use discovery_core::{EndpointConfig, EndpointConfigMap, EndpointId};

/// Repository for the `endpoint_configs` table.
#[derive(Debug, Clone)]
pub struct EndpointConfigRepository {
    pool: SqlitePool,
}

impl EndpointConfigRepository {
    /// Creates a new EndpointConfigRepository.
    pub fn new(pool: SqlitePool) -> Self {
        EndpointConfigRepository { pool }
    }

    /// True when the `endpoint_configs` table exists.
    pub async fn table_exists(&self) -> StoreResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'endpoint_configs'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Inserts or replaces the config of one endpoint.
    pub async fn upsert(&self, endpoint_id: &str, config: &EndpointConfig) -> StoreResult<()> {
        debug!(endpoint_id = %endpoint_id, bytes = config.len(), "Storing endpoint config");

        sqlx::query(
            r#"
            INSERT INTO endpoint_configs (endpoint_id, endpoint_config, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(endpoint_id) DO UPDATE SET
                endpoint_config = excluded.endpoint_config,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(endpoint_id)
        .bind(config.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts or replaces many configs atomically.
    pub async fn upsert_all(&self, configs: &EndpointConfigMap) -> StoreResult<()> {
        if configs.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for (endpoint_id, config) in configs {
            sqlx::query(
                r#"
                INSERT INTO endpoint_configs (endpoint_id, endpoint_config, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(endpoint_id) DO UPDATE SET
                    endpoint_config = excluded.endpoint_config,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(endpoint_id)
            .bind(config.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(count = configs.len(), "Stored endpoint configs");
        Ok(())
    }

    /// Gets the config of one endpoint.
    pub async fn get(&self, endpoint_id: &str) -> StoreResult<Option<EndpointConfig>> {
        let config: Option<String> = sqlx::query_scalar(
            "SELECT endpoint_config FROM endpoint_configs WHERE endpoint_id = ?1",
        )
        .bind(endpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(config.map(EndpointConfig::from_raw))
    }

    /// Gets every stored config.
    pub async fn get_all(&self) -> StoreResult<EndpointConfigMap> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT endpoint_id, endpoint_config FROM endpoint_configs ORDER BY endpoint_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, config)| (id, EndpointConfig::from_raw(config)))
            .collect())
    }

    /// Deletes one endpoint. Returns whether a row existed.
    pub async fn delete(&self, endpoint_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM endpoint_configs WHERE endpoint_id = ?1")
            .bind(endpoint_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes many endpoints atomically. Returns the number of rows removed.
    pub async fn delete_all(&self, endpoint_ids: &[EndpointId]) -> StoreResult<u64> {
        if endpoint_ids.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        let mut tx = self.pool.begin().await?;

        for endpoint_id in endpoint_ids {
            let result = sqlx::query("DELETE FROM endpoint_configs WHERE endpoint_id = ?1")
                .bind(endpoint_id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }

        tx.commit().await?;

        debug!(requested = endpoint_ids.len(), removed, "Erased endpoint configs");
        Ok(removed)
    }

    /// Removes every row. Returns the number of rows removed.
    pub async fn clear(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM endpoint_configs").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Counts stored endpoints.
    pub async fn count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM endpoint_configs")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
