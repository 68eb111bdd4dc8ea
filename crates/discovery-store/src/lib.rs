//! # discovery-store: Persisted Endpoint Configs
//!
//! The durable map `EndpointId → EndpointConfig` that survives restarts.
//! The registry uses it to tell acknowledged endpoints from stale ones.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Endpoint Discovery Data Flow                        │
//! │                                                                         │
//! │  EndpointRegistry (discovery-sync)                                     │
//! │       │  load_all / store_all / erase_all / clear                      │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 discovery-store (THIS CRATE)                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────────┐  ┌──────────────────┐  ┌────────────┐  │   │
//! │  │   │ EndpointConfig-   │  │    Database      │  │ Migrations │  │   │
//! │  │   │ Store (store.rs)  │─►│    (pool.rs)     │  │ (embedded) │  │   │
//! │  │   │ open/create/close │  │  SqlitePool      │  │ 001_...sql │  │   │
//! │  │   └───────────────────┘  └────────┬─────────┘  └────────────┘  │   │
//! │  │                                   │                             │   │
//! │  │                     EndpointConfigRepository                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database (endpoint_configs table)                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`store`] - `EndpointConfigStore` trait and its SQLite implementation
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`repository`] - SQL for the `endpoint_configs` table
//! - [`error`] - Store error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use discovery_store::{DbConfig, EndpointConfigStore, SqliteEndpointStore};
//!
//! let store = SqliteEndpointStore::new(DbConfig::new("discovery.db"));
//! if store.open().await.is_err() {
//!     store.create().await?;
//! }
//! let known = store.load_all().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use pool::{Database, DbConfig};
pub use repository::endpoint_config::EndpointConfigRepository;
pub use store::{EndpointConfigStore, SqliteEndpointStore};
