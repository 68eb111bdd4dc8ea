//! # Repository Module
//!
//! SQL behind the persisted store, kept in one place.
//!
//! ```text
//! SqliteEndpointStore
//!      │  db.endpoint_configs().upsert_all(&configs)
//!      ▼
//! EndpointConfigRepository
//! ├── upsert / upsert_all     (INSERT ... ON CONFLICT DO UPDATE)
//! ├── get / get_all
//! ├── delete / delete_all
//! └── clear / count
//!      │
//!      ▼
//! endpoint_configs table
//! ```

pub mod endpoint_config;
