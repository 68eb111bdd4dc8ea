//! # Error Types
//!
//! Domain-specific error types for discovery-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  discovery-core errors (this file)                                     │
//! │  ├── CoreError        - Formatting and size failures                   │
//! │  └── ValidationError  - Descriptor validation failures                 │
//! │                                                                         │
//! │  discovery-store errors (separate crate)                               │
//! │  └── StoreError       - Persisted store failures                       │
//! │                                                                         │
//! │  discovery-sync errors (separate crate)                                │
//! │  └── SyncError        - Config, transport, registry failures           │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → `false` / observer    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while turning descriptors into wire data.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A descriptor failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The canonical config of one endpoint does not fit in an event.
    ///
    /// ## When This Occurs
    /// ```text
    /// register_or_update(attrs, caps)
    ///      │
    ///      ▼
    /// canonical config: 260 KiB
    ///      │
    ///      ▼
    /// ConfigTooLarge { endpoint_id, size: 266240, max: 251904 }
    /// ```
    #[error("Config for endpoint {endpoint_id} is {size} bytes, maximum is {max}")]
    ConfigTooLarge {
        endpoint_id: String,
        size: usize,
        max: usize,
    },

    /// JSON serialization or parsing failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Descriptor validation errors.
///
/// Raised synchronously at the call boundary, before any registry state
/// is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// An optional field was supplied but is empty.
    #[error("{field} must not be empty when present")]
    Empty { field: String },

    /// A custom configuration value is not valid JSON.
    #[error("{field} is not valid JSON: {reason}")]
    InvalidJson { field: String, reason: String },

    /// Too many entries in a collection.
    #[error("{field} has {actual} entries, maximum is {max}")]
    TooMany {
        field: String,
        max: usize,
        actual: usize,
    },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
