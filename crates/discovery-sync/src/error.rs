//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Discovery Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  SendFailed     │  │  InvalidDescriptor      │ │
//! │  │  ConfigLoad...  │  │  AuthUnavailable│  │  SerializationFailed    │ │
//! │  │  ConfigSave...  │  │  Canceled       │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Storage      │  │    Registry     │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  StorageFailed  │  │  Rejected       │  │  ShuttingDown           │ │
//! │  │                 │  │  (RejectReason) │  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Public registry operations report `bool` or a state notification; these
//! errors are logged where they stop.

use thiserror::Error;

use crate::transport::MessageStatus;

/// Result type alias for discovery operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Discovery error type.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid discovery configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// An event was not accepted by the service.
    #[error("Event send failed: {0}")]
    SendFailed(MessageStatus),

    /// No usable credential before the sender stopped.
    #[error("No auth token available")]
    AuthUnavailable,

    /// The sender was stopped.
    #[error("Operation canceled")]
    Canceled,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Descriptor rejected by validation or formatting.
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(#[from] discovery_core::CoreError),

    /// Failed to serialize an event.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The persisted store failed.
    #[error("Storage error: {0}")]
    StorageFailed(#[from] discovery_store::StoreError),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// A registration or deregistration was refused.
    #[error("Request rejected: {0}")]
    Rejected(#[from] RejectReason),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Registry is shutting down.
    #[error("Endpoint registry is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Reject Reasons
// =============================================================================

/// Why the registry refused a request. No state was changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("endpoint {0} is pending deletion")]
    PendingDeletion(String),

    #[error("endpoint {0} is already pending add or update")]
    PendingAddOrUpdate(String),

    #[error("registration of endpoint {0} cannot change")]
    RegistrationChanged(String),

    #[error("endpoint {0} is not registered")]
    NotRegistered(String),

    #[error("endpoint {0} belongs to the deduplication group and cannot be deleted")]
    DedupMember(String),

    #[error("endpoint {0} would start a second deduplication group")]
    SecondDedupGroup(String),

    #[error("deduplication group would exceed {max} endpoints")]
    DedupGroupFull { max: usize },

    #[error("endpoint {0} collides with a deduplicated endpoint pending deletion")]
    DedupDeletionCollision(String),

    #[error("deduplication group would be {size} bytes, maximum is {max}")]
    DedupGroupTooLarge { size: usize, max: usize },
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<discovery_core::ValidationError> for SyncError {
    fn from(err: discovery_core::ValidationError) -> Self {
        SyncError::InvalidDescriptor(err.into())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::SendFailed(status) => status.is_retryable(),
            SyncError::AuthUnavailable => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery_core::ValidationError;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::SendFailed(MessageStatus::ServerInternalError).is_retryable());
        assert!(SyncError::SendFailed(MessageStatus::Timeout).is_retryable());
        assert!(SyncError::AuthUnavailable.is_retryable());

        assert!(!SyncError::SendFailed(MessageStatus::BadRequest).is_retryable());
        assert!(!SyncError::SendFailed(MessageStatus::InvalidAuth).is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::ConfigLoadFailed("missing".into()).is_config_error());
        assert!(!SyncError::ShuttingDown.is_config_error());
    }

    #[test]
    fn test_conversions() {
        let err: SyncError = ValidationError::Required {
            field: "endpointId".into(),
        }
        .into();
        assert!(matches!(err, SyncError::InvalidDescriptor(_)));

        let err: SyncError = RejectReason::DedupMember("e1".into()).into();
        assert_eq!(
            err.to_string(),
            "Request rejected: endpoint e1 belongs to the deduplication group and cannot be deleted"
        );
    }
}
