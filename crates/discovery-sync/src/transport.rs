//! # Transport Contract
//!
//! The registry never talks to the network itself. It hands formatted event
//! bodies to a [`MessageSender`] and classifies the status that comes back.
//!
//! ## Status Classification
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    MessageStatus → Sender Action                        │
//! │                                                                         │
//! │  SuccessAccepted ─────────────► next sub-batch                         │
//! │  InvalidAuth ─────────────────► report auth failure, abort (fatal)     │
//! │  BadRequest ──────────────────► abort (fatal)                          │
//! │  Canceled ────────────────────► abort (stop requested)                 │
//! │  ServerInternalError ─┐                                                 │
//! │  Throttled            │                                                 │
//! │  Timeout              ├───────► report, back off, retry same batch     │
//! │  NotConnected         │                                                 │
//! │  InternalError ───────┘                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;

// =============================================================================
// Message Status
// =============================================================================

/// Terminal status of one event transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// The service accepted the event.
    SuccessAccepted,
    /// The bearer token was rejected.
    InvalidAuth,
    /// The service refused the event body.
    BadRequest,
    /// The service failed while processing the event.
    ServerInternalError,
    /// The service asked the client to slow down.
    Throttled,
    /// No response or no acknowledgment in time.
    Timeout,
    /// The send was abandoned because the sender stopped.
    Canceled,
    /// The channel to the service is down.
    NotConnected,
    /// Any other client-side failure.
    InternalError,
}

impl MessageStatus {
    /// True for the terminal-success status.
    pub fn is_success(&self) -> bool {
        matches!(self, MessageStatus::SuccessAccepted)
    }

    /// True when the same event may be sent again after a backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            MessageStatus::SuccessAccepted
                | MessageStatus::InvalidAuth
                | MessageStatus::BadRequest
                | MessageStatus::Canceled
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::SuccessAccepted => write!(f, "success_accepted"),
            MessageStatus::InvalidAuth => write!(f, "invalid_auth"),
            MessageStatus::BadRequest => write!(f, "bad_request"),
            MessageStatus::ServerInternalError => write!(f, "server_internal_error"),
            MessageStatus::Throttled => write!(f, "throttled"),
            MessageStatus::Timeout => write!(f, "timeout"),
            MessageStatus::Canceled => write!(f, "canceled"),
            MessageStatus::NotConnected => write!(f, "not_connected"),
            MessageStatus::InternalError => write!(f, "internal_error"),
        }
    }
}

// =============================================================================
// Connection Status
// =============================================================================

/// Connection transitions delivered to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

// =============================================================================
// Message Sender
// =============================================================================

/// Delivers one formatted event and resolves with its status.
///
/// Implementations must resolve every call, including when the channel is
/// down (`NotConnected`).
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_event(&self, event: String) -> MessageStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(MessageStatus::SuccessAccepted.is_success());
        assert!(!MessageStatus::SuccessAccepted.is_retryable());

        let terminal = [
            MessageStatus::InvalidAuth,
            MessageStatus::BadRequest,
            MessageStatus::Canceled,
        ];
        for status in terminal {
            assert!(!status.is_success());
            assert!(!status.is_retryable(), "{} should be terminal", status);
        }

        for status in [
            MessageStatus::ServerInternalError,
            MessageStatus::Throttled,
            MessageStatus::Timeout,
            MessageStatus::NotConnected,
            MessageStatus::InternalError,
        ] {
            assert!(status.is_retryable(), "{} should be retryable", status);
        }
    }

    #[test]
    fn test_status_display() {
        assert_eq!(MessageStatus::ServerInternalError.to_string(), "server_internal_error");
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
    }
}
