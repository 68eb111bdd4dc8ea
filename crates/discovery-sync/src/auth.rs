//! # Credential Provider
//!
//! Senders block on the credential provider until a token is available.
//! State changes are published on a `watch` channel; dropping the receiver
//! is the unsubscribe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::watch;
use tracing::{debug, info, warn};

// =============================================================================
// Auth State
// =============================================================================

/// Lifecycle of the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No token obtained yet.
    Uninitialized,
    /// A valid token is available.
    Refreshed,
    /// The token expired and a refresh is pending.
    Expired,
    /// The provider gave up.
    UnrecoverableError,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthState::Uninitialized => write!(f, "uninitialized"),
            AuthState::Refreshed => write!(f, "refreshed"),
            AuthState::Expired => write!(f, "expired"),
            AuthState::UnrecoverableError => write!(f, "unrecoverable_error"),
        }
    }
}

// =============================================================================
// Provider Contract
// =============================================================================

/// Source of bearer tokens for discovery events.
pub trait CredentialProvider: Send + Sync {
    /// The current token, empty when none is available.
    fn auth_token(&self) -> String;

    /// Subscribes to state changes. The receiver starts at the current state.
    fn subscribe_auth_state(&self) -> watch::Receiver<AuthState>;

    /// Reports that the service rejected `token`.
    fn report_auth_failure(&self, token: &str);
}

// =============================================================================
// Manual Provider
// =============================================================================

/// Provider whose token is set by its owner.
///
/// Used by the simulator and by tests; production devices plug in their own
/// [`CredentialProvider`].
pub struct ManualCredentialProvider {
    token: RwLock<String>,
    state_tx: watch::Sender<AuthState>,
    failures: AtomicU64,
}

impl ManualCredentialProvider {
    /// Creates a provider without a token.
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(AuthState::Uninitialized);
        ManualCredentialProvider {
            token: RwLock::new(String::new()),
            state_tx,
            failures: AtomicU64::new(0),
        }
    }

    /// Creates a provider that already holds `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        let provider = Self::new();
        provider.set_token(token);
        provider
    }

    /// Installs a fresh token and publishes `Refreshed`.
    pub fn set_token(&self, token: impl Into<String>) {
        match self.token.write() {
            Ok(mut guard) => *guard = token.into(),
            Err(poisoned) => *poisoned.into_inner() = token.into(),
        }
        info!("Auth token refreshed");
        self.state_tx.send_replace(AuthState::Refreshed);
    }

    /// Drops the token and publishes `state`.
    pub fn revoke(&self, state: AuthState) {
        match self.token.write() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        debug!(%state, "Auth token revoked");
        self.state_tx.send_replace(state);
    }

    pub fn state(&self) -> AuthState {
        *self.state_tx.borrow()
    }

    /// Number of rejected tokens reported so far.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

impl Default for ManualCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for ManualCredentialProvider {
    fn auth_token(&self) -> String {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn subscribe_auth_state(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    fn report_auth_failure(&self, token: &str) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if self.auth_token() == token {
            warn!(failures, "Current auth token rejected, marking expired");
            self.state_tx.send_replace(AuthState::Expired);
        } else {
            debug!(failures, "Stale auth token rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_provider_lifecycle() {
        let provider = ManualCredentialProvider::new();
        let rx = provider.subscribe_auth_state();

        assert_eq!(*rx.borrow(), AuthState::Uninitialized);
        assert!(provider.auth_token().is_empty());

        provider.set_token("token-1");
        assert_eq!(*rx.borrow(), AuthState::Refreshed);
        assert_eq!(provider.auth_token(), "token-1");
    }

    #[test]
    fn test_failure_on_current_token_expires_it() {
        let provider = ManualCredentialProvider::with_token("token-1");

        provider.report_auth_failure("old-token");
        assert_eq!(provider.state(), AuthState::Refreshed);

        provider.report_auth_failure("token-1");
        assert_eq!(provider.state(), AuthState::Expired);
        assert_eq!(provider.failure_count(), 2);
    }

    #[test]
    fn test_revoke_clears_token() {
        let provider = ManualCredentialProvider::with_token("token-1");
        provider.revoke(AuthState::UnrecoverableError);

        assert!(provider.auth_token().is_empty());
        assert_eq!(provider.state(), AuthState::UnrecoverableError);
    }
}
