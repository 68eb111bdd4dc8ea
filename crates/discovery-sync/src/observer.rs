//! # Capabilities Observers
//!
//! Overall registry state plus the set of observers told about it. Observers
//! are always invoked with the lock released.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use discovery_core::EndpointId;

// =============================================================================
// State / Error
// =============================================================================

/// Outcome of the latest discovery exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilitiesState {
    Uninitialized,
    Success,
    /// Will not be retried without a new request.
    FatalError,
    /// Kept in flight and retried on the next pass.
    RetriableError,
}

/// Detail accompanying a [`CapabilitiesState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilitiesError {
    Uninitialized,
    Success,
    Forbidden,
    BadRequest,
    ServerInternalError,
    Unknown,
}

impl std::fmt::Display for CapabilitiesState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilitiesState::Uninitialized => write!(f, "uninitialized"),
            CapabilitiesState::Success => write!(f, "success"),
            CapabilitiesState::FatalError => write!(f, "fatal_error"),
            CapabilitiesState::RetriableError => write!(f, "retriable_error"),
        }
    }
}

impl std::fmt::Display for CapabilitiesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilitiesError::Uninitialized => write!(f, "uninitialized"),
            CapabilitiesError::Success => write!(f, "success"),
            CapabilitiesError::Forbidden => write!(f, "forbidden"),
            CapabilitiesError::BadRequest => write!(f, "bad_request"),
            CapabilitiesError::ServerInternalError => write!(f, "server_internal_error"),
            CapabilitiesError::Unknown => write!(f, "unknown"),
        }
    }
}

/// Receives registry state changes.
pub trait CapabilitiesObserver: Send + Sync {
    /// Called on every state change, and with the ids an exchange affected.
    fn on_capabilities_state_change(
        &self,
        state: CapabilitiesState,
        error: CapabilitiesError,
        add_or_update_ids: &[EndpointId],
        delete_ids: &[EndpointId],
    );
}

// =============================================================================
// Observer Hub
// =============================================================================

struct HubInner {
    observers: Vec<Arc<dyn CapabilitiesObserver>>,
    state: CapabilitiesState,
    error: CapabilitiesError,
}

/// Observer set with the current state/error pair.
pub struct ObserverHub {
    inner: Mutex<HubInner>,
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverHub {
    pub fn new() -> Self {
        ObserverHub {
            inner: Mutex::new(HubInner {
                observers: Vec::new(),
                state: CapabilitiesState::Uninitialized,
                error: CapabilitiesError::Uninitialized,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds `observer` and immediately tells it the current state.
    pub fn add(&self, observer: Arc<dyn CapabilitiesObserver>) {
        let (state, error) = {
            let mut inner = self.lock();
            if inner.observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
                warn!("Capabilities observer already added");
                return;
            }
            inner.observers.push(observer.clone());
            (inner.state, inner.error)
        };

        observer.on_capabilities_state_change(state, error, &[], &[]);
    }

    pub fn remove(&self, observer: &Arc<dyn CapabilitiesObserver>) {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|o| !Arc::ptr_eq(o, observer));
        if inner.observers.len() == before {
            debug!("Removal of unknown capabilities observer ignored");
        }
    }

    pub fn clear(&self) {
        self.lock().observers.clear();
    }

    pub fn current(&self) -> (CapabilitiesState, CapabilitiesError) {
        let inner = self.lock();
        (inner.state, inner.error)
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Records a new state. Observers hear about it when it changed or when
    /// an exchange affected endpoints.
    pub fn set_state(
        &self,
        state: CapabilitiesState,
        error: CapabilitiesError,
        add_or_update_ids: &[EndpointId],
        delete_ids: &[EndpointId],
    ) {
        let observers = {
            let mut inner = self.lock();
            let changed = inner.state != state || inner.error != error;
            inner.state = state;
            inner.error = error;

            if !changed && add_or_update_ids.is_empty() && delete_ids.is_empty() {
                return;
            }
            inner.observers.clone()
        };

        debug!(
            %state,
            %error,
            added = add_or_update_ids.len(),
            deleted = delete_ids.len(),
            observers = observers.len(),
            "Capabilities state change"
        );

        for observer in observers {
            observer.on_capabilities_state_change(state, error, add_or_update_ids, delete_ids);
        }
    }
}
