//! # Discovery Event Sender
//!
//! One sender carries one fixed batch: a set of AddOrUpdate configs and a
//! set of Delete configs. It is used for exactly one `send_all` call.
//!
//! ## Send Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        send_all(transport)                              │
//! │                                                                         │
//! │  AddOrUpdate configs ──► sub-batches (≤ 300 endpoints, ≤ 246 KiB)      │
//! │       │                                                                 │
//! │       ▼   for each sub-batch:                                           │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  wait for token ──► format (fresh correlation token) ──► send   │   │
//! │  │        ▲                                                   │    │   │
//! │  │        │                          success + wait_for_ack?  ▼    │   │
//! │  │        │                         ┌──────────────────────────┐   │   │
//! │  │        │                         │ await matching ack (2s)  │   │   │
//! │  │        │                         └────────────┬─────────────┘   │   │
//! │  │        │  retryable                           ▼                 │   │
//! │  │        └────── backoff ◄──────────────── classify status        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Delete configs ──► sub-batches (≤ 246 KiB) ──► same loop, no ack      │
//! │                                                                         │
//! │  Every wait also ends when stop() is called.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use discovery_core::format::{add_or_update_report_event, delete_report_event};
use discovery_core::{
    EndpointConfig, EndpointConfigMap, MAX_ENDPOINTS_PER_ADD_OR_UPDATE_REPORT,
    MAX_ENDPOINTS_SIZE_IN_PAYLOAD,
};

use crate::auth::{AuthState, CredentialProvider};
use crate::retry::RetryPolicy;
use crate::transport::{MessageSender, MessageStatus};

/// Default wait for the asynchronous acknowledgment of an AddOrUpdateReport.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Status Observer
// =============================================================================

/// Receives the terminal outcome of a sender.
#[async_trait]
pub trait DiscoveryStatusObserver: Send + Sync {
    /// Every event of the batch was accepted.
    async fn on_discovery_completed(
        &self,
        add_or_update: &EndpointConfigMap,
        delete: &EndpointConfigMap,
    );

    /// An event failed. Retryable failures are reported before each retry.
    async fn on_discovery_failure(&self, status: MessageStatus);
}

// =============================================================================
// Sub-batching
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportKind {
    AddOrUpdate,
    Delete,
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportKind::AddOrUpdate => write!(f, "AddOrUpdateReport"),
            ReportKind::Delete => write!(f, "DeleteReport"),
        }
    }
}

/// Splits configs, in order, into sub-batches bounded by `max_count` (when
/// given) and by `max_bytes` of summed config length.
///
/// A single config larger than `max_bytes` travels alone.
pub fn split_into_sub_batches<'a, I>(
    configs: I,
    max_count: Option<usize>,
    max_bytes: usize,
) -> Vec<Vec<EndpointConfig>>
where
    I: IntoIterator<Item = &'a EndpointConfig>,
{
    let mut batches = Vec::new();
    let mut current: Vec<EndpointConfig> = Vec::new();
    let mut current_bytes = 0;

    for config in configs {
        let full_by_count = max_count.is_some_and(|max| current.len() >= max);
        let full_by_size = current_bytes + config.len() > max_bytes;

        if !current.is_empty() && (full_by_count || full_by_size) {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }

        current_bytes += config.len();
        current.push(config.clone());
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Resolves once `stop_rx` reads `true`.
async fn stopped(mut stop_rx: watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopping| *stopping).await;
}

// =============================================================================
// Sender
// =============================================================================

struct PendingAck {
    correlation_token: String,
    tx: oneshot::Sender<()>,
}

/// Sends one batch of discovery events with auth, retry and ack handling.
pub struct DiscoveryEventSender {
    add_or_update: EndpointConfigMap,
    delete: EndpointConfigMap,
    credentials: Arc<dyn CredentialProvider>,
    wait_for_event_processed: bool,
    retry_policy: RetryPolicy,
    ack_timeout: Duration,
    invoked: AtomicBool,
    finished_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
    pending_ack: Mutex<Option<PendingAck>>,
    observer: Mutex<Option<Arc<dyn DiscoveryStatusObserver>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DiscoveryEventSender {
    /// Creates a sender, or `None` when there is nothing to send.
    pub fn new(
        add_or_update: EndpointConfigMap,
        delete: EndpointConfigMap,
        credentials: Arc<dyn CredentialProvider>,
        wait_for_event_processed: bool,
    ) -> Option<Self> {
        if add_or_update.is_empty() && delete.is_empty() {
            error!("Discovery event sender needs at least one endpoint");
            return None;
        }

        let (stop_tx, _) = watch::channel(false);
        let (finished_tx, _) = watch::channel(false);
        Some(DiscoveryEventSender {
            add_or_update,
            delete,
            credentials,
            wait_for_event_processed,
            retry_policy: RetryPolicy::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            invoked: AtomicBool::new(false),
            finished_tx,
            stop_tx,
            pending_ack: Mutex::new(None),
            observer: Mutex::new(None),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn add_or_update_endpoints(&self) -> &EndpointConfigMap {
        &self.add_or_update
    }

    pub fn delete_endpoints(&self) -> &EndpointConfigMap {
        &self.delete
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// True once `send_all` has returned.
    pub fn is_finished(&self) -> bool {
        *self.finished_tx.borrow()
    }

    /// Resolves once `send_all` has returned, or once the sender is stopped
    /// before `send_all` was ever called.
    pub async fn settled(&self) {
        let mut finished_rx = self.finished_tx.subscribe();
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *finished_rx.borrow_and_update() {
                return;
            }
            if *stop_rx.borrow_and_update() && !self.invoked.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                changed = finished_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    // =========================================================================
    // Observer Slot
    // =========================================================================

    /// Attaches `observer`, replacing any previous one.
    pub fn add_status_observer(&self, observer: Arc<dyn DiscoveryStatusObserver>) {
        *lock(&self.observer) = Some(observer);
    }

    /// Detaches `observer` if it is the attached one.
    pub fn remove_status_observer(&self, observer: &Arc<dyn DiscoveryStatusObserver>) {
        let mut slot = lock(&self.observer);
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, observer) => *slot = None,
            _ => warn!("Discovery status observer not attached"),
        }
    }

    fn status_observer(&self) -> Option<Arc<dyn DiscoveryStatusObserver>> {
        lock(&self.observer).clone()
    }

    async fn report_failure(&self, status: MessageStatus) {
        info!(%status, "Discovery event failed");
        if let Some(observer) = self.status_observer() {
            observer.on_discovery_failure(status).await;
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Sends every AddOrUpdate event, then every Delete event.
    ///
    /// Returns true only if all of them were accepted. A second call fails
    /// immediately.
    pub async fn send_all(&self, transport: &dyn MessageSender) -> bool {
        if self.invoked.swap(true, Ordering::SeqCst) {
            error!("send_all already invoked on this sender");
            return false;
        }

        info!(
            add_or_update = self.add_or_update.len(),
            delete = self.delete.len(),
            "Sending discovery events"
        );

        let mut auth_rx = self.credentials.subscribe_auth_state();
        let mut backoff = self.retry_policy.backoff();

        let success = self
            .send_reports(transport, ReportKind::AddOrUpdate, &mut auth_rx, &mut backoff)
            .await
            && self
                .send_reports(transport, ReportKind::Delete, &mut auth_rx, &mut backoff)
                .await;

        drop(auth_rx);

        if success {
            info!("Discovery events accepted");
            if let Some(observer) = self.status_observer() {
                observer.on_discovery_completed(&self.add_or_update, &self.delete).await;
            }
        }

        self.finished_tx.send_replace(true);
        success
    }

    async fn send_reports(
        &self,
        transport: &dyn MessageSender,
        kind: ReportKind,
        auth_rx: &mut watch::Receiver<AuthState>,
        backoff: &mut ExponentialBackoff,
    ) -> bool {
        let (configs, max_count) = match kind {
            ReportKind::AddOrUpdate => {
                (&self.add_or_update, Some(MAX_ENDPOINTS_PER_ADD_OR_UPDATE_REPORT))
            }
            ReportKind::Delete => (&self.delete, None),
        };

        if configs.is_empty() {
            debug!(%kind, "No endpoints to report");
            return true;
        }

        let batches =
            split_into_sub_batches(configs.values(), max_count, MAX_ENDPOINTS_SIZE_IN_PAYLOAD);
        debug!(%kind, endpoints = configs.len(), events = batches.len(), "Split discovery report");

        for batch in &batches {
            if !self.send_with_retries(transport, kind, batch, auth_rx, backoff).await {
                return false;
            }
        }
        true
    }

    async fn send_with_retries(
        &self,
        transport: &dyn MessageSender,
        kind: ReportKind,
        endpoints: &[EndpointConfig],
        auth_rx: &mut watch::Receiver<AuthState>,
        backoff: &mut ExponentialBackoff,
    ) -> bool {
        while !self.is_stopping() {
            let Some(token) = self.wait_for_auth_token(auth_rx).await else {
                error!(%kind, "No auth token, abandoning discovery event");
                return false;
            };

            let status = match self.send_once(transport, kind, endpoints, &token).await {
                Some(status) => status,
                None => return false,
            };

            match status {
                MessageStatus::SuccessAccepted => return true,
                MessageStatus::InvalidAuth => {
                    self.credentials.report_auth_failure(&token);
                    self.report_failure(status).await;
                    return false;
                }
                MessageStatus::BadRequest => {
                    self.report_failure(status).await;
                    return false;
                }
                MessageStatus::Canceled if self.is_stopping() => {
                    debug!(%kind, "Discovery event canceled");
                    return false;
                }
                _ => self.report_failure(status).await,
            }

            let delay = RetryPolicy::next_delay(backoff);
            debug!(%kind, delay_ms = delay.as_millis() as u64, "Retrying discovery event");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(self.stop_tx.subscribe()) => {
                    debug!(%kind, "Retry wait aborted");
                    return false;
                }
            }
        }
        false
    }

    /// One formatted attempt. `None` means the event could not be built.
    async fn send_once(
        &self,
        transport: &dyn MessageSender,
        kind: ReportKind,
        endpoints: &[EndpointConfig],
        token: &str,
    ) -> Option<MessageStatus> {
        let (event, ack_rx) = match kind {
            ReportKind::AddOrUpdate => match add_or_update_report_event(endpoints, token) {
                Ok((event, correlation_token)) => {
                    trace!(
                        correlation_token = %correlation_token,
                        endpoints = endpoints.len(),
                        "Formatted AddOrUpdateReport"
                    );
                    let ack_rx = self
                        .wait_for_event_processed
                        .then(|| self.arm_ack(correlation_token));
                    (event, ack_rx)
                }
                Err(e) => {
                    error!(?e, "Failed to format AddOrUpdateReport");
                    return None;
                }
            },
            ReportKind::Delete => match delete_report_event(endpoints, token) {
                Ok(event) => (event, None),
                Err(e) => {
                    error!(?e, "Failed to format DeleteReport");
                    return None;
                }
            },
        };

        let status = tokio::select! {
            status = transport.send_event(event) => status,
            _ = stopped(self.stop_tx.subscribe()) => MessageStatus::Canceled,
        };
        debug!(%kind, %status, "Discovery event sent");

        match ack_rx {
            Some(ack_rx) if status.is_success() => Some(self.wait_for_ack(ack_rx).await),
            Some(_) => {
                lock(&self.pending_ack).take();
                Some(status)
            }
            None => Some(status),
        }
    }

    async fn wait_for_auth_token(
        &self,
        auth_rx: &mut watch::Receiver<AuthState>,
    ) -> Option<String> {
        let refreshed = async {
            auth_rx
                .wait_for(|state| *state == AuthState::Refreshed)
                .await
                .is_ok()
        };
        let ready = tokio::select! {
            ready = refreshed => ready,
            _ = stopped(self.stop_tx.subscribe()) => false,
        };

        if !ready || self.is_stopping() {
            debug!("Stopped while waiting for auth token");
            return None;
        }

        let token = self.credentials.auth_token();
        (!token.is_empty()).then_some(token)
    }

    // =========================================================================
    // Acknowledgment
    // =========================================================================

    fn arm_ack(&self, correlation_token: String) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.pending_ack) = Some(PendingAck { correlation_token, tx });
        rx
    }

    async fn wait_for_ack(&self, ack_rx: oneshot::Receiver<()>) -> MessageStatus {
        debug!("Waiting for event processed acknowledgment");
        let status = tokio::select! {
            acked = tokio::time::timeout(self.ack_timeout, ack_rx) => match acked {
                Ok(Ok(())) => MessageStatus::SuccessAccepted,
                Ok(Err(_)) => MessageStatus::Canceled,
                Err(_) => {
                    warn!(
                        timeout_ms = self.ack_timeout.as_millis() as u64,
                        "Event processed acknowledgment timed out"
                    );
                    MessageStatus::Timeout
                }
            },
            _ = stopped(self.stop_tx.subscribe()) => MessageStatus::Canceled,
        };

        lock(&self.pending_ack).take();
        status
    }

    /// Delivers the acknowledgment for `correlation_token`.
    ///
    /// Tokens other than the one minted for the latest AddOrUpdateReport are
    /// ignored.
    pub fn on_alexa_event_processed(&self, correlation_token: &str) {
        let mut pending = lock(&self.pending_ack);
        match pending.take() {
            Some(ack) if ack.correlation_token == correlation_token => {
                debug!("Matching event processed acknowledgment");
                let _ = ack.tx.send(());
            }
            Some(ack) => {
                warn!("Event processed acknowledgment with unexpected correlation token");
                *pending = Some(ack);
            }
            None => debug!("Event processed acknowledgment with no event awaiting it"),
        }
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Stops the sender. Every wait ends promptly and no further event is
    /// sent. Safe to call repeatedly and concurrently.
    pub fn stop(&self) {
        let first = self.stop_tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });

        if !first {
            return;
        }

        debug!("Stopping discovery event sender");
        lock(&self.pending_ack).take();
        lock(&self.observer).take();
    }
}

impl Drop for DiscoveryEventSender {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
