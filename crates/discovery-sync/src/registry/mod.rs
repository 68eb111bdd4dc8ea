//! # Endpoint Registry
//!
//! Decides what the discovery service must be told, and when.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Endpoint Registry Architecture                      │
//! │                                                                         │
//! │  Callers (any task)                                                     │
//! │   │ register_or_update / deregister                                     │
//! │   │   1. validate + format on the caller's task                        │
//! │   │   2. send Command, await reply                                     │
//! │   ▼                                                                     │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 EndpointRegistry worker (one task)              │   │
//! │  │                                                                 │   │
//! │  │  EndpointTable ── owned outright, never shared                  │   │
//! │  │                                                                 │   │
//! │  │  dispatch pass ──► DiscoveryEventSender ──spawned send_all──┐   │   │
//! │  │        ▲                                                    │   │   │
//! │  │        └──── DiscoveryCompleted / DiscoveryFailed ◄─────────┘   │   │
//! │  │              (BatchStatusObserver holds a weak command sender)  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Shared with handles, each behind its own lock:                        │
//! │   • ObserverHub ─── observers + current state/error                    │
//! │   • active slot ─── the live sender (for acks, stop on shutdown)       │
//! │                                                                         │
//! │  At most one batch is outstanding. Completion is applied before the    │
//! │  next dispatch pass starts.                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use discovery_core::format::{endpoint_config, ensure_fits_payload};
use discovery_core::validation::{validate_capabilities, validate_endpoint_attributes};
use discovery_core::{
    CapabilityConfiguration, EndpointAttributes, EndpointConfig, EndpointConfigMap, EndpointId,
    Registration,
};
use discovery_store::{EndpointConfigStore, StoreResult};

use crate::auth::CredentialProvider;
use crate::config::DiscoveryConfig;
use crate::error::{RejectReason, SyncError, SyncResult};
use crate::observer::{CapabilitiesError, CapabilitiesObserver, CapabilitiesState, ObserverHub};
use crate::post_connect::PostConnectPublisher;
use crate::sender::{DiscoveryEventSender, DiscoveryStatusObserver};
use crate::transport::{ConnectionStatus, MessageSender, MessageStatus};

pub use state::RegistrySnapshot;
use state::{Batch, EndpointTable};

// =============================================================================
// Commands
// =============================================================================

enum Command {
    RegisterOrUpdate {
        endpoint_id: EndpointId,
        registration: Option<Registration>,
        config: EndpointConfig,
        reply: oneshot::Sender<Result<(), RejectReason>>,
    },
    Deregister {
        endpoint_id: EndpointId,
        registration: Option<Registration>,
        reply: oneshot::Sender<Result<(), RejectReason>>,
    },
    ConnectionStatusChanged(ConnectionStatus),
    CreatePostConnectOperation {
        reply: oneshot::Sender<Option<PostConnectPublisher>>,
    },
    DiscoveryCompleted {
        batch_id: u64,
        add_or_update: EndpointConfigMap,
        delete: EndpointConfigMap,
    },
    DiscoveryFailed {
        batch_id: u64,
        status: MessageStatus,
    },
    BatchFinished {
        batch_id: u64,
    },
    ClearStore {
        reason: &'static str,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<RegistrySnapshot>,
    },
}

// =============================================================================
// Active Sender Slot
// =============================================================================

struct ActiveSender {
    batch_id: u64,
    sender: Arc<DiscoveryEventSender>,
    observer: Arc<dyn DiscoveryStatusObserver>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveSender>>>;

fn lock_slot(slot: &Mutex<Option<ActiveSender>>) -> MutexGuard<'_, Option<ActiveSender>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Replaces the active sender. The new one is observed before the old one
/// is detached and stopped.
fn swap_active_sender(slot: &Mutex<Option<ActiveSender>>, next: Option<ActiveSender>) {
    if let Some(next) = &next {
        next.sender.add_status_observer(next.observer.clone());
    }

    let previous = std::mem::replace(&mut *lock_slot(slot), next);

    if let Some(previous) = previous {
        debug!(batch_id = previous.batch_id, "Detaching discovery sender");
        // stop() already empties the observer slot.
        if !previous.sender.is_stopping() {
            previous.sender.remove_status_observer(&previous.observer);
        }
        previous.sender.stop();
    }
}

/// Queued after every outcome the batch's sender can report.
async fn notify_batch_finished(commands: &mpsc::WeakSender<Command>, batch_id: u64) {
    if let Some(commands) = commands.upgrade() {
        let _ = commands.send(Command::BatchFinished { batch_id }).await;
    }
}

/// Forwards one sender's outcome to the worker.
struct BatchStatusObserver {
    commands: mpsc::WeakSender<Command>,
    batch_id: u64,
}

impl BatchStatusObserver {
    async fn forward(&self, command: Command) {
        match self.commands.upgrade() {
            Some(commands) => {
                if commands.send(command).await.is_err() {
                    debug!(batch_id = self.batch_id, "Registry stopped before batch outcome");
                }
            }
            None => debug!(batch_id = self.batch_id, "Registry gone, batch outcome dropped"),
        }
    }
}

#[async_trait]
impl DiscoveryStatusObserver for BatchStatusObserver {
    async fn on_discovery_completed(
        &self,
        add_or_update: &EndpointConfigMap,
        delete: &EndpointConfigMap,
    ) {
        self.forward(Command::DiscoveryCompleted {
            batch_id: self.batch_id,
            add_or_update: add_or_update.clone(),
            delete: delete.clone(),
        })
        .await;
    }

    async fn on_discovery_failure(&self, status: MessageStatus) {
        self.forward(Command::DiscoveryFailed {
            batch_id: self.batch_id,
            status,
        })
        .await;
    }
}

// =============================================================================
// Registry Handle
// =============================================================================

/// Cloneable entry point to the registry.
#[derive(Clone)]
pub struct EndpointRegistryHandle {
    cmd_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
    active: ActiveSlot,
    observers: Arc<ObserverHub>,
    shutting_down: Arc<AtomicBool>,
    max_capabilities: usize,
}

impl EndpointRegistryHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> SyncResult<T> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(make(reply)).await.map_err(|_| SyncError::ShuttingDown)?;
        rx.await
            .map_err(|_| SyncError::ChannelError("Registry dropped the request".into()))
    }

    /// Validates descriptors and builds the canonical config.
    fn prepare(
        &self,
        attributes: &EndpointAttributes,
        capabilities: &[CapabilityConfiguration],
    ) -> SyncResult<EndpointConfig> {
        validate_endpoint_attributes(attributes)?;
        validate_capabilities(capabilities, self.max_capabilities)?;
        let config = endpoint_config(attributes, capabilities)?;
        ensure_fits_payload(&attributes.endpoint_id, &config)?;
        Ok(config)
    }

    /// Queues an endpoint for AddOrUpdateReport. False when rejected.
    pub async fn register_or_update(
        &self,
        attributes: &EndpointAttributes,
        capabilities: &[CapabilityConfiguration],
    ) -> bool {
        let endpoint_id = attributes.endpoint_id.clone();

        let config = match self.prepare(attributes, capabilities) {
            Ok(config) => config,
            Err(e) => {
                warn!(endpoint_id = %endpoint_id, error = %e, "Endpoint registration rejected");
                return false;
            }
        };

        let registration = attributes.registration().cloned();
        let result = self
            .request(|reply| Command::RegisterOrUpdate {
                endpoint_id: endpoint_id.clone(),
                registration,
                config,
                reply,
            })
            .await;

        Self::log_outcome("registration", &endpoint_id, result)
    }

    /// Queues an endpoint for DeleteReport. False when rejected.
    pub async fn deregister(
        &self,
        attributes: &EndpointAttributes,
        capabilities: &[CapabilityConfiguration],
    ) -> bool {
        let endpoint_id = attributes.endpoint_id.clone();

        if let Err(e) = self.prepare(attributes, capabilities) {
            warn!(endpoint_id = %endpoint_id, error = %e, "Endpoint deregistration rejected");
            return false;
        }

        let registration = attributes.registration().cloned();
        let result = self
            .request(|reply| Command::Deregister {
                endpoint_id: endpoint_id.clone(),
                registration,
                reply,
            })
            .await;

        Self::log_outcome("deregistration", &endpoint_id, result)
    }

    fn log_outcome(
        operation: &str,
        endpoint_id: &str,
        result: SyncResult<Result<(), RejectReason>>,
    ) -> bool {
        match result {
            Ok(Ok(())) => {
                debug!(endpoint_id = %endpoint_id, operation, "Endpoint request accepted");
                true
            }
            Ok(Err(reason)) => {
                warn!(endpoint_id = %endpoint_id, operation, %reason, "Endpoint request rejected");
                false
            }
            Err(e) => {
                warn!(
                    endpoint_id = %endpoint_id,
                    operation,
                    error = %e,
                    "Endpoint request not delivered"
                );
                false
            }
        }
    }

    /// Connection transitions from the channel owner.
    pub async fn on_connection_status_changed(&self, status: ConnectionStatus) {
        if let Err(e) = self.cmd_tx.send(Command::ConnectionStatusChanged(status)).await {
            debug!(%status, error = %e, "Connection status not delivered");
        }
    }

    /// Builds the discovery step of the connection bootstrap, or `None` when
    /// nothing needs sending.
    pub async fn create_post_connect_operation(&self) -> Option<PostConnectPublisher> {
        match self.request(|reply| Command::CreatePostConnectOperation { reply }).await {
            Ok(operation) => operation,
            Err(e) => {
                warn!(error = %e, "Post-connect operation not created");
                None
            }
        }
    }

    /// Acknowledgment for an AddOrUpdateReport, forwarded to the live sender.
    pub fn on_alexa_event_processed(&self, correlation_token: &str) {
        let sender = lock_slot(&self.active).as_ref().map(|active| active.sender.clone());
        match sender {
            Some(sender) => sender.on_alexa_event_processed(correlation_token),
            None => debug!("Event processed acknowledgment with no active sender"),
        }
    }

    /// Erases every persisted endpoint config.
    pub async fn clear_data(&self) -> bool {
        self.request(|reply| Command::ClearStore {
            reason: "customer data reset",
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Invalidates persisted configs so the next bootstrap republishes
    /// everything.
    pub async fn on_gateway_changed(&self, gateway: &str) -> bool {
        info!(gateway = %gateway, "Discovery gateway changed");
        self.request(|reply| Command::ClearStore {
            reason: "gateway changed",
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub fn add_observer(&self, observer: Arc<dyn CapabilitiesObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn CapabilitiesObserver>) {
        self.observers.remove(observer);
    }

    /// Latest state/error pair.
    pub fn state(&self) -> (CapabilitiesState, CapabilitiesError) {
        self.observers.current()
    }

    pub async fn snapshot(&self) -> SyncResult<RegistrySnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stops the registry. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down endpoint registry");
        self.observers.clear();
        swap_active_sender(&self.active, None);
        let _ = self.shutdown_tx.send(()).await;
    }
}

// =============================================================================
// Registry Worker
// =============================================================================

/// The registry worker. Owns the endpoint table.
pub struct EndpointRegistry {
    config: DiscoveryConfig,
    store: Arc<dyn EndpointConfigStore>,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn MessageSender>,
    table: EndpointTable,
    connection: ConnectionStatus,
    active: ActiveSlot,
    observers: Arc<ObserverHub>,
    shutting_down: Arc<AtomicBool>,
    next_batch_id: u64,
    cmd_tx: mpsc::WeakSender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl EndpointRegistry {
    /// Creates the worker and its handle. Call [`EndpointRegistry::init`],
    /// then spawn [`EndpointRegistry::run`].
    pub fn new(
        config: DiscoveryConfig,
        store: Arc<dyn EndpointConfigStore>,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn MessageSender>,
    ) -> (Self, EndpointRegistryHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.registry.command_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let active: ActiveSlot = Arc::new(Mutex::new(None));
        let observers = Arc::new(ObserverHub::new());
        let shutting_down = Arc::new(AtomicBool::new(false));

        let handle = EndpointRegistryHandle {
            cmd_tx: cmd_tx.clone(),
            shutdown_tx,
            active: active.clone(),
            observers: observers.clone(),
            shutting_down: shutting_down.clone(),
            max_capabilities: config.registry.max_capabilities_per_endpoint,
        };

        let registry = EndpointRegistry {
            config,
            store,
            credentials,
            transport,
            table: EndpointTable::new(),
            connection: ConnectionStatus::Disconnected,
            active,
            observers,
            shutting_down,
            next_batch_id: 0,
            cmd_tx: cmd_tx.downgrade(),
            cmd_rx,
            shutdown_rx,
        };

        (registry, handle)
    }

    /// Opens the persisted store, creating it when it cannot be opened.
    pub async fn init(&self) -> SyncResult<()> {
        if let Err(e) = self.store.open().await {
            info!(error = %e, "Endpoint store could not be opened, creating it");
            self.store.create().await.map_err(|e| {
                error!(error = %e, "Endpoint store could not be created");
                e
            })?;
        }
        Ok(())
    }

    /// Runs the worker loop.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!("Endpoint registry starting");

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Every registry handle dropped");
                        break;
                    }
                },

                _ = self.shutdown_rx.recv() => {
                    info!("Endpoint registry shutting down");
                    break;
                }
            }
        }

        self.shutting_down.store(true, Ordering::SeqCst);
        swap_active_sender(&self.active, None);
        info!("Endpoint registry stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RegisterOrUpdate {
                endpoint_id,
                registration,
                config,
                reply,
            } => {
                let result = self
                    .table
                    .accept_add_or_update(&endpoint_id, registration, config)
                    .map(|_| ());
                let accepted = result.is_ok();
                let _ = reply.send(result);
                if accepted {
                    self.dispatch();
                }
            }

            Command::Deregister {
                endpoint_id,
                registration,
                reply,
            } => {
                let result = self.table.accept_delete(&endpoint_id, registration);
                let accepted = result.is_ok();
                let _ = reply.send(result);
                if accepted {
                    self.dispatch();
                }
            }

            Command::ConnectionStatusChanged(status) => self.handle_connection_status(status),

            Command::CreatePostConnectOperation { reply } => {
                let operation = self.create_post_connect_operation().await;
                // An undelivered publisher stops its sender when dropped.
                let _ = reply.send(operation);
            }

            Command::DiscoveryCompleted {
                batch_id,
                add_or_update,
                delete,
            } => self.handle_discovery_completed(batch_id, add_or_update, delete).await,

            Command::DiscoveryFailed { batch_id, status } => {
                self.handle_discovery_failed(batch_id, status)
            }

            Command::BatchFinished { batch_id } => {
                if self.release_active(batch_id) {
                    debug!(batch_id, "Discovery batch released without a confirmed outcome");
                    // In-flight endpoints wait for the next trigger.
                    if self.table.has_pending() {
                        self.dispatch();
                    }
                }
            }

            Command::ClearStore { reason, reply } => {
                let cleared = match self.store.clear().await {
                    Ok(()) => {
                        info!(reason, "Cleared persisted endpoint configs");
                        true
                    }
                    Err(e) => {
                        error!(reason, error = %e, "Failed to clear persisted endpoint configs");
                        false
                    }
                };
                let _ = reply.send(cleared);
            }

            Command::Snapshot { reply } => {
                let _ = reply.send(self.table.snapshot());
            }
        }
    }

    fn handle_connection_status(&mut self, status: ConnectionStatus) {
        debug!(%status, "Connection status changed");
        self.connection = status;
        match status {
            ConnectionStatus::Connected => self.dispatch(),
            ConnectionStatus::Disconnected => swap_active_sender(&self.active, None),
        }
    }

    // =========================================================================
    // Active Sender
    // =========================================================================

    fn is_active_batch(&self, batch_id: u64) -> bool {
        lock_slot(&self.active)
            .as_ref()
            .is_some_and(|active| active.batch_id == batch_id)
    }

    /// Detaches the active sender if it belongs to `batch_id`.
    fn release_active(&self, batch_id: u64) -> bool {
        if !self.is_active_batch(batch_id) {
            return false;
        }
        swap_active_sender(&self.active, None);
        true
    }

    fn build_sender(
        &mut self,
        batch: Batch,
        wait_for_event_processed: bool,
    ) -> Option<(u64, Arc<DiscoveryEventSender>)> {
        let sender = DiscoveryEventSender::new(
            batch.add_or_update,
            batch.delete,
            self.credentials.clone(),
            wait_for_event_processed,
        )?
        .with_retry_policy(self.config.sender.retry_policy())
        .with_ack_timeout(self.config.sender.ack_timeout());

        self.next_batch_id += 1;
        let batch_id = self.next_batch_id;
        let sender = Arc::new(sender);

        swap_active_sender(
            &self.active,
            Some(ActiveSender {
                batch_id,
                sender: sender.clone(),
                observer: Arc::new(BatchStatusObserver {
                    commands: self.cmd_tx.clone(),
                    batch_id,
                }),
            }),
        );

        Some((batch_id, sender))
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Sends the next batch if the registry is idle and connected.
    fn dispatch(&mut self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("Dispatch skipped, shutting down");
            return;
        }
        if self.connection != ConnectionStatus::Connected {
            debug!("Dispatch skipped, not connected");
            return;
        }

        // The slot is only emptied once the batch outcome has been applied.
        if let Some(current) = lock_slot(&self.active).as_ref() {
            debug!(batch_id = current.batch_id, "Dispatch deferred, batch outstanding");
            return;
        }

        self.table.reclaim_in_flight();

        let Some(batch) = self.table.select_batch() else {
            debug!("Nothing pending");
            return;
        };

        info!(
            add_or_update = batch.add_or_update.len(),
            delete = batch.delete.len(),
            "Dispatching discovery batch"
        );

        let wait = self.config.sender.wait_for_event_processed;
        let Some((batch_id, sender)) = self.build_sender(batch, wait) else {
            return;
        };

        let transport = self.transport.clone();
        let commands = self.cmd_tx.clone();
        tokio::spawn(async move {
            let success = sender.send_all(transport.as_ref()).await;
            debug!(batch_id, success, "Discovery batch send finished");
            notify_batch_finished(&commands, batch_id).await;
        });
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    async fn persist(
        &self,
        add_or_update: &EndpointConfigMap,
        delete: &EndpointConfigMap,
    ) -> StoreResult<()> {
        self.store.store_all(add_or_update).await?;
        let erased: Vec<EndpointId> = delete.keys().cloned().collect();
        self.store.erase_all(&erased).await
    }

    async fn handle_discovery_completed(
        &mut self,
        batch_id: u64,
        add_or_update: EndpointConfigMap,
        delete: EndpointConfigMap,
    ) {
        if !self.is_active_batch(batch_id) {
            debug!(batch_id, "Completion of a detached batch ignored");
            return;
        }

        if let Err(e) = self.persist(&add_or_update, &delete).await {
            error!(batch_id, error = %e, "Failed to persist discovery outcome");
            self.observers
                .set_state(CapabilitiesState::FatalError, CapabilitiesError::Unknown, &[], &[]);
            return;
        }

        let (added, deleted) = self.table.complete_in_flight();
        info!(batch_id, added = added.len(), deleted = deleted.len(), "Discovery batch confirmed");

        self.release_active(batch_id);
        self.observers
            .set_state(CapabilitiesState::Success, CapabilitiesError::Success, &added, &deleted);

        self.dispatch();
    }

    fn handle_discovery_failed(&mut self, batch_id: u64, status: MessageStatus) {
        if !self.is_active_batch(batch_id) {
            debug!(batch_id, %status, "Failure of a detached batch ignored");
            return;
        }

        let (state, error) = match status {
            MessageStatus::SuccessAccepted => {
                error!(batch_id, "Failure reported with a success status");
                return;
            }
            MessageStatus::InvalidAuth => {
                (CapabilitiesState::FatalError, CapabilitiesError::Forbidden)
            }
            MessageStatus::BadRequest => {
                (CapabilitiesState::FatalError, CapabilitiesError::BadRequest)
            }
            MessageStatus::ServerInternalError => {
                (CapabilitiesState::RetriableError, CapabilitiesError::ServerInternalError)
            }
            _ => (CapabilitiesState::RetriableError, CapabilitiesError::Unknown),
        };

        if state == CapabilitiesState::FatalError {
            let dropped = self.table.drop_in_flight();
            error!(batch_id, %status, dropped, "Discovery batch failed permanently");
            self.release_active(batch_id);
        } else {
            warn!(batch_id, %status, "Discovery batch failed, retrying");
        }

        self.observers.set_state(state, error, &[], &[]);
    }

    // =========================================================================
    // Post-Connect
    // =========================================================================

    async fn create_post_connect_operation(&mut self) -> Option<PostConnectPublisher> {
        swap_active_sender(&self.active, None);
        self.table.reclaim_in_flight();

        let stored = match self.store.load_all().await {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Could not load persisted endpoint configs");
                return None;
            }
        };
        debug!(stored = stored.len(), "Reconciling endpoints with persisted configs");

        let unchanged = self.table.reconcile_with_store(&stored);
        if !unchanged.is_empty() {
            info!(unchanged = unchanged.len(), "Endpoints already published");
            self.observers
                .set_state(CapabilitiesState::Success, CapabilitiesError::Success, &unchanged, &[]);
        }

        let Some(batch) = self.table.take_all_pending() else {
            debug!("No endpoint changes, skipping post-connect discovery");
            return None;
        };

        info!(
            add_or_update = batch.add_or_update.len(),
            delete = batch.delete.len(),
            "Publishing endpoints after connect"
        );

        let (batch_id, sender) = self.build_sender(batch, true)?;

        let commands = self.cmd_tx.clone();
        let watched = sender.clone();
        tokio::spawn(async move {
            watched.settled().await;
            notify_batch_finished(&commands, batch_id).await;
        });

        Some(PostConnectPublisher::new(sender))
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating an EndpointRegistry with its collaborators.
pub struct EndpointRegistryBuilder {
    config: DiscoveryConfig,
    store: Option<Arc<dyn EndpointConfigStore>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    transport: Option<Arc<dyn MessageSender>>,
}

impl EndpointRegistryBuilder {
    pub fn new(config: DiscoveryConfig) -> Self {
        EndpointRegistryBuilder {
            config,
            store: None,
            credentials: None,
            transport: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn EndpointConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn MessageSender>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the registry, opening (or creating) its store.
    pub async fn build(self) -> SyncResult<(EndpointRegistry, EndpointRegistryHandle)> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("Endpoint store required".into()))?;
        let credentials = self
            .credentials
            .ok_or_else(|| SyncError::InvalidConfig("Credential provider required".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| SyncError::InvalidConfig("Transport required".into()))?;

        let (registry, handle) = EndpointRegistry::new(self.config, store, credentials, transport);
        registry.init().await?;
        Ok((registry, handle))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ManualCredentialProvider;
    use crate::observer::tests::{Notification, RecordingObserver};
    use crate::post_connect::PostConnectOperation;
    use crate::sender::tests::ScriptedTransport;
    use discovery_core::format::DiscoveryEvent;
    use discovery_core::{CapabilityProperties, ADD_OR_UPDATE_REPORT, DELETE_REPORT};
    use discovery_store::{DbConfig, SqliteEndpointStore, StoreError};
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    // =========================================================================
    // Test Doubles
    // =========================================================================

    /// Map-backed store. Opening fails until it has been created.
    #[derive(Default)]
    struct MemoryStore {
        configs: Mutex<EndpointConfigMap>,
        created: AtomicBool,
        fail_create: AtomicBool,
        fail_load: AtomicBool,
        fail_store: AtomicBool,
        slow_clear: AtomicBool,
    }

    impl MemoryStore {
        fn ready() -> Arc<Self> {
            let store = MemoryStore::default();
            store.created.store(true, Ordering::SeqCst);
            Arc::new(store)
        }

        fn configs(&self) -> EndpointConfigMap {
            self.configs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EndpointConfigStore for MemoryStore {
        async fn create(&self) -> StoreResult<()> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(StoreError::MigrationFailed("disk full".into()));
            }
            self.configs.lock().unwrap().clear();
            self.created.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn open(&self) -> StoreResult<()> {
            if self.created.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::SchemaMissing("endpoint_configs".into()))
            }
        }

        async fn close(&self) {}

        async fn store(&self, endpoint_id: &str, config: &EndpointConfig) -> StoreResult<()> {
            self.configs.lock().unwrap().insert(endpoint_id.to_string(), config.clone());
            Ok(())
        }

        async fn store_all(&self, configs: &EndpointConfigMap) -> StoreResult<()> {
            if self.fail_store.load(Ordering::SeqCst) {
                return Err(StoreError::QueryFailed("disk I/O error".into()));
            }
            self.configs.lock().unwrap().extend(configs.clone());
            Ok(())
        }

        async fn load_all(&self) -> StoreResult<EndpointConfigMap> {
            if self.fail_load.load(Ordering::SeqCst) {
                return Err(StoreError::QueryFailed("database is locked".into()));
            }
            Ok(self.configs())
        }

        async fn load(&self, endpoint_id: &str) -> StoreResult<Option<EndpointConfig>> {
            Ok(self.configs.lock().unwrap().get(endpoint_id).cloned())
        }

        async fn erase(&self, endpoint_id: &str) -> StoreResult<()> {
            self.configs.lock().unwrap().remove(endpoint_id);
            Ok(())
        }

        async fn erase_all(&self, endpoint_ids: &[EndpointId]) -> StoreResult<()> {
            if self.fail_store.load(Ordering::SeqCst) {
                return Err(StoreError::QueryFailed("disk I/O error".into()));
            }
            let mut configs = self.configs.lock().unwrap();
            for id in endpoint_ids {
                configs.remove(id);
            }
            Ok(())
        }

        async fn clear(&self) -> StoreResult<()> {
            if self.slow_clear.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.configs.lock().unwrap().clear();
            Ok(())
        }
    }

    /// Succeeds every send and acks AddOrUpdateReports through the handle.
    #[derive(Default)]
    struct AckingTransport {
        handle: Mutex<Option<EndpointRegistryHandle>>,
        events: Mutex<Vec<DiscoveryEvent>>,
    }

    impl AckingTransport {
        fn attach(&self, handle: &EndpointRegistryHandle) {
            *self.handle.lock().unwrap() = Some(handle.clone());
        }

        fn events(&self) -> Vec<DiscoveryEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSender for AckingTransport {
        async fn send_event(&self, event: String) -> MessageStatus {
            let parsed = DiscoveryEvent::from_json(&event).unwrap();
            let is_add = parsed.event.header.name == ADD_OR_UPDATE_REPORT;
            let token = parsed.event.header.event_correlation_token.clone();
            self.events.lock().unwrap().push(parsed);

            let handle = self.handle.lock().unwrap().clone();
            if let (true, Some(handle)) = (is_add, handle) {
                tokio::spawn(async move { handle.on_alexa_event_processed(&token) });
            }
            MessageStatus::SuccessAccepted
        }
    }

    /// Succeeds every send. During the first one it queues a slow store
    /// clear and then a registration, both ahead of the batch outcome.
    #[derive(Default)]
    struct InterleavingTransport {
        commands: Mutex<Option<mpsc::Sender<Command>>>,
        followup: Mutex<Option<(EndpointId, EndpointConfig)>>,
        events: Mutex<Vec<DiscoveryEvent>>,
    }

    impl InterleavingTransport {
        fn events(&self) -> Vec<DiscoveryEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSender for InterleavingTransport {
        async fn send_event(&self, event: String) -> MessageStatus {
            self.events.lock().unwrap().push(DiscoveryEvent::from_json(&event).unwrap());

            let commands = self.commands.lock().unwrap().clone();
            let followup = self.followup.lock().unwrap().take();
            if let (Some(commands), Some((endpoint_id, config))) = (commands, followup) {
                let (reply, _) = oneshot::channel();
                let clear = Command::ClearStore { reason: "test", reply };
                commands.send(clear).await.unwrap();

                let (reply, _) = oneshot::channel();
                let register = Command::RegisterOrUpdate {
                    endpoint_id,
                    registration: None,
                    config,
                    reply,
                };
                commands.send(register).await.unwrap();
            }
            MessageStatus::SuccessAccepted
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    struct Harness {
        handle: EndpointRegistryHandle,
        observer: Arc<RecordingObserver>,
        task: JoinHandle<()>,
    }

    async fn start(
        store: Arc<dyn EndpointConfigStore>,
        transport: Arc<dyn MessageSender>,
        credentials: Arc<ManualCredentialProvider>,
        wait_for_event_processed: bool,
    ) -> Harness {
        let mut config = DiscoveryConfig::new();
        config.sender.wait_for_event_processed = wait_for_event_processed;

        let (registry, handle) = EndpointRegistryBuilder::new(config)
            .with_store(store)
            .with_credentials(credentials)
            .with_transport(transport)
            .build()
            .await
            .unwrap();
        let task = tokio::spawn(registry.run());

        let observer = Arc::new(RecordingObserver::default());
        handle.add_observer(observer.clone());
        observer.take();

        Harness { handle, observer, task }
    }

    fn credentials() -> Arc<ManualCredentialProvider> {
        Arc::new(ManualCredentialProvider::with_token("token-1"))
    }

    fn lamp(id: &str) -> EndpointAttributes {
        EndpointAttributes::new(
            id,
            format!("Lamp {}", id),
            "Smart lamp",
            "Acme",
            vec!["LIGHT".to_string()],
        )
    }

    fn registered_lamp(id: &str, serial: &str) -> EndpointAttributes {
        let registration = Registration::new("product-1", serial, "acme:registration", "productId");
        lamp(id).with_registration(registration)
    }

    fn power() -> Vec<CapabilityConfiguration> {
        vec![CapabilityConfiguration::new("AlexaInterface", "Alexa.PowerController", "3")
            .with_properties(CapabilityProperties {
                supported: vec!["powerState".to_string()],
                proactively_reported: true,
                retrievable: true,
                non_controllable: None,
            })]
    }

    fn scripted() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::default())
    }

    fn owned(list: &[&str]) -> Vec<EndpointId> {
        list.iter().map(|id| id.to_string()).collect()
    }

    fn success(added: &[&str], deleted: &[&str]) -> Notification {
        (CapabilitiesState::Success, CapabilitiesError::Success, owned(added), owned(deleted))
    }

    fn ids(list: &[&str]) -> BTreeSet<EndpointId> {
        list.iter().map(|id| id.to_string()).collect()
    }

    async fn eventually(
        handle: &EndpointRegistryHandle,
        what: &str,
        check: impl Fn(&RegistrySnapshot) -> bool,
    ) -> RegistrySnapshot {
        for _ in 0..500 {
            let snapshot = handle.snapshot().await.unwrap();
            if check(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn until(what: &str, check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    // =========================================================================
    // Registration and Dispatch
    // =========================================================================

    #[tokio::test]
    async fn test_register_then_connect_confirms_and_persists() {
        let store = Arc::new(SqliteEndpointStore::new(DbConfig::in_memory()));
        let transport = Arc::new(ScriptedTransport::default());
        let h = start(store.clone(), transport.clone(), credentials(), false).await;

        assert!(h.handle.register_or_update(&lamp("e1"), &power()).await);
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.pending_add_or_update, ids(&["e1"]));
        assert!(transport.events().is_empty());

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        let snapshot = eventually(&h.handle, "e1 confirmed", |s| s.confirmed.contains("e1")).await;
        assert!(snapshot.pending_add_or_update.is_empty());
        assert!(snapshot.in_flight_add_or_update.is_empty());

        let events = transport.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.header.name, ADD_OR_UPDATE_REPORT);
        assert_eq!(events[0].endpoint_ids(), vec!["e1".to_string()]);

        let stored = store.load("e1").await.unwrap().unwrap();
        assert!(stored.is_equivalent(&endpoint_config(&lamp("e1"), &power()).unwrap()));

        assert_eq!(
            h.observer.take(),
            vec![success(&["e1"], &[])]
        );
        assert_eq!(h.handle.state(), (CapabilitiesState::Success, CapabilitiesError::Success));
    }

    #[tokio::test]
    async fn test_invalid_descriptors_are_rejected() {
        let h = start(MemoryStore::ready(), scripted(), credentials(), false).await;

        assert!(!h.handle.register_or_update(&lamp("e1"), &[]).await);
        assert!(!h.handle.register_or_update(&lamp(""), &power()).await);
        assert!(!h.handle.deregister(&lamp("e1"), &[]).await);
        assert_eq!(h.handle.snapshot().await.unwrap(), RegistrySnapshot::default());
    }

    #[tokio::test]
    async fn test_registration_cannot_change() {
        let h = start(MemoryStore::ready(), scripted(), credentials(), false).await;

        assert!(h.handle.register_or_update(&registered_lamp("e1", "sn-1"), &power()).await);
        assert!(!h.handle.register_or_update(&registered_lamp("e1", "sn-2"), &power()).await);
        assert!(!h.handle.deregister(&lamp("e1"), &power()).await);
    }

    #[tokio::test]
    async fn test_dedup_group_is_resent_together() {
        let transport = Arc::new(ScriptedTransport::default());
        let h = start(MemoryStore::ready(), transport.clone(), credentials(), false).await;

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        assert!(h.handle.register_or_update(&registered_lamp("d1", "sn-1"), &power()).await);
        eventually(&h.handle, "d1 confirmed", |s| s.confirmed.contains("d1")).await;

        h.handle.on_connection_status_changed(ConnectionStatus::Disconnected).await;
        assert!(h.handle.register_or_update(&registered_lamp("d2", "sn-1"), &power()).await);

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.pending_add_or_update, ids(&["d1", "d2"]));
        assert!(!h.handle.deregister(&registered_lamp("d1", "sn-1"), &power()).await);

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        let snapshot = eventually(&h.handle, "group confirmed", |s| {
            s.confirmed == ids(&["d1", "d2"])
                && s.pending_add_or_update.is_empty()
                && s.in_flight_add_or_update.is_empty()
        })
        .await;
        assert_eq!(snapshot.dedup_group, ids(&["d1", "d2"]));

        let events = transport.events();
        assert_eq!(events.len(), 2);
        let mut sent = events[1].endpoint_ids();
        sent.sort();
        assert_eq!(sent, vec!["d1".to_string(), "d2".to_string()]);
    }

    #[tokio::test]
    async fn test_deregister_sends_delete_and_erases() {
        let store = MemoryStore::ready();
        let transport = Arc::new(ScriptedTransport::default());
        let h = start(store.clone(), transport.clone(), credentials(), false).await;

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        assert!(h.handle.register_or_update(&lamp("e1"), &power()).await);
        eventually(&h.handle, "e1 confirmed", |s| s.confirmed.contains("e1")).await;
        h.observer.take();

        assert!(h.handle.deregister(&lamp("e1"), &power()).await);
        eventually(&h.handle, "e1 removed", |s| *s == RegistrySnapshot::default()).await;

        assert!(store.configs().is_empty());
        let events = transport.events();
        assert_eq!(events.last().unwrap().event.header.name, DELETE_REPORT);
        assert_eq!(
            h.observer.take(),
            vec![success(&[], &["e1"])]
        );

        assert!(!h.handle.deregister(&lamp("e1"), &power()).await);
    }

    #[tokio::test]
    async fn test_ack_routed_through_handle() {
        let transport = Arc::new(AckingTransport::default());
        let h = start(MemoryStore::ready(), transport.clone(), credentials(), true).await;
        transport.attach(&h.handle);

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        assert!(h.handle.register_or_update(&lamp("e1"), &power()).await);
        eventually(&h.handle, "e1 confirmed", |s| s.confirmed.contains("e1")).await;
        assert_eq!(transport.events().len(), 1);
    }

    #[tokio::test]
    async fn test_registration_during_send_waits_for_outcome() {
        let store = MemoryStore::ready();
        store.slow_clear.store(true, Ordering::SeqCst);
        let transport = Arc::new(InterleavingTransport::default());
        let h = start(store.clone(), transport.clone(), credentials(), false).await;

        let config = h.handle.prepare(&lamp("e2"), &power()).unwrap();
        *transport.commands.lock().unwrap() = Some(h.handle.cmd_tx.clone());
        *transport.followup.lock().unwrap() = Some(("e2".to_string(), config));

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        assert!(h.handle.register_or_update(&lamp("e1"), &power()).await);

        let snapshot = eventually(&h.handle, "e1 and e2 confirmed", |s| {
            s.confirmed == ids(&["e1", "e2"]) && s.in_flight_add_or_update.is_empty()
        })
        .await;
        assert!(snapshot.pending_add_or_update.is_empty());

        let sent: Vec<Vec<String>> =
            transport.events().iter().map(DiscoveryEvent::endpoint_ids).collect();
        assert_eq!(sent, vec![vec!["e1".to_string()], vec!["e2".to_string()]]);
        assert!(store.configs().contains_key("e1"));
        assert!(store.configs().contains_key("e2"));
        assert_eq!(
            h.observer.take(),
            vec![
                success(&["e1"], &[]),
                success(&["e2"], &[]),
            ]
        );
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[tokio::test]
    async fn test_storage_failure_on_completion_keeps_in_flight() {
        let store = MemoryStore::ready();
        store.fail_store.store(true, Ordering::SeqCst);
        let transport = Arc::new(ScriptedTransport::default());
        let h = start(store.clone(), transport.clone(), credentials(), false).await;

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        assert!(h.handle.register_or_update(&lamp("e1"), &power()).await);

        until("fatal state", || {
            h.handle.state() == (CapabilitiesState::FatalError, CapabilitiesError::Unknown)
        })
        .await;
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.in_flight_add_or_update, ids(&["e1"]));
        assert!(snapshot.confirmed.is_empty());
        assert!(store.configs().is_empty());
        assert_eq!(
            h.observer.take(),
            vec![(CapabilitiesState::FatalError, CapabilitiesError::Unknown, vec![], vec![])]
        );

        store.fail_store.store(false, Ordering::SeqCst);
        assert!(h.handle.register_or_update(&lamp("e2"), &power()).await);
        let snapshot = eventually(&h.handle, "e1 and e2 confirmed", |s| {
            s.confirmed == ids(&["e1", "e2"]) && s.in_flight_add_or_update.is_empty()
        })
        .await;
        assert!(snapshot.pending_add_or_update.is_empty());
        assert!(store.configs().contains_key("e1"));

        let events = transport.events();
        assert_eq!(events.len(), 2);
        let mut resent = events[1].endpoint_ids();
        resent.sort();
        assert_eq!(resent, vec!["e1".to_string(), "e2".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_auth_is_fatal_and_drops_in_flight() {
        let credentials = credentials();
        let transport = Arc::new(ScriptedTransport::with_script(&[MessageStatus::InvalidAuth]));
        let h = start(MemoryStore::ready(), transport.clone(), credentials.clone(), false).await;

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        assert!(h.handle.register_or_update(&lamp("e1"), &power()).await);

        until("fatal state", || {
            h.handle.state() == (CapabilitiesState::FatalError, CapabilitiesError::Forbidden)
        })
        .await;
        eventually(&h.handle, "e1 dropped", |s| *s == RegistrySnapshot::default()).await;

        assert_eq!(transport.events().len(), 1);
        assert_eq!(credentials.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retriable_failure_then_success() {
        let transport =
            Arc::new(ScriptedTransport::with_script(&[MessageStatus::ServerInternalError]));
        let h = start(MemoryStore::ready(), transport.clone(), credentials(), false).await;

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        assert!(h.handle.register_or_update(&lamp("e1"), &power()).await);
        eventually(&h.handle, "e1 confirmed", |s| s.confirmed.contains("e1")).await;

        assert_eq!(transport.events().len(), 2);
        assert_eq!(
            h.observer.take(),
            vec![
                (
                    CapabilitiesState::RetriableError,
                    CapabilitiesError::ServerInternalError,
                    vec![],
                    vec![],
                ),
                success(&["e1"], &[]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_keeps_endpoint_in_flight() {
        let transport = Arc::new(ScriptedTransport::default());
        let h = start(MemoryStore::ready(), transport.clone(), credentials(), true).await;

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        assert!(h.handle.register_or_update(&lamp("e1"), &power()).await);

        until("ack timeout", || {
            h.handle.state() == (CapabilitiesState::RetriableError, CapabilitiesError::Unknown)
        })
        .await;
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.in_flight_add_or_update, ids(&["e1"]));
        assert!(snapshot.confirmed.is_empty());

        h.handle.shutdown().await;
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_keeps_in_flight_until_reconnect() {
        let transport = Arc::new(ScriptedTransport::with_script(&[MessageStatus::Throttled]));
        let h = start(MemoryStore::ready(), transport.clone(), credentials(), false).await;

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        assert!(h.handle.register_or_update(&lamp("e1"), &power()).await);
        until("first attempt", || transport.events().len() == 1).await;

        h.handle.on_connection_status_changed(ConnectionStatus::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.in_flight_add_or_update, ids(&["e1"]));
        assert_eq!(transport.events().len(), 1);

        h.handle.on_connection_status_changed(ConnectionStatus::Connected).await;
        eventually(&h.handle, "e1 confirmed", |s| s.confirmed.contains("e1")).await;
        assert_eq!(transport.events().len(), 2);
    }

    // =========================================================================
    // Post-Connect
    // =========================================================================

    #[tokio::test]
    async fn test_post_connect_publishes_then_restart_is_idempotent() {
        let store = MemoryStore::ready();

        let transport = Arc::new(AckingTransport::default());
        let first = start(store.clone(), transport.clone(), credentials(), true).await;
        transport.attach(&first.handle);

        assert!(first.handle.register_or_update(&lamp("e1"), &power()).await);
        let operation = first.handle.create_post_connect_operation().await.unwrap();
        assert_eq!(operation.priority(), crate::post_connect::ENDPOINT_DISCOVERY_PRIORITY);
        assert!(operation.perform_operation(transport.as_ref()).await);
        eventually(&first.handle, "e1 confirmed", |s| s.confirmed.contains("e1")).await;
        assert!(store.configs().contains_key("e1"));

        first.handle.shutdown().await;
        first.task.await.unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        let second = start(store.clone(), transport.clone(), credentials(), true).await;
        assert!(second.handle.register_or_update(&lamp("e1"), &power()).await);

        assert!(second.handle.create_post_connect_operation().await.is_none());
        assert_eq!(
            second.observer.take(),
            vec![success(&["e1"], &[])]
        );
        let snapshot = second.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.confirmed, ids(&["e1"]));
        assert!(snapshot.pending_add_or_update.is_empty());
        assert!(transport.events().is_empty());
    }

    #[tokio::test]
    async fn test_post_connect_deletes_stale_endpoints() {
        let store = MemoryStore::ready();
        store.store("ghost", &endpoint_config(&lamp("ghost"), &power()).unwrap()).await.unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        let h = start(store.clone(), transport.clone(), credentials(), true).await;

        let operation = h.handle.create_post_connect_operation().await.unwrap();
        assert_eq!(operation.sender().delete_endpoints().len(), 1);
        assert!(operation.perform_operation(transport.as_ref()).await);

        eventually(&h.handle, "ghost erased", |s| *s == RegistrySnapshot::default()).await;
        assert!(store.configs().is_empty());
        assert_eq!(transport.events()[0].event.header.name, DELETE_REPORT);
    }

    #[tokio::test]
    async fn test_post_connect_requires_loaded_store() {
        let store = MemoryStore::ready();
        store.fail_load.store(true, Ordering::SeqCst);
        let transport = Arc::new(ScriptedTransport::default());
        let h = start(store, transport.clone(), credentials(), true).await;

        assert!(h.handle.register_or_update(&lamp("e1"), &power()).await);
        assert!(h.handle.register_or_update(&registered_lamp("d1", "sn-1"), &power()).await);
        let before = h.handle.snapshot().await.unwrap();
        assert_eq!(before.pending_add_or_update, ids(&["d1", "e1"]));

        assert!(h.handle.create_post_connect_operation().await.is_none());
        assert_eq!(h.handle.snapshot().await.unwrap(), before);
        assert!(h.observer.take().is_empty());
        assert!(transport.events().is_empty());
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_init_creates_missing_store() {
        let store = Arc::new(MemoryStore::default());
        start(store.clone(), scripted(), credentials(), false).await;
        assert!(store.created.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_build_fails_when_store_unusable() {
        let store = Arc::new(MemoryStore::default());
        store.fail_create.store(true, Ordering::SeqCst);

        let result = EndpointRegistryBuilder::new(DiscoveryConfig::new())
            .with_store(store)
            .with_credentials(credentials())
            .with_transport(Arc::new(ScriptedTransport::default()))
            .build()
            .await;
        assert!(matches!(result, Err(SyncError::StorageFailed(_))));

        let result = EndpointRegistryBuilder::new(DiscoveryConfig::new())
            .with_store(MemoryStore::ready())
            .with_credentials(credentials())
            .build()
            .await;
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_clear_data_and_gateway_change() {
        let store = MemoryStore::ready();
        let h = start(store.clone(), scripted(), credentials(), false).await;

        store.store("e1", &EndpointConfig::from_raw("{}")).await.unwrap();
        assert!(h.handle.clear_data().await);
        assert!(store.configs().is_empty());

        store.store("e2", &EndpointConfig::from_raw("{}")).await.unwrap();
        assert!(h.handle.on_gateway_changed("https://gateway.example.com").await);
        assert!(store.configs().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_further_requests() {
        let h = start(MemoryStore::ready(), scripted(), credentials(), false).await;

        h.handle.shutdown().await;
        h.handle.shutdown().await;
        h.task.await.unwrap();

        assert!(!h.handle.register_or_update(&lamp("e1"), &power()).await);
        assert!(h.handle.create_post_connect_operation().await.is_none());
        assert!(!h.handle.clear_data().await);
        assert!(h.handle.snapshot().await.is_err());
    }
}
