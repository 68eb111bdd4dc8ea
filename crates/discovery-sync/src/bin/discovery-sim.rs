//! # Discovery Simulator
//!
//! Runs a registry against a loopback transport and a real SQLite store.
//! Running it twice shows the second bootstrap skipping endpoints the store
//! already holds.
//!
//! ```text
//! RUST_LOG=info,discovery=debug cargo run --bin discovery-sim
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use discovery_core::format::DiscoveryEvent;
use discovery_core::{
    CapabilityConfiguration, CapabilityProperties, EndpointAttributes, EndpointId, Registration,
    ADD_OR_UPDATE_REPORT,
};
use discovery_store::SqliteEndpointStore;
use discovery_sync::{
    CapabilitiesError, CapabilitiesObserver, CapabilitiesState, ConnectionStatus, DiscoveryConfig,
    EndpointRegistryBuilder, EndpointRegistryHandle, ManualCredentialProvider, MessageSender,
    MessageStatus, PostConnectOperation, RegistrySnapshot, SyncResult,
};

/// Accepts every event and acknowledges AddOrUpdateReports shortly after.
#[derive(Default)]
struct LoopbackTransport {
    handle: Mutex<Option<EndpointRegistryHandle>>,
}

impl LoopbackTransport {
    fn attach(&self, handle: &EndpointRegistryHandle) {
        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle.clone());
    }
}

#[async_trait]
impl MessageSender for LoopbackTransport {
    async fn send_event(&self, event: String) -> MessageStatus {
        let event = match DiscoveryEvent::from_json(&event) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Malformed discovery event");
                return MessageStatus::BadRequest;
            }
        };

        let header = &event.event.header;
        info!(name = %header.name, endpoints = ?event.endpoint_ids(), "Event sent");

        if header.name == ADD_OR_UPDATE_REPORT {
            let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).clone();
            if let Some(handle) = handle {
                let token = header.event_correlation_token.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    handle.on_alexa_event_processed(&token);
                });
            }
        }

        MessageStatus::SuccessAccepted
    }
}

struct LogObserver;

impl CapabilitiesObserver for LogObserver {
    fn on_capabilities_state_change(
        &self,
        state: CapabilitiesState,
        error: CapabilitiesError,
        add_or_update_ids: &[EndpointId],
        delete_ids: &[EndpointId],
    ) {
        info!(
            %state,
            %error,
            added = ?add_or_update_ids,
            deleted = ?delete_ids,
            "Capabilities state"
        );
    }
}

fn power() -> CapabilityConfiguration {
    CapabilityConfiguration::new("AlexaInterface", "Alexa.PowerController", "3").with_properties(
        CapabilityProperties {
            supported: vec!["powerState".to_string()],
            proactively_reported: true,
            retrievable: true,
            non_controllable: None,
        },
    )
}

fn temperature() -> CapabilityConfiguration {
    CapabilityConfiguration::new("AlexaInterface", "Alexa.TemperatureSensor", "3").with_properties(
        CapabilityProperties {
            supported: vec!["temperature".to_string()],
            proactively_reported: true,
            retrievable: true,
            non_controllable: None,
        },
    )
}

/// Waits until nothing is pending or in flight.
async fn settle(handle: &EndpointRegistryHandle) -> SyncResult<RegistrySnapshot> {
    let mut snapshot = handle.snapshot().await?;
    for _ in 0..100 {
        let settled = snapshot.pending_add_or_update.is_empty()
            && snapshot.pending_delete.is_empty()
            && snapshot.in_flight_add_or_update.is_empty()
            && snapshot.in_flight_delete.is_empty();
        if settled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        snapshot = handle.snapshot().await?;
    }
    Ok(snapshot)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,discovery=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = DiscoveryConfig::load(None)?;
    if config.store.database_path.is_none() {
        config.store.database_path = Some(std::env::temp_dir().join("discovery-sim.db"));
    }
    info!(path = ?config.store.database_path, "Starting discovery simulator");

    let store = Arc::new(SqliteEndpointStore::new(config.db_config()?));
    let transport = Arc::new(LoopbackTransport::default());
    let credentials = Arc::new(ManualCredentialProvider::with_token("sim-token"));

    let (registry, handle) = EndpointRegistryBuilder::new(config)
        .with_store(store)
        .with_credentials(credentials)
        .with_transport(transport.clone())
        .build()
        .await?;
    transport.attach(&handle);
    let worker = tokio::spawn(registry.run());

    handle.add_observer(Arc::new(LogObserver));

    let hub_registration =
        Registration::new("hub-product", "hub-0001", "acme:registration", "productId");
    let lamp = EndpointAttributes::new(
        "lamp-1",
        "Desk Lamp",
        "Dimmable desk lamp",
        "Acme",
        vec!["LIGHT".into()],
    )
    .with_registration(hub_registration.clone());
    let plug = EndpointAttributes::new(
        "plug-1",
        "Kettle Plug",
        "Smart plug",
        "Acme",
        vec!["SMARTPLUG".into()],
    )
    .with_registration(hub_registration);

    let sensor = EndpointAttributes::new(
        "sensor-1",
        "Hall Thermometer",
        "Temperature sensor",
        "Acme",
        vec!["TEMPERATURE_SENSOR".into()],
    );

    handle.register_or_update(&lamp, &[power()]).await;
    handle.register_or_update(&plug, &[power()]).await;
    handle.register_or_update(&sensor, &[temperature()]).await;

    match handle.create_post_connect_operation().await {
        Some(operation) => {
            let published = operation.perform_operation(transport.as_ref()).await;
            info!(published, "Post-connect discovery finished");
        }
        None => info!("Endpoints already published, nothing to do on connect"),
    }

    handle.on_connection_status_changed(ConnectionStatus::Connected).await;
    settle(&handle).await?;

    let guest = EndpointAttributes::new(
        "guest-light",
        "Guest Light",
        "Temporary light",
        "Acme",
        vec!["LIGHT".into()],
    );
    handle.register_or_update(&guest, &[power()]).await;
    settle(&handle).await?;
    handle.deregister(&guest, &[power()]).await;

    let snapshot = settle(&handle).await?;
    info!(confirmed = ?snapshot.confirmed, dedup_group = ?snapshot.dedup_group, "Registry settled");

    handle.shutdown().await;
    worker.await?;
    Ok(())
}
