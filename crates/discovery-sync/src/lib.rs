//! # discovery-sync: Endpoint Discovery Engine
//!
//! Keeps the discovery service told which endpoints exist and what they can
//! do, across reconnects and restarts.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Endpoint Discovery Data Flow                        │
//! │                                                                         │
//! │  Device code                                                            │
//! │    │ register_or_update / deregister                                    │
//! │    ▼                                                                    │
//! │  ┌──────────────────┐   dispatch    ┌──────────────────────┐           │
//! │  │ EndpointRegistry │──────────────►│ DiscoveryEventSender │           │
//! │  │   (registry/)    │◄──────────────│     (sender.rs)      │           │
//! │  └───────┬──────────┘   outcome     └──────────┬───────────┘           │
//! │          │                                     │ AddOrUpdateReport     │
//! │          │ store_all / erase_all               │ DeleteReport          │
//! │          ▼                                     ▼                        │
//! │  ┌──────────────────┐               ┌──────────────────────┐           │
//! │  │ discovery-store  │               │    MessageSender     │           │
//! │  └──────────────────┘               │   (transport.rs)     │           │
//! │                                     └──────────────────────┘           │
//! │                                                                         │
//! │  Connection bootstrap: create_post_connect_operation() hands a         │
//! │  PostConnectPublisher to the channel owner, which runs it before       │
//! │  normal traffic resumes.                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`registry`] - Endpoint state actor and its handle
//! - [`sender`] - Sub-batching, auth wait, retry and ack correlation
//! - [`post_connect`] - Bootstrap step wrapping one sender
//! - [`observer`] - Capabilities state and observers
//! - [`transport`] - Outbound event contract and send statuses
//! - [`auth`] - Credential provider contract
//! - [`retry`] - Exponential backoff policy
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (registry, handle) = EndpointRegistryBuilder::new(DiscoveryConfig::load(None)?)
//!     .with_store(store)
//!     .with_credentials(credentials)
//!     .with_transport(transport)
//!     .build()
//!     .await?;
//! tokio::spawn(registry.run());
//!
//! handle.register_or_update(&attributes, &capabilities).await;
//! if let Some(operation) = handle.create_post_connect_operation().await {
//!     operation.perform_operation(bootstrap_transport).await;
//! }
//! handle.on_connection_status_changed(ConnectionStatus::Connected).await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod config;
pub mod error;
pub mod observer;
pub mod post_connect;
pub mod registry;
pub mod retry;
pub mod sender;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{AuthState, CredentialProvider, ManualCredentialProvider};
pub use config::DiscoveryConfig;
pub use error::{RejectReason, SyncError, SyncResult};
pub use observer::{CapabilitiesError, CapabilitiesObserver, CapabilitiesState};
pub use post_connect::{PostConnectOperation, PostConnectPublisher, ENDPOINT_DISCOVERY_PRIORITY};
pub use registry::{
    EndpointRegistry, EndpointRegistryBuilder, EndpointRegistryHandle, RegistrySnapshot,
};
pub use retry::RetryPolicy;
pub use sender::{DiscoveryEventSender, DiscoveryStatusObserver};
pub use transport::{ConnectionStatus, MessageSender, MessageStatus};
