//! # discovery-core: Pure Endpoint Descriptor Logic
//!
//! Everything needed to describe an endpoint to the discovery service,
//! without touching the network, the disk or a clock.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Endpoint Discovery Architecture                    │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 discovery-sync (Registry / Sender)              │   │
//! │  │   register_or_update ──► dispatch pass ──► send_all ──► ack     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ discovery-core (THIS CRATE) ★                   │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌────────────┐  ┌────────────┐                │   │
//! │  │   │   types   │  │ validation │  │   format   │                │   │
//! │  │   │ Endpoint  │  │  id, desc  │  │ canonical  │                │   │
//! │  │   │Capability │  │ capability │  │   events   │                │   │
//! │  │   └───────────┘  └────────────┘  └────────────┘                │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 discovery-store (Persisted Store)               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Endpoint attributes, capabilities, registrations, configs
//! - [`validation`] - Descriptor validation rules
//! - [`format`] - Canonical endpoint configs and discovery event bodies
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use discovery_core::format::endpoint_config;
//! use discovery_core::types::{CapabilityConfiguration, EndpointAttributes};
//!
//! let attributes = EndpointAttributes::new("lamp-1", "Lamp", "Desk lamp", "Acme", vec!["LIGHT".into()]);
//! let power = CapabilityConfiguration::new("AlexaInterface", "Alexa.PowerController", "3");
//!
//! let config = endpoint_config(&attributes, &[power]).unwrap();
//! assert!(config.as_str().starts_with("{\"capabilities\":"));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod format;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

// =============================================================================
// Protocol Limits
// =============================================================================

/// Ceiling for a whole discovery event, envelope included.
pub const MAX_EVENT_PAYLOAD_BYTES: usize = 256 * 1024;

/// Bytes reserved for the header and scope of every discovery event.
pub const EVENT_ENVELOPE_RESERVE_BYTES: usize = 10 * 1024;

/// Budget for the serialized `endpoints` list of one event.
///
/// A single endpoint config larger than this can never be sent, and a
/// Dedup Group must fit inside it as a whole.
pub const MAX_ENDPOINTS_SIZE_IN_PAYLOAD: usize =
    MAX_EVENT_PAYLOAD_BYTES - EVENT_ENVELOPE_RESERVE_BYTES;

/// Maximum endpoints carried by one `AddOrUpdateReport`.
///
/// `DeleteReport` events are only size-bounded.
pub const MAX_ENDPOINTS_PER_ADD_OR_UPDATE_REPORT: usize = 300;

/// Maximum capabilities a single endpoint may declare.
pub const MAX_CAPABILITIES_PER_ENDPOINT: usize = 100;

/// Maximum members of the Dedup Group. The group travels in one event.
pub const MAX_DEDUP_GROUP_ENDPOINTS: usize = MAX_ENDPOINTS_PER_ADD_OR_UPDATE_REPORT;

/// Namespace of every discovery event.
pub const DISCOVERY_NAMESPACE: &str = "Alexa.Discovery";

/// Payload version of every discovery event.
pub const DISCOVERY_PAYLOAD_VERSION: &str = "3";

/// Event name announcing new or changed endpoints.
pub const ADD_OR_UPDATE_REPORT: &str = "AddOrUpdateReport";

/// Event name announcing removed endpoints.
pub const DELETE_REPORT: &str = "DeleteReport";
