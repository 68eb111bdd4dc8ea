//! # Descriptor Types
//!
//! Types callers use to describe an endpoint and the capabilities it exposes.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Descriptor Types                                │
//! │                                                                         │
//! │  ┌──────────────────────┐        ┌─────────────────────────┐           │
//! │  │  EndpointAttributes  │        │ CapabilityConfiguration │           │
//! │  │  ──────────────────  │   +    │ ─────────────────────── │  (1..100) │
//! │  │  endpoint_id         │        │ interface_type          │           │
//! │  │  friendly_name       │        │ interface_name          │           │
//! │  │  display_categories  │        │ version, instance_name  │           │
//! │  │  registration?  ─────┼──┐     │ properties?             │           │
//! │  └──────────────────────┘  │     └─────────────────────────┘           │
//! │                            ▼                  │                         │
//! │                   ┌─────────────────┐         │ format::endpoint_config │
//! │                   │  Registration   │         ▼                         │
//! │                   │  (Dedup Group)  │  ┌─────────────────┐              │
//! │                   └─────────────────┘  │ EndpointConfig  │ canonical    │
//! │                                        └─────────────────┘ JSON text    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque endpoint identifier. Unique key of every registry map.
pub type EndpointId = String;

/// Endpoint configs keyed by id, iterated in id order.
pub type EndpointConfigMap = BTreeMap<EndpointId, EndpointConfig>;

// =============================================================================
// Registration
// =============================================================================

/// Manufacturer registration identity of an endpoint.
///
/// Endpoints carrying the same registration form the Dedup Group and are
/// always announced together. An all-empty registration counts as none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Registration {
    pub product_id: String,
    pub serial_number: String,
    /// JSON key the registration object is published under.
    pub registration_key: String,
    /// JSON key the product id is published under.
    pub product_id_key: String,
}

impl Registration {
    pub fn new(
        product_id: impl Into<String>,
        serial_number: impl Into<String>,
        registration_key: impl Into<String>,
        product_id_key: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            serial_number: serial_number.into(),
            registration_key: registration_key.into(),
            product_id_key: product_id_key.into(),
        }
    }

    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.product_id.is_empty()
            && self.serial_number.is_empty()
            && self.registration_key.is_empty()
            && self.product_id_key.is_empty()
    }
}

// =============================================================================
// Endpoint Attributes
// =============================================================================

/// Optional manufacturer details published under `additionalAttributes`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdditionalAttributes {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub software_version: String,
    pub custom_identifier: String,
}

impl AdditionalAttributes {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.manufacturer.is_empty()
            && self.model.is_empty()
            && self.serial_number.is_empty()
            && self.firmware_version.is_empty()
            && self.software_version.is_empty()
            && self.custom_identifier.is_empty()
    }
}

/// Identity and presentation of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAttributes {
    /// Unique identifier (1..=256 chars).
    pub endpoint_id: EndpointId,

    /// Name shown to the user in companion apps.
    pub friendly_name: String,

    /// Free-form description (1..=128 chars).
    pub description: String,

    /// Manufacturer name (1..=128 chars).
    pub manufacturer_name: String,

    /// Display categories, at least one.
    pub display_categories: Vec<String>,

    pub additional_attributes: Option<AdditionalAttributes>,

    /// Connection descriptors, each a flat string map.
    pub connections: Vec<BTreeMap<String, String>>,

    /// Opaque key/value pairs echoed back by the service.
    pub cookies: BTreeMap<String, String>,

    pub registration: Option<Registration>,
}

impl EndpointAttributes {
    /// Creates attributes with the mandatory fields and nothing else.
    pub fn new(
        endpoint_id: impl Into<String>,
        friendly_name: impl Into<String>,
        description: impl Into<String>,
        manufacturer_name: impl Into<String>,
        display_categories: Vec<String>,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            friendly_name: friendly_name.into(),
            description: description.into(),
            manufacturer_name: manufacturer_name.into(),
            display_categories,
            additional_attributes: None,
            connections: Vec::new(),
            cookies: BTreeMap::new(),
            registration: None,
        }
    }

    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn with_additional_attributes(mut self, additional: AdditionalAttributes) -> Self {
        self.additional_attributes = Some(additional);
        self
    }

    pub fn with_connection(mut self, connection: BTreeMap<String, String>) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn with_cookie(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(key.into(), value.into());
        self
    }

    /// The registration, if one is set and non-empty.
    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref().filter(|r| !r.is_empty())
    }
}

// =============================================================================
// Capability Configuration
// =============================================================================

/// Property block of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilityProperties {
    /// Names of the supported properties. Must not be empty.
    pub supported: Vec<String>,
    pub proactively_reported: bool,
    pub retrievable: bool,
    pub non_controllable: Option<bool>,
}

/// One interface an endpoint exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfiguration {
    /// Capability type, e.g. `AlexaInterface`.
    pub interface_type: String,

    /// Interface name, e.g. `Alexa.PowerController`.
    pub interface_name: String,

    pub version: String,

    /// Instance name for multi-instance interfaces.
    pub instance_name: Option<String>,

    pub properties: Option<CapabilityProperties>,

    /// Extra members published verbatim. Values are raw JSON text.
    pub additional_configurations: BTreeMap<String, String>,
}

impl CapabilityConfiguration {
    pub fn new(
        interface_type: impl Into<String>,
        interface_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            interface_type: interface_type.into(),
            interface_name: interface_name.into(),
            version: version.into(),
            instance_name: None,
            properties: None,
            additional_configurations: BTreeMap::new(),
        }
    }

    pub fn with_instance(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = Some(instance_name.into());
        self
    }

    pub fn with_properties(mut self, properties: CapabilityProperties) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Adds a custom member. `raw_json` must parse as JSON.
    pub fn with_configuration(
        mut self,
        key: impl Into<String>,
        raw_json: impl Into<String>,
    ) -> Self {
        self.additional_configurations.insert(key.into(), raw_json.into());
        self
    }
}

// =============================================================================
// Endpoint Config
// =============================================================================

/// Canonical serialized attributes and capabilities of one endpoint.
///
/// Produced by [`crate::format`]. Configs loaded back from storage may have
/// been written by another formatter, so compare them with
/// [`EndpointConfig::is_equivalent`] rather than `==`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointConfig(String);

impl EndpointConfig {
    /// Wraps config text without checking it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        EndpointConfig(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Serialized size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Semantic (order-insensitive) equality.
    pub fn is_equivalent(&self, other: &EndpointConfig) -> bool {
        crate::format::configs_equivalent(self.as_str(), other.as_str())
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registration_is_ignored() {
        let attrs = EndpointAttributes::new("e1", "Lamp", "Lamp", "Acme", vec!["LIGHT".into()])
            .with_registration(Registration::default());
        assert!(attrs.registration().is_none());

        let registration = Registration::new("p", "s", "registration", "productId");
        let attrs = attrs.with_registration(registration);
        assert_eq!(attrs.registration().map(|r| r.serial_number.as_str()), Some("s"));
    }

    #[test]
    fn test_additional_attributes_empty() {
        assert!(AdditionalAttributes::default().is_empty());
        let attrs = AdditionalAttributes {
            model: "X1".into(),
            ..Default::default()
        };
        assert!(!attrs.is_empty());
    }

    #[test]
    fn test_endpoint_config_serializes_as_plain_string() {
        let config = EndpointConfig::from_raw("{\"endpointId\":\"e1\"}");
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, "\"{\\\"endpointId\\\":\\\"e1\\\"}\"");
        assert_eq!(config.len(), 19);
    }
}
