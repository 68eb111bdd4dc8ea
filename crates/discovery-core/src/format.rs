//! # Canonical Formatter
//!
//! Turns descriptors into canonical endpoint configs and assembles the
//! `Alexa.Discovery` event bodies that carry them.
//!
//! ## Wire Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  {"event":{                                                             │
//! │     "header":{"namespace":"Alexa.Discovery",                            │
//! │               "name":"AddOrUpdateReport" | "DeleteReport",              │
//! │               "messageId":<uuid>,"eventCorrelationToken":<uuid>,        │
//! │               "payloadVersion":"3"},                                    │
//! │     "payload":{"scope":{"type":"BearerToken","token":<token>},          │
//! │                "endpoints":[ <endpoint config>, ... ]}}}                │
//! │                                                                         │
//! │  AddOrUpdateReport endpoint: full canonical config                      │
//! │  DeleteReport endpoint:      {"endpointId":<id>}                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Canonical Form
//! Object keys are sorted recursively, `displayCategories` is sorted, and
//! `connections` / `capabilities` are sorted by their own canonical text.
//! The output carries no insignificant whitespace, so two semantically equal
//! configs are byte-equal after canonicalization.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{CapabilityConfiguration, EndpointAttributes, EndpointConfig};
use crate::{ADD_OR_UPDATE_REPORT, DELETE_REPORT, DISCOVERY_NAMESPACE, DISCOVERY_PAYLOAD_VERSION};

const DEVICE_SERIAL_NUMBER_KEY: &str = "deviceSerialNumber";

/// Top-level members written by [`endpoint_config`] other than the
/// registration object.
const RESERVED_CONFIG_KEYS: [&str; 9] = [
    "endpointId",
    "friendlyName",
    "description",
    "manufacturerName",
    "displayCategories",
    "additionalAttributes",
    "connections",
    "cookie",
    "capabilities",
];

/// Arrays whose element order carries no meaning.
const UNORDERED_ARRAYS: [&str; 3] = ["displayCategories", "connections", "capabilities"];

// =============================================================================
// Canonicalization
// =============================================================================

/// Returns the canonical form of a JSON value.
pub fn canonicalize(value: Value) -> Value {
    canonicalize_member(None, value)
}

fn canonicalize_member(key: Option<&str>, value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map
                .into_iter()
                .map(|(k, v)| {
                    let v = canonicalize_member(Some(&k), v);
                    (k, v)
                })
                .collect();
            // Insert in key order so the result is sorted whichever Map backing is compiled in.
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().collect::<Map<String, Value>>())
        }
        Value::Array(items) => {
            let mut items: Vec<Value> =
                items.into_iter().map(|v| canonicalize_member(None, v)).collect();
            if key.is_some_and(|k| UNORDERED_ARRAYS.contains(&k)) {
                items.sort_by_cached_key(|v| v.to_string());
            }
            Value::Array(items)
        }
        other => other,
    }
}

/// Semantic equality of two serialized configs.
///
/// Text that fails to parse is never equal to anything.
pub fn configs_equivalent(a: &str, b: &str) -> bool {
    match (serde_json::from_str::<Value>(a), serde_json::from_str::<Value>(b)) {
        (Ok(a), Ok(b)) => canonicalize(a) == canonicalize(b),
        _ => false,
    }
}

// =============================================================================
// Endpoint Configs
// =============================================================================

/// Builds the canonical config of one endpoint.
///
/// Descriptors are expected to have passed [`crate::validation`]; a custom
/// capability member that is not JSON still fails here.
pub fn endpoint_config(
    attributes: &EndpointAttributes,
    capabilities: &[CapabilityConfiguration],
) -> CoreResult<EndpointConfig> {
    let mut root = Map::new();
    root.insert("endpointId".into(), json!(attributes.endpoint_id));
    root.insert("friendlyName".into(), json!(attributes.friendly_name));
    root.insert("description".into(), json!(attributes.description));
    root.insert("manufacturerName".into(), json!(attributes.manufacturer_name));
    root.insert("displayCategories".into(), json!(attributes.display_categories));

    if let Some(additional) = attributes.additional_attributes.as_ref().filter(|a| !a.is_empty()) {
        let mut members = Map::new();
        let fields = [
            ("manufacturer", &additional.manufacturer),
            ("model", &additional.model),
            ("serialNumber", &additional.serial_number),
            ("firmwareVersion", &additional.firmware_version),
            ("softwareVersion", &additional.software_version),
            ("customIdentifier", &additional.custom_identifier),
        ];
        for (key, value) in fields.into_iter().filter(|(_, v)| !v.is_empty()) {
            members.insert(key.into(), json!(value));
        }
        root.insert("additionalAttributes".into(), Value::Object(members));
    }

    if let Some(registration) = attributes.registration() {
        let mut members = Map::new();
        members.insert(registration.product_id_key.clone(), json!(registration.product_id));
        members.insert(DEVICE_SERIAL_NUMBER_KEY.into(), json!(registration.serial_number));
        root.insert(registration.registration_key.clone(), Value::Object(members));
    }

    if !attributes.connections.is_empty() {
        root.insert("connections".into(), json!(attributes.connections));
    }

    if !attributes.cookies.is_empty() {
        root.insert("cookie".into(), json!(attributes.cookies));
    }

    let capabilities = capabilities
        .iter()
        .map(capability_json)
        .collect::<CoreResult<Vec<Value>>>()?;
    root.insert("capabilities".into(), Value::Array(capabilities));

    let canonical = canonicalize(Value::Object(root));
    Ok(EndpointConfig::from_raw(serde_json::to_string(&canonical)?))
}

fn capability_json(capability: &CapabilityConfiguration) -> CoreResult<Value> {
    let mut members = Map::new();
    members.insert("type".into(), json!(capability.interface_type));
    members.insert("interface".into(), json!(capability.interface_name));
    members.insert("version".into(), json!(capability.version));

    if let Some(instance) = &capability.instance_name {
        members.insert("instance".into(), json!(instance));
    }

    if let Some(properties) = &capability.properties {
        let supported: Vec<Value> = properties
            .supported
            .iter()
            .map(|name| json!({ "name": name }))
            .collect();
        let mut block = Map::new();
        block.insert("supported".into(), Value::Array(supported));
        block.insert("proactivelyReported".into(), json!(properties.proactively_reported));
        block.insert("retrievable".into(), json!(properties.retrievable));
        if let Some(non_controllable) = properties.non_controllable {
            block.insert("nonControllable".into(), json!(non_controllable));
        }
        members.insert("properties".into(), Value::Object(block));
    }

    for (key, raw) in &capability.additional_configurations {
        let value: Value = serde_json::from_str(raw).map_err(|e| ValidationError::InvalidJson {
            field: format!("capability.{}", key),
            reason: e.to_string(),
        })?;
        members.insert(key.clone(), value);
    }

    Ok(Value::Object(members))
}

/// The `{"endpointId": ...}` config used by `DeleteReport`.
pub fn delete_report_endpoint_config(endpoint_id: &str) -> EndpointConfig {
    EndpointConfig::from_raw(json!({ "endpointId": endpoint_id }).to_string())
}

/// True when a serialized config publishes a registration object.
///
/// Used on configs loaded from storage, where the registration key is not
/// known in advance.
pub fn carries_registration(config: &EndpointConfig) -> bool {
    match serde_json::from_str::<Value>(config.as_str()) {
        Ok(Value::Object(root)) => root
            .iter()
            .filter(|(key, _)| !RESERVED_CONFIG_KEYS.contains(&key.as_str()))
            .any(|(_, v)| v.as_object().is_some_and(|o| o.contains_key(DEVICE_SERIAL_NUMBER_KEY))),
        _ => false,
    }
}

// =============================================================================
// Discovery Events
// =============================================================================

/// Top-level discovery event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub event: EventBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBody {
    pub header: EventHeader,
    pub payload: DiscoveryPayload,
}

/// Event header. Every event gets a fresh message id and correlation token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    pub namespace: String,
    pub name: String,
    pub message_id: String,
    pub event_correlation_token: String,
    pub payload_version: String,
}

impl EventHeader {
    fn new(name: &str) -> Self {
        EventHeader {
            namespace: DISCOVERY_NAMESPACE.to_string(),
            name: name.to_string(),
            message_id: Uuid::new_v4().to_string(),
            event_correlation_token: Uuid::new_v4().to_string(),
            payload_version: DISCOVERY_PAYLOAD_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub scope: Scope,
    pub endpoints: Vec<Value>,
}

/// Bearer-token scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub scope_type: String,
    pub token: String,
}

impl DiscoveryEvent {
    fn build(name: &str, endpoints: &[EndpointConfig], auth_token: &str) -> CoreResult<Self> {
        let endpoints = endpoints
            .iter()
            .map(|config| serde_json::from_str::<Value>(config.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DiscoveryEvent {
            event: EventBody {
                header: EventHeader::new(name),
                payload: DiscoveryPayload {
                    scope: Scope {
                        scope_type: "BearerToken".to_string(),
                        token: auth_token.to_string(),
                    },
                    endpoints,
                },
            },
        })
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// `endpointId` of every endpoint in the payload, in payload order.
    pub fn endpoint_ids(&self) -> Vec<String> {
        self.event
            .payload
            .endpoints
            .iter()
            .filter_map(|e| e.get("endpointId").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

/// Builds an `AddOrUpdateReport` event.
///
/// Returns the event text and the correlation token minted for it.
pub fn add_or_update_report_event(
    endpoints: &[EndpointConfig],
    auth_token: &str,
) -> CoreResult<(String, String)> {
    let event = DiscoveryEvent::build(ADD_OR_UPDATE_REPORT, endpoints, auth_token)?;
    let token = event.event.header.event_correlation_token.clone();
    Ok((event.to_json()?, token))
}

/// Builds a `DeleteReport` event from delete-report endpoint configs.
pub fn delete_report_event(endpoints: &[EndpointConfig], auth_token: &str) -> CoreResult<String> {
    DiscoveryEvent::build(DELETE_REPORT, endpoints, auth_token)?.to_json()
}

/// Checks one config against the per-event endpoint budget.
pub fn ensure_fits_payload(endpoint_id: &str, config: &EndpointConfig) -> CoreResult<()> {
    if config.len() > crate::MAX_ENDPOINTS_SIZE_IN_PAYLOAD {
        return Err(CoreError::ConfigTooLarge {
            endpoint_id: endpoint_id.to_string(),
            size: config.len(),
            max: crate::MAX_ENDPOINTS_SIZE_IN_PAYLOAD,
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
