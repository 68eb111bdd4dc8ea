//! # Validation Module
//!
//! Descriptor validation run at the registry's call boundary.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: THIS MODULE (caller thread)                                  │
//! │  ├── Endpoint attributes (id, description, manufacturer, categories)   │
//! │  └── Capabilities (type, interface, version, instance, properties)     │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: format (caller thread)                                       │
//! │  └── Canonical config must fit the per-event endpoint budget           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Registry worker                                              │
//! │  └── Registration / Dedup Group / pending-state rules                  │
//! │                                                                         │
//! │  A failure at any layer rejects the call with no state change          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use discovery_core::types::EndpointAttributes;
//! use discovery_core::validation::validate_endpoint_attributes;
//!
//! let attrs = EndpointAttributes::new("lamp-1", "Lamp", "Desk lamp", "Acme", vec!["LIGHT".into()]);
//! assert!(validate_endpoint_attributes(&attrs).is_ok());
//! ```

use crate::error::ValidationError;
use crate::types::{AdditionalAttributes, CapabilityConfiguration, EndpointAttributes};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Endpoint identifier length limit.
pub const MAX_ENDPOINT_ID_LENGTH: usize = 256;

/// Description length limit.
pub const MAX_DESCRIPTION_LENGTH: usize = 128;

/// Manufacturer name length limit.
pub const MAX_MANUFACTURER_NAME_LENGTH: usize = 128;

/// Length limit for each additional attribute.
pub const MAX_ADDITIONAL_ATTRIBUTE_LENGTH: usize = 256;

// =============================================================================
// Endpoint Validators
// =============================================================================

fn validate_bounded(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    Ok(())
}

/// Validates an endpoint identifier.
///
/// ## Rules
/// - Must not be empty
/// - At most 256 characters
pub fn validate_endpoint_id(endpoint_id: &str) -> ValidationResult<()> {
    validate_bounded("endpointId", endpoint_id, MAX_ENDPOINT_ID_LENGTH)
}

/// Validates an endpoint description (1..=128 characters).
pub fn validate_description(description: &str) -> ValidationResult<()> {
    validate_bounded("description", description, MAX_DESCRIPTION_LENGTH)
}

/// Validates a manufacturer name (1..=128 characters).
pub fn validate_manufacturer_name(name: &str) -> ValidationResult<()> {
    validate_bounded("manufacturerName", name, MAX_MANUFACTURER_NAME_LENGTH)
}

/// Requires at least one display category.
pub fn validate_display_categories(categories: &[String]) -> ValidationResult<()> {
    if categories.is_empty() {
        return Err(ValidationError::Required {
            field: "displayCategories".to_string(),
        });
    }
    Ok(())
}

/// Checks every populated additional attribute against the length limit.
pub fn validate_additional_attributes(additional: &AdditionalAttributes) -> ValidationResult<()> {
    let fields = [
        ("manufacturer", &additional.manufacturer),
        ("model", &additional.model),
        ("serialNumber", &additional.serial_number),
        ("firmwareVersion", &additional.firmware_version),
        ("softwareVersion", &additional.software_version),
        ("customIdentifier", &additional.custom_identifier),
    ];

    for (field, value) in fields {
        if value.chars().count() > MAX_ADDITIONAL_ATTRIBUTE_LENGTH {
            return Err(ValidationError::TooLong {
                field: format!("additionalAttributes.{}", field),
                max: MAX_ADDITIONAL_ATTRIBUTE_LENGTH,
            });
        }
    }

    Ok(())
}

/// Validates a whole endpoint descriptor.
pub fn validate_endpoint_attributes(attributes: &EndpointAttributes) -> ValidationResult<()> {
    validate_endpoint_id(&attributes.endpoint_id)?;
    validate_description(&attributes.description)?;
    validate_manufacturer_name(&attributes.manufacturer_name)?;
    validate_display_categories(&attributes.display_categories)?;

    if let Some(additional) = &attributes.additional_attributes {
        validate_additional_attributes(additional)?;
    }

    Ok(())
}

// =============================================================================
// Capability Validators
// =============================================================================

/// Validates one capability descriptor.
///
/// ## Rules
/// - `interface_type`, `interface_name` and `version` must not be empty
/// - `instance_name`, when present, must not be empty
/// - `properties.supported`, when properties are present, must not be empty
/// - every custom configuration value must parse as JSON
pub fn validate_capability_configuration(
    capability: &CapabilityConfiguration,
) -> ValidationResult<()> {
    let required = [
        ("type", &capability.interface_type),
        ("interface", &capability.interface_name),
        ("version", &capability.version),
    ];
    for (field, value) in required {
        if value.is_empty() {
            return Err(ValidationError::Required {
                field: format!("capability.{}", field),
            });
        }
    }

    if matches!(&capability.instance_name, Some(instance) if instance.is_empty()) {
        return Err(ValidationError::Empty {
            field: "capability.instance".to_string(),
        });
    }

    if let Some(properties) = &capability.properties {
        if properties.supported.is_empty() {
            return Err(ValidationError::Empty {
                field: "capability.properties.supported".to_string(),
            });
        }
    }

    for (key, raw) in &capability.additional_configurations {
        if let Err(e) = serde_json::from_str::<serde_json::Value>(raw) {
            return Err(ValidationError::InvalidJson {
                field: format!("capability.{}", key),
                reason: e.to_string(),
            });
        }
    }

    Ok(())
}

/// Validates a capability list.
///
/// ## Rules
/// - At least one capability
/// - At most `max` capabilities
/// - Every entry passes [`validate_capability_configuration`]
pub fn validate_capabilities(
    capabilities: &[CapabilityConfiguration],
    max: usize,
) -> ValidationResult<()> {
    if capabilities.is_empty() {
        return Err(ValidationError::Required {
            field: "capabilities".to_string(),
        });
    }

    if capabilities.len() > max {
        return Err(ValidationError::TooMany {
            field: "capabilities".to_string(),
            max,
            actual: capabilities.len(),
        });
    }

    capabilities.iter().try_for_each(validate_capability_configuration)
}

// =============================================================================
// Unit Tests
// =============================================================================
