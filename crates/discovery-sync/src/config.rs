//! # Discovery Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     DISCOVERY_DB_PATH=/var/lib/discovery/endpoints.db                  │
//! │     DISCOVERY_WAIT_FOR_ACK=false                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/discovery/discovery.toml (Linux)                         │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     1s → 256s retry, 2s ack timeout, 100 capabilities per endpoint     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [sender]
//! retry_initial_ms = 1000
//! retry_max_ms = 256000
//! retry_multiplier = 2.0
//! ack_timeout_ms = 2000
//! wait_for_event_processed = true
//!
//! [registry]
//! max_capabilities_per_endpoint = 100
//! command_buffer = 64
//!
//! [store]
//! database_path = "/var/lib/discovery/endpoints.db"
//! max_connections = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use discovery_core::MAX_CAPABILITIES_PER_ENDPOINT;
use discovery_store::DbConfig;

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;

// =============================================================================
// Sender Settings
// =============================================================================

/// Per-sender retry and acknowledgment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderSettings {
    /// First retry delay (milliseconds).
    #[serde(default = "default_retry_initial")]
    pub retry_initial_ms: u64,

    /// Retry delay ceiling (milliseconds).
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,

    /// Growth factor between consecutive retry delays.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// How long to wait for the asynchronous ack of an AddOrUpdateReport.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Whether registry-dispatched batches wait for the ack.
    /// Post-connect operations always wait.
    #[serde(default = "default_true")]
    pub wait_for_event_processed: bool,
}

fn default_retry_initial() -> u64 {
    1_000
}
fn default_retry_max() -> u64 {
    256_000
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_ack_timeout() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}

impl Default for SenderSettings {
    fn default() -> Self {
        SenderSettings {
            retry_initial_ms: default_retry_initial(),
            retry_max_ms: default_retry_max(),
            retry_multiplier: default_retry_multiplier(),
            ack_timeout_ms: default_ack_timeout(),
            wait_for_event_processed: default_true(),
        }
    }
}

impl SenderSettings {
    /// Builds the retry policy handed to each sender.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_initial_ms),
            Duration::from_millis(self.retry_max_ms),
            self.retry_multiplier,
        )
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

// =============================================================================
// Registry Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Capabilities accepted per endpoint.
    #[serde(default = "default_max_capabilities")]
    pub max_capabilities_per_endpoint: usize,

    /// Depth of the registry worker's command queue.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_max_capabilities() -> usize {
    MAX_CAPABILITIES_PER_ENDPOINT
}
fn default_command_buffer() -> usize {
    64
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            max_capabilities_per_endpoint: default_max_capabilities(),
            command_buffer: default_command_buffer(),
        }
    }
}

// =============================================================================
// Store Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite file. Defaults to `endpoints.db` in the platform data dir.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            database_path: None,
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete discovery configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub sender: SenderSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub store: StoreSettings,
}

impl DiscoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (discovery.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading discovery config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load discovery config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Discovery config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let sender = &self.sender;

        if !(sender.retry_multiplier >= 1.0) {
            return Err(SyncError::InvalidConfig(format!(
                "retry_multiplier must be at least 1.0, got {}",
                sender.retry_multiplier
            )));
        }

        if sender.retry_initial_ms == 0 || sender.retry_initial_ms > sender.retry_max_ms {
            return Err(SyncError::InvalidConfig(format!(
                "retry_initial_ms must be between 1 and retry_max_ms ({}), got {}",
                sender.retry_max_ms, sender.retry_initial_ms
            )));
        }

        if sender.ack_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig("ack_timeout_ms must be greater than 0".into()));
        }

        let max_caps = self.registry.max_capabilities_per_endpoint;
        if max_caps == 0 || max_caps > MAX_CAPABILITIES_PER_ENDPOINT {
            return Err(SyncError::InvalidConfig(format!(
                "max_capabilities_per_endpoint must be between 1 and {}, got {}",
                MAX_CAPABILITIES_PER_ENDPOINT, max_caps
            )));
        }

        if self.registry.command_buffer == 0 {
            return Err(SyncError::InvalidConfig("command_buffer must be greater than 0".into()));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("DISCOVERY_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.store.database_path = Some(PathBuf::from(path));
        }

        if let Ok(value) = std::env::var("DISCOVERY_RETRY_INITIAL_MS") {
            match value.parse::<u64>() {
                Ok(ms) => self.sender.retry_initial_ms = ms,
                Err(_) => warn!(value = %value, "Ignoring invalid DISCOVERY_RETRY_INITIAL_MS"),
            }
        }

        if let Ok(value) = std::env::var("DISCOVERY_RETRY_MAX_MS") {
            match value.parse::<u64>() {
                Ok(ms) => self.sender.retry_max_ms = ms,
                Err(_) => warn!(value = %value, "Ignoring invalid DISCOVERY_RETRY_MAX_MS"),
            }
        }

        if let Ok(value) = std::env::var("DISCOVERY_ACK_TIMEOUT_MS") {
            match value.parse::<u64>() {
                Ok(ms) => self.sender.ack_timeout_ms = ms,
                Err(_) => warn!(value = %value, "Ignoring invalid DISCOVERY_ACK_TIMEOUT_MS"),
            }
        }

        if let Ok(value) = std::env::var("DISCOVERY_WAIT_FOR_ACK") {
            match value.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.sender.wait_for_event_processed = true,
                "0" | "false" | "no" => self.sender.wait_for_event_processed = false,
                _ => warn!(value = %value, "Ignoring invalid DISCOVERY_WAIT_FOR_ACK"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "discovery", "endpoint-discovery")
            .map(|dirs| dirs.config_dir().join("discovery.toml"))
    }

    /// Returns the default database path.
    fn default_database_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "discovery", "endpoint-discovery")
            .map(|dirs| dirs.data_dir().join("endpoints.db"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Resolves the store database configuration.
    pub fn db_config(&self) -> SyncResult<DbConfig> {
        let path = self
            .store
            .database_path
            .clone()
            .or_else(Self::default_database_path)
            .ok_or_else(|| SyncError::InvalidConfig("No database path available".into()))?;

        Ok(DbConfig::new(path).max_connections(self.store.max_connections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.sender.retry_initial_ms, 1_000);
        assert_eq!(config.sender.retry_max_ms, 256_000);
        assert_eq!(config.sender.ack_timeout(), Duration::from_secs(2));
        assert!(config.sender.wait_for_event_processed);
        assert_eq!(config.registry.max_capabilities_per_endpoint, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DiscoveryConfig::default();

        config.sender.retry_multiplier = 0.5;
        assert!(config.validate().is_err());
        config.sender.retry_multiplier = 2.0;

        config.sender.retry_initial_ms = 300_000;
        assert!(config.validate().is_err());
        config.sender.retry_initial_ms = 1_000;

        config.sender.ack_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.sender.ack_timeout_ms = 2_000;

        config.registry.max_capabilities_per_endpoint = 101;
        assert!(config.validate().is_err());
        config.registry.max_capabilities_per_endpoint = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: DiscoveryConfig = toml::from_str(
            r#"
            [sender]
            ack_timeout_ms = 500

            [store]
            database_path = "/tmp/endpoints.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.sender.ack_timeout_ms, 500);
        assert_eq!(config.sender.retry_max_ms, 256_000);
        assert_eq!(config.registry.command_buffer, 64);
        assert_eq!(
            config.db_config().unwrap().database_path,
            PathBuf::from("/tmp/endpoints.db")
        );
    }

    #[test]
    fn test_toml_serialization() {
        let config = DiscoveryConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[sender]"));
        assert!(toml_str.contains("[registry]"));
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let name = format!("discovery-config-{}.toml", std::process::id());
        let path = std::env::temp_dir().join(name);

        let mut config = DiscoveryConfig::default();
        config.sender.retry_initial_ms = 250;
        config.save(Some(path.clone())).unwrap();

        let loaded = DiscoveryConfig::load(Some(path.clone())).unwrap();
        assert_eq!(loaded.sender.retry_initial_ms, 250);

        let _ = std::fs::remove_file(path);
    }
}
