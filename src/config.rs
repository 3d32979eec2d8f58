//! Bridge configuration.
//! Tuning knobs for the connection state machine and the coalescer, loaded
//! from a JSON file when present and falling back to defaults otherwise.
//! The controller-number mapping is deliberately not configurable; it lives
//! as constants in the codec.

use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::BridgeError;

/// Connection state-machine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// How long a connect attempt may take before it fails.
    pub connect_timeout_ms: u64,
    /// Per-phase cap on service/characteristic discovery and subscription.
    pub discovery_timeout_ms: u64,
    /// Connect attempts against one discovered peripheral before falling
    /// back to scanning.
    pub max_connect_attempts: u32,
    /// Base delay of the reconnect backoff.
    pub backoff_base_ms: u64,
    /// Ceiling of the reconnect backoff.
    pub backoff_cap_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            discovery_timeout_ms: 5_000,
            max_connect_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Advertised name the scan matches exactly. The device does not
    /// reliably advertise its service UUID, so name is the only filter.
    pub device_name: String,
    pub connection: ConnectionConfig,
    /// Coalescing window and drain period for continuous controllers.
    pub coalesce_window_ms: u64,
    /// Spacing between the LED-off commands issued after connect.
    pub led_init_spacing_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_name: "iRig BlueBoard".to_string(),
            connection: ConnectionConfig::default(),
            coalesce_window_ms: 20,
            led_init_spacing_ms: 50,
        }
    }
}

impl BridgeConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn led_init_spacing(&self) -> Duration {
        Duration::from_millis(self.led_init_spacing_ms)
    }

    /// Loads configuration from `path`, returning defaults when the file is
    /// absent. A present-but-invalid file is an error rather than silently
    /// ignored.
    pub async fn load_or_default(path: &Path) -> Result<Self, BridgeError> {
        match fs::read_to_string(path).await {
            Ok(contents) => {
                let config = serde_json::from_str(&contents)
                    .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                Err(BridgeError::Config(e.to_string()))
            }
        }
    }

    /// Writes the configuration as pretty-printed JSON.
    pub async fn save(&self, path: &Path) -> Result<(), BridgeError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| BridgeError::Config(e.to_string()))?;
        fs::write(path, contents)
            .await
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        info!("Saved configuration to {}", path.display());
        Ok(())
    }
}
