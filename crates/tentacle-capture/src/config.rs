//! Capture configuration
//!
//! Loaded from a JSON file and overridden by command-line flags:
//!
//! ```json
//! {
//!   "scan": { "mode": "low-latency", "nameFilter": "Tentacle" },
//!   "timecodeCharacteristic": "00002a37-0000-1000-8000-00805f9b34fb",
//!   "connectTimeout": "10s",
//!   "forward": true
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tentacle_ble::{BleError, CharacteristicKey, Result, ScanConfig};
use uuid::Uuid;

/// Default time allowed for a connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for service discovery
pub const DEFAULT_DISCOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration of a capture run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Scan used to find the peripheral
    #[serde(default)]
    pub scan: ScanConfig,

    /// Only connect to this address
    #[serde(default)]
    pub target_address: Option<String>,

    /// Service carrying the timecode characteristic
    #[serde(default)]
    pub timecode_service: Option<String>,

    /// Timecode characteristic; every notifiable characteristic when unset
    #[serde(default)]
    pub timecode_characteristic: Option<String>,

    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_discover_timeout")]
    pub discover_timeout: Duration,

    /// Forward decoded timecode to local consumers
    #[serde(default)]
    pub forward: bool,
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_discover_timeout() -> Duration {
    DEFAULT_DISCOVER_TIMEOUT
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            target_address: None,
            timecode_service: None,
            timecode_characteristic: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discover_timeout: DEFAULT_DISCOVER_TIMEOUT,
            forward: false,
        }
    }
}

impl CaptureConfig {
    /// Parse a configuration from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| BleError::InvalidConfig(format!("capture config: {e}")))
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.scan.service_uuid()?;
        self.service_uuid()?;
        self.characteristic_uuid()?;
        if self.connect_timeout.is_zero() {
            return Err(BleError::InvalidConfig(
                "connect timeout must be > 0".to_string(),
            ));
        }
        if self.discover_timeout.is_zero() {
            return Err(BleError::InvalidConfig(
                "discover timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn service_uuid(&self) -> Result<Option<Uuid>> {
        parse_optional_uuid(self.timecode_service.as_deref())
    }

    pub fn characteristic_uuid(&self) -> Result<Option<Uuid>> {
        parse_optional_uuid(self.timecode_characteristic.as_deref())
    }

    /// Fully qualified timecode characteristic, when both UUIDs are set
    pub fn timecode_key(&self) -> Result<Option<CharacteristicKey>> {
        Ok(match (self.service_uuid()?, self.characteristic_uuid()?) {
            (Some(service), Some(characteristic)) => {
                Some(CharacteristicKey::new(service, characteristic))
            }
            _ => None,
        })
    }
}

fn parse_optional_uuid(raw: Option<&str>) -> Result<Option<Uuid>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => Uuid::parse_str(raw)
            .map(Some)
            .map_err(|_| BleError::InvalidUuid(raw.to_string())),
    }
}

// Helper module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
