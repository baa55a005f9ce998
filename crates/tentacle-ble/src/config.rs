//! Configuration types for the BLE engine
//!
//! This module provides scan configuration, engine tuning knobs and the
//! GATT protocol constants shared by the scanner, session and codec.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BleError;

/// Bluetooth base UUID (`00000000-0000-1000-8000-00805f9b34fb`)
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCCD value disabling both notifications and indications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Default capacity of the engine command channel
pub const DEFAULT_COMMAND_BUFFER: usize = 256;

/// Default capacity of the timecode forwarding broadcast channel
pub const DEFAULT_FORWARD_BUFFER: usize = 64;

/// Expand a 16- or 32-bit assigned number against the Bluetooth base UUID
pub fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Radio duty cycle requested for a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
    /// Lowest power, longest latency
    LowPower,
    /// Balance between power and discovery latency
    #[default]
    Balanced,
    /// Highest duty cycle, intended for foreground use
    LowLatency,
}

impl ScanMode {
    /// Platform scan mode code (low-power = 0, balanced = 1, low-latency = 2)
    pub fn code(&self) -> i32 {
        match self {
            ScanMode::LowPower => 0,
            ScanMode::Balanced => 1,
            ScanMode::LowLatency => 2,
        }
    }

    /// Map a platform scan mode code back to a mode
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ScanMode::LowPower),
            1 => Some(ScanMode::Balanced),
            2 => Some(ScanMode::LowLatency),
            _ => None,
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::LowPower => write!(f, "low-power"),
            ScanMode::Balanced => write!(f, "balanced"),
            ScanMode::LowLatency => write!(f, "low-latency"),
        }
    }
}

impl FromStr for ScanMode {
    type Err = BleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low-power" | "low_power" | "lowpower" => Ok(ScanMode::LowPower),
            "balanced" => Ok(ScanMode::Balanced),
            "low-latency" | "low_latency" | "lowlatency" => Ok(ScanMode::LowLatency),
            other => Err(BleError::InvalidConfig(format!("unknown scan mode: {other}"))),
        }
    }
}

/// Parameters of a single scan session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// Requested scan mode
    #[serde(default)]
    pub mode: ScanMode,

    /// Exact device name filter
    #[serde(default)]
    pub name_filter: Option<String>,

    /// Service UUID filter (parsed when the scan starts)
    #[serde(default)]
    pub service_uuid_filter: Option<String>,
}

impl ScanConfig {
    /// Create a configuration with no filters
    pub fn new(mode: ScanMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Name filter, with empty strings treated as absent
    pub fn name(&self) -> Option<&str> {
        self.name_filter.as_deref().filter(|name| !name.is_empty())
    }

    /// Parse the service UUID filter, with empty strings treated as absent
    pub fn service_uuid(&self) -> Result<Option<Uuid>, BleError> {
        match self.service_uuid_filter.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Uuid::parse_str(raw)
                .map(Some)
                .map_err(|_| BleError::InvalidFilter(raw.to_string())),
        }
    }

    /// Check whether the configuration carries any filter
    pub fn has_filters(&self) -> bool {
        self.name().is_some()
            || self
                .service_uuid_filter
                .as_deref()
                .is_some_and(|raw| !raw.trim().is_empty())
    }
}

/// Builder for ScanConfig
#[derive(Debug, Default)]
pub struct ScanConfigBuilder {
    config: ScanConfig,
}

impl ScanConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan mode
    pub fn mode(mut self, mode: ScanMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Only report devices advertising exactly this name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name_filter = Some(name.into());
        self
    }

    /// Only report devices advertising this service UUID
    pub fn service_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.config.service_uuid_filter = Some(uuid.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> ScanConfig {
        self.config
    }
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Capacity of the command channel between handles and the engine task
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,

    /// Capacity of the timecode forwarding broadcast channel
    #[serde(default = "default_forward_buffer")]
    pub forward_buffer: usize,

    /// Start with timecode forwarding enabled
    #[serde(default)]
    pub forwarding_enabled: bool,
}

fn default_command_buffer() -> usize {
    DEFAULT_COMMAND_BUFFER
}

fn default_forward_buffer() -> usize {
    DEFAULT_FORWARD_BUFFER
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_buffer: DEFAULT_COMMAND_BUFFER,
            forward_buffer: DEFAULT_FORWARD_BUFFER,
            forwarding_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BleError> {
        if self.command_buffer == 0 {
            return Err(BleError::InvalidConfig(
                "command buffer must be > 0".to_string(),
            ));
        }
        if self.forward_buffer == 0 {
            return Err(BleError::InvalidConfig(
                "forward buffer must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
