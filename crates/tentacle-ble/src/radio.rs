//! Native radio seam
//!
//! The engine never talks to hardware directly. It issues fire-and-forget
//! requests through [`ScanRadio`] / [`GattRadio`] and reacts to the
//! canonical [`ScanCallback`] / [`GattCallback`] messages the radio delivers
//! later through a [`CallbackSender`]. Every callback names the native
//! handle that produced it so that late callbacks from released handles can
//! be told apart from live ones.
//!
//! # Architecture
//!
//! ```text
//!  caller ──► EngineHandle ──► BleEngine ──► ScanRadio / GattRadio ──► hardware
//!                                  ▲                                      │
//!                                  └──────── CallbackSender ◄─────────────┘
//! ```

use std::fmt;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::advertisement::RawAdvertisement;
use crate::catalog::{CharacteristicKey, Service};
use crate::config::{ScanConfig, ScanMode};
use crate::error::Result;
use crate::gatt::ConnectionState;

/// Completion status reported on success
pub const GATT_SUCCESS: i32 = 0;

/// Generic stack failure reported by most platforms
pub const GATT_ERROR: i32 = 133;

/// Generic operation failure
pub const GATT_FAILURE: i32 = 257;

/// Scan failure codes reported by the adapter
pub const SCAN_FAILED_ALREADY_STARTED: i32 = 1;
pub const SCAN_FAILED_APPLICATION_REGISTRATION_FAILED: i32 = 2;
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;
pub const SCAN_FAILED_FEATURE_UNSUPPORTED: i32 = 4;

/// Native scan session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanHandle(pub u64);

impl fmt::Display for ScanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan#{}", self.0)
    }
}

/// Native GATT connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GattHandle(pub u64);

impl fmt::Display for GattHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gatt#{}", self.0)
    }
}

/// Which matches the adapter reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackType {
    #[default]
    AllMatches,
    FirstMatch,
    MatchLost,
}

/// How eagerly the adapter matches filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    Aggressive,
    Sticky,
}

/// How many advertisements per filter the adapter tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchCount {
    One,
    Few,
    #[default]
    Max,
}

/// Hardware scan settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub mode: ScanMode,
    /// Batch report delay, 0 for immediate delivery
    pub report_delay_ms: u64,
    pub callback_type: CallbackType,
    pub match_mode: MatchMode,
    pub match_count: MatchCount,
}

impl ScanSettings {
    /// Settings used for every scan: immediate reports of all matches
    pub fn for_mode(mode: ScanMode) -> Self {
        Self {
            mode,
            report_delay_ms: 0,
            callback_type: CallbackType::AllMatches,
            match_mode: MatchMode::Aggressive,
            match_count: MatchCount::Max,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::for_mode(ScanMode::default())
    }
}

/// One hardware scan filter; every criterion set on it must match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Exact device name
    pub name: Option<String>,
    /// Advertised service UUID
    pub service_uuid: Option<Uuid>,
}

impl ScanFilter {
    /// Build the filter set for a scan configuration
    ///
    /// Name and service UUID go into a single filter so that both must
    /// match. No criteria yields an empty set, which passes everything.
    pub fn from_config(config: &ScanConfig) -> Result<Vec<ScanFilter>> {
        let filter = ScanFilter {
            name: config.name().map(str::to_string),
            service_uuid: config.service_uuid()?,
        };
        if filter.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![filter])
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.service_uuid.is_none()
    }

    /// Check an advertisement against this filter
    pub fn matches(&self, advertisement: &RawAdvertisement) -> bool {
        if let Some(name) = &self.name {
            if advertisement.effective_name().as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(uuid) = &self.service_uuid {
            if !advertisement.effective_service_uuids().contains(uuid) {
                return false;
            }
        }
        true
    }

    /// Check an advertisement against a filter set (any filter may match)
    pub fn matches_any(filters: &[ScanFilter], advertisement: &RawAdvertisement) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(advertisement))
    }
}

/// LE scanner side of the radio
pub trait ScanRadio: Send {
    /// Start a hardware scan
    ///
    /// Fails with `AdapterUnavailable` when no scanner can be obtained.
    fn start_scan(&mut self, settings: &ScanSettings, filters: &[ScanFilter]) -> Result<ScanHandle>;

    /// Stop a hardware scan and release its handle
    fn stop_scan(&mut self, handle: ScanHandle);
}

/// GATT client side of the radio
///
/// Request methods return whether the request was initiated; completions
/// arrive later as [`GattCallback`]s.
pub trait GattRadio: Send {
    /// Resolve an address and issue a connect request
    ///
    /// Fails with `DeviceNotFound` when the address does not resolve.
    fn connect(&mut self, address: &str) -> Result<GattHandle>;

    /// Request disconnection; the handle stays allocated until closed
    fn disconnect(&mut self, handle: GattHandle);

    /// Release the native handle
    fn close(&mut self, handle: GattHandle);

    fn discover_services(&mut self, handle: GattHandle) -> bool;

    /// Toggle local delivery of notifications for a characteristic
    fn set_notification(&mut self, handle: GattHandle, key: &CharacteristicKey, enable: bool) -> bool;

    fn write_descriptor(
        &mut self,
        handle: GattHandle,
        key: &CharacteristicKey,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool;

    fn read_characteristic(&mut self, handle: GattHandle, key: &CharacteristicKey) -> bool;
}

/// Scan callbacks in canonical form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanCallback {
    /// A single advertisement report
    Result {
        handle: ScanHandle,
        advertisement: RawAdvertisement,
    },
    /// A batch of reports, in radio order
    Batch {
        handle: ScanHandle,
        advertisements: Vec<RawAdvertisement>,
    },
    /// The adapter aborted the scan
    Failed { handle: ScanHandle, code: i32 },
}

impl ScanCallback {
    pub fn handle(&self) -> ScanHandle {
        match self {
            ScanCallback::Result { handle, .. }
            | ScanCallback::Batch { handle, .. }
            | ScanCallback::Failed { handle, .. } => *handle,
        }
    }
}

/// GATT callbacks in canonical form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCallback {
    ConnectionStateChanged {
        handle: GattHandle,
        status: i32,
        state: ConnectionState,
    },
    ServicesDiscovered {
        handle: GattHandle,
        status: i32,
        services: Vec<Service>,
    },
    CharacteristicRead {
        handle: GattHandle,
        key: CharacteristicKey,
        value: Option<Vec<u8>>,
        status: i32,
    },
    /// Notification or indication
    CharacteristicChanged {
        handle: GattHandle,
        key: CharacteristicKey,
        value: Vec<u8>,
    },
    DescriptorWritten {
        handle: GattHandle,
        key: CharacteristicKey,
        descriptor: Uuid,
        status: i32,
    },
}

impl GattCallback {
    pub fn handle(&self) -> GattHandle {
        match self {
            GattCallback::ConnectionStateChanged { handle, .. }
            | GattCallback::ServicesDiscovered { handle, .. }
            | GattCallback::CharacteristicRead { handle, .. }
            | GattCallback::CharacteristicChanged { handle, .. }
            | GattCallback::DescriptorWritten { handle, .. } => *handle,
        }
    }
}

/// Any callback delivered by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    Scan(ScanCallback),
    Gatt(GattCallback),
}

/// Sending half used by radios to deliver callbacks
#[derive(Debug, Clone)]
pub struct CallbackSender {
    tx: mpsc::UnboundedSender<RadioEvent>,
}

/// Receiving half consumed by the engine
pub type CallbackReceiver = mpsc::UnboundedReceiver<RadioEvent>;

/// Create the inbound callback channel
pub fn callback_channel() -> (CallbackSender, CallbackReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CallbackSender { tx }, rx)
}

impl CallbackSender {
    /// Deliver a scan callback; returns false once the engine is gone
    pub fn scan(&self, callback: ScanCallback) -> bool {
        self.deliver(RadioEvent::Scan(callback))
    }

    /// Deliver a GATT callback; returns false once the engine is gone
    pub fn gatt(&self, callback: GattCallback) -> bool {
        self.deliver(RadioEvent::Gatt(callback))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn deliver(&self, event: RadioEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(_) => {
                trace!("Engine gone, dropping radio callback");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{uuid_from_short, ScanConfigBuilder};

    fn advertisement(name: Option<&str>, services: &[u16]) -> RawAdvertisement {
        let mut raw = RawAdvertisement::new("AA:BB:CC:DD:EE:FF", -60);
        raw.device_name = name.map(str::to_string);
        raw.service_uuids = services.iter().map(|s| uuid_from_short(*s as u32)).collect();
        raw
    }

    #[test]
    fn test_settings_for_mode() {
        let settings = ScanSettings::for_mode(ScanMode::LowLatency);
        assert_eq!(settings.report_delay_ms, 0);
        assert_eq!(settings.callback_type, CallbackType::AllMatches);
        assert_eq!(settings.match_mode, MatchMode::Aggressive);
        assert_eq!(settings.match_count, MatchCount::Max);
        assert_eq!(ScanSettings::default().mode, ScanMode::Balanced);
    }

    #[test]
    fn test_no_filters_pass_everything() {
        let filters = ScanFilter::from_config(&ScanConfig::default()).unwrap();
        assert!(filters.is_empty());
        assert!(ScanFilter::matches_any(&filters, &advertisement(None, &[])));
    }

    #[test]
    fn test_combined_filter_is_and() {
        let config = ScanConfigBuilder::new()
            .name("Tentacle")
            .service_uuid("0000180d-0000-1000-8000-00805f9b34fb")
            .build();
        let filters = ScanFilter::from_config(&config).unwrap();
        assert_eq!(filters.len(), 1);

        assert!(ScanFilter::matches_any(&filters, &advertisement(Some("Tentacle"), &[0x180D])));
        assert!(!ScanFilter::matches_any(&filters, &advertisement(Some("Tentacle"), &[0x180F])));
        assert!(!ScanFilter::matches_any(&filters, &advertisement(Some("Other"), &[0x180D])));
        assert!(!ScanFilter::matches_any(&filters, &advertisement(None, &[0x180D])));
    }

    #[test]
    fn test_filter_uses_payload_fallback() {
        let filter = ScanFilter {
            name: Some("Tentacle".to_string()),
            service_uuid: None,
        };
        let mut raw = RawAdvertisement::new("AA:BB:CC:DD:EE:FF", -60);
        raw.payload = Some(vec![0x09, 0x09, b'T', b'e', b'n', b't', b'a', b'c', b'l', b'e']);
        assert!(filter.matches(&raw));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = ScanConfigBuilder::new().service_uuid("zzz").build();
        let err = ScanFilter::from_config(&config).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_UUID");
    }

    #[test]
    fn test_callback_channel() {
        let (tx, mut rx) = callback_channel();
        assert!(tx.scan(ScanCallback::Failed {
            handle: ScanHandle(1),
            code: SCAN_FAILED_INTERNAL_ERROR,
        }));
        match rx.try_recv().unwrap() {
            RadioEvent::Scan(cb) => assert_eq!(cb.handle(), ScanHandle(1)),
            other => panic!("unexpected {other:?}"),
        }
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.gatt(GattCallback::ConnectionStateChanged {
            handle: GattHandle(1),
            status: GATT_SUCCESS,
            state: ConnectionState::Connected,
        }));
    }
}
