//! Test utilities: a scriptable radio, a recording sink and fixtures
//!
//! [`MockRadio`] implements both radio traits without hardware. It records
//! every request, tracks which native handles are open and applies scan
//! filters the way an adapter would, so tests can assert on handle leaks and
//! filter behavior. Callbacks are never produced on their own; tests inject
//! them through the engine's [`CallbackSender`](crate::radio::CallbackSender)
//! or straight into a scanner/session.
//!
//! # Example
//!
//! ```rust
//! use tentacle_ble::config::ScanConfig;
//! use tentacle_ble::scanner::Scanner;
//! use tentacle_ble::test_utils::MockRadio;
//!
//! let radio = MockRadio::new();
//! let mut scanner = Scanner::new(radio.clone());
//! scanner.start(&ScanConfig::default()).unwrap();
//! assert_eq!(radio.active_scans().len(), 1);
//! ```

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::advertisement::RawAdvertisement;
use crate::catalog::{Characteristic, CharacteristicKey, Service};
use crate::codec::CharacteristicProperties;
use crate::config::{uuid_from_short, CLIENT_CHARACTERISTIC_CONFIG};
use crate::error::{BleError, Result};
use crate::event::{BleEvent, CharacteristicEvent, EventSink};
use crate::radio::{
    GattHandle, GattRadio, ScanCallback, ScanFilter, ScanHandle, ScanRadio, ScanSettings,
};

/// A request recorded by [`MockRadio`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan {
        handle: ScanHandle,
        settings: ScanSettings,
        filters: Vec<ScanFilter>,
    },
    StopScan(ScanHandle),
    Connect(String),
    Disconnect(GattHandle),
    Close(GattHandle),
    DiscoverServices(GattHandle),
    SetNotification(GattHandle, CharacteristicKey, bool),
    WriteDescriptor(GattHandle, CharacteristicKey, Uuid, Vec<u8>),
    Read(GattHandle, CharacteristicKey),
}

#[derive(Debug)]
struct MockState {
    next_handle: u64,
    calls: Vec<RadioCall>,
    scans: BTreeMap<ScanHandle, Vec<ScanFilter>>,
    open: BTreeSet<GattHandle>,
    scanner_available: bool,
    unknown_addresses: HashSet<String>,
    refuse_notifications: bool,
    refuse_descriptor_writes: bool,
    refuse_requests: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            next_handle: 1,
            calls: Vec::new(),
            scans: BTreeMap::new(),
            open: BTreeSet::new(),
            scanner_available: true,
            unknown_addresses: HashSet::new(),
            refuse_notifications: false,
            refuse_descriptor_writes: false,
            refuse_requests: false,
        }
    }
}

impl MockState {
    fn allocate(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }
}

/// Scriptable in-memory radio; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockRadio {
    state: Arc<Mutex<MockState>>,
}

impl MockRadio {
    /// Create a new mock radio
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request issued so far
    pub fn calls(&self) -> Vec<RadioCall> {
        self.state.lock().calls.clone()
    }

    /// Forget recorded requests
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Scan handles started and not yet stopped
    pub fn active_scans(&self) -> Vec<ScanHandle> {
        self.state.lock().scans.keys().copied().collect()
    }

    /// GATT handles issued and not yet closed
    pub fn open_handles(&self) -> Vec<GattHandle> {
        self.state.lock().open.iter().copied().collect()
    }

    /// Most recently issued GATT handle still open
    pub fn last_gatt_handle(&self) -> Option<GattHandle> {
        self.state.lock().open.iter().next_back().copied()
    }

    /// Descriptor writes issued so far
    pub fn descriptor_writes(&self) -> Vec<(CharacteristicKey, Uuid, Vec<u8>)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                RadioCall::WriteDescriptor(_, key, uuid, value) => {
                    Some((*key, *uuid, value.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Simulate a missing LE scanner
    pub fn set_scanner_available(&self, available: bool) {
        self.state.lock().scanner_available = available;
    }

    /// Make an address fail to resolve
    pub fn set_unknown_address(&self, address: &str) {
        self.state
            .lock()
            .unknown_addresses
            .insert(address.to_ascii_uppercase());
    }

    /// Refuse to toggle local notification delivery
    pub fn set_refuse_notifications(&self, refuse: bool) {
        self.state.lock().refuse_notifications = refuse;
    }

    /// Refuse to start descriptor writes
    pub fn set_refuse_descriptor_writes(&self, refuse: bool) {
        self.state.lock().refuse_descriptor_writes = refuse;
    }

    /// Refuse discovery and read requests
    pub fn set_refuse_requests(&self, refuse: bool) {
        self.state.lock().refuse_requests = refuse;
    }

    /// Run an advertisement through the active scan's filters
    ///
    /// Returns the callback the adapter would deliver, or `None` when no scan
    /// is active or the filters exclude the advertisement.
    pub fn advertise(&self, advertisement: RawAdvertisement) -> Option<ScanCallback> {
        let state = self.state.lock();
        let (handle, filters) = state.scans.iter().next_back()?;
        if !ScanFilter::matches_any(filters, &advertisement) {
            return None;
        }
        Some(ScanCallback::Result {
            handle: *handle,
            advertisement,
        })
    }
}

impl ScanRadio for MockRadio {
    fn start_scan(&mut self, settings: &ScanSettings, filters: &[ScanFilter]) -> Result<ScanHandle> {
        let mut state = self.state.lock();
        if !state.scanner_available {
            return Err(BleError::AdapterUnavailable(
                "Bluetooth LE scanner not available".to_string(),
            ));
        }
        let handle = ScanHandle(state.allocate());
        state.scans.insert(handle, filters.to_vec());
        state.calls.push(RadioCall::StartScan {
            handle,
            settings: *settings,
            filters: filters.to_vec(),
        });
        Ok(handle)
    }

    fn stop_scan(&mut self, handle: ScanHandle) {
        let mut state = self.state.lock();
        state.scans.remove(&handle);
        state.calls.push(RadioCall::StopScan(handle));
    }
}

impl GattRadio for MockRadio {
    fn connect(&mut self, address: &str) -> Result<GattHandle> {
        let mut state = self.state.lock();
        state.calls.push(RadioCall::Connect(address.to_string()));
        if state
            .unknown_addresses
            .contains(&address.to_ascii_uppercase())
        {
            return Err(BleError::DeviceNotFound(address.to_string()));
        }
        let handle = GattHandle(state.allocate());
        state.open.insert(handle);
        Ok(handle)
    }

    fn disconnect(&mut self, handle: GattHandle) {
        self.state.lock().calls.push(RadioCall::Disconnect(handle));
    }

    fn close(&mut self, handle: GattHandle) {
        let mut state = self.state.lock();
        state.open.remove(&handle);
        state.calls.push(RadioCall::Close(handle));
    }

    fn discover_services(&mut self, handle: GattHandle) -> bool {
        let mut state = self.state.lock();
        state.calls.push(RadioCall::DiscoverServices(handle));
        !state.refuse_requests && state.open.contains(&handle)
    }

    fn set_notification(&mut self, handle: GattHandle, key: &CharacteristicKey, enable: bool) -> bool {
        let mut state = self.state.lock();
        state
            .calls
            .push(RadioCall::SetNotification(handle, *key, enable));
        !state.refuse_notifications && state.open.contains(&handle)
    }

    fn write_descriptor(
        &mut self,
        handle: GattHandle,
        key: &CharacteristicKey,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        let mut state = self.state.lock();
        if state.refuse_descriptor_writes || !state.open.contains(&handle) {
            return false;
        }
        state.calls.push(RadioCall::WriteDescriptor(
            handle,
            *key,
            descriptor,
            value.to_vec(),
        ));
        true
    }

    fn read_characteristic(&mut self, handle: GattHandle, key: &CharacteristicKey) -> bool {
        let mut state = self.state.lock();
        state.calls.push(RadioCall::Read(handle, *key));
        !state.refuse_requests && state.open.contains(&handle)
    }
}

/// Sink keeping every event it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<BleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BleEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Events of one wire type
    pub fn of_kind(&self, kind: &str) -> Vec<BleEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Codes of `scanError` and `error` events, in order
    pub fn error_codes(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                BleEvent::ScanError { code, .. } | BleEvent::Error { code, .. } => {
                    Some(code.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Addresses of delivered advertisements, in order
    pub fn advertisement_addresses(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                BleEvent::Advertisement(record) => Some(record.address.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn characteristic_events(&self) -> Vec<CharacteristicEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                BleEvent::CharacteristicEvent(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn send(&self, event: BleEvent) {
        self.events.lock().push(event);
    }
}

/// Heart rate service (0x180D): notifiable measurement with a CCCD and a
/// readable sensor location
pub fn heart_rate_service() -> Service {
    Service::new(uuid_from_short(0x180D), true)
        .with_characteristic(
            Characteristic::new(uuid_from_short(0x2A37), CharacteristicProperties::NOTIFY)
                .with_descriptor(CLIENT_CHARACTERISTIC_CONFIG),
        )
        .with_characteristic(Characteristic::new(
            uuid_from_short(0x2A38),
            CharacteristicProperties::READ,
        ))
}

/// Key of the heart rate measurement characteristic
pub fn heart_rate_key() -> CharacteristicKey {
    CharacteristicKey::new(uuid_from_short(0x180D), uuid_from_short(0x2A37))
}

/// Health thermometer service (0x1809) whose measurement both notifies and
/// indicates
pub fn indicate_service() -> Service {
    Service::new(uuid_from_short(0x1809), true).with_characteristic(
        Characteristic::new(
            uuid_from_short(0x2A1C),
            CharacteristicProperties::INDICATE | CharacteristicProperties::NOTIFY,
        )
        .with_descriptor(CLIENT_CHARACTERISTIC_CONFIG),
    )
}

/// Advertisement carrying a name and service UUIDs
pub fn named_advertisement(
    address: &str,
    rssi: i16,
    name: Option<&str>,
    services: &[Uuid],
) -> RawAdvertisement {
    let mut advertisement = RawAdvertisement::new(address, rssi);
    advertisement.device_name = name.map(str::to_string);
    advertisement.service_uuids = services.to_vec();
    advertisement
}

/// Sink helper for tests that want a shared recording sink
pub fn recording_sink() -> Arc<RecordingSink> {
    Arc::new(RecordingSink::new())
}
