//! Capture flow: scan → connect → discover → subscribe → decode
//!
//! [`CaptureFlow`] is a pure reactor. It consumes engine events and answers
//! with the [`CaptureAction`]s the driver should carry out, so the whole
//! sequence can be tested without a radio.

use std::collections::BTreeSet;
use std::fmt;
use tentacle_ble::{
    decode_timecode, BleEvent, CharacteristicEvent, CharacteristicKey, ConnectionState, Result,
    Service, TimecodeUpdate, GATT_SUCCESS,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CaptureConfig;

/// Step the driver should take next
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureAction {
    StopScan,
    Connect(String),
    DiscoverServices,
    Subscribe(CharacteristicKey),
    /// A decoded timecode
    Emit(TimecodeUpdate),
    /// The capture is over
    Finish,
}

/// Where the capture currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Scanning,
    Connecting,
    Discovering,
    Streaming,
    Finished,
}

impl fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapturePhase::Scanning => write!(f, "scanning"),
            CapturePhase::Connecting => write!(f, "connecting"),
            CapturePhase::Discovering => write!(f, "discovering"),
            CapturePhase::Streaming => write!(f, "streaming"),
            CapturePhase::Finished => write!(f, "finished"),
        }
    }
}

/// Event-driven capture state machine
#[derive(Debug, Clone)]
pub struct CaptureFlow {
    target_address: Option<String>,
    service: Option<Uuid>,
    characteristic: Option<Uuid>,
    phase: CapturePhase,
    device_address: Option<String>,
    device_name: Option<String>,
    subscribed: BTreeSet<CharacteristicKey>,
}

impl CaptureFlow {
    pub fn new(config: &CaptureConfig) -> Result<Self> {
        Ok(Self {
            target_address: config
                .target_address
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string),
            service: config.service_uuid()?,
            characteristic: config.characteristic_uuid()?,
            phase: CapturePhase::Scanning,
            device_address: None,
            device_name: None,
            subscribed: BTreeSet::new(),
        })
    }

    pub fn phase(&self) -> CapturePhase {
        self.phase
    }

    /// Address of the peripheral being captured
    pub fn device_address(&self) -> Option<&str> {
        self.device_address.as_deref()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Characteristics a subscription was requested for
    pub fn subscribed(&self) -> &BTreeSet<CharacteristicKey> {
        &self.subscribed
    }

    /// React to an engine event
    pub fn on_event(&mut self, event: &BleEvent) -> Vec<CaptureAction> {
        match (self.phase, event) {
            (_, _) if self.phase == CapturePhase::Finished => Vec::new(),

            (CapturePhase::Scanning, BleEvent::Advertisement(record)) => {
                if !self.is_target(&record.address) {
                    return Vec::new();
                }
                info!(address = %record.address, name = ?record.name, rssi = record.rssi, "Found device");
                self.device_address = Some(record.address.clone());
                self.device_name = record.name.clone();
                self.phase = CapturePhase::Connecting;
                vec![
                    CaptureAction::StopScan,
                    CaptureAction::Connect(record.address.clone()),
                ]
            }

            (CapturePhase::Scanning, BleEvent::ScanError { code, message, .. }) => {
                warn!(code = %code, "Scan failed: {}", message);
                self.finish()
            }

            (_, BleEvent::ConnectionStateChange { state, .. }) => self.on_connection_state(*state),

            (CapturePhase::Connecting, BleEvent::Error { code, message }) => {
                warn!(code = %code, "Connect failed: {}", message);
                self.finish()
            }

            (CapturePhase::Discovering, BleEvent::ServicesDiscovered { status, services }) => {
                self.on_services(*status, services)
            }

            (CapturePhase::Streaming, BleEvent::CharacteristicEvent(event)) => {
                self.on_characteristic(event).into_iter().collect()
            }

            _ => Vec::new(),
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) -> Vec<CaptureAction> {
        match (self.phase, state) {
            (CapturePhase::Connecting, ConnectionState::Connected) => {
                info!("Connected, discovering services");
                self.phase = CapturePhase::Discovering;
                vec![CaptureAction::DiscoverServices]
            }
            (
                CapturePhase::Connecting | CapturePhase::Discovering | CapturePhase::Streaming,
                ConnectionState::Disconnected,
            ) => {
                info!(phase = %self.phase, "Device disconnected");
                self.finish()
            }
            _ => Vec::new(),
        }
    }

    fn on_services(&mut self, status: i32, services: &[Service]) -> Vec<CaptureAction> {
        if status != GATT_SUCCESS {
            warn!(status, "Service discovery failed");
            return Vec::new();
        }

        let keys = self.timecode_characteristics(services);
        if keys.is_empty() {
            warn!(services = services.len(), "No timecode characteristic found");
            return self.finish();
        }

        info!(characteristics = keys.len(), "Subscribing to timecode");
        self.phase = CapturePhase::Streaming;
        self.subscribed = keys.iter().copied().collect();
        keys.into_iter().map(CaptureAction::Subscribe).collect()
    }

    fn on_characteristic(&self, event: &CharacteristicEvent) -> Option<CaptureAction> {
        if !self.subscribed.contains(&event.key()) {
            return None;
        }
        let value = event.value.as_deref()?;
        match decode_timecode(value) {
            Ok(timecode) => {
                debug!(%timecode, "Timecode");
                Some(CaptureAction::Emit(TimecodeUpdate::from_timecode(
                    &timecode,
                    self.device_address.clone().unwrap_or_default(),
                    self.device_name.clone(),
                )))
            }
            Err(e) => {
                debug!(key = %event.key(), "Skipping payload: {}", e);
                None
            }
        }
    }

    /// Notifiable characteristics matching the configured UUIDs
    fn timecode_characteristics(&self, services: &[Service]) -> Vec<CharacteristicKey> {
        let (service, characteristic) = (self.service, self.characteristic);
        services
            .iter()
            .filter(|s| service.map_or(true, |uuid| s.uuid == uuid))
            .flat_map(|s| {
                s.characteristics
                    .iter()
                    .filter(move |c| characteristic.map_or(true, |uuid| c.uuid == uuid))
                    .filter(|c| c.properties.is_notifiable() || c.properties.is_indicatable())
                    .map(move |c| CharacteristicKey::new(s.uuid, c.uuid))
            })
            .collect()
    }

    fn is_target(&self, address: &str) -> bool {
        self.target_address
            .as_deref()
            .map_or(true, |target| target.eq_ignore_ascii_case(address))
    }

    fn finish(&mut self) -> Vec<CaptureAction> {
        self.phase = CapturePhase::Finished;
        vec![CaptureAction::Finish]
    }
}
