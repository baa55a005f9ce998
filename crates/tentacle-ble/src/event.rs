//! Event stream records and the consumer-facing sink
//!
//! The scanner and the GATT session push [`BleEvent`]s into an
//! [`EventSink`] owned by the caller. Each component holds exactly one
//! optional sink in a [`SinkSlot`], replaced wholesale on attach/detach.
//! With no sink attached, events are dropped.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::advertisement::{base64_serde, AdvertisementRecord, Timestamp};
use crate::catalog::{CharacteristicKey, Service};
use crate::error::BleError;
use crate::gatt::ConnectionState;

/// Kind of characteristic value delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CharacteristicOperation {
    /// Completion of a read request
    Read,
    /// Unsolicited notification or indication
    Notify,
}

/// A characteristic value (or failed read) reported by the peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicEvent {
    pub operation: CharacteristicOperation,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// Value bytes; absent signals a failed read
    #[serde(rename = "valueBase64", serialize_with = "base64_serde::option")]
    pub value: Option<Vec<u8>>,
    /// Transport status, 0 on success
    pub status: i32,
    #[serde(flatten)]
    pub timestamp: Timestamp,
}

impl CharacteristicEvent {
    pub fn key(&self) -> CharacteristicKey {
        CharacteristicKey::new(self.service_uuid, self.characteristic_uuid)
    }
}

/// Structured record pushed to subscribers, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BleEvent {
    /// A decoded advertisement
    Advertisement(AdvertisementRecord),

    /// Scanning could not start or the hardware reported a failure
    #[serde(rename_all = "camelCase")]
    ScanError {
        code: String,
        message: String,
        status: Option<i32>,
    },

    /// Connection state transition
    #[serde(rename_all = "camelCase")]
    ConnectionStateChange {
        state: ConnectionState,
        status: i32,
        address: Option<String>,
    },

    /// Service discovery completed
    #[serde(rename_all = "camelCase")]
    ServicesDiscovered { status: i32, services: Vec<Service> },

    /// Characteristic read completion or notification
    CharacteristicEvent(CharacteristicEvent),

    /// Client configuration descriptor write completed
    #[serde(rename_all = "camelCase")]
    DescriptorWrite {
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        descriptor_uuid: Uuid,
        status: i32,
    },

    /// Session-level failure
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String },
}

impl BleEvent {
    /// Build the event record for an error
    ///
    /// Scan-related errors become `scanError`, everything else `error`.
    pub fn from_error(err: &BleError) -> Self {
        if err.is_scan_error() {
            BleEvent::ScanError {
                code: err.error_code().to_string(),
                message: err.to_string(),
                status: err.status(),
            }
        } else {
            BleEvent::Error {
                code: err.error_code().to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Wire tag of the event
    pub fn kind(&self) -> &'static str {
        match self {
            BleEvent::Advertisement(_) => "advertisement",
            BleEvent::ScanError { .. } => "scanError",
            BleEvent::ConnectionStateChange { .. } => "connectionStateChange",
            BleEvent::ServicesDiscovered { .. } => "servicesDiscovered",
            BleEvent::CharacteristicEvent(_) => "characteristicEvent",
            BleEvent::DescriptorWrite { .. } => "descriptorWrite",
            BleEvent::Error { .. } => "error",
        }
    }

    /// Serialize the event as JSON
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Consumer of engine events
///
/// Implementations must not block; they are called from the task that
/// processes radio callbacks.
pub trait EventSink: Send + Sync {
    fn send(&self, event: BleEvent);
}

/// Sink forwarding events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BleEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<BleEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: BleEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}

/// Callback invoked for every event
pub type EventCallback = Arc<dyn Fn(BleEvent) + Send + Sync>;

/// Sink calling a closure
#[derive(Clone)]
pub struct CallbackSink {
    callback: EventCallback,
}

impl CallbackSink {
    pub fn new(callback: impl Fn(BleEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl EventSink for CallbackSink {
    fn send(&self, event: BleEvent) {
        (self.callback)(event)
    }
}

/// The single optional subscriber of a component
#[derive(Clone, Default)]
pub struct SinkSlot {
    sink: Option<Arc<dyn EventSink>>,
}

impl SinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current subscriber
    pub fn attach(&mut self, sink: Arc<dyn EventSink>) {
        self.sink = Some(sink);
    }

    /// Drop the current subscriber, returning whether one was attached
    pub fn detach(&mut self) -> bool {
        self.sink.take().is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Deliver an event to the subscriber, if any
    pub fn emit(&self, event: BleEvent) {
        match &self.sink {
            Some(sink) => sink.send(event),
            None => trace!(kind = event.kind(), "No subscriber attached, dropping event"),
        }
    }
}

impl std::fmt::Debug for SinkSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::uuid_from_short;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_scan_error_from_error() {
        let event = BleEvent::from_error(&BleError::ScanFailed { code: 2 });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "scanError");
        assert_eq!(json["code"], "SCAN_FAILED");
        assert_eq!(json["status"], 2);
    }

    #[test]
    fn test_session_error_from_error() {
        let event = BleEvent::from_error(&BleError::DeviceNotFound("AA".into()));
        assert_eq!(event.kind(), "error");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["code"], "DEVICE_NOT_FOUND");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_connection_state_change_shape() {
        let event = BleEvent::ConnectionStateChange {
            state: ConnectionState::Connected,
            status: 0,
            address: Some("11:22:33:44:55:66".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "connectionStateChange");
        assert_eq!(json["state"], "connected");
        assert_eq!(json["address"], "11:22:33:44:55:66");
    }

    #[test]
    fn test_characteristic_event_shape() {
        let event = BleEvent::CharacteristicEvent(CharacteristicEvent {
            operation: CharacteristicOperation::Notify,
            service_uuid: uuid_from_short(0x180D),
            characteristic_uuid: uuid_from_short(0x2A37),
            value: Some(vec![0x02, 0x15]),
            status: 0,
            timestamp: Timestamp::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "characteristicEvent");
        assert_eq!(json["operation"], "notify");
        assert_eq!(json["serviceUuid"], "0000180d-0000-1000-8000-00805f9b34fb");
        assert_eq!(json["valueBase64"], "AhU=");
        assert!(json["timestampNanos"].is_u64());
    }

    #[test]
    fn test_descriptor_write_shape() {
        let event = BleEvent::DescriptorWrite {
            service_uuid: uuid_from_short(0x180D),
            characteristic_uuid: uuid_from_short(0x2A37),
            descriptor_uuid: uuid_from_short(0x2902),
            status: 0,
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "descriptorWrite");
        assert_eq!(json["descriptorUuid"], "00002902-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_sink_slot_attach_detach() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mut slot = SinkSlot::new();

        slot.emit(BleEvent::from_error(&BleError::ChannelClosed));
        slot.attach(Arc::new(CallbackSink::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        slot.emit(BleEvent::from_error(&BleError::ChannelClosed));
        assert!(slot.detach());
        assert!(!slot.detach());
        slot.emit(BleEvent::from_error(&BleError::ChannelClosed));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_sink() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.send(BleEvent::from_error(&BleError::ChannelClosed));
        assert_eq!(rx.try_recv().unwrap().kind(), "error");
        drop(rx);
        // Receiver gone, send is silently dropped
        sink.send(BleEvent::from_error(&BleError::ChannelClosed));
    }
}
