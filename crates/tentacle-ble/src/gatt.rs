//! GATT client session
//!
//! [`GattSession`] drives a single peripheral connection through
//! connect → discover → subscribe/read → disconnect. Requests return as
//! soon as they are handed to the radio; every outcome arrives later as a
//! [`GattCallback`] and is applied by [`SessionState::on_callback`], a pure
//! transition that reports which events to emit and which native handle to
//! release.
//!
//! The session holds at most one native handle. `connect` closes the
//! previous one before asking for a new one, and any transition to
//! `Disconnected` releases it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::advertisement::Timestamp;
use crate::catalog::{CharacteristicKey, Service, ServiceCatalog};
use crate::codec::cccd_value;
use crate::config::CLIENT_CHARACTERISTIC_CONFIG;
use crate::error::{BleError, Result};
use crate::event::{BleEvent, CharacteristicEvent, CharacteristicOperation, EventSink, SinkSlot};
use crate::radio::{GattCallback, GattHandle, GattRadio, GATT_SUCCESS};

/// Connection state of a GATT session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No peripheral associated
    #[default]
    Disconnected,
    /// Connect request issued
    Connecting,
    /// Link established
    Connected,
    /// Disconnect request issued
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Outcome of applying a callback to the session state
#[derive(Debug, Default, PartialEq)]
pub struct Reaction {
    /// Events to deliver, in order
    pub events: Vec<BleEvent>,
    /// Native handle to close
    pub release: Option<GattHandle>,
}

/// Local state of a GATT session
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    state: ConnectionState,
    handle: Option<GattHandle>,
    address: Option<String>,
    catalog: ServiceCatalog,
    subscriptions: BTreeSet<CharacteristicKey>,
    /// Descriptor writes in flight per key, oldest first, with the
    /// subscription each one commits
    pending: HashMap<CharacteristicKey, VecDeque<bool>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> Option<GattHandle> {
        self.handle
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub fn subscriptions(&self) -> &BTreeSet<CharacteristicKey> {
        &self.subscriptions
    }

    /// Subscription changes awaiting descriptor write confirmation
    pub fn pending_subscriptions(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Pop the oldest descriptor write in flight for `key`
    fn take_pending(&mut self, key: &CharacteristicKey) -> Option<bool> {
        let queue = self.pending.get_mut(key)?;
        let enable = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(key);
        }
        enable
    }

    /// Associate a freshly issued connect request
    fn bind(&mut self, handle: GattHandle, address: &str) {
        *self = Self {
            state: ConnectionState::Connecting,
            handle: Some(handle),
            address: Some(address.to_string()),
            ..Self::default()
        };
    }

    /// Forget the peripheral, returning the handle that must be closed
    fn unbind(&mut self) -> Option<GattHandle> {
        let handle = self.handle.take();
        *self = Self::default();
        handle
    }

    fn commit_subscription(&mut self, key: CharacteristicKey, enable: bool) {
        if enable {
            self.subscriptions.insert(key);
        } else {
            self.subscriptions.remove(&key);
        }
    }

    /// Apply a radio callback
    pub fn on_callback(&mut self, callback: GattCallback) -> Reaction {
        if self.handle != Some(callback.handle()) {
            trace!(handle = %callback.handle(), "Dropping callback for released handle");
            return Reaction::default();
        }

        match callback {
            GattCallback::ConnectionStateChanged {
                handle,
                status,
                state,
            } => {
                debug!(%handle, from = %self.state, to = %state, status, "Connection state changed");
                let event = BleEvent::ConnectionStateChange {
                    state,
                    status,
                    address: self.address.clone(),
                };
                if state == ConnectionState::Disconnected {
                    self.unbind();
                    Reaction {
                        events: vec![event],
                        release: Some(handle),
                    }
                } else {
                    self.state = state;
                    Reaction {
                        events: vec![event],
                        release: None,
                    }
                }
            }

            GattCallback::ServicesDiscovered {
                status, services, ..
            } => {
                if status == GATT_SUCCESS {
                    debug!(services = services.len(), "Service catalog rebuilt");
                    self.catalog = ServiceCatalog::new(services);
                } else {
                    warn!(status, "Service discovery failed");
                }
                Reaction {
                    events: vec![BleEvent::ServicesDiscovered {
                        status,
                        services: self.catalog.services().to_vec(),
                    }],
                    release: None,
                }
            }

            GattCallback::CharacteristicRead {
                key, value, status, ..
            } => {
                if status != GATT_SUCCESS {
                    warn!(%key, status, "Characteristic read failed");
                }
                let value = if status == GATT_SUCCESS { value } else { None };
                Reaction {
                    events: vec![characteristic_event(
                        CharacteristicOperation::Read,
                        key,
                        value,
                        status,
                    )],
                    release: None,
                }
            }

            GattCallback::CharacteristicChanged { key, value, .. } => Reaction {
                events: vec![characteristic_event(
                    CharacteristicOperation::Notify,
                    key,
                    Some(value),
                    GATT_SUCCESS,
                )],
                release: None,
            },

            GattCallback::DescriptorWritten {
                key,
                descriptor,
                status,
                ..
            } => {
                if descriptor == CLIENT_CHARACTERISTIC_CONFIG {
                    if let Some(enable) = self.take_pending(&key) {
                        if status == GATT_SUCCESS {
                            debug!(%key, enable, "Subscription confirmed");
                            self.commit_subscription(key, enable);
                        } else {
                            warn!(%key, enable, status, "Subscription descriptor write failed");
                        }
                    }
                }
                Reaction {
                    events: vec![BleEvent::DescriptorWrite {
                        service_uuid: key.service,
                        characteristic_uuid: key.characteristic,
                        descriptor_uuid: descriptor,
                        status,
                    }],
                    release: None,
                }
            }
        }
    }
}

fn characteristic_event(
    operation: CharacteristicOperation,
    key: CharacteristicKey,
    value: Option<Vec<u8>>,
    status: i32,
) -> BleEvent {
    BleEvent::CharacteristicEvent(CharacteristicEvent {
        operation,
        service_uuid: key.service,
        characteristic_uuid: key.characteristic,
        value,
        status,
        timestamp: Timestamp::now(),
    })
}

/// A single-peripheral GATT session over a [`GattRadio`]
pub struct GattSession<R: GattRadio> {
    radio: R,
    state: SessionState,
    sink: SinkSlot,
}

impl<R: GattRadio> GattSession<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio,
            state: SessionState::new(),
            sink: SinkSlot::new(),
        }
    }

    /// Attach the subscriber, replacing any previous one
    pub fn attach_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sink.attach(sink);
    }

    /// Detach the subscriber; the connection is left untouched
    pub fn detach_sink(&mut self) {
        if self.sink.detach() {
            debug!("GATT subscriber detached");
        }
    }

    /// Connect to a peripheral
    ///
    /// Any existing handle is closed first. The outcome arrives later as a
    /// `connectionStateChange` event. Resolution failures are emitted as an
    /// `error` event and also returned.
    pub fn connect(&mut self, address: &str) -> Result<()> {
        self.release();

        match self.radio.connect(address) {
            Ok(handle) => {
                info!(%handle, address, "Connecting");
                self.state.bind(handle, address);
                Ok(())
            }
            Err(e) => {
                warn!(address, "Connect failed: {}", e);
                self.sink.emit(BleEvent::from_error(&e));
                Err(e)
            }
        }
    }

    /// Request disconnection; no-op unless connected or connecting
    pub fn disconnect(&mut self) {
        let Some(handle) = self.state.handle else {
            return;
        };
        match self.state.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                info!(%handle, "Disconnecting");
                self.state.state = ConnectionState::Disconnecting;
                self.radio.disconnect(handle);
            }
            _ => trace!(state = %self.state.state, "Disconnect ignored"),
        }
    }

    /// Start service discovery; returns whether the request was issued
    pub fn discover_services(&mut self) -> bool {
        match self.connected_handle() {
            Ok(handle) => {
                let accepted = self.radio.discover_services(handle);
                if accepted {
                    debug!(%handle, "Service discovery requested");
                } else {
                    warn!(%handle, "Service discovery refused by radio");
                }
                accepted
            }
            Err(_) => {
                debug!(state = %self.state.state, "Service discovery ignored, not connected");
                false
            }
        }
    }

    /// Current catalog, empty until discovery succeeds
    pub fn catalog(&self) -> Vec<Service> {
        self.state.catalog.services().to_vec()
    }

    /// Serialized catalog
    pub fn services_json(&self) -> String {
        self.state.catalog.to_json()
    }

    /// Enable notifications; `true` means the request was accepted
    pub fn subscribe(&mut self, key: &CharacteristicKey) -> bool {
        accepted(key, self.try_set_subscription(key, true))
    }

    /// Disable notifications; `true` means the request was accepted
    pub fn unsubscribe(&mut self, key: &CharacteristicKey) -> bool {
        accepted(key, self.try_set_subscription(key, false))
    }

    /// Enable notifications, reporting why a request was rejected
    pub fn try_subscribe(&mut self, key: &CharacteristicKey) -> Result<()> {
        self.try_set_subscription(key, true)
    }

    /// Disable notifications, reporting why a request was rejected
    pub fn try_unsubscribe(&mut self, key: &CharacteristicKey) -> Result<()> {
        self.try_set_subscription(key, false)
    }

    /// Issue a read; silently ignored when it cannot be issued
    pub fn read_characteristic(&mut self, key: &CharacteristicKey) {
        if let Err(e) = self.try_read_characteristic(key) {
            debug!(%key, "Read ignored: {}", e);
        }
    }

    /// Issue a read, reporting why it could not be issued
    pub fn try_read_characteristic(&mut self, key: &CharacteristicKey) -> Result<()> {
        let handle = self.connected_handle()?;
        if self.state.catalog.find(key).is_none() {
            return Err(not_in_catalog(key));
        }
        if !self.radio.read_characteristic(handle, key) {
            return Err(BleError::OperationRejected(format!(
                "read of {key} refused by radio"
            )));
        }
        trace!(%key, "Read requested");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state.state == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.state
    }

    /// Address of the associated peripheral
    pub fn address(&self) -> Option<&str> {
        self.state.address()
    }

    /// Native handle currently held
    pub fn handle(&self) -> Option<GattHandle> {
        self.state.handle
    }

    /// Confirmed subscriptions
    pub fn subscriptions(&self) -> Vec<CharacteristicKey> {
        self.state.subscriptions.iter().copied().collect()
    }

    pub fn is_subscribed(&self, key: &CharacteristicKey) -> bool {
        self.state.subscriptions.contains(key)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// React to a radio callback
    pub fn handle_callback(&mut self, callback: GattCallback) {
        let reaction = self.state.on_callback(callback);
        for event in reaction.events {
            self.sink.emit(event);
        }
        if let Some(handle) = reaction.release {
            debug!(%handle, "Releasing native handle");
            self.radio.close(handle);
        }
    }

    /// Drop the peripheral without waiting for a callback, closing its handle
    pub fn release(&mut self) {
        if let Some(handle) = self.state.unbind() {
            debug!(%handle, "Closing native handle");
            self.radio.close(handle);
        }
    }

    /// Disconnect and release everything
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.state.handle {
            if self.state.state != ConnectionState::Disconnected {
                self.radio.disconnect(handle);
            }
        }
        self.release();
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    fn connected_handle(&self) -> Result<GattHandle> {
        match (self.state.state, self.state.handle) {
            (ConnectionState::Connected, Some(handle)) => Ok(handle),
            (state, _) => Err(BleError::OperationRejected(format!(
                "no connected peripheral (state: {state})"
            ))),
        }
    }

    fn try_set_subscription(&mut self, key: &CharacteristicKey, enable: bool) -> Result<()> {
        let handle = self.connected_handle()?;
        let (properties, has_cccd) = match self.state.catalog.find(key) {
            Some(characteristic) => (characteristic.properties, characteristic.has_cccd()),
            None => return Err(not_in_catalog(key)),
        };

        if !self.radio.set_notification(handle, key, enable) {
            return Err(BleError::OperationRejected(format!(
                "notification toggle for {key} refused by radio"
            )));
        }

        if !has_cccd {
            debug!(%key, enable, "No client configuration descriptor, local delivery only");
            self.state.commit_subscription(*key, enable);
            return Ok(());
        }

        let value = cccd_value(properties, enable);
        if !self
            .radio
            .write_descriptor(handle, key, CLIENT_CHARACTERISTIC_CONFIG, &value)
        {
            return Err(BleError::OperationRejected(format!(
                "descriptor write for {key} refused by radio"
            )));
        }

        info!(%key, enable, value = ?value, "Subscription requested");
        self.state
            .pending
            .entry(*key)
            .or_default()
            .push_back(enable);
        Ok(())
    }
}

impl<R: GattRadio> Drop for GattSession<R> {
    fn drop(&mut self) {
        self.release();
    }
}

fn not_in_catalog(key: &CharacteristicKey) -> BleError {
    BleError::OperationRejected(format!("characteristic {key} not in catalog"))
}

fn accepted(key: &CharacteristicKey, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(%key, "Subscription change rejected: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{uuid_from_short, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE};
    use crate::test_utils::{
        heart_rate_key, heart_rate_service, indicate_service, MockRadio, RadioCall, RecordingSink,
    };

    const ADDR_A: &str = "11:22:33:44:55:66";
    const ADDR_B: &str = "66:55:44:33:22:11";

    fn session() -> (GattSession<MockRadio>, MockRadio, Arc<RecordingSink>) {
        let radio = MockRadio::new();
        let sink = Arc::new(RecordingSink::new());
        let mut session = GattSession::new(radio.clone());
        session.attach_sink(sink.clone());
        (session, radio, sink)
    }

    fn connected(services: Vec<Service>) -> (GattSession<MockRadio>, MockRadio, Arc<RecordingSink>) {
        let (mut session, radio, sink) = session();
        session.connect(ADDR_A).unwrap();
        let handle = session.handle().unwrap();
        session.handle_callback(GattCallback::ConnectionStateChanged {
            handle,
            status: GATT_SUCCESS,
            state: ConnectionState::Connected,
        });
        session.handle_callback(GattCallback::ServicesDiscovered {
            handle,
            status: GATT_SUCCESS,
            services,
        });
        sink.clear();
        radio.clear_calls();
        (session, radio, sink)
    }

    #[test]
    fn test_connection_state_strings() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnecting.to_string(), "disconnecting");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connecting).unwrap(),
            "\"connecting\""
        );
    }

    #[test]
    fn test_connect_is_asynchronous() {
        let (mut session, _radio, sink) = session();
        session.connect(ADDR_A).unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
        assert_eq!(session.address(), Some(ADDR_A));
        assert!(!session.is_connected());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_reconnect_closes_previous_handle_first() {
        let (mut session, radio, _sink) = session();
        session.connect(ADDR_A).unwrap();
        let first = session.handle().unwrap();
        session.connect(ADDR_B).unwrap();

        let calls = radio.calls();
        let close = calls
            .iter()
            .position(|c| *c == RadioCall::Close(first))
            .unwrap();
        let connect = calls
            .iter()
            .position(|c| *c == RadioCall::Connect(ADDR_B.to_string()))
            .unwrap();
        assert!(close < connect);
        assert_eq!(radio.open_handles().len(), 1);
        assert_eq!(session.address(), Some(ADDR_B));
    }

    #[test]
    fn test_device_not_found() {
        let (mut session, radio, sink) = session();
        radio.set_unknown_address(ADDR_A);
        assert!(session.connect(ADDR_A).is_err());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(session.handle().is_none());
        assert_eq!(sink.error_codes(), vec!["DEVICE_NOT_FOUND".to_string()]);
    }

    #[test]
    fn test_link_loss_releases_once() {
        let (mut session, radio, sink) = connected(vec![heart_rate_service()]);
        let handle = session.handle().unwrap();

        let lost = GattCallback::ConnectionStateChanged {
            handle,
            status: 8,
            state: ConnectionState::Disconnected,
        };
        session.handle_callback(lost.clone());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(session.address().is_none());
        assert!(session.catalog().is_empty());
        assert!(radio.open_handles().is_empty());

        session.handle_callback(lost);
        let closes = radio
            .calls()
            .iter()
            .filter(|c| matches!(c, RadioCall::Close(_)))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_disconnect_noop_when_idle() {
        let (mut session, radio, sink) = session();
        session.disconnect();
        assert!(radio.calls().is_empty());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_voluntary_disconnect() {
        let (mut session, radio, sink) = connected(vec![]);
        let handle = session.handle().unwrap();
        session.disconnect();
        assert_eq!(session.connection_state(), ConnectionState::Disconnecting);
        assert_eq!(radio.calls(), vec![RadioCall::Disconnect(handle)]);

        session.handle_callback(GattCallback::ConnectionStateChanged {
            handle,
            status: GATT_SUCCESS,
            state: ConnectionState::Disconnected,
        });
        assert!(radio.calls().contains(&RadioCall::Close(handle)));
        match &sink.events()[0] {
            BleEvent::ConnectionStateChange { state, address, .. } => {
                assert_eq!(*state, ConnectionState::Disconnected);
                assert_eq!(address.as_deref(), Some(ADDR_A));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_discover_requires_connection() {
        let (mut session, radio, _sink) = session();
        assert!(!session.discover_services());
        session.connect(ADDR_A).unwrap();
        assert!(!session.discover_services());
        assert!(!radio
            .calls()
            .iter()
            .any(|c| matches!(c, RadioCall::DiscoverServices(_))));
    }

    #[test]
    fn test_failed_discovery_keeps_catalog() {
        let (mut session, _radio, sink) = connected(vec![heart_rate_service()]);
        let handle = session.handle().unwrap();
        session.handle_callback(GattCallback::ServicesDiscovered {
            handle,
            status: 129,
            services: vec![],
        });
        assert_eq!(session.catalog().len(), 1);
        match &sink.events()[0] {
            BleEvent::ServicesDiscovered { status, services } => {
                assert_eq!(*status, 129);
                assert_eq!(services.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_subscribe_notify_value() {
        let (mut session, radio, _sink) = connected(vec![heart_rate_service()]);
        let key = heart_rate_key();
        assert!(session.subscribe(&key));
        assert_eq!(
            radio.descriptor_writes(),
            vec![(key, CLIENT_CHARACTERISTIC_CONFIG, ENABLE_NOTIFICATION_VALUE.to_vec())]
        );
        // Accepted but not confirmed yet
        assert!(!session.is_subscribed(&key));
    }

    #[test]
    fn test_subscribe_indicate_value() {
        let (mut session, radio, _sink) = connected(vec![indicate_service()]);
        let service = indicate_service();
        let characteristic = &service.characteristics[0];
        let key = CharacteristicKey::new(service.uuid, characteristic.uuid);
        assert!(session.subscribe(&key));
        assert_eq!(radio.descriptor_writes()[0].2, ENABLE_INDICATION_VALUE.to_vec());
    }

    #[test]
    fn test_descriptor_write_commits_subscription() {
        let (mut session, _radio, sink) = connected(vec![heart_rate_service()]);
        let key = heart_rate_key();
        let handle = session.handle().unwrap();
        session.subscribe(&key);

        session.handle_callback(GattCallback::DescriptorWritten {
            handle,
            key,
            descriptor: CLIENT_CHARACTERISTIC_CONFIG,
            status: GATT_SUCCESS,
        });
        assert!(session.is_subscribed(&key));
        assert_eq!(sink.events()[0].kind(), "descriptorWrite");

        session.unsubscribe(&key);
        session.handle_callback(GattCallback::DescriptorWritten {
            handle,
            key,
            descriptor: CLIENT_CHARACTERISTIC_CONFIG,
            status: 133,
        });
        // Failed disable leaves the subscription in place
        assert!(session.is_subscribed(&key));
    }

    #[test]
    fn test_overlapping_subscription_changes_commit_in_order() {
        let (mut session, _radio, _sink) = connected(vec![heart_rate_service()]);
        let key = heart_rate_key();
        let handle = session.handle().unwrap();
        let written = |status| GattCallback::DescriptorWritten {
            handle,
            key,
            descriptor: CLIENT_CHARACTERISTIC_CONFIG,
            status,
        };

        assert!(session.subscribe(&key));
        assert!(session.unsubscribe(&key));
        assert_eq!(session.state().pending_subscriptions(), 2);

        // Enable lands, disable is refused: the peripheral keeps notifying
        session.handle_callback(written(GATT_SUCCESS));
        assert!(session.is_subscribed(&key));
        session.handle_callback(written(133));
        assert!(session.is_subscribed(&key));
        assert_eq!(session.state().pending_subscriptions(), 0);

        // And the reverse order of outcomes
        assert!(session.unsubscribe(&key));
        assert!(session.subscribe(&key));
        session.handle_callback(written(GATT_SUCCESS));
        assert!(!session.is_subscribed(&key));
        session.handle_callback(written(GATT_SUCCESS));
        assert!(session.is_subscribed(&key));
    }

    #[test]
    fn test_subscribe_unknown_characteristic() {
        let (mut session, radio, _sink) = connected(vec![heart_rate_service()]);
        let key = CharacteristicKey::new(uuid_from_short(0x180D), uuid_from_short(0x2A99));
        assert!(!session.subscribe(&key));
        assert!(radio.descriptor_writes().is_empty());
        let err = session.try_subscribe(&key).unwrap_err();
        assert_eq!(err.error_code(), "OPERATION_REJECTED");
    }

    #[test]
    fn test_subscribe_without_cccd() {
        let service = Service::new(uuid_from_short(0x1234), true).with_characteristic(
            crate::catalog::Characteristic::new(uuid_from_short(0x5678), 0x10u8),
        );
        let key = CharacteristicKey::new(uuid_from_short(0x1234), uuid_from_short(0x5678));
        let (mut session, radio, _sink) = connected(vec![service]);

        assert!(session.subscribe(&key));
        assert!(radio.descriptor_writes().is_empty());
        assert!(session.is_subscribed(&key));
        assert!(session.unsubscribe(&key));
        assert!(!session.is_subscribed(&key));
    }

    #[test]
    fn test_subscribe_rejected_by_radio() {
        let (mut session, radio, _sink) = connected(vec![heart_rate_service()]);
        radio.set_refuse_descriptor_writes(true);
        assert!(!session.subscribe(&heart_rate_key()));
        assert_eq!(session.state().pending_subscriptions(), 0);
    }

    #[test]
    fn test_read_silently_ignored_when_disconnected() {
        let (mut session, radio, sink) = session();
        session.read_characteristic(&heart_rate_key());
        assert!(radio.calls().is_empty());
        assert!(sink.events().is_empty());
        assert!(session.try_read_characteristic(&heart_rate_key()).is_err());
    }

    #[test]
    fn test_read_and_notify_events() {
        let (mut session, radio, sink) = connected(vec![heart_rate_service()]);
        let key = heart_rate_key();
        let handle = session.handle().unwrap();

        session.read_characteristic(&key);
        assert_eq!(radio.calls(), vec![RadioCall::Read(handle, key)]);

        session.handle_callback(GattCallback::CharacteristicRead {
            handle,
            key,
            value: Some(vec![1]),
            status: 5,
        });
        session.handle_callback(GattCallback::CharacteristicChanged {
            handle,
            key,
            value: vec![0x00, 0x48],
        });

        let events = sink.characteristic_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, CharacteristicOperation::Read);
        assert_eq!(events[0].status, 5);
        assert!(events[0].value.is_none());
        assert_eq!(events[1].operation, CharacteristicOperation::Notify);
        assert_eq!(events[1].value, Some(vec![0x00, 0x48]));
    }

    #[test]
    fn test_stale_callback_for_previous_peripheral() {
        let (mut session, radio, sink) = session();
        session.connect(ADDR_A).unwrap();
        let old = session.handle().unwrap();
        session.connect(ADDR_B).unwrap();

        let mut state = session.state().clone();
        let reaction = state.on_callback(GattCallback::ConnectionStateChanged {
            handle: old,
            status: GATT_SUCCESS,
            state: ConnectionState::Connected,
        });
        assert_eq!(reaction, Reaction::default());

        session.handle_callback(GattCallback::ConnectionStateChanged {
            handle: old,
            status: GATT_SUCCESS,
            state: ConnectionState::Disconnected,
        });
        assert_eq!(session.address(), Some(ADDR_B));
        assert_eq!(radio.open_handles().len(), 1);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_shutdown_releases_handle() {
        let (mut session, radio, _sink) = connected(vec![]);
        let handle = session.handle().unwrap();
        session.shutdown();
        assert_eq!(
            radio.calls(),
            vec![RadioCall::Disconnect(handle), RadioCall::Close(handle)]
        );
        assert!(session.handle().is_none());
    }
}
