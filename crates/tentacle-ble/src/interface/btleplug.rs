//! btleplug backend
//!
//! Adapts btleplug's async central API to the fire-and-forget radio seam.
//! Requests are spawned onto the runtime the radio was created on; their
//! outcomes, together with adapter events, are delivered as canonical
//! callbacks through the [`CallbackSender`].
//!
//! Adapter scan commands run one after another in issue order. A connect
//! waits until every disconnect issued before it has finished.
//!
//! btleplug writes the Client Characteristic Configuration Descriptor
//! itself, so a CCCD write is carried out as `subscribe` / `unsubscribe`.
//! Several platform stacks hide the CCCD from discovery; it is added back
//! for every characteristic that can notify or indicate.

use ::btleplug::api::{
    Central, CentralEvent, Characteristic as BtCharacteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter as BtScanFilter, Service as BtService, ValueNotification,
};
use ::btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::advertisement::RawAdvertisement;
use crate::catalog::{Characteristic, CharacteristicKey, Service};
use crate::codec::CharacteristicProperties;
use crate::config::{CLIENT_CHARACTERISTIC_CONFIG, DISABLE_NOTIFICATION_VALUE};
use crate::error::{BleError, Result};
use crate::gatt::ConnectionState;
use crate::radio::{
    CallbackSender, GattCallback, GattHandle, GattRadio, ScanCallback, ScanFilter, ScanHandle,
    ScanRadio, ScanSettings, GATT_ERROR, GATT_SUCCESS, SCAN_FAILED_INTERNAL_ERROR,
};

struct ActiveScan {
    handle: ScanHandle,
    filters: Vec<ScanFilter>,
}

struct Connection {
    peripheral: Peripheral,
    id: PeripheralId,
    notifying: HashSet<CharacteristicKey>,
    notify_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    scan: Option<ActiveScan>,
    /// Peripherals seen by the adapter, by upper-case address
    known: HashMap<String, Peripheral>,
    connections: HashMap<GattHandle, Connection>,
    /// Last adapter scan command
    scan_control: Option<JoinHandle<()>>,
    /// Disconnects in flight
    teardown: Vec<JoinHandle<()>>,
}

impl State {
    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn peripheral(&self, handle: GattHandle) -> Option<Peripheral> {
        self.connections.get(&handle).map(|c| c.peripheral.clone())
    }
}

/// Radio backed by the first btleplug adapter
#[derive(Clone)]
pub struct BtleplugRadio {
    adapter: Adapter,
    runtime: Handle,
    callbacks: CallbackSender,
    state: Arc<Mutex<State>>,
}

impl BtleplugRadio {
    /// Open the first adapter and start listening to its events
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(callbacks: CallbackSender) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::AdapterUnavailable("no Bluetooth adapter found".into()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let radio = Self {
            adapter,
            runtime: Handle::current(),
            callbacks,
            state: Arc::new(Mutex::new(State::default())),
        };
        radio.spawn_event_listener();
        Ok(radio)
    }

    fn spawn_event_listener(&self) {
        let adapter = self.adapter.clone();
        let state = self.state.clone();
        let callbacks = self.callbacks.clone();

        self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to subscribe to adapter events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                if callbacks.is_closed() {
                    break;
                }
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        report_advertisement(&adapter, &state, &callbacks, &id).await;
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let linked: Vec<(GattHandle, Peripheral)> = state
                            .lock()
                            .connections
                            .iter()
                            .filter(|(_, c)| c.id == id)
                            .map(|(handle, c)| (*handle, c.peripheral.clone()))
                            .collect();
                        for (handle, peripheral) in linked {
                            // Late event from a link released before this handle connected
                            if peripheral.is_connected().await.unwrap_or(false) {
                                trace!(%handle, "Stale disconnect event ignored");
                                continue;
                            }
                            callbacks.gatt(GattCallback::ConnectionStateChanged {
                                handle,
                                status: GATT_SUCCESS,
                                state: ConnectionState::Disconnected,
                            });
                        }
                    }
                    _ => {}
                }
            }
            debug!("Adapter event listener stopped");
        });
    }

    fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task)
    }

    /// Run an adapter scan command after the previous one
    fn queue_scan_control<F>(&self, command: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();
        let previous = state.scan_control.take().into_iter().collect();
        state.scan_control = Some(spawn_after(&self.runtime, previous, command));
    }

    /// Run a disconnect that later connects must wait for
    fn queue_teardown<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = self.spawn(task);
        let mut state = self.state.lock();
        state.teardown.retain(|t| !t.is_finished());
        state.teardown.push(task);
    }
}

/// Spawn `task` once every task in `before` has finished
fn spawn_after<F>(runtime: &Handle, before: Vec<JoinHandle<()>>, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    runtime.spawn(async move {
        for previous in before {
            if let Err(e) = previous.await {
                if e.is_panic() {
                    warn!("Preceding radio task panicked");
                }
            }
        }
        task.await;
    })
}

impl ScanRadio for BtleplugRadio {
    fn start_scan(&mut self, settings: &ScanSettings, filters: &[ScanFilter]) -> Result<ScanHandle> {
        let handle = {
            let mut state = self.state.lock();
            let handle = ScanHandle(state.allocate());
            state.scan = Some(ActiveScan {
                handle,
                filters: filters.to_vec(),
            });
            handle
        };
        // btleplug exposes no duty-cycle control
        debug!(%handle, mode = %settings.mode, "Starting adapter scan");

        let services: Vec<Uuid> = filters.iter().filter_map(|f| f.service_uuid).collect();
        let adapter = self.adapter.clone();
        let callbacks = self.callbacks.clone();
        let state = self.state.clone();
        self.queue_scan_control(async move {
            if let Err(e) = adapter.start_scan(BtScanFilter { services }).await {
                warn!(%handle, "Adapter scan failed: {}", e);
                let still_active = state.lock().scan.as_ref().map(|s| s.handle) == Some(handle);
                if still_active {
                    callbacks.scan(ScanCallback::Failed {
                        handle,
                        code: SCAN_FAILED_INTERNAL_ERROR,
                    });
                }
            }
        });
        Ok(handle)
    }

    fn stop_scan(&mut self, handle: ScanHandle) {
        {
            let mut state = self.state.lock();
            if state.scan.as_ref().map(|s| s.handle) != Some(handle) {
                return;
            }
            state.scan = None;
        }
        let adapter = self.adapter.clone();
        self.queue_scan_control(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!(%handle, "Adapter stop_scan failed: {}", e);
            }
        });
    }
}

impl GattRadio for BtleplugRadio {
    fn connect(&mut self, address: &str) -> Result<GattHandle> {
        let (handle, peripheral, teardown) = {
            let mut state = self.state.lock();
            let peripheral = state
                .known
                .get(&address.to_ascii_uppercase())
                .cloned()
                .ok_or_else(|| BleError::DeviceNotFound(address.to_string()))?;
            let handle = GattHandle(state.allocate());
            state.connections.insert(
                handle,
                Connection {
                    id: peripheral.id(),
                    peripheral: peripheral.clone(),
                    notifying: HashSet::new(),
                    notify_task: None,
                },
            );
            (handle, peripheral, std::mem::take(&mut state.teardown))
        };

        let callbacks = self.callbacks.clone();
        let state = self.state.clone();
        let runtime = self.runtime.clone();
        spawn_after(&self.runtime, teardown, async move {
            if let Err(e) = peripheral.connect().await {
                warn!(%handle, "Connect failed: {}", e);
                callbacks.gatt(GattCallback::ConnectionStateChanged {
                    handle,
                    status: GATT_ERROR,
                    state: ConnectionState::Disconnected,
                });
                return;
            }

            callbacks.gatt(GattCallback::ConnectionStateChanged {
                handle,
                status: GATT_SUCCESS,
                state: ConnectionState::Connected,
            });

            match peripheral.notifications().await {
                Ok(stream) => {
                    let task = runtime.spawn(forward_notifications(
                        stream,
                        handle,
                        state.clone(),
                        callbacks,
                    ));
                    match state.lock().connections.get_mut(&handle) {
                        Some(connection) => connection.notify_task = Some(task),
                        None => task.abort(),
                    }
                }
                Err(e) => warn!(%handle, "Notification stream unavailable: {}", e),
            }
        });
        Ok(handle)
    }

    fn disconnect(&mut self, handle: GattHandle) {
        let Some(peripheral) = self.state.lock().peripheral(handle) else {
            return;
        };
        let callbacks = self.callbacks.clone();
        self.queue_teardown(async move {
            match peripheral.disconnect().await {
                // Some stacks never raise DeviceDisconnected for a local
                // disconnect; a duplicate is dropped by the session
                Ok(()) => {
                    callbacks.gatt(GattCallback::ConnectionStateChanged {
                        handle,
                        status: GATT_SUCCESS,
                        state: ConnectionState::Disconnected,
                    });
                }
                Err(e) => warn!(%handle, "Disconnect failed: {}", e),
            }
        });
    }

    fn close(&mut self, handle: GattHandle) {
        let Some(connection) = self.state.lock().connections.remove(&handle) else {
            return;
        };
        if let Some(task) = connection.notify_task {
            task.abort();
        }
        let peripheral = connection.peripheral;
        self.queue_teardown(async move {
            if peripheral.is_connected().await.unwrap_or(false) {
                let _ = peripheral.disconnect().await;
            }
        });
        trace!(%handle, "Handle closed");
    }

    fn discover_services(&mut self, handle: GattHandle) -> bool {
        let Some(peripheral) = self.state.lock().peripheral(handle) else {
            return false;
        };
        let callbacks = self.callbacks.clone();
        self.spawn(async move {
            let (status, services) = match peripheral.discover_services().await {
                Ok(()) => (
                    GATT_SUCCESS,
                    peripheral.services().iter().map(to_service).collect(),
                ),
                Err(e) => {
                    warn!(%handle, "Service discovery failed: {}", e);
                    (GATT_ERROR, Vec::new())
                }
            };
            callbacks.gatt(GattCallback::ServicesDiscovered {
                handle,
                status,
                services,
            });
        });
        true
    }

    fn set_notification(&mut self, handle: GattHandle, key: &CharacteristicKey, enable: bool) -> bool {
        let mut state = self.state.lock();
        let Some(connection) = state.connections.get_mut(&handle) else {
            return false;
        };
        if enable {
            connection.notifying.insert(*key);
        } else {
            connection.notifying.remove(key);
        }
        true
    }

    fn write_descriptor(
        &mut self,
        handle: GattHandle,
        key: &CharacteristicKey,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        if descriptor != CLIENT_CHARACTERISTIC_CONFIG {
            debug!(%descriptor, "Only the client configuration descriptor is writable");
            return false;
        }
        let Some(peripheral) = self.state.lock().peripheral(handle) else {
            return false;
        };
        let Some(characteristic) = find_characteristic(&peripheral, key) else {
            return false;
        };

        let enable = value != DISABLE_NOTIFICATION_VALUE;
        let key = *key;
        let callbacks = self.callbacks.clone();
        self.spawn(async move {
            let result = if enable {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            let status = match result {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    warn!(%key, enable, "Subscription change failed: {}", e);
                    GATT_ERROR
                }
            };
            callbacks.gatt(GattCallback::DescriptorWritten {
                handle,
                key,
                descriptor,
                status,
            });
        });
        true
    }

    fn read_characteristic(&mut self, handle: GattHandle, key: &CharacteristicKey) -> bool {
        let Some(peripheral) = self.state.lock().peripheral(handle) else {
            return false;
        };
        let Some(characteristic) = find_characteristic(&peripheral, key) else {
            return false;
        };

        let key = *key;
        let callbacks = self.callbacks.clone();
        self.spawn(async move {
            let (value, status) = match peripheral.read(&characteristic).await {
                Ok(value) => (Some(value), GATT_SUCCESS),
                Err(e) => {
                    warn!(%key, "Read failed: {}", e);
                    (None, GATT_ERROR)
                }
            };
            callbacks.gatt(GattCallback::CharacteristicRead {
                handle,
                key,
                value,
                status,
            });
        });
        true
    }
}

async fn report_advertisement(
    adapter: &Adapter,
    state: &Mutex<State>,
    callbacks: &CallbackSender,
    id: &PeripheralId,
) {
    let Ok(peripheral) = adapter.peripheral(id).await else {
        return;
    };
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        _ => return,
    };

    let address = peripheral_address(&peripheral);
    let advertisement = to_raw_advertisement(address.clone(), properties);

    let target = {
        let mut state = state.lock();
        state.known.insert(address.to_ascii_uppercase(), peripheral);
        state
            .scan
            .as_ref()
            .filter(|scan| ScanFilter::matches_any(&scan.filters, &advertisement))
            .map(|scan| scan.handle)
    };

    if let Some(handle) = target {
        callbacks.scan(ScanCallback::Result {
            handle,
            advertisement,
        });
    }
}

async fn forward_notifications(
    mut stream: std::pin::Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    handle: GattHandle,
    state: Arc<Mutex<State>>,
    callbacks: CallbackSender,
) {
    while let Some(notification) = stream.next().await {
        let key = {
            let state = state.lock();
            let Some(connection) = state.connections.get(&handle) else {
                break;
            };
            connection
                .notifying
                .iter()
                .find(|key| key.characteristic == notification.uuid)
                .copied()
        };
        match key {
            Some(key) => {
                callbacks.gatt(GattCallback::CharacteristicChanged {
                    handle,
                    key,
                    value: notification.value,
                });
            }
            None => trace!(uuid = %notification.uuid, "Notification for unsubscribed characteristic"),
        }
    }
}

/// Address used to identify a peripheral; platforms that hide the hardware
/// address fall back to the peripheral id
fn peripheral_address(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address.into_inner() == [0u8; 6] {
        format!("{:?}", peripheral.id())
    } else {
        address.to_string()
    }
}

fn to_raw_advertisement(address: String, properties: PeripheralProperties) -> RawAdvertisement {
    RawAdvertisement {
        address,
        device_name: properties.local_name,
        rssi: properties.rssi.unwrap_or_default(),
        timestamp_nanos: None,
        payload: None,
        service_uuids: properties.services,
        manufacturer_data: properties.manufacturer_data.into_iter().collect::<BTreeMap<_, _>>(),
        service_data: properties.service_data.into_iter().collect::<BTreeMap<_, _>>(),
        tx_power: properties.tx_power_level,
        connectable: None,
    }
}

fn to_service(service: &BtService) -> Service {
    Service {
        uuid: service.uuid,
        is_primary: service.primary,
        characteristics: service.characteristics.iter().map(to_characteristic).collect(),
    }
}

fn to_characteristic(characteristic: &BtCharacteristic) -> Characteristic {
    let properties = CharacteristicProperties(characteristic.properties.bits());
    let mut converted = Characteristic::new(characteristic.uuid, properties);
    for descriptor in &characteristic.descriptors {
        converted = converted.with_descriptor(descriptor.uuid);
    }
    if (properties.is_notifiable() || properties.is_indicatable()) && !converted.has_cccd() {
        converted = converted.with_descriptor(CLIENT_CHARACTERISTIC_CONFIG);
    }
    converted
}

fn find_characteristic(peripheral: &Peripheral, key: &CharacteristicKey) -> Option<BtCharacteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == key.characteristic && c.service_uuid == key.service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder() -> (
        Arc<Mutex<Vec<&'static str>>>,
        impl Fn(&'static str) + Clone + Send + 'static,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let writer = log.clone();
        (log, move |entry| writer.lock().push(entry))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_waits_for_teardown() {
        let runtime = Handle::current();
        let (log, record) = recorder();

        let close = {
            let record = record.clone();
            runtime.spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                record("close previous link");
            })
        };
        let connect = spawn_after(&runtime, vec![close], async move {
            record("connect");
        });
        connect.await.unwrap();

        assert_eq!(*log.lock(), vec!["close previous link", "connect"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_commands_run_in_issue_order() {
        let runtime = Handle::current();
        let (log, record) = recorder();

        // A restart: stop the running scan, then start again
        let stop = {
            let record = record.clone();
            spawn_after(&runtime, vec![], async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                record("stop");
            })
        };
        let start = spawn_after(&runtime, vec![stop], async move {
            record("start");
        });
        start.await.unwrap();

        assert_eq!(*log.lock(), vec!["stop", "start"]);
    }

    #[tokio::test]
    async fn test_panicked_predecessor_does_not_block() {
        let runtime = Handle::current();
        let (log, record) = recorder();

        let failed: JoinHandle<()> = runtime.spawn(async { panic!("radio task failed") });
        spawn_after(&runtime, vec![failed], async move {
            record("next");
        })
        .await
        .unwrap();

        assert_eq!(*log.lock(), vec!["next"]);
    }
}
