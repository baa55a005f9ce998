//! BleEngine - the scan and GATT actor
//!
//! The engine owns a [`Scanner`] and a [`GattSession`] and processes two
//! inbound streams one message at a time: commands from [`EngineHandle`]s
//! and callbacks from the radio. Nothing inside the loop waits on hardware;
//! every multi-step protocol is "issue a request, react to the callback".
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          BleEngine                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  EngineHandle ──► command rx ──┐        ┌──► Scanner ──┐     │
//! │                                ├─ loop ─┤              ├──► sinks
//! │  CallbackSender ─► callback rx ┘        └──► GattSession ┘   │
//! │                                                              │
//! │  TimecodeForwarder ──► broadcast receivers                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use tentacle_ble::config::{EngineConfig, ScanConfig};
//! use tentacle_ble::engine::BleEngine;
//! use tentacle_ble::radio::callback_channel;
//! use tentacle_ble::test_utils::MockRadio;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tentacle_ble::Result<()> {
//! let radio = MockRadio::new();
//! let (_callbacks, callback_rx) = callback_channel();
//! let (engine, handle) =
//!     BleEngine::new(radio.clone(), radio.clone(), callback_rx, EngineConfig::default())?;
//! tokio::spawn(engine.run());
//!
//! handle.start_scan(ScanConfig::default()).await?;
//! assert!(handle.is_scanning().await?);
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::catalog::{CharacteristicKey, Service};
use crate::config::{EngineConfig, ScanConfig};
use crate::error::{BleError, Result};
use crate::event::EventSink;
use crate::forward::{TimecodeForwarder, TimecodeUpdate};
use crate::gatt::{ConnectionState, GattSession};
use crate::radio::{CallbackReceiver, GattRadio, RadioEvent, ScanRadio};
use crate::scanner::Scanner;

/// Callbacks handled in a row before a waiting command is served
pub const CALLBACK_BURST: usize = 64;

/// Commands accepted by the engine
pub enum EngineCommand {
    StartScan {
        config: ScanConfig,
        reply: oneshot::Sender<()>,
    },
    StopScan(oneshot::Sender<()>),
    IsScanning(oneshot::Sender<bool>),
    Connect {
        address: String,
        reply: oneshot::Sender<()>,
    },
    Disconnect(oneshot::Sender<()>),
    DiscoverServices(oneshot::Sender<()>),
    GetServices(oneshot::Sender<String>),
    Catalog(oneshot::Sender<Vec<Service>>),
    Subscribe {
        key: CharacteristicKey,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        key: CharacteristicKey,
        reply: oneshot::Sender<bool>,
    },
    ReadCharacteristic {
        key: CharacteristicKey,
        reply: oneshot::Sender<()>,
    },
    IsConnected(oneshot::Sender<bool>),
    GetConnectionState(oneshot::Sender<ConnectionState>),
    AttachScanSink {
        sink: Arc<dyn EventSink>,
        reply: oneshot::Sender<()>,
    },
    DetachScanSink(oneshot::Sender<()>),
    AttachGattSink {
        sink: Arc<dyn EventSink>,
        reply: oneshot::Sender<()>,
    },
    DetachGattSink(oneshot::Sender<()>),
    SetForwardingEnabled {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    IsForwardingEnabled(oneshot::Sender<bool>),
    ForwardTimecode {
        update: TimecodeUpdate,
        reply: oneshot::Sender<usize>,
    },
    /// Stop scanning, release the GATT handle and exit the loop
    Shutdown,
}

/// Handle for controlling a running [`BleEngine`]
///
/// Every call returns once the engine has processed it. The only error is
/// [`BleError::ChannelClosed`], once the engine has stopped.
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    forwarder: TimecodeForwarder,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(command(tx))
            .await
            .map_err(|_| BleError::ChannelClosed)?;
        rx.await.map_err(|_| BleError::ChannelClosed)
    }

    /// Start scanning; failures arrive as `scanError` events
    pub async fn start_scan(&self, config: ScanConfig) -> Result<()> {
        self.request(|reply| EngineCommand::StartScan { config, reply })
            .await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.request(EngineCommand::StopScan).await
    }

    pub async fn is_scanning(&self) -> Result<bool> {
        self.request(EngineCommand::IsScanning).await
    }

    /// Connect to a peripheral; the outcome arrives as events
    pub async fn connect(&self, address: impl Into<String>) -> Result<()> {
        let address = address.into();
        self.request(|reply| EngineCommand::Connect { address, reply })
            .await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(EngineCommand::Disconnect).await
    }

    pub async fn discover_services(&self) -> Result<()> {
        self.request(EngineCommand::DiscoverServices).await
    }

    /// Serialized service catalog
    pub async fn get_services(&self) -> Result<String> {
        self.request(EngineCommand::GetServices).await
    }

    pub async fn catalog(&self) -> Result<Vec<Service>> {
        self.request(EngineCommand::Catalog).await
    }

    /// Enable notifications; `true` means the request was accepted
    pub async fn subscribe(&self, key: CharacteristicKey) -> Result<bool> {
        self.request(|reply| EngineCommand::Subscribe { key, reply })
            .await
    }

    /// Disable notifications; `true` means the request was accepted
    pub async fn unsubscribe(&self, key: CharacteristicKey) -> Result<bool> {
        self.request(|reply| EngineCommand::Unsubscribe { key, reply })
            .await
    }

    pub async fn read_characteristic(&self, key: CharacteristicKey) -> Result<()> {
        self.request(|reply| EngineCommand::ReadCharacteristic { key, reply })
            .await
    }

    pub async fn is_connected(&self) -> Result<bool> {
        self.request(EngineCommand::IsConnected).await
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        self.request(EngineCommand::GetConnectionState).await
    }

    pub async fn attach_scan_sink(&self, sink: Arc<dyn EventSink>) -> Result<()> {
        self.request(|reply| EngineCommand::AttachScanSink { sink, reply })
            .await
    }

    /// Detach the scan subscriber, stopping any active scan
    pub async fn detach_scan_sink(&self) -> Result<()> {
        self.request(EngineCommand::DetachScanSink).await
    }

    pub async fn attach_gatt_sink(&self, sink: Arc<dyn EventSink>) -> Result<()> {
        self.request(|reply| EngineCommand::AttachGattSink { sink, reply })
            .await
    }

    pub async fn detach_gatt_sink(&self) -> Result<()> {
        self.request(EngineCommand::DetachGattSink).await
    }

    pub async fn set_forwarding_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SetForwardingEnabled { enabled, reply })
            .await
    }

    pub async fn is_forwarding_enabled(&self) -> Result<bool> {
        self.request(EngineCommand::IsForwardingEnabled).await
    }

    /// Forward a timecode update; returns how many consumers received it
    pub async fn forward_timecode(&self, update: TimecodeUpdate) -> Result<usize> {
        self.request(|reply| EngineCommand::ForwardTimecode { update, reply })
            .await
    }

    /// Receive forwarded timecode updates
    pub fn timecode_updates(&self) -> broadcast::Receiver<TimecodeUpdate> {
        self.forwarder.subscribe()
    }

    /// Shut the engine down
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(EngineCommand::Shutdown)
            .await
            .map_err(|_| BleError::ChannelClosed)
    }

    /// Check whether the engine has stopped
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// Scan and GATT actor
pub struct BleEngine<S: ScanRadio, G: GattRadio> {
    scanner: Scanner<S>,
    session: GattSession<G>,
    forwarder: TimecodeForwarder,
    command_rx: mpsc::Receiver<EngineCommand>,
    callback_rx: CallbackReceiver,
}

impl<S: ScanRadio, G: GattRadio> BleEngine<S, G> {
    /// Create an engine over the given radios
    ///
    /// `callback_rx` is the receiving end of the channel the radios deliver
    /// their callbacks on.
    pub fn new(
        scan_radio: S,
        gatt_radio: G,
        callback_rx: CallbackReceiver,
        config: EngineConfig,
    ) -> Result<(Self, EngineHandle)> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let forwarder = TimecodeForwarder::new(config.forward_buffer, config.forwarding_enabled);
        let handle = EngineHandle {
            command_tx,
            forwarder: forwarder.clone(),
        };

        let engine = Self {
            scanner: Scanner::new(scan_radio),
            session: GattSession::new(gatt_radio),
            forwarder,
            command_rx,
            callback_rx,
        };

        Ok((engine, handle))
    }

    /// Run the engine until shutdown or until every handle is dropped
    pub async fn run(mut self) -> Result<()> {
        info!("Starting BLE engine");

        let mut burst = 0;
        loop {
            // A callback flood must not starve commands
            if burst >= CALLBACK_BURST {
                burst = 0;
                let command = match self.command_rx.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => continue,
                    Err(TryRecvError::Disconnected) => None,
                };
                if !self.dispatch(command) {
                    break;
                }
                continue;
            }

            tokio::select! {
                // Radio callbacks first, so a command observes every callback
                // delivered before it was sent
                biased;

                Some(event) = self.callback_rx.recv() => {
                    burst += 1;
                    self.handle_radio_event(event);
                }

                command = self.command_rx.recv() => {
                    burst = 0;
                    if !self.dispatch(command) {
                        break;
                    }
                }
            }
        }

        self.scanner.stop();
        self.session.shutdown();
        info!("BLE engine stopped");
        Ok(())
    }

    /// Handle a received command; `false` stops the loop
    fn dispatch(&mut self, command: Option<EngineCommand>) -> bool {
        match command {
            Some(EngineCommand::Shutdown) => {
                info!("Engine shutdown requested");
                false
            }
            Some(command) => {
                self.handle_command(command);
                true
            }
            None => {
                debug!("All engine handles dropped");
                false
            }
        }
    }

    fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Scan(callback) => self.scanner.handle_callback(callback),
            RadioEvent::Gatt(callback) => self.session.handle_callback(callback),
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::StartScan { config, reply } => {
                // Failures already went to the scan subscriber
                let _ = self.scanner.start(&config);
                let _ = reply.send(());
            }
            EngineCommand::StopScan(reply) => {
                self.scanner.stop();
                let _ = reply.send(());
            }
            EngineCommand::IsScanning(reply) => {
                let _ = reply.send(self.scanner.is_scanning());
            }
            EngineCommand::Connect { address, reply } => {
                let _ = self.session.connect(&address);
                let _ = reply.send(());
            }
            EngineCommand::Disconnect(reply) => {
                self.session.disconnect();
                let _ = reply.send(());
            }
            EngineCommand::DiscoverServices(reply) => {
                self.session.discover_services();
                let _ = reply.send(());
            }
            EngineCommand::GetServices(reply) => {
                let _ = reply.send(self.session.services_json());
            }
            EngineCommand::Catalog(reply) => {
                let _ = reply.send(self.session.catalog());
            }
            EngineCommand::Subscribe { key, reply } => {
                let _ = reply.send(self.session.subscribe(&key));
            }
            EngineCommand::Unsubscribe { key, reply } => {
                let _ = reply.send(self.session.unsubscribe(&key));
            }
            EngineCommand::ReadCharacteristic { key, reply } => {
                self.session.read_characteristic(&key);
                let _ = reply.send(());
            }
            EngineCommand::IsConnected(reply) => {
                let _ = reply.send(self.session.is_connected());
            }
            EngineCommand::GetConnectionState(reply) => {
                let _ = reply.send(self.session.connection_state());
            }
            EngineCommand::AttachScanSink { sink, reply } => {
                self.scanner.attach_sink(sink);
                let _ = reply.send(());
            }
            EngineCommand::DetachScanSink(reply) => {
                self.scanner.detach_sink();
                let _ = reply.send(());
            }
            EngineCommand::AttachGattSink { sink, reply } => {
                self.session.attach_sink(sink);
                let _ = reply.send(());
            }
            EngineCommand::DetachGattSink(reply) => {
                self.session.detach_sink();
                let _ = reply.send(());
            }
            EngineCommand::SetForwardingEnabled { enabled, reply } => {
                self.forwarder.set_enabled(enabled);
                let _ = reply.send(());
            }
            EngineCommand::IsForwardingEnabled(reply) => {
                let _ = reply.send(self.forwarder.is_enabled());
            }
            EngineCommand::ForwardTimecode { update, reply } => {
                let _ = reply.send(self.forwarder.forward(update));
            }
            EngineCommand::Shutdown => {}
        }
    }
}
