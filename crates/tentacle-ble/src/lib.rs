//! BLE scan and GATT engine for Tentacle timecode capture
//!
//! This crate scans for Bluetooth Low Energy peripherals, holds a single
//! GATT client session and streams everything it observes as JSON-shaped
//! [`BleEvent`]s. Timecode notifications can be decoded and re-broadcast to
//! other local consumers.
//!
//! # Architecture
//!
//! The engine operates in four layers:
//!
//! 1. **Radio** - [`ScanRadio`] / [`GattRadio`] requests and canonical callbacks
//! 2. **Sessions** - [`Scanner`] and [`GattSession`] state machines
//! 3. **Actor** - [`BleEngine`] serializing commands and callbacks
//! 4. **Application** - `tentacle-capture` CLI and event subscribers
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `ble` feature to use BtleplugRadio
//! // Cargo.toml: tentacle-ble = { version = "0.1", features = ["ble"] }
//!
//! use tentacle_ble::{
//!     callback_channel, BleEngine, BtleplugRadio, ChannelSink, EngineConfig, ScanConfigBuilder,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (callbacks, callback_rx) = callback_channel();
//!     let radio = BtleplugRadio::new(callbacks).await?;
//!     let (engine, handle) =
//!         BleEngine::new(radio.clone(), radio, callback_rx, EngineConfig::default())?;
//!     tokio::spawn(engine.run());
//!
//!     let (sink, mut events) = ChannelSink::channel();
//!     handle.attach_scan_sink(std::sync::Arc::new(sink)).await?;
//!     handle
//!         .start_scan(ScanConfigBuilder::new().name("Tentacle").build())
//!         .await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{}", event.to_json()?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `ble` - btleplug hardware backend (requires `libdbus-1-dev` on Linux)
//!
//! # Event Flow
//!
//! ## Scanning
//!
//! 1. `start_scan` stops any running scan and starts a new one
//! 2. The radio reports advertisements for the active scan handle
//! 3. Reports are decoded into [`AdvertisementRecord`]s
//! 4. The scan subscriber receives `advertisement` events in report order
//!
//! ## GATT
//!
//! 1. `connect` releases any previous handle and issues a connect request
//! 2. `connectionStateChange` events follow the link state
//! 3. `discover_services` rebuilds the [`ServiceCatalog`]
//! 4. `subscribe` enables notifications and writes the CCCD
//! 5. Notifications arrive as `characteristicEvent`s
//!
//! # Timecode Payload
//!
//! Tentacle sync devices notify a short binary frame:
//! - Bytes 0-3: hours, minutes, seconds, frames
//! - Byte 4: frame rate code, bit 7 set for drop-frame
//!
//! See [`codec`] for details.

#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod radio;

// Payloads
pub mod advertisement;
pub mod catalog;
pub mod codec;
pub mod event;

// Sessions
pub mod gatt;
pub mod scanner;

// Actor and forwarding
pub mod engine;
pub mod forward;

// Backends
pub mod interface;

// Testing utilities
pub mod test_utils;

// Re-exports for convenience - core
pub use config::{EngineConfig, ScanConfig, ScanConfigBuilder, ScanMode};
pub use error::{BleError, Result};
pub use radio::{
    callback_channel, CallbackReceiver, CallbackSender, GattCallback, GattHandle, GattRadio,
    RadioEvent, ScanCallback, ScanFilter, ScanHandle, ScanRadio, ScanSettings,
};

// Re-exports for convenience - payloads
pub use advertisement::{decode_advertisement, AdvertisementRecord, RawAdvertisement};
pub use catalog::{Characteristic, CharacteristicKey, Descriptor, Service, ServiceCatalog};
pub use codec::{decode_timecode, encode_timecode, CharacteristicProperties, FrameRate, Timecode};
pub use event::{
    BleEvent, CallbackSink, ChannelSink, CharacteristicEvent, CharacteristicOperation, EventSink,
};

// Re-exports for convenience - sessions and actor
pub use engine::{BleEngine, EngineHandle};
pub use forward::{TimecodeForwarder, TimecodeUpdate};
pub use gatt::{ConnectionState, GattSession};
pub use scanner::Scanner;

#[cfg(feature = "ble")]
pub use interface::BtleplugRadio;

// Re-exports for convenience - testing
pub use test_utils::{MockRadio, RecordingSink};

// Protocol constants re-exports
pub use config::{
    uuid_from_short, CLIENT_CHARACTERISTIC_CONFIG, DISABLE_NOTIFICATION_VALUE,
    ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
pub use radio::{GATT_ERROR, GATT_FAILURE, GATT_SUCCESS};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(ENABLE_NOTIFICATION_VALUE, [0x01, 0x00]);
        assert_eq!(ENABLE_INDICATION_VALUE, [0x02, 0x00]);
        assert_eq!(DISABLE_NOTIFICATION_VALUE, [0x00, 0x00]);
        assert_eq!(GATT_SUCCESS, 0);
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIG.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(uuid_from_short(0x2902), CLIENT_CHARACTERISTIC_CONFIG);
    }
}
