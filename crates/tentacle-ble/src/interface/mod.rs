//! Hardware radio backends
//!
//! - [`btleplug::BtleplugRadio`] - BlueZ / CoreBluetooth / WinRT through
//!   btleplug (requires `ble` feature)
//!
//! # Feature Requirements
//!
//! - `ble`: Requires D-Bus development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev pkg-config
//!   ```
//!
//! Without the feature, the engine can still be driven by
//! [`MockRadio`](crate::test_utils::MockRadio) or any other implementation
//! of the radio traits.

#[cfg(feature = "ble")]
pub mod btleplug;

#[cfg(feature = "ble")]
pub use self::btleplug::BtleplugRadio;
