//! Timecode capture on top of the tentacle-ble engine
//!
//! - [`config`] - capture configuration, JSON file plus CLI overrides
//! - [`flow`] - the event-driven capture sequence
//!
//! The `tentacle-capture` binary (feature `ble`) wires both to a btleplug
//! radio.

pub mod config;
pub mod flow;

pub use config::CaptureConfig;
pub use flow::{CaptureAction, CaptureFlow, CapturePhase};
