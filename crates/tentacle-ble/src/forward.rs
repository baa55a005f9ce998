//! Timecode forwarding to other local consumers
//!
//! Decoded timecode can be re-broadcast as [`TimecodeUpdate`]s. Forwarding
//! is off by default; while disabled, [`TimecodeForwarder::forward`] is a
//! silent no-op.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::codec::{format_timecode, Timecode};

/// Payload forwarded to timecode consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimecodeUpdate {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
    /// Formatted `HH:MM:SS:FF` / `HH:MM:SS;FF`
    pub timecode: String,
    pub fps: f64,
    pub drop_frame: bool,
    /// Capture wall clock, milliseconds since the Unix epoch
    pub timestamp: i64,
    pub device_address: String,
    pub device_name: Option<String>,
}

impl TimecodeUpdate {
    /// Build an update stamped with the current wall clock
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hours: u8,
        minutes: u8,
        seconds: u8,
        frames: u8,
        fps: f64,
        drop_frame: bool,
        device_address: impl Into<String>,
        device_name: Option<String>,
    ) -> Self {
        Self {
            hours,
            minutes,
            seconds,
            frames,
            timecode: format_timecode(hours, minutes, seconds, frames, drop_frame),
            fps,
            drop_frame,
            timestamp: chrono::Utc::now().timestamp_millis(),
            device_address: device_address.into(),
            device_name,
        }
    }

    /// Build an update from a decoded timecode
    pub fn from_timecode(
        timecode: &Timecode,
        device_address: impl Into<String>,
        device_name: Option<String>,
    ) -> Self {
        Self::new(
            timecode.hours,
            timecode.minutes,
            timecode.seconds,
            timecode.frames,
            timecode.rate.fps(),
            timecode.drop_frame,
            device_address,
            device_name,
        )
    }
}

/// Enable-gated broadcaster of timecode updates
#[derive(Debug, Clone)]
pub struct TimecodeForwarder {
    enabled: Arc<AtomicBool>,
    tx: broadcast::Sender<TimecodeUpdate>,
}

impl TimecodeForwarder {
    /// Create a forwarder whose channel keeps up to `capacity` updates per
    /// lagging consumer
    pub fn new(capacity: usize, enabled: bool) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            tx,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            debug!(enabled, "Timecode forwarding toggled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Receive forwarded updates
    pub fn subscribe(&self) -> broadcast::Receiver<TimecodeUpdate> {
        self.tx.subscribe()
    }

    /// Forward an update; returns how many consumers received it
    pub fn forward(&self, update: TimecodeUpdate) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        match self.tx.send(update) {
            Ok(receivers) => {
                trace!(receivers, "Timecode forwarded");
                receivers
            }
            Err(_) => {
                trace!("No timecode consumers");
                0
            }
        }
    }
}

impl Default for TimecodeForwarder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_FORWARD_BUFFER, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_timecode;

    fn update() -> TimecodeUpdate {
        TimecodeUpdate::new(1, 2, 3, 4, 25.0, false, "AA:BB:CC:DD:EE:FF", None)
    }

    #[test]
    fn test_update_formats_timecode() {
        let update = update();
        assert_eq!(update.timecode, "01:02:03:04");
        assert!(update.timestamp > 0);

        let drop = decode_timecode(&[1, 2, 3, 4, 0x83]).unwrap();
        let update = TimecodeUpdate::from_timecode(&drop, "AA", Some("Tentacle".into()));
        assert_eq!(update.timecode, "01:02:03;04");
        assert!(update.drop_frame);
        assert!((update.fps - 29.97).abs() < 0.001);
    }

    #[test]
    fn test_update_json_shape() {
        let json = serde_json::to_value(update()).unwrap();
        assert_eq!(json["timecode"], "01:02:03:04");
        assert_eq!(json["dropFrame"], false);
        assert_eq!(json["deviceAddress"], "AA:BB:CC:DD:EE:FF");
        assert!(json["deviceName"].is_null());
    }

    #[tokio::test]
    async fn test_disabled_forwarding_is_silent() {
        let forwarder = TimecodeForwarder::default();
        let mut rx = forwarder.subscribe();
        assert!(!forwarder.is_enabled());
        assert_eq!(forwarder.forward(update()), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_enabled_forwarding_delivers() {
        let forwarder = TimecodeForwarder::new(8, false);
        let mut rx = forwarder.subscribe();
        forwarder.clone().set_enabled(true);
        assert!(forwarder.is_enabled());
        assert_eq!(forwarder.forward(update()), 1);
        assert_eq!(rx.recv().await.unwrap().timecode, "01:02:03:04");
    }

    #[test]
    fn test_forward_without_consumers() {
        let forwarder = TimecodeForwarder::new(8, true);
        assert_eq!(forwarder.forward(update()), 0);
    }
}
