//! Scan lifecycle
//!
//! The [`Scanner`] owns at most one native scan handle. Starting a new scan
//! always releases the previous handle first, and a hardware scan failure
//! releases the failed handle before reporting it.
//!
//! Filters are handed to the radio and applied again on delivery, so a
//! platform that reports unfiltered results never leaks a non-matching
//! advertisement to the subscriber.

use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::advertisement::{decode_advertisement, RawAdvertisement};
use crate::config::ScanConfig;
use crate::error::{BleError, Result};
use crate::event::{BleEvent, EventSink, SinkSlot};
use crate::radio::{ScanCallback, ScanFilter, ScanHandle, ScanRadio, ScanSettings};

/// Scanner state machine over a [`ScanRadio`]
pub struct Scanner<R: ScanRadio> {
    radio: R,
    active: Option<ScanHandle>,
    config: Option<ScanConfig>,
    filters: Vec<ScanFilter>,
    sink: SinkSlot,
}

impl<R: ScanRadio> Scanner<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio,
            active: None,
            config: None,
            filters: Vec::new(),
            sink: SinkSlot::new(),
        }
    }

    /// Attach the subscriber, replacing any previous one
    pub fn attach_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sink.attach(sink);
    }

    /// Detach the subscriber; an active scan is stopped
    pub fn detach_sink(&mut self) {
        if self.sink.detach() {
            debug!("Scan subscriber detached");
        }
        self.stop();
    }

    /// Start scanning
    ///
    /// Any scan in progress is stopped first. Failures are pushed to the
    /// subscriber as a `scanError` and also returned.
    pub fn start(&mut self, config: &ScanConfig) -> Result<()> {
        self.stop();

        let filters = match ScanFilter::from_config(config) {
            Ok(filters) => filters,
            Err(e) => return Err(self.fail(e)),
        };
        let settings = ScanSettings::for_mode(config.mode);

        match self.radio.start_scan(&settings, &filters) {
            Ok(handle) => {
                info!(
                    %handle,
                    mode = %config.mode,
                    filters = filters.len(),
                    "Scan started"
                );
                self.active = Some(handle);
                self.config = Some(config.clone());
                self.filters = filters;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Stop scanning; no-op when idle
    pub fn stop(&mut self) {
        if let Some(handle) = self.active.take() {
            self.radio.stop_scan(handle);
            self.config = None;
            self.filters.clear();
            info!(%handle, "Scan stopped");
        }
    }

    /// Local scanning state
    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    /// Native handle of the active scan
    pub fn active_handle(&self) -> Option<ScanHandle> {
        self.active
    }

    /// Configuration of the active scan
    pub fn config(&self) -> Option<&ScanConfig> {
        self.config.as_ref()
    }

    /// React to a radio scan callback
    pub fn handle_callback(&mut self, callback: ScanCallback) {
        if self.active != Some(callback.handle()) {
            trace!(handle = %callback.handle(), "Dropping callback for inactive scan");
            return;
        }

        match callback {
            ScanCallback::Result { advertisement, .. } => self.deliver(advertisement),
            ScanCallback::Batch { advertisements, .. } => {
                trace!(count = advertisements.len(), "Batch scan results");
                for advertisement in advertisements {
                    self.deliver(advertisement);
                }
            }
            ScanCallback::Failed { handle, code } => {
                warn!(%handle, code, "Scan failed");
                self.active = None;
                self.config = None;
                self.filters.clear();
                self.radio.stop_scan(handle);
                self.sink
                    .emit(BleEvent::from_error(&BleError::ScanFailed { code }));
            }
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    fn deliver(&self, advertisement: RawAdvertisement) {
        if !ScanFilter::matches_any(&self.filters, &advertisement) {
            trace!(address = %advertisement.address, "Advertisement excluded by filter");
            return;
        }
        trace!(address = %advertisement.address, rssi = advertisement.rssi, "Advertisement");
        self.sink
            .emit(BleEvent::Advertisement(decode_advertisement(advertisement)));
    }

    fn fail(&self, err: BleError) -> BleError {
        warn!("Scan not started: {}", err);
        self.sink.emit(BleEvent::from_error(&err));
        err
    }
}

impl<R: ScanRadio> Drop for Scanner<R> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScanConfigBuilder, ScanMode};
    use crate::test_utils::{MockRadio, RadioCall, RecordingSink};

    fn scanner() -> (Scanner<MockRadio>, MockRadio, Arc<RecordingSink>) {
        let radio = MockRadio::new();
        let sink = Arc::new(RecordingSink::new());
        let mut scanner = Scanner::new(radio.clone());
        scanner.attach_sink(sink.clone());
        (scanner, radio, sink)
    }

    #[test]
    fn test_restart_leaves_one_handle() {
        let (mut scanner, radio, _sink) = scanner();
        scanner.start(&ScanConfig::default()).unwrap();
        let first = scanner.active_handle().unwrap();
        scanner.start(&ScanConfig::new(ScanMode::LowLatency)).unwrap();

        assert_eq!(radio.active_scans().len(), 1);
        assert_ne!(scanner.active_handle(), Some(first));
        assert!(radio.calls().contains(&RadioCall::StopScan(first)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut scanner, radio, _sink) = scanner();
        scanner.stop();
        scanner.start(&ScanConfig::default()).unwrap();
        scanner.stop();
        scanner.stop();
        assert!(!scanner.is_scanning());
        let stops = radio
            .calls()
            .iter()
            .filter(|c| matches!(c, RadioCall::StopScan(_)))
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn test_invalid_filter_does_not_start() {
        let (mut scanner, radio, sink) = scanner();
        let config = ScanConfigBuilder::new().service_uuid("not-a-uuid").build();
        assert!(scanner.start(&config).is_err());
        assert!(!scanner.is_scanning());
        assert!(radio.active_scans().is_empty());
        assert_eq!(sink.error_codes(), vec!["INVALID_UUID".to_string()]);
    }

    #[test]
    fn test_adapter_unavailable() {
        let (mut scanner, radio, sink) = scanner();
        radio.set_scanner_available(false);
        let err = scanner.start(&ScanConfig::default()).unwrap_err();
        assert_eq!(err.error_code(), "BLUETOOTH_UNAVAILABLE");
        assert_eq!(sink.error_codes(), vec!["BLUETOOTH_UNAVAILABLE".to_string()]);
    }

    #[test]
    fn test_scan_failure_releases_handle() {
        let (mut scanner, radio, sink) = scanner();
        scanner.start(&ScanConfig::default()).unwrap();
        let handle = scanner.active_handle().unwrap();

        scanner.handle_callback(ScanCallback::Failed { handle, code: 2 });
        assert!(!scanner.is_scanning());
        assert!(radio.active_scans().is_empty());
        assert_eq!(sink.error_codes(), vec!["SCAN_FAILED".to_string()]);
    }

    #[test]
    fn test_batch_preserves_order() {
        let (mut scanner, _radio, sink) = scanner();
        scanner.start(&ScanConfig::default()).unwrap();
        let handle = scanner.active_handle().unwrap();

        scanner.handle_callback(ScanCallback::Batch {
            handle,
            advertisements: vec![
                RawAdvertisement::new("00:00:00:00:00:01", -40),
                RawAdvertisement::new("00:00:00:00:00:02", -50),
                RawAdvertisement::new("00:00:00:00:00:03", -60),
            ],
        });
        assert_eq!(
            sink.advertisement_addresses(),
            vec!["00:00:00:00:00:01", "00:00:00:00:00:02", "00:00:00:00:00:03"]
        );
    }

    #[test]
    fn test_unfiltered_platform_reports_excluded() {
        let (mut scanner, _radio, sink) = scanner();
        scanner
            .start(&ScanConfigBuilder::new().name("Tentacle").build())
            .unwrap();
        let handle = scanner.active_handle().unwrap();

        let mut matching = RawAdvertisement::new("00:00:00:00:00:01", -40);
        matching.device_name = Some("Tentacle".into());
        scanner.handle_callback(ScanCallback::Batch {
            handle,
            advertisements: vec![RawAdvertisement::new("00:00:00:00:00:02", -40), matching],
        });
        assert_eq!(sink.advertisement_addresses(), vec!["00:00:00:00:00:01"]);
    }

    #[test]
    fn test_stale_results_dropped() {
        let (mut scanner, _radio, sink) = scanner();
        scanner.start(&ScanConfig::default()).unwrap();
        let handle = scanner.active_handle().unwrap();
        scanner.stop();

        scanner.handle_callback(ScanCallback::Result {
            handle,
            advertisement: RawAdvertisement::new("AA:BB:CC:DD:EE:FF", -60),
        });
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_detach_stops_scan() {
        let (mut scanner, radio, _sink) = scanner();
        scanner.start(&ScanConfig::default()).unwrap();
        scanner.detach_sink();
        assert!(!scanner.is_scanning());
        assert!(radio.active_scans().is_empty());
    }

    #[test]
    fn test_drop_releases_handle() {
        let (mut scanner, radio, _sink) = scanner();
        scanner.start(&ScanConfig::default()).unwrap();
        drop(scanner);
        assert!(radio.active_scans().is_empty());
    }
}
