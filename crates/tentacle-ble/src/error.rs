//! Error types for BLE scan and GATT session operations
//!
//! Failures that originate in asynchronous radio callbacks are never returned
//! from a call; they travel through the event stream as `scanError` / `error`
//! records built from these variants. Only synchronously detectable failures
//! (bad filter, missing catalog entry, closed engine) surface as `Err`.

use thiserror::Error;

/// Main error type for the BLE engine
#[derive(Error, Debug)]
pub enum BleError {
    // ===== Adapter / Scan Errors =====
    /// The radio adapter or its LE scanner could not be obtained
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Service UUID filter could not be parsed
    #[error("Invalid service UUID filter: {0}")]
    InvalidFilter(String),

    /// The hardware reported a scan failure
    #[error("Scan failed with error code: {code}")]
    ScanFailed {
        /// Vendor status code reported by the adapter
        code: i32,
    },

    // ===== Connection / GATT Errors =====
    /// Address does not resolve to a reachable peripheral
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A request could not be initiated (not connected, unknown UUID, radio refused)
    #[error("Operation rejected: {0}")]
    OperationRejected(String),

    /// A completion callback carried a non-zero status
    #[error("{operation} completed with status {status}")]
    TransportStatus {
        /// The completed operation (read, discovery, descriptor write)
        operation: String,
        /// Transport-defined status code
        status: i32,
    },

    /// UUID argument could not be parsed
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    // ===== Codec Errors =====
    /// Characteristic payload does not match the expected layout
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// The engine task has stopped
    #[error("Engine channel closed")]
    ChannelClosed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BleError {
    /// Check if the caller may simply retry the operation
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BleError::AdapterUnavailable(_)
                | BleError::ScanFailed { .. }
                | BleError::DeviceNotFound(_)
                | BleError::TransportStatus { .. }
        )
    }

    /// Check if this error belongs on the scan event stream
    pub fn is_scan_error(&self) -> bool {
        matches!(
            self,
            BleError::AdapterUnavailable(_)
                | BleError::InvalidFilter(_)
                | BleError::ScanFailed { .. }
        )
    }

    /// Get the stable error code carried by `scanError` / `error` events
    pub fn error_code(&self) -> &'static str {
        match self {
            BleError::AdapterUnavailable(_) => "BLUETOOTH_UNAVAILABLE",
            BleError::InvalidFilter(_) => "INVALID_UUID",
            BleError::ScanFailed { .. } => "SCAN_FAILED",
            BleError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            BleError::OperationRejected(_) => "OPERATION_REJECTED",
            BleError::TransportStatus { .. } => "TRANSPORT_STATUS",
            BleError::InvalidUuid(_) => "INVALID_ARGUMENT",
            BleError::InvalidPayload(_) => "INVALID_PAYLOAD",
            BleError::InvalidConfig(_) => "INVALID_CONFIG",
            BleError::ChannelClosed => "CHANNEL_CLOSED",
            BleError::Internal(_) => "INTERNAL_ERROR",
            BleError::Io(_) => "IO_ERROR",
            BleError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Status code associated with the error, if the transport supplied one
    pub fn status(&self) -> Option<i32> {
        match self {
            BleError::ScanFailed { code } => Some(*code),
            BleError::TransportStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type alias for BLE engine operations
pub type Result<T> = std::result::Result<T, BleError>;

impl From<uuid::Error> for BleError {
    fn from(err: uuid::Error) -> Self {
        BleError::InvalidUuid(err.to_string())
    }
}

// Conversion from btleplug errors (only when the ble feature is enabled)
#[cfg(feature = "ble")]
impl From<btleplug::Error> for BleError {
    fn from(err: btleplug::Error) -> Self {
        match &err {
            btleplug::Error::DeviceNotFound => BleError::DeviceNotFound(err.to_string()),
            btleplug::Error::NotConnected => BleError::OperationRejected(err.to_string()),
            btleplug::Error::PermissionDenied => BleError::AdapterUnavailable(err.to_string()),
            _ => BleError::Internal(err.to_string()),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BleError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BleError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for BleError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        BleError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BleError::AdapterUnavailable("no scanner".into()).error_code(),
            "BLUETOOTH_UNAVAILABLE"
        );
        assert_eq!(
            BleError::InvalidFilter("zzz".into()).error_code(),
            "INVALID_UUID"
        );
        assert_eq!(
            BleError::DeviceNotFound("AA:BB".into()).error_code(),
            "DEVICE_NOT_FOUND"
        );
    }

    #[test]
    fn test_is_retriable() {
        assert!(BleError::ScanFailed { code: 2 }.is_retriable());
        assert!(BleError::DeviceNotFound("x".into()).is_retriable());
        assert!(!BleError::InvalidFilter("x".into()).is_retriable());
        assert!(!BleError::ChannelClosed.is_retriable());
    }

    #[test]
    fn test_scan_error_classification() {
        assert!(BleError::ScanFailed { code: 1 }.is_scan_error());
        assert!(BleError::InvalidFilter("x".into()).is_scan_error());
        assert!(!BleError::DeviceNotFound("x".into()).is_scan_error());
    }

    #[test]
    fn test_display_carries_status() {
        let err = BleError::TransportStatus {
            operation: "read".to_string(),
            status: 133,
        };
        assert_eq!(err.to_string(), "read completed with status 133");
        assert_eq!(err.status(), Some(133));
        assert_eq!(BleError::ScanFailed { code: 4 }.status(), Some(4));
        assert_eq!(BleError::ChannelClosed.status(), None);
    }

    #[test]
    fn test_json_error_is_not_a_config_error() {
        let err: BleError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(matches!(err, BleError::Serialization(_)));
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_uuid_error_conversion() {
        let err: BleError = uuid::Uuid::parse_str("not-a-uuid").unwrap_err().into();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }
}
