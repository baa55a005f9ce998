//! Advertisement decoding
//!
//! Turns a radio report ([`RawAdvertisement`]) into the immutable
//! [`AdvertisementRecord`] delivered on the scan event stream. Byte blobs
//! (raw payload, manufacturer data, service data) serialize as standard
//! base64 so the record can cross a process boundary as text.
//!
//! When the platform hands over only the raw payload, the AD structures are
//! parsed here as a best-effort fallback. Parsing stops silently at the first
//! malformed structure.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;
use uuid::Uuid;

use crate::config::uuid_from_short;
use crate::error::{BleError, Result};

// AD types (Bluetooth Core Supplement, Part A)
const AD_FLAGS: u8 = 0x01;
const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID32: u8 = 0x04;
const AD_COMPLETE_UUID32: u8 = 0x05;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORTENED_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0A;
const AD_SERVICE_DATA_UUID16: u8 = 0x16;
const AD_SERVICE_DATA_UUID32: u8 = 0x20;
const AD_SERVICE_DATA_UUID128: u8 = 0x21;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// Encode bytes as standard base64 (padded, no line wrapping)
pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

/// Decode standard base64 text back into bytes
pub fn decode_bytes(text: &str) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(text)
        .map_err(|e| BleError::InvalidPayload(format!("invalid base64: {e}")))
}

fn monotonic_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Nanoseconds elapsed on the process monotonic clock
pub fn monotonic_nanos() -> u64 {
    let anchor = monotonic_anchor();
    u64::try_from(Instant::now().duration_since(anchor).as_nanos()).unwrap_or(u64::MAX)
}

/// Event timestamp: monotonic nanoseconds plus wall-clock milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    /// Monotonic clock reading in nanoseconds
    #[serde(rename = "timestampNanos")]
    pub monotonic_nanos: u64,
    /// Wall clock in milliseconds since the Unix epoch
    #[serde(rename = "timestampMillis")]
    pub wall_millis: i64,
}

impl Timestamp {
    /// Snapshot both clocks
    pub fn now() -> Self {
        Self::with_monotonic(monotonic_nanos())
    }

    /// Use a hardware-supplied monotonic reading, stamping the wall clock now
    pub fn with_monotonic(monotonic_nanos: u64) -> Self {
        Self {
            monotonic_nanos,
            wall_millis: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A single advertisement report as handed over by the radio
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAdvertisement {
    /// Stable hardware address
    pub address: String,
    /// Name reported by the transport (cached device name)
    pub device_name: Option<String>,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Hardware receive timestamp, when the platform supplies one
    pub timestamp_nanos: Option<u64>,
    /// Raw advertisement payload
    pub payload: Option<Vec<u8>>,
    /// Service UUIDs parsed by the platform
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer specific data by company identifier
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Service data by service UUID
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    /// Advertised TX power level in dBm
    pub tx_power: Option<i16>,
    /// Connectable flag, when the platform can tell
    pub connectable: Option<bool>,
}

impl RawAdvertisement {
    /// Create a bare report for an address and RSSI
    pub fn new(address: impl Into<String>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            rssi,
            ..Self::default()
        }
    }

    /// Name the platform reported, falling back to the payload's local name
    pub fn effective_name(&self) -> Option<String> {
        self.device_name.clone().or_else(|| {
            self.payload
                .as_deref()
                .and_then(|payload| parse_payload(payload).local_name)
        })
    }

    /// Service UUIDs the platform reported, falling back to the payload
    pub fn effective_service_uuids(&self) -> Vec<Uuid> {
        if !self.service_uuids.is_empty() {
            return self.service_uuids.clone();
        }
        self.payload
            .as_deref()
            .map(|payload| parse_payload(payload).service_uuids)
            .unwrap_or_default()
    }
}

/// Decoded advertisement delivered to the scan subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisementRecord {
    /// Stable hardware address
    pub address: String,
    /// Device name
    pub name: Option<String>,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Receive timestamp
    #[serde(flatten)]
    pub timestamp: Timestamp,
    /// Raw advertisement payload
    #[serde(rename = "payloadBase64", serialize_with = "base64_serde::option")]
    pub payload: Option<Vec<u8>>,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer specific data by company identifier
    #[serde(serialize_with = "base64_serde::map")]
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Service data by service UUID
    #[serde(serialize_with = "base64_serde::map")]
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    /// Advertised TX power level in dBm
    #[serde(rename = "txPowerLevel")]
    pub tx_power: Option<i16>,
    /// Whether the peripheral accepts connections
    #[serde(rename = "isConnectable")]
    pub connectable: bool,
}

/// AD structures extracted from a raw payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPayload {
    /// Flags byte
    pub flags: Option<u8>,
    /// Complete local name, or the shortened one when no complete name exists
    pub local_name: Option<String>,
    /// Service UUIDs from all UUID list structures
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer specific data by company identifier
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Service data by service UUID
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    /// TX power level in dBm
    pub tx_power: Option<i8>,
}

/// Parse the AD structures of a raw advertisement payload
pub fn parse_payload(data: &[u8]) -> ParsedPayload {
    let mut parsed = ParsedPayload::default();

    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + len >= data.len() {
            break;
        }
        let ad_type = data[i + 1];
        let body = &data[i + 2..i + 1 + len];

        match ad_type {
            AD_FLAGS => parsed.flags = body.first().copied(),
            AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                for chunk in body.chunks_exact(2) {
                    let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                    push_unique(&mut parsed.service_uuids, uuid_from_short(short as u32));
                }
            }
            AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => {
                for chunk in body.chunks_exact(4) {
                    let short = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    push_unique(&mut parsed.service_uuids, uuid_from_short(short));
                }
            }
            AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                for chunk in body.chunks_exact(16) {
                    push_unique(&mut parsed.service_uuids, uuid_from_le(chunk));
                }
            }
            AD_SHORTENED_NAME => {
                if parsed.local_name.is_none() {
                    parsed.local_name = Some(String::from_utf8_lossy(body).into_owned());
                }
            }
            AD_COMPLETE_NAME => {
                parsed.local_name = Some(String::from_utf8_lossy(body).into_owned());
            }
            AD_TX_POWER => parsed.tx_power = body.first().map(|&b| b as i8),
            AD_SERVICE_DATA_UUID16 if body.len() >= 2 => {
                let short = u16::from_le_bytes([body[0], body[1]]);
                parsed
                    .service_data
                    .insert(uuid_from_short(short as u32), body[2..].to_vec());
            }
            AD_SERVICE_DATA_UUID32 if body.len() >= 4 => {
                let short = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                parsed
                    .service_data
                    .insert(uuid_from_short(short), body[4..].to_vec());
            }
            AD_SERVICE_DATA_UUID128 if body.len() >= 16 => {
                parsed
                    .service_data
                    .insert(uuid_from_le(&body[..16]), body[16..].to_vec());
            }
            AD_MANUFACTURER_DATA if body.len() >= 2 => {
                let company = u16::from_le_bytes([body[0], body[1]]);
                parsed.manufacturer_data.insert(company, body[2..].to_vec());
            }
            _ => {}
        }

        i += len + 1;
    }

    parsed
}

fn uuid_from_le(bytes: &[u8]) -> Uuid {
    let mut be = [0u8; 16];
    for (dst, src) in be.iter_mut().zip(bytes.iter().rev()) {
        *dst = *src;
    }
    Uuid::from_bytes(be)
}

fn push_unique(uuids: &mut Vec<Uuid>, uuid: Uuid) {
    if !uuids.contains(&uuid) {
        uuids.push(uuid);
    }
}

/// Decode a radio report into the record delivered to subscribers
///
/// The transport-reported name wins over a name embedded in the payload.
/// Fields the platform left empty are filled from the parsed payload. When
/// the platform supplies no hardware timestamp, the monotonic clock is
/// sampled instead.
pub fn decode_advertisement(raw: RawAdvertisement) -> AdvertisementRecord {
    let parsed = raw
        .payload
        .as_deref()
        .map(parse_payload)
        .unwrap_or_default();

    let timestamp = match raw.timestamp_nanos {
        Some(nanos) => Timestamp::with_monotonic(nanos),
        None => Timestamp::now(),
    };

    AdvertisementRecord {
        name: raw.device_name.or(parsed.local_name),
        service_uuids: if raw.service_uuids.is_empty() {
            parsed.service_uuids
        } else {
            raw.service_uuids
        },
        manufacturer_data: if raw.manufacturer_data.is_empty() {
            parsed.manufacturer_data
        } else {
            raw.manufacturer_data
        },
        service_data: if raw.service_data.is_empty() {
            parsed.service_data
        } else {
            raw.service_data
        },
        tx_power: raw.tx_power.or(parsed.tx_power.map(i16::from)),
        connectable: raw.connectable.unwrap_or(true),
        address: raw.address,
        rssi: raw.rssi,
        timestamp,
        payload: raw.payload,
    }
}

/// Serde helpers rendering byte blobs as base64 text
pub(crate) mod base64_serde {
    use serde::ser::SerializeMap;
    use serde::{Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn option<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&super::encode_bytes(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn map<K, S>(map: &BTreeMap<K, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(key, &super::encode_bytes(value))?;
        }
        out.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Vec<u8> {
        vec![
            0x02, 0x01, 0x06, // Flags
            0x03, 0x03, 0x0D, 0x18, // Complete 16-bit UUIDs: 0x180D
            0x05, 0x08, b'T', b'E', b'N', b'T', // Shortened name
            0x09, 0x09, b'T', b'e', b'n', b't', b'a', b'c', b'l', b'e', // Complete name
            0x02, 0x0A, 0xF4, // TX power -12 dBm
            0x05, 0xFF, 0x4C, 0x00, 0x02, 0x15, // Manufacturer 0x004C
            0x04, 0x16, 0x0D, 0x18, 0x2A, // Service data 0x180D
        ]
    }

    #[test]
    fn test_parse_payload_structures() {
        let parsed = parse_payload(&sample_payload());
        assert_eq!(parsed.flags, Some(0x06));
        assert_eq!(parsed.local_name.as_deref(), Some("Tentacle"));
        assert_eq!(parsed.service_uuids, vec![uuid_from_short(0x180D)]);
        assert_eq!(parsed.tx_power, Some(-12));
        assert_eq!(parsed.manufacturer_data.get(&0x004C), Some(&vec![0x02, 0x15]));
        assert_eq!(
            parsed.service_data.get(&uuid_from_short(0x180D)),
            Some(&vec![0x2A])
        );
    }

    #[test]
    fn test_parse_128_bit_uuid_is_little_endian() {
        let uuid = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let mut payload = vec![0x11, 0x07];
        payload.extend(uuid.as_bytes().iter().rev());
        let parsed = parse_payload(&payload);
        assert_eq!(parsed.service_uuids, vec![uuid]);
    }

    #[test]
    fn test_parse_stops_at_malformed_structure() {
        // Second structure claims more bytes than remain
        let payload = [0x02, 0x01, 0x06, 0x09, 0x09, b'X'];
        let parsed = parse_payload(&payload);
        assert_eq!(parsed.flags, Some(0x06));
        assert!(parsed.local_name.is_none());
        assert_eq!(parse_payload(&[]), ParsedPayload::default());
        assert_eq!(parse_payload(&[0x00, 0x01]), ParsedPayload::default());
    }

    #[test]
    fn test_transport_name_wins() {
        let mut raw = RawAdvertisement::new("AA:BB:CC:DD:EE:FF", -50);
        raw.device_name = Some("Cached".to_string());
        raw.payload = Some(sample_payload());
        let record = decode_advertisement(raw.clone());
        assert_eq!(record.name.as_deref(), Some("Cached"));

        raw.device_name = None;
        let record = decode_advertisement(raw);
        assert_eq!(record.name.as_deref(), Some("Tentacle"));
    }

    #[test]
    fn test_platform_fields_win_over_payload() {
        let mut raw = RawAdvertisement::new("AA:BB:CC:DD:EE:FF", -50);
        raw.payload = Some(sample_payload());
        raw.manufacturer_data.insert(0x0059, vec![0x01]);
        raw.tx_power = Some(4);
        let record = decode_advertisement(raw);
        assert_eq!(record.manufacturer_data.len(), 1);
        assert!(record.manufacturer_data.contains_key(&0x0059));
        assert_eq!(record.tx_power, Some(4));
        // Not supplied by the platform, filled from the payload
        assert_eq!(record.service_uuids, vec![uuid_from_short(0x180D)]);
    }

    #[test]
    fn test_defaults_without_payload() {
        let record = decode_advertisement(RawAdvertisement::new("11:22:33:44:55:66", -70));
        assert!(record.connectable);
        assert!(record.payload.is_none());
        assert!(record.tx_power.is_none());
        assert!(record.timestamp.wall_millis > 0);
    }

    #[test]
    fn test_hardware_timestamp_preserved() {
        let mut raw = RawAdvertisement::new("11:22:33:44:55:66", -70);
        raw.timestamp_nanos = Some(42);
        let record = decode_advertisement(raw);
        assert_eq!(record.timestamp.monotonic_nanos, 42);
    }

    #[test]
    fn test_base64_round_trip() {
        let payload = sample_payload();
        let text = encode_bytes(&payload);
        assert_eq!(decode_bytes(&text).unwrap(), payload);
        assert_eq!(encode_bytes(&[0x02, 0x15]), "AhU=");
        assert!(decode_bytes("%%%").is_err());
    }

    #[test]
    fn test_record_serialization() {
        let mut raw = RawAdvertisement::new("AA:BB:CC:DD:EE:FF", -60);
        raw.manufacturer_data.insert(0x004C, vec![0x02, 0x15]);
        raw.payload = Some(vec![0x02, 0x01, 0x06]);
        let json = serde_json::to_value(decode_advertisement(raw)).unwrap();

        assert_eq!(json["address"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(json["rssi"], -60);
        assert_eq!(json["manufacturerData"]["76"], "AhU=");
        assert_eq!(json["payloadBase64"], "AgEG");
        assert_eq!(json["isConnectable"], true);
        assert!(json["txPowerLevel"].is_null());
        assert!(json["timestampNanos"].is_u64());
        assert!(json["timestampMillis"].is_i64());
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let first = monotonic_nanos();
        let second = monotonic_nanos();
        assert!(second >= first);
    }
}
