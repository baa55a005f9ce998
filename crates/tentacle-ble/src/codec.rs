//! Characteristic payload codec
//!
//! Property-bitmask interpretation, Client Characteristic Configuration
//! values, and the timecode notification layout:
//!
//! ```text
//! byte 0   hours        0..=23
//! byte 1   minutes      0..=59
//! byte 2   seconds      0..=59
//! byte 3   frames       0..nominal fps
//! byte 4   rate/flags   bits 0-3 frame-rate code, bit 7 drop-frame (optional)
//! ```
//!
//! A four-byte payload is read as 25 fps non-drop.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE};
use crate::error::{BleError, Result};

/// Minimum timecode payload length
pub const TIMECODE_MIN_LEN: usize = 4;

/// Full timecode payload length, including the rate/flags byte
pub const TIMECODE_PAYLOAD_LEN: usize = 5;

const DROP_FRAME_BIT: u8 = 0x80;
const RATE_MASK: u8 = 0x0F;

/// GATT characteristic property bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_NO_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
    pub const SIGNED_WRITE: u8 = 0x40;
    pub const EXTENDED_PROPERTIES: u8 = 0x80;

    /// Raw bitmask
    pub fn bits(&self) -> u8 {
        self.0
    }

    fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn is_readable(&self) -> bool {
        self.has(Self::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.has(Self::WRITE)
    }

    pub fn is_writable_no_response(&self) -> bool {
        self.has(Self::WRITE_NO_RESPONSE)
    }

    pub fn is_notifiable(&self) -> bool {
        self.has(Self::NOTIFY)
    }

    pub fn is_indicatable(&self) -> bool {
        self.has(Self::INDICATE)
    }
}

impl From<u8> for CharacteristicProperties {
    fn from(bits: u8) -> Self {
        Self(bits)
    }
}

/// Value to write to the CCCD when (un)subscribing
///
/// Indication takes precedence: a characteristic that can indicate is
/// always enabled with the indication value, never the notification value.
pub fn cccd_value(properties: CharacteristicProperties, enable: bool) -> [u8; 2] {
    if !enable {
        DISABLE_NOTIFICATION_VALUE
    } else if properties.is_indicatable() {
        ENABLE_INDICATION_VALUE
    } else {
        ENABLE_NOTIFICATION_VALUE
    }
}

/// Timecode frame rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameRate {
    Fps23_976,
    Fps24,
    #[default]
    Fps25,
    Fps29_97,
    Fps30,
    Fps48,
    Fps50,
    Fps59_94,
    Fps60,
}

impl FrameRate {
    /// Decode a rate code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FrameRate::Fps23_976),
            1 => Some(FrameRate::Fps24),
            2 => Some(FrameRate::Fps25),
            3 => Some(FrameRate::Fps29_97),
            4 => Some(FrameRate::Fps30),
            5 => Some(FrameRate::Fps48),
            6 => Some(FrameRate::Fps50),
            7 => Some(FrameRate::Fps59_94),
            8 => Some(FrameRate::Fps60),
            _ => None,
        }
    }

    /// Rate code as carried in the payload
    pub fn code(&self) -> u8 {
        match self {
            FrameRate::Fps23_976 => 0,
            FrameRate::Fps24 => 1,
            FrameRate::Fps25 => 2,
            FrameRate::Fps29_97 => 3,
            FrameRate::Fps30 => 4,
            FrameRate::Fps48 => 5,
            FrameRate::Fps50 => 6,
            FrameRate::Fps59_94 => 7,
            FrameRate::Fps60 => 8,
        }
    }

    /// Frames per second
    pub fn fps(&self) -> f64 {
        match self {
            FrameRate::Fps23_976 => 24000.0 / 1001.0,
            FrameRate::Fps24 => 24.0,
            FrameRate::Fps25 => 25.0,
            FrameRate::Fps29_97 => 30000.0 / 1001.0,
            FrameRate::Fps30 => 30.0,
            FrameRate::Fps48 => 48.0,
            FrameRate::Fps50 => 50.0,
            FrameRate::Fps59_94 => 60000.0 / 1001.0,
            FrameRate::Fps60 => 60.0,
        }
    }

    /// Frame labels per second (frames field upper bound)
    pub fn nominal_frames(&self) -> u8 {
        match self {
            FrameRate::Fps23_976 | FrameRate::Fps24 => 24,
            FrameRate::Fps25 => 25,
            FrameRate::Fps29_97 | FrameRate::Fps30 => 30,
            FrameRate::Fps48 => 48,
            FrameRate::Fps50 => 50,
            FrameRate::Fps59_94 | FrameRate::Fps60 => 60,
        }
    }

    /// Drop-frame counting only exists for the NTSC rates
    pub fn supports_drop_frame(&self) -> bool {
        matches!(self, FrameRate::Fps29_97 | FrameRate::Fps59_94)
    }
}

/// Format a timecode tuple as `HH:MM:SS:FF`, or `HH:MM:SS;FF` for drop-frame
pub fn format_timecode(hours: u8, minutes: u8, seconds: u8, frames: u8, drop_frame: bool) -> String {
    let separator = if drop_frame { ';' } else { ':' };
    format!("{hours:02}:{minutes:02}:{seconds:02}{separator}{frames:02}")
}

/// A decoded timecode sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timecode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
    pub rate: FrameRate,
    pub drop_frame: bool,
}

impl Timecode {
    /// Create a validated timecode
    pub fn new(
        hours: u8,
        minutes: u8,
        seconds: u8,
        frames: u8,
        rate: FrameRate,
        drop_frame: bool,
    ) -> Result<Self> {
        let timecode = Self {
            hours,
            minutes,
            seconds,
            frames,
            rate,
            drop_frame,
        };
        timecode.validate()?;
        Ok(timecode)
    }

    /// Check field ranges and drop-frame compatibility
    pub fn validate(&self) -> Result<()> {
        if self.hours > 23 {
            return Err(BleError::InvalidPayload(format!("hours out of range: {}", self.hours)));
        }
        if self.minutes > 59 {
            return Err(BleError::InvalidPayload(format!(
                "minutes out of range: {}",
                self.minutes
            )));
        }
        if self.seconds > 59 {
            return Err(BleError::InvalidPayload(format!(
                "seconds out of range: {}",
                self.seconds
            )));
        }
        if self.frames >= self.rate.nominal_frames() {
            return Err(BleError::InvalidPayload(format!(
                "frames {} out of range for {:.3} fps",
                self.frames,
                self.rate.fps()
            )));
        }
        if self.drop_frame && !self.rate.supports_drop_frame() {
            return Err(BleError::InvalidPayload(format!(
                "drop-frame is not defined for {:.3} fps",
                self.rate.fps()
            )));
        }
        Ok(())
    }

    /// Formatted `HH:MM:SS:FF` / `HH:MM:SS;FF`
    pub fn formatted(&self) -> String {
        format_timecode(self.hours, self.minutes, self.seconds, self.frames, self.drop_frame)
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted())
    }
}

/// Decode a timecode notification payload
pub fn decode_timecode(payload: &[u8]) -> Result<Timecode> {
    if payload.len() < TIMECODE_MIN_LEN {
        return Err(BleError::InvalidPayload(format!(
            "timecode payload too short: {} bytes",
            payload.len()
        )));
    }

    let (rate, drop_frame) = match payload.get(4) {
        Some(&flags) => {
            let rate = FrameRate::from_code(flags & RATE_MASK).ok_or_else(|| {
                BleError::InvalidPayload(format!("unknown frame rate code: {}", flags & RATE_MASK))
            })?;
            (rate, flags & DROP_FRAME_BIT != 0)
        }
        None => (FrameRate::Fps25, false),
    };

    Timecode::new(payload[0], payload[1], payload[2], payload[3], rate, drop_frame)
}

/// Encode a timecode into its notification payload
pub fn encode_timecode(timecode: &Timecode) -> [u8; TIMECODE_PAYLOAD_LEN] {
    let mut flags = timecode.rate.code() & RATE_MASK;
    if timecode.drop_frame {
        flags |= DROP_FRAME_BIT;
    }
    [
        timecode.hours,
        timecode.minutes,
        timecode.seconds,
        timecode.frames,
        flags,
    ]
}
