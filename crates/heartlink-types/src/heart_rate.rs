//! Heart-rate readings.
//!
//! Sensors report heart rate through the standard Bluetooth SIG Heart Rate
//! Measurement characteristic (0x2A37), which is little-endian.

use bytes::Buf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, DecodeResult};

const FLAG_BPM_U16: u8 = 0x01;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_ENERGY_PRESENT: u8 = 0x08;
const FLAG_RR_PRESENT: u8 = 0x10;

/// A single heart-rate notification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HeartRateReading {
    /// Beats per minute.
    pub bpm: u16,
    /// RR intervals in milliseconds, oldest first.
    pub rr_intervals: Vec<u16>,
    /// Skin contact state, if the sensor reports it.
    pub sensor_contact: Option<bool>,
}

impl HeartRateReading {
    /// Create a reading with only a BPM value.
    pub fn new(bpm: u16) -> Self {
        Self {
            bpm,
            ..Default::default()
        }
    }

    /// Parse a Heart Rate Measurement characteristic value.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::TooShort`] if the value is truncated.
    pub fn from_measurement(data: &[u8]) -> DecodeResult<Self> {
        let mut buf = data;
        if buf.remaining() < 2 {
            return Err(DecodeError::TooShort {
                expected: 2,
                actual: data.len(),
            });
        }

        let flags = buf.get_u8();
        let bpm = if flags & FLAG_BPM_U16 != 0 {
            if buf.remaining() < 2 {
                return Err(DecodeError::TooShort {
                    expected: 3,
                    actual: data.len(),
                });
            }
            buf.get_u16_le()
        } else {
            u16::from(buf.get_u8())
        };

        let sensor_contact =
            (flags & FLAG_CONTACT_SUPPORTED != 0).then_some(flags & FLAG_CONTACT_DETECTED != 0);

        if flags & FLAG_ENERGY_PRESENT != 0 {
            if buf.remaining() < 2 {
                return Err(DecodeError::InvalidData(
                    "energy expended field truncated".to_string(),
                ));
            }
            buf.advance(2);
        }

        let mut rr_intervals = Vec::new();
        if flags & FLAG_RR_PRESENT != 0 {
            while buf.remaining() >= 2 {
                // Units of 1/1024 s.
                let raw = u32::from(buf.get_u16_le());
                rr_intervals.push((raw * 1000 / 1024) as u16);
            }
        }

        Ok(Self {
            bpm,
            rr_intervals,
            sensor_contact,
        })
    }
}
