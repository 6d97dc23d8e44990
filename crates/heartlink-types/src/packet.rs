//! ECG frame decoding.
//!
//! Each radio notification carries exactly one complete frame; there is no
//! reassembly across notifications. All multi-byte integers are big-endian.
//!
//! ```text
//! [0..3]    signature "MEP"
//! [3]       flags (bit 0: RR interval present)
//! [4..8]    packet sequence number (u32)
//! [8..10]   ECG sample 0 (i16)
//! [10..12]  ECG sample 1 (i16)
//! [12]      accelerometer X (i8)
//! [13]      accelerometer Y (i8)
//! [14]      accelerometer Z (i8)
//! [15..17]  marker (u16)
//! [17]      temperature in °C (i8)
//! [18]      battery voltage in 0.1 V units (u8)
//! [19..23]  device timestamp (u32)
//! [23..25]  RR interval in ms (u16), flag bit 0 set and frame >= 27 bytes
//! [25..28]  reserved
//! [28..n-2] pacemaker events, 2 bytes each, only when the frame is > 30 bytes
//! [n-2..n]  checksum (u16)
//! ```

use bytes::{Buf, BufMut};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, DecodeResult};

/// Signature every ECG frame starts with.
pub const SIGNATURE: [u8; 3] = *b"MEP";

/// Minimum length of a valid ECG frame in bytes.
pub const MIN_FRAME_LEN: usize = 25;

/// Flag bit signalling that the RR interval slot is populated.
pub const FLAG_RR_PRESENT: u8 = 0x01;

/// Number of ECG samples carried by one frame.
pub const SAMPLES_PER_FRAME: usize = 2;

const RR_OFFSET: usize = 23;
const EVENTS_OFFSET: usize = 28;
const CHECKSUM_LEN: usize = 2;

/// Frames up to this length never carry pacemaker events.
const EVENTS_THRESHOLD: usize = 30;

/// Raw three-axis accelerometer reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Acceleration {
    pub x: i8,
    pub y: i8,
    pub z: i8,
}

/// A pacemaker pulse reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PacemakerEvent {
    /// Whether the sensor flagged this record as a detected pulse.
    pub detected: bool,
    /// 15-bit timestamp relative to the frame.
    pub sub_timestamp: u16,
}

impl PacemakerEvent {
    /// Decode an event from its two wire bytes.
    ///
    /// The high bit of the first byte is the detected flag; the remaining
    /// 7 bits and the whole second byte form the sub-timestamp.
    #[must_use]
    pub fn from_wire(bytes: [u8; 2]) -> Self {
        Self {
            detected: bytes[0] & 0x80 != 0,
            sub_timestamp: (u16::from(bytes[0] & 0x7F) << 8) | u16::from(bytes[1]),
        }
    }

    /// Encode the event into its two wire bytes.
    #[must_use]
    pub fn to_wire(self) -> [u8; 2] {
        let high = ((self.sub_timestamp >> 8) as u8 & 0x7F) | if self.detected { 0x80 } else { 0 };
        [high, self.sub_timestamp as u8]
    }
}

/// One decoded ECG frame.
///
/// Packets are constructed per radio notification and consumed immediately
/// by the fanout; they are never retained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EcgPacket {
    /// Raw flag byte.
    pub flags: u8,
    /// Monotonically increasing packet sequence number.
    pub sequence: u32,
    /// ECG samples in device units.
    pub samples: [i16; SAMPLES_PER_FRAME],
    /// Accelerometer reading taken with this frame.
    pub acceleration: Acceleration,
    /// Marker value set by the device.
    pub marker: u16,
    /// RR interval in milliseconds, present iff flag bit 0 is set.
    pub rr_interval: Option<u16>,
    /// Skin temperature in °C.
    pub temperature: i8,
    /// Battery voltage in 0.1 V units.
    pub battery_raw: u8,
    /// Device-side timestamp.
    pub device_timestamp: u32,
    /// Pacemaker events carried by the frame.
    pub pacemaker_events: Vec<PacemakerEvent>,
    /// Checksum carried by the frame.
    pub checksum: u16,
}

impl EcgPacket {
    /// A packet carrying only a sequence number and samples.
    pub fn with_samples(sequence: u32, samples: [i16; SAMPLES_PER_FRAME]) -> Self {
        Self {
            sequence,
            samples,
            ..Default::default()
        }
    }

    /// Parse a frame received from the radio.
    ///
    /// The checksum is parsed but not enforced; use
    /// [`from_bytes_verified`](Self::from_bytes_verified) to reject frames
    /// whose checksum does not match.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::TooShort`] if `data` is shorter than
    /// [`MIN_FRAME_LEN`] and [`DecodeError::BadSignature`] if it does not
    /// start with [`SIGNATURE`].
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> DecodeResult<Self> {
        if data.len() < MIN_FRAME_LEN {
            return Err(DecodeError::TooShort {
                expected: MIN_FRAME_LEN,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let mut signature = [0u8; 3];
        buf.copy_to_slice(&mut signature);
        if signature != SIGNATURE {
            return Err(DecodeError::BadSignature { found: signature });
        }

        let flags = buf.get_u8();
        let sequence = buf.get_u32();
        let samples = [buf.get_i16(), buf.get_i16()];
        let acceleration = Acceleration {
            x: buf.get_i8(),
            y: buf.get_i8(),
            z: buf.get_i8(),
        };
        let marker = buf.get_u16();
        let temperature = buf.get_i8();
        let battery_raw = buf.get_u8();
        let device_timestamp = buf.get_u32();

        // The RR slot shares bytes with the checksum on minimum-length frames.
        let rr_interval = if flags & FLAG_RR_PRESENT != 0
            && data.len() >= RR_OFFSET + 2 + CHECKSUM_LEN
        {
            Some(u16::from_be_bytes([data[RR_OFFSET], data[RR_OFFSET + 1]]))
        } else {
            None
        };

        let body_end = data.len() - CHECKSUM_LEN;
        let pacemaker_events = if data.len() > EVENTS_THRESHOLD {
            data[EVENTS_OFFSET..body_end]
                .chunks_exact(2)
                .map(|pair| PacemakerEvent::from_wire([pair[0], pair[1]]))
                .collect()
        } else {
            Vec::new()
        };

        let checksum = u16::from_be_bytes([data[body_end], data[body_end + 1]]);

        Ok(EcgPacket {
            flags,
            sequence,
            samples,
            acceleration,
            marker,
            rr_interval,
            temperature,
            battery_raw,
            device_timestamp,
            pacemaker_events,
            checksum,
        })
    }

    /// Parse a frame and reject it unless its checksum matches.
    ///
    /// # Errors
    ///
    /// Everything [`from_bytes`](Self::from_bytes) returns, plus
    /// [`DecodeError::ChecksumMismatch`].
    pub fn from_bytes_verified(data: &[u8]) -> DecodeResult<Self> {
        let packet = Self::from_bytes(data)?;
        let expected = checksum(&data[..data.len() - CHECKSUM_LEN]);
        if expected != packet.checksum {
            return Err(DecodeError::ChecksumMismatch {
                expected,
                actual: packet.checksum,
            });
        }
        Ok(packet)
    }

    /// Battery voltage in volts.
    #[must_use]
    pub fn battery_voltage(&self) -> f32 {
        f32::from(self.battery_raw) / 10.0
    }

    /// Encode the packet into a wire frame with a valid checksum.
    ///
    /// Flag bit 0 is derived from `rr_interval`. The RR slot is written
    /// whenever an RR interval or pacemaker events are present, so that the
    /// frame decodes back to the same packet.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let flags = if self.rr_interval.is_some() {
            self.flags | FLAG_RR_PRESENT
        } else {
            self.flags & !FLAG_RR_PRESENT
        };

        let mut buf = Vec::with_capacity(EVENTS_OFFSET + 2 * self.pacemaker_events.len() + 2);
        buf.put_slice(&SIGNATURE);
        buf.put_u8(flags);
        buf.put_u32(self.sequence);
        for sample in self.samples {
            buf.put_i16(sample);
        }
        buf.put_i8(self.acceleration.x);
        buf.put_i8(self.acceleration.y);
        buf.put_i8(self.acceleration.z);
        buf.put_u16(self.marker);
        buf.put_i8(self.temperature);
        buf.put_u8(self.battery_raw);
        buf.put_u32(self.device_timestamp);

        if self.rr_interval.is_some() || !self.pacemaker_events.is_empty() {
            buf.put_u16(self.rr_interval.unwrap_or(0));
        }
        if !self.pacemaker_events.is_empty() {
            buf.put_bytes(0, EVENTS_OFFSET - buf.len());
            for event in &self.pacemaker_events {
                buf.put_slice(&event.to_wire());
            }
        }

        let sum = checksum(&buf);
        buf.put_u16(sum);
        buf
    }
}

/// Decode a frame without checksum enforcement.
///
/// Convenience alias for [`EcgPacket::from_bytes`].
pub fn decode(data: &[u8]) -> DecodeResult<EcgPacket> {
    EcgPacket::from_bytes(data)
}

/// Decode a frame and enforce its checksum.
pub fn decode_verified(data: &[u8]) -> DecodeResult<EcgPacket> {
    EcgPacket::from_bytes_verified(data)
}

/// 16-bit wrapping sum of all bytes.
#[must_use]
pub fn checksum(body: &[u8]) -> u16 {
    body.iter()
        .fold(0u16, |acc, byte| acc.wrapping_add(u16::from(*byte)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> EcgPacket {
        EcgPacket {
            flags: 0,
            sequence: 0x0102_0304,
            samples: [-1200, 875],
            acceleration: Acceleration { x: 12, y: -7, z: 64 },
            marker: 0xBEEF,
            rr_interval: None,
            temperature: 33,
            battery_raw: 37,
            device_timestamp: 0xA0B0_C0D0,
            pacemaker_events: Vec::new(),
            checksum: 0,
        }
    }

    #[test]
    fn test_decode_minimum_frame() {
        let frame = sample_packet().encode();
        assert_eq!(frame.len(), MIN_FRAME_LEN);

        let packet = decode(&frame).unwrap();
        assert_eq!(packet.sequence, 0x0102_0304);
        assert_eq!(packet.samples, [-1200, 875]);
        assert_eq!(packet.acceleration, Acceleration { x: 12, y: -7, z: 64 });
        assert_eq!(packet.marker, 0xBEEF);
        assert_eq!(packet.temperature, 33);
        assert!((packet.battery_voltage() - 3.7).abs() < 0.001);
        assert_eq!(packet.device_timestamp, 0xA0B0_C0D0);
        assert_eq!(packet.rr_interval, None);
        assert!(packet.pacemaker_events.is_empty());
    }

    #[test]
    fn test_fields_are_big_endian() {
        let mut frame = sample_packet().encode();
        frame[4..8].copy_from_slice(&[0x00, 0x00, 0x01, 0x00]);
        frame[8..10].copy_from_slice(&[0xFF, 0xFE]);

        let packet = decode(&frame).unwrap();
        assert_eq!(packet.sequence, 256);
        assert_eq!(packet.samples[0], -2);
    }

    #[test]
    fn test_accelerometer_does_not_overlap_second_sample() {
        let mut packet = sample_packet();
        packet.samples = [0, 0x7F7F];
        packet.acceleration = Acceleration { x: -1, y: 0, z: 1 };

        let decoded = decode(&packet.encode()).unwrap();
        assert_eq!(decoded.samples[1], 0x7F7F);
        assert_eq!(decoded.acceleration.x, -1);
    }

    #[test]
    fn test_too_short() {
        let frame = sample_packet().encode();
        let err = decode(&frame[..24]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TooShort {
                expected: 25,
                actual: 24
            }
        );
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_bad_signature() {
        let mut frame = sample_packet().encode();
        frame[0] = b'X';
        assert!(matches!(
            decode(&frame),
            Err(DecodeError::BadSignature { found }) if &found == b"XEP"
        ));
    }

    #[test]
    fn test_rr_interval_present_when_flag_set() {
        let mut packet = sample_packet();
        packet.rr_interval = Some(812);
        let frame = packet.encode();
        assert_eq!(frame.len(), 27);
        assert_eq!(frame[3] & FLAG_RR_PRESENT, FLAG_RR_PRESENT);

        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.rr_interval, Some(812));
    }

    #[test]
    fn test_rr_interval_absent_without_flag() {
        let mut packet = sample_packet();
        packet.pacemaker_events = vec![PacemakerEvent {
            detected: true,
            sub_timestamp: 5,
        }];
        let frame = packet.encode();

        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.rr_interval, None);
    }

    #[test]
    fn test_rr_flag_on_minimum_frame_has_no_room() {
        let mut frame = sample_packet().encode();
        frame[3] |= FLAG_RR_PRESENT;
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.rr_interval, None);
    }

    #[test]
    fn test_pacemaker_events() {
        let mut packet = sample_packet();
        packet.rr_interval = Some(700);
        packet.pacemaker_events = vec![
            PacemakerEvent {
                detected: true,
                sub_timestamp: 0x7FFF,
            },
            PacemakerEvent {
                detected: false,
                sub_timestamp: 0x0123,
            },
        ];
        let frame = packet.encode();
        assert_eq!(frame.len(), 34);
        assert_eq!(&frame[28..30], &[0xFF, 0xFF]);
        assert_eq!(&frame[30..32], &[0x01, 0x23]);

        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.pacemaker_events, packet.pacemaker_events);
        assert_eq!(decoded.rr_interval, Some(700));
    }

    #[test]
    fn test_no_events_up_to_thirty_bytes() {
        let mut frame = sample_packet().encode();
        frame.truncate(23);
        frame.extend_from_slice(&[0xAA; 5]);
        frame.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(frame.len(), 30);

        let decoded = decode(&frame).unwrap();
        assert!(decoded.pacemaker_events.is_empty());
    }

    #[test]
    fn test_odd_trailing_event_byte_ignored() {
        let mut frame = sample_packet().encode();
        frame.truncate(23);
        frame.extend_from_slice(&[0; 5]);
        frame.extend_from_slice(&[0x80, 0x10, 0x42]);
        frame.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(frame.len(), 33);

        let decoded = decode(&frame).unwrap();
        assert_eq!(
            decoded.pacemaker_events,
            vec![PacemakerEvent {
                detected: true,
                sub_timestamp: 0x0010
            }]
        );
    }

    #[test]
    fn test_checksum_not_enforced_by_default() {
        let mut frame = sample_packet().encode();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(decode(&frame).is_ok());
        assert!(matches!(
            decode_verified(&frame),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_verified_accepts_encoded_frame() {
        let packet = sample_packet();
        let decoded = decode_verified(&packet.encode()).unwrap();
        assert_eq!(decoded.checksum, checksum(&packet.encode()[..23]));
    }

    #[test]
    fn test_pacemaker_wire_roundtrip_limits() {
        let event = PacemakerEvent::from_wire([0x00, 0x01]);
        assert!(!event.detected);
        assert_eq!(event.sub_timestamp, 1);
        assert_eq!(event.to_wire(), [0x00, 0x01]);
    }
}

/// Property-based tests for the frame decoder.
///
/// ```bash
/// cargo test -p heartlink-types packet::proptests
/// ```
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_event() -> impl Strategy<Value = PacemakerEvent> {
        (any::<bool>(), 0u16..0x8000).prop_map(|(detected, sub_timestamp)| PacemakerEvent {
            detected,
            sub_timestamp,
        })
    }

    prop_compose! {
        fn arb_packet()(
            flags in any::<u8>(),
            sequence in any::<u32>(),
            samples in any::<[i16; 2]>(),
            acc in any::<(i8, i8, i8)>(),
            marker in any::<u16>(),
            rr_interval in proptest::option::of(any::<u16>()),
            temperature in any::<i8>(),
            battery_raw in any::<u8>(),
            device_timestamp in any::<u32>(),
            pacemaker_events in proptest::collection::vec(arb_event(), 0..8),
        ) -> EcgPacket {
            EcgPacket {
                flags,
                sequence,
                samples,
                acceleration: Acceleration { x: acc.0, y: acc.1, z: acc.2 },
                marker,
                rr_interval,
                temperature,
                battery_raw,
                device_timestamp,
                pacemaker_events,
                checksum: 0,
            }
        }
    }

    proptest! {
        /// Decoding arbitrary bytes never panics.
        #[test]
        fn decode_never_panics(data: Vec<u8>) {
            let _ = decode(&data);
            let _ = decode_verified(&data);
        }

        /// Anything shorter than the minimum frame is rejected.
        #[test]
        fn short_frames_rejected(data in proptest::collection::vec(any::<u8>(), 0..MIN_FRAME_LEN)) {
            let is_too_short = matches!(decode(&data), Err(DecodeError::TooShort { .. }));
            prop_assert!(is_too_short);
        }

        /// Frames with the wrong signature are rejected.
        #[test]
        fn bad_signature_rejected(
            sig in any::<[u8; 3]>().prop_filter("not MEP", |s| s != &SIGNATURE),
            rest in proptest::collection::vec(any::<u8>(), 22..64),
        ) {
            let mut data = sig.to_vec();
            data.extend(rest);
            let is_bad_signature = matches!(decode(&data), Err(DecodeError::BadSignature { .. }));
            prop_assert!(is_bad_signature);
        }

        /// Every fixed-offset field survives an encode/decode pass.
        #[test]
        fn well_formed_frames_decode(packet in arb_packet()) {
            let frame = packet.encode();
            let decoded = decode_verified(&frame).unwrap();
            prop_assert_eq!(decoded.sequence, packet.sequence);
            prop_assert_eq!(decoded.samples, packet.samples);
            prop_assert_eq!(decoded.acceleration, packet.acceleration);
            prop_assert_eq!(decoded.marker, packet.marker);
            prop_assert_eq!(decoded.rr_interval, packet.rr_interval);
            prop_assert_eq!(decoded.temperature, packet.temperature);
            prop_assert_eq!(decoded.battery_raw, packet.battery_raw);
            prop_assert_eq!(decoded.device_timestamp, packet.device_timestamp);
            prop_assert_eq!(decoded.pacemaker_events, packet.pacemaker_events);
        }

        /// A cleared flag bit never yields an RR interval.
        #[test]
        fn rr_absent_without_flag(mut data in proptest::collection::vec(any::<u8>(), MIN_FRAME_LEN..64)) {
            data[..3].copy_from_slice(&SIGNATURE);
            data[3] &= !FLAG_RR_PRESENT;
            prop_assert_eq!(decode(&data).unwrap().rr_interval, None);
        }

        /// A set flag bit on a long enough frame always yields an RR interval.
        #[test]
        fn rr_present_with_flag(mut data in proptest::collection::vec(any::<u8>(), 27..64)) {
            data[..3].copy_from_slice(&SIGNATURE);
            data[3] |= FLAG_RR_PRESENT;
            let expected = u16::from_be_bytes([data[23], data[24]]);
            prop_assert_eq!(decode(&data).unwrap().rr_interval, Some(expected));
        }
    }
}
