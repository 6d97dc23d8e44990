//! Error types for frame decoding in heartlink-types.

use thiserror::Error;

/// Errors that can occur when decoding a frame received from the sensor.
///
/// Decode errors are per-frame: the frame is discarded and decoding simply
/// continues with the next notification.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The frame is shorter than the minimum length for its kind.
    #[error("Frame too short: requires {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// The frame does not start with the `MEP` signature.
    #[error("Bad frame signature: {found:02X?}")]
    BadSignature {
        /// The first three bytes of the frame.
        found: [u8; 3],
    },

    /// The trailing checksum does not match the frame contents.
    #[error("Checksum mismatch: computed 0x{expected:04X}, frame carries 0x{actual:04X}")]
    ChecksumMismatch {
        /// Checksum computed over the frame body.
        expected: u16,
        /// Checksum carried by the frame.
        actual: u16,
    },

    /// A field carried a value outside its valid range.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using heartlink-types' DecodeError type.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;
