//! Platform-agnostic types for the heartlink ECG pipeline.
//!
//! This crate holds the pure, I/O-free parts of the pipeline so they can be
//! shared between the BLE core, the local store and any other consumer.
//!
//! # Features
//!
//! - ECG frame decoding ([`EcgPacket`], [`packet::decode`])
//! - Heart Rate Measurement decoding ([`HeartRateReading`])
//! - Sample batches as stored locally ([`SampleRecord`])
//! - UUID constants for BLE services and characteristics
//!
//! # Example
//!
//! ```
//! use heartlink_types::{DecodeError, packet};
//!
//! let err = packet::decode(&[0u8; 4]).unwrap_err();
//! assert!(matches!(err, DecodeError::TooShort { .. }));
//! ```

pub mod error;
pub mod heart_rate;
pub mod packet;
pub mod types;
pub mod uuid;

pub use error::{DecodeError, DecodeResult};
pub use heart_rate::HeartRateReading;
pub use packet::{Acceleration, EcgPacket, PacemakerEvent};
pub use types::{DeviceInfo, SampleRecord};
pub use uuid as uuids;
