//! Core data types shared across the pipeline.

use time::OffsetDateTime;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A batch of raw ECG samples stamped with the time they were received.
///
/// Records are appended by the fanout's accumulator and moved into the local
/// store when it is flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SampleRecord {
    /// Host time at which the samples were received.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Raw, unclamped samples in device units.
    pub samples: Vec<i16>,
}

impl SampleRecord {
    /// Create a new record.
    pub fn new(timestamp: OffsetDateTime, samples: Vec<i16>) -> Self {
        Self { timestamp, samples }
    }

    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the batch carries no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Static information reported by a sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_record_len() {
        let record = SampleRecord::new(OffsetDateTime::UNIX_EPOCH, vec![1, -2, 3]);
        assert_eq!(record.len(), 3);
        assert!(!record.is_empty());
        assert!(SampleRecord::new(OffsetDateTime::UNIX_EPOCH, Vec::new()).is_empty());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_sample_record_serde() {
        let record = SampleRecord::new(OffsetDateTime::UNIX_EPOCH, vec![10, -10]);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("1970-01-01T00:00:00Z"));
        let back: SampleRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
