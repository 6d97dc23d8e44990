//! Error types for heartlink-core.
//!
//! Errors fall into three groups:
//!
//! | Error | Origin | Typical handling |
//! |-------|--------|------------------|
//! | [`Error::OperationPending`] | caller contract violation | wait for the outstanding operation |
//! | [`Error::NotConnected`], [`Error::InvalidState`] | caller contract violation | connect first |
//! | [`Error::Timeout`], [`Error::Radio`], [`Error::ConnectionFailed`] | radio stack | reconnect |
//! | [`Error::Bluetooth`] | btleplug | retry, then reconnect |
//! | [`Error::Cancelled`] | session shut down | stop |
//!
//! Frame decoding failures never surface here: malformed ECG frames are
//! counted and dropped by the session.

use std::time::Duration;

use thiserror::Error;

use crate::events::Resource;
use crate::session::SessionState;

/// Errors that can occur while talking to a sensor.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The radio stack reported a failure for the pending operation.
    #[error("Radio error: {0}")]
    Radio(String),

    /// A connect or disconnect is already outstanding.
    #[error("A {operation} operation is already pending")]
    OperationPending {
        /// The operation that was rejected.
        operation: &'static str,
    },

    /// Operation attempted while not connected to the device.
    #[error("Not connected to device")]
    NotConnected,

    /// Operation not allowed in the current session state.
    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the session was in.
        state: SessionState,
    },

    /// Device not known to the radio stack.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Required BLE characteristic not found on device.
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Connection failed with specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// The resource cannot be requested or subscribed to this way.
    #[error("Unsupported request for {0:?}")]
    Unsupported(Resource),

    /// Operation was cancelled because the session shut down.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Link dropped before the connection was confirmed.
    DroppedBeforeConfirmation,
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::DroppedBeforeConfirmation => write!(f, "link dropped before confirmation"),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a connection failure for a device.
    pub fn connection_failed(device_id: impl Into<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed {
            device_id: Some(device_id.into()),
            reason,
        }
    }
}

/// Result type alias using heartlink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
