//! Events delivered by a radio stack.
//!
//! A [`RadioStack`](crate::traits::RadioStack) reports everything it observes
//! as a [`RadioEvent`] on a single unbounded channel. Events are grouped by
//! level: adapter-wide ([`ApiEvent`]), per-device link changes
//! ([`DeviceEvent`]) and per-operation results ([`OperationEvent`]).
//!
//! Events for one device arrive in the order the stack emitted them. In
//! particular a stack must emit a device's last notification before its
//! [`DeviceEvent::Disconnected`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use heartlink_types::{DeviceInfo, HeartRateReading};

/// Device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Unique identifier (peripheral ID or MAC address).
    pub id: String,
    /// Advertised name if known.
    pub name: Option<String>,
}

impl DeviceId {
    /// Create a new device ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Create a device ID with name.
    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }

    /// Whether two IDs refer to the same device, ignoring names.
    pub fn same_device(&self, other: &DeviceId) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub device: DeviceId,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// Something that can be read from, or subscribed to on, a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Ecg,
    HeartRate,
    Battery,
    DeviceInfo,
}

/// A notification stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Ecg,
    HeartRate,
}

impl From<StreamKind> for Resource {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Ecg => Resource::Ecg,
            StreamKind::HeartRate => Resource::HeartRate,
        }
    }
}

/// A subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// Raw ECG frames at the given sampling frequency.
    Ecg { frequency_hz: u16 },
    /// Heart Rate Measurement notifications.
    HeartRate,
}

impl Subscription {
    /// The stream this subscription opens.
    pub fn kind(&self) -> StreamKind {
        match self {
            Subscription::Ecg { .. } => StreamKind::Ecg,
            Subscription::HeartRate => StreamKind::HeartRate,
        }
    }
}

/// A value read from, or notified by, a device.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceValue {
    /// One undecoded ECG frame.
    EcgFrame(Bytes),
    HeartRate(HeartRateReading),
    /// Battery level in percent.
    Battery(u8),
    DeviceInfo(DeviceInfo),
}

impl ResourceValue {
    /// The resource this value belongs to.
    pub fn resource(&self) -> Resource {
        match self {
            ResourceValue::EcgFrame(_) => Resource::Ecg,
            ResourceValue::HeartRate(_) => Resource::HeartRate,
            ResourceValue::Battery(_) => Resource::Battery,
            ResourceValue::DeviceInfo(_) => Resource::DeviceInfo,
        }
    }
}

/// Adapter-wide events.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ApiEvent {
    DiscoveryStarted,
    Discovered(DiscoveredDevice),
    DiscoveryStopped,
    /// The adapter failed outside of any device operation.
    AdapterError(String),
}

/// Link-level events for a single device.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DeviceEvent {
    Connected(DeviceId),
    Disconnected(DeviceId),
    /// The device's pending connect or disconnect failed.
    Error { device: DeviceId, error: String },
}

/// Results of reads and subscriptions.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum OperationEvent {
    /// Answer to a [`RadioStack::request`](crate::traits::RadioStack::request).
    Response {
        device: DeviceId,
        value: ResourceValue,
    },
    /// A request could not be served.
    Failed {
        device: DeviceId,
        resource: Resource,
        error: String,
    },
    /// Unsolicited value on a subscribed stream.
    Notification {
        device: DeviceId,
        value: ResourceValue,
    },
}

/// Everything a radio stack can report.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Api(ApiEvent),
    Device(DeviceEvent),
    Operation(OperationEvent),
}

impl RadioEvent {
    /// The device this event concerns, if any.
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            RadioEvent::Api(ApiEvent::Discovered(found)) => Some(&found.device),
            RadioEvent::Api(_) => None,
            RadioEvent::Device(
                DeviceEvent::Connected(device)
                | DeviceEvent::Disconnected(device)
                | DeviceEvent::Error { device, .. },
            ) => Some(device),
            RadioEvent::Operation(
                OperationEvent::Response { device, .. }
                | OperationEvent::Failed { device, .. }
                | OperationEvent::Notification { device, .. },
            ) => Some(device),
        }
    }
}

/// Sending half of a radio event channel.
pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;

/// Receiving half of a radio event channel.
pub type RadioEventReceiver = mpsc::UnboundedReceiver<RadioEvent>;

/// Create the channel a radio stack reports on.
pub fn radio_channel() -> (RadioEventSender, RadioEventReceiver) {
    mpsc::unbounded_channel()
}
