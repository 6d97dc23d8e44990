//! Trait abstraction over the BLE radio.
//!
//! This module provides the [`RadioStack`] trait that abstracts over the
//! btleplug adapter ([`crate::ble::BleRadio`]) and the in-memory
//! [`crate::mock::MockRadio`] used in tests.

use async_trait::async_trait;

use crate::error::Result;
use crate::events::{DeviceId, Resource, StreamKind, Subscription};

/// Capability interface of a BLE radio.
///
/// Every method only *issues* an operation. Its outcome is reported later as
/// a [`RadioEvent`](crate::events::RadioEvent) on the channel the stack was
/// created with, in the order the stack observed it. An `Err` from a method
/// means the operation could not be issued at all.
///
/// # Example
///
/// ```ignore
/// use heartlink_core::{DeviceId, RadioStack, Resource, Result};
///
/// async fn poll_battery<R: RadioStack>(radio: &R, device: &DeviceId) -> Result<()> {
///     // The level arrives as an OperationEvent::Response.
///     radio.request(device, Resource::Battery).await
/// }
/// ```
#[async_trait]
pub trait RadioStack: Send + Sync {
    /// Start reporting nearby devices as `ApiEvent::Discovered`.
    async fn start_discovery(&self) -> Result<()>;

    /// Stop reporting nearby devices.
    async fn stop_discovery(&self) -> Result<()>;

    /// Open a link. Confirmed by `DeviceEvent::Connected` or failed by
    /// `DeviceEvent::Error`.
    async fn connect(&self, device: &DeviceId) -> Result<()>;

    /// Close a link. Confirmed by `DeviceEvent::Disconnected`.
    async fn disconnect(&self, device: &DeviceId) -> Result<()>;

    /// Read a resource once. Answered by `OperationEvent::Response` or
    /// `OperationEvent::Failed`.
    async fn request(&self, device: &DeviceId, resource: Resource) -> Result<()>;

    /// Start notifications. Values arrive as `OperationEvent::Notification`.
    async fn subscribe(&self, device: &DeviceId, subscription: Subscription) -> Result<()>;

    /// Stop notifications.
    async fn unsubscribe(&self, device: &DeviceId, kind: StreamKind) -> Result<()>;
}
