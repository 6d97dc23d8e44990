//! Mock radio implementation for testing.
//!
//! This module provides a mock radio stack that can be used for unit testing
//! without requiring actual BLE hardware.
//!
//! The [`MockRadio`] implements the [`RadioStack`] trait, so a
//! [`DeviceSession`](crate::DeviceSession) can run on it unchanged.
//!
//! # Features
//!
//! - **Auto or manual confirmation**: connects and disconnects are confirmed
//!   immediately, or only when the test calls [`MockRadio::confirm_connect`]
//! - **Failure injection**: fail every call, or report a device error for the
//!   next connect
//! - **Latency simulation**: delay connects to exercise timeouts
//! - **Notification injection**: push ECG frames and heart-rate readings as if
//!   the sensor had sent them

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;

use heartlink_types::{DeviceInfo, EcgPacket, HeartRateReading};

use crate::error::{Error, Result};
use crate::events::{
    ApiEvent, DeviceEvent, DeviceId, DiscoveredDevice, OperationEvent, RadioEvent,
    RadioEventReceiver, RadioEventSender, Resource, ResourceValue, StreamKind, Subscription,
    radio_channel,
};
use crate::traits::RadioStack;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A mock radio stack for testing.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use heartlink_core::{DeviceId, DeviceSession, MockRadioBuilder, SessionConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let (radio, events) = MockRadioBuilder::new().battery(90).build();
///     let session = DeviceSession::new(Arc::new(radio), events, SessionConfig::default()).unwrap();
///
///     let device = DeviceId::new("MOCK-000001");
///     session.connect(&device).await.unwrap();
///     assert_eq!(session.get_battery(&device).await.unwrap(), 90);
/// }
/// ```
pub struct MockRadio {
    events: RadioEventSender,
    auto_confirm: AtomicBool,
    auto_respond: AtomicBool,
    battery: AtomicU8,
    device_info: Mutex<DeviceInfo>,
    nearby: Mutex<Vec<DiscoveredDevice>>,
    subscriptions: Mutex<Vec<Subscription>>,
    should_fail: AtomicBool,
    fail_message: Mutex<String>,
    /// Reported as a device error for the next confirmed connect.
    connect_error: Mutex<Option<String>>,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
    discovering: AtomicBool,
    connect_count: AtomicU32,
    disconnect_count: AtomicU32,
    request_count: AtomicU32,
}

impl std::fmt::Debug for MockRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRadio")
            .field("auto_confirm", &self.auto_confirm.load(Ordering::Relaxed))
            .field("connect_count", &self.connect_count())
            .field("discovering", &self.is_discovering())
            .finish()
    }
}

impl MockRadio {
    /// Create a mock radio with default settings.
    pub fn new() -> (Self, RadioEventReceiver) {
        MockRadioBuilder::new().build()
    }

    fn emit(&self, event: RadioEvent) {
        // The session owning the receiver may already be gone.
        let _ = self.events.send(event);
    }

    fn check_should_fail(&self) -> Result<()> {
        if self.should_fail.load(Ordering::Relaxed) {
            Err(Error::Radio(lock(&self.fail_message).clone()))
        } else {
            Ok(())
        }
    }

    /// Inject an arbitrary radio event.
    pub fn inject(&self, event: RadioEvent) {
        self.emit(event);
    }

    /// Confirm a pending connect.
    pub fn confirm_connect(&self, device: &DeviceId) {
        self.emit(RadioEvent::Device(DeviceEvent::Connected(device.clone())));
    }

    /// Confirm a pending disconnect.
    pub fn confirm_disconnect(&self, device: &DeviceId) {
        self.emit(RadioEvent::Device(DeviceEvent::Disconnected(
            device.clone(),
        )));
    }

    /// Report a link drop the session did not ask for.
    pub fn drop_link(&self, device: &DeviceId) {
        lock(&self.subscriptions).clear();
        self.confirm_disconnect(device);
    }

    /// Report a device error.
    pub fn fail_device(&self, device: &DeviceId, error: &str) {
        self.emit(RadioEvent::Device(DeviceEvent::Error {
            device: device.clone(),
            error: error.to_string(),
        }));
    }

    /// Push a raw ECG frame as a notification.
    pub fn notify_ecg(&self, device: &DeviceId, frame: impl Into<Bytes>) {
        self.emit(RadioEvent::Operation(OperationEvent::Notification {
            device: device.clone(),
            value: ResourceValue::EcgFrame(frame.into()),
        }));
    }

    /// Push `count` well-formed ECG frames with random samples, starting at
    /// sequence number `first_sequence`. Returns the packets sent.
    pub fn notify_synthetic_ecg(
        &self,
        device: &DeviceId,
        first_sequence: u32,
        count: usize,
    ) -> Vec<EcgPacket> {
        let mut rng = rand::rng();
        (0..count)
            .map(|i| {
                let sequence = first_sequence.wrapping_add(i as u32);
                let packet = EcgPacket::with_samples(
                    sequence,
                    [rng.random_range(-2048..2048), rng.random_range(-2048..2048)],
                );
                self.notify_ecg(device, packet.encode());
                packet
            })
            .collect()
    }

    /// Push a heart-rate reading as a notification.
    pub fn notify_heart_rate(&self, device: &DeviceId, reading: HeartRateReading) {
        self.emit(RadioEvent::Operation(OperationEvent::Notification {
            device: device.clone(),
            value: ResourceValue::HeartRate(reading),
        }));
    }

    /// Set whether connects and disconnects are confirmed automatically.
    pub fn set_auto_confirm(&self, auto: bool) {
        self.auto_confirm.store(auto, Ordering::Relaxed);
    }

    /// Set the battery level reported to requests.
    pub fn set_battery(&self, level: u8) {
        self.battery.store(level, Ordering::Relaxed);
    }

    /// Set whether every call should fail immediately.
    pub fn set_should_fail(&self, fail: bool, message: Option<&str>) {
        self.should_fail.store(fail, Ordering::Relaxed);
        if let Some(msg) = message {
            *lock(&self.fail_message) = msg.to_string();
        }
    }

    /// Report a device error instead of confirming the next connect.
    pub fn fail_next_connect(&self, error: &str) {
        *lock(&self.connect_error) = Some(error.to_string());
    }

    /// Set simulated connect latency.
    ///
    /// Set to `Duration::ZERO` to disable latency simulation.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Get the number of connect calls.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// Get the number of disconnect calls.
    pub fn disconnect_count(&self) -> u32 {
        self.disconnect_count.load(Ordering::Relaxed)
    }

    /// Get the number of one-shot requests.
    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Active subscriptions, at most one per stream kind.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.subscriptions).clone()
    }

    /// Whether discovery is running.
    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RadioStack for MockRadio {
    async fn start_discovery(&self) -> Result<()> {
        self.check_should_fail()?;
        self.discovering.store(true, Ordering::Relaxed);
        self.emit(RadioEvent::Api(ApiEvent::DiscoveryStarted));
        let nearby = lock(&self.nearby).clone();
        for found in nearby {
            self.emit(RadioEvent::Api(ApiEvent::Discovered(found)));
        }
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.discovering.store(false, Ordering::Relaxed);
        self.emit(RadioEvent::Api(ApiEvent::DiscoveryStopped));
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::Relaxed);

        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        self.check_should_fail()?;
        if self.auto_confirm.load(Ordering::Relaxed) {
            match lock(&self.connect_error).take() {
                Some(error) => self.fail_device(device, &error),
                None => self.confirm_connect(device),
            }
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        self.disconnect_count.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail()?;
        lock(&self.subscriptions).clear();
        if self.auto_confirm.load(Ordering::Relaxed) {
            self.confirm_disconnect(device);
        }
        Ok(())
    }

    async fn request(&self, device: &DeviceId, resource: Resource) -> Result<()> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail()?;
        if !self.auto_respond.load(Ordering::Relaxed) {
            return Ok(());
        }

        let value = match resource {
            Resource::Battery => ResourceValue::Battery(self.battery.load(Ordering::Relaxed)),
            Resource::DeviceInfo => ResourceValue::DeviceInfo(lock(&self.device_info).clone()),
            Resource::Ecg | Resource::HeartRate => return Err(Error::Unsupported(resource)),
        };
        self.emit(RadioEvent::Operation(OperationEvent::Response {
            device: device.clone(),
            value,
        }));
        Ok(())
    }

    async fn subscribe(&self, _device: &DeviceId, subscription: Subscription) -> Result<()> {
        self.check_should_fail()?;
        let mut subscriptions = lock(&self.subscriptions);
        subscriptions.retain(|s| s.kind() != subscription.kind());
        subscriptions.push(subscription);
        Ok(())
    }

    async fn unsubscribe(&self, _device: &DeviceId, kind: StreamKind) -> Result<()> {
        self.check_should_fail()?;
        lock(&self.subscriptions).retain(|s| s.kind() != kind);
        Ok(())
    }
}

/// Builder for creating mock radios with custom settings.
#[derive(Debug, Clone)]
pub struct MockRadioBuilder {
    auto_confirm: bool,
    auto_respond: bool,
    battery: u8,
    device_info: DeviceInfo,
    nearby: Vec<DiscoveredDevice>,
}

impl Default for MockRadioBuilder {
    fn default() -> Self {
        Self {
            auto_confirm: true,
            auto_respond: true,
            battery: 85,
            device_info: DeviceInfo {
                manufacturer: "Mock".to_string(),
                model: "Mock ECG Patch".to_string(),
                serial: "MOCK-12345".to_string(),
                firmware: "1.0.0".to_string(),
            },
            nearby: Vec::new(),
        }
    }
}

impl MockRadioBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirm connects and disconnects automatically (default: true).
    #[must_use]
    pub fn auto_confirm(mut self, auto: bool) -> Self {
        self.auto_confirm = auto;
        self
    }

    /// Answer battery and device info requests automatically (default: true).
    #[must_use]
    pub fn auto_respond(mut self, auto: bool) -> Self {
        self.auto_respond = auto;
        self
    }

    /// Set the battery level.
    #[must_use]
    pub fn battery(mut self, level: u8) -> Self {
        self.battery = level;
        self
    }

    /// Set the device information.
    #[must_use]
    pub fn device_info(mut self, info: DeviceInfo) -> Self {
        self.device_info = info;
        self
    }

    /// Add a device reported by discovery.
    #[must_use]
    pub fn nearby(mut self, found: DiscoveredDevice) -> Self {
        self.nearby.push(found);
        self
    }

    /// Add a device with a random address and signal strength.
    #[must_use]
    pub fn random_nearby(mut self, name: &str) -> Self {
        let mut rng = rand::rng();
        self.nearby.push(DiscoveredDevice {
            device: DeviceId::with_name(
                format!("MOCK-{:06X}", rng.random::<u32>() % 0xFF_FFFF),
                name,
            ),
            rssi: Some(rng.random_range(-90..-30)),
        });
        self
    }

    /// Build the mock radio and the receiver for its events.
    pub fn build(self) -> (MockRadio, RadioEventReceiver) {
        let (events, receiver) = radio_channel();
        let radio = MockRadio {
            events,
            auto_confirm: AtomicBool::new(self.auto_confirm),
            auto_respond: AtomicBool::new(self.auto_respond),
            battery: AtomicU8::new(self.battery),
            device_info: Mutex::new(self.device_info),
            nearby: Mutex::new(self.nearby),
            subscriptions: Mutex::new(Vec::new()),
            should_fail: AtomicBool::new(false),
            fail_message: Mutex::new("Mock failure".to_string()),
            connect_error: Mutex::new(None),
            connect_latency_ms: AtomicU64::new(0),
            discovering: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            request_count: AtomicU32::new(0),
        };
        (radio, receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use heartlink_types::packet;

    #[tokio::test]
    async fn test_auto_confirm_connect() {
        let (radio, mut events) = MockRadio::new();
        let device = DeviceId::new("MOCK-1");
        radio.connect(&device).await.unwrap();

        assert_eq!(radio.connect_count(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            RadioEvent::Device(DeviceEvent::Connected(device))
        );
    }

    #[tokio::test]
    async fn test_manual_confirm_emits_nothing() {
        let (radio, mut events) = MockRadioBuilder::new().auto_confirm(false).build();
        radio.connect(&DeviceId::new("MOCK-1")).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_next_connect() {
        let (radio, mut events) = MockRadio::new();
        let device = DeviceId::new("MOCK-1");
        radio.fail_next_connect("out of range");
        radio.connect(&device).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            RadioEvent::Device(DeviceEvent::Error { ref error, .. }) if error == "out of range"
        ));

        // Only the next connect fails.
        radio.connect(&device).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            RadioEvent::Device(DeviceEvent::Connected(_))
        ));
    }

    #[tokio::test]
    async fn test_should_fail() {
        let (radio, _events) = MockRadio::new();
        radio.set_should_fail(true, Some("boom"));
        let err = radio.connect(&DeviceId::new("MOCK-1")).await.unwrap_err();
        assert_eq!(err.to_string(), "Radio error: boom");
    }

    #[tokio::test]
    async fn test_request_unsupported_resource() {
        let (radio, _events) = MockRadio::new();
        let result = radio.request(&DeviceId::new("MOCK-1"), Resource::Ecg).await;
        assert!(matches!(result, Err(Error::Unsupported(Resource::Ecg))));
    }

    #[tokio::test]
    async fn test_discovery_reports_nearby() {
        let (radio, mut events) = MockRadioBuilder::new().random_nearby("Patch").build();
        radio.start_discovery().await.unwrap();
        assert!(radio.is_discovering());

        assert_eq!(
            events.recv().await.unwrap(),
            RadioEvent::Api(ApiEvent::DiscoveryStarted)
        );
        match events.recv().await.unwrap() {
            RadioEvent::Api(ApiEvent::Discovered(found)) => {
                assert!(found.device.id.starts_with("MOCK-"));
                assert_eq!(found.device.name.as_deref(), Some("Patch"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_synthetic_ecg_frames_decode() {
        let (radio, mut events) = MockRadio::new();
        let device = DeviceId::new("MOCK-1");
        let sent = radio.notify_synthetic_ecg(&device, 10, 3);
        assert_eq!(sent.len(), 3);

        for expected in sent {
            match events.recv().await.unwrap() {
                RadioEvent::Operation(OperationEvent::Notification {
                    value: ResourceValue::EcgFrame(frame),
                    ..
                }) => {
                    let packet = packet::decode_verified(&frame).unwrap();
                    assert_eq!(packet.sequence, expected.sequence);
                    assert_eq!(packet.samples, expected.samples);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }
}
