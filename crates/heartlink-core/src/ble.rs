//! btleplug-backed radio stack.
//!
//! [`BleRadio`] implements [`RadioStack`] on a btleplug [`Adapter`]. Link
//! operations run in background tasks and report back through the radio
//! event channel; one long-lived task watches the adapter for discoveries
//! and link loss.
//!
//! Which characteristics carry which stream is described by a
//! [`GattProfile`]. Heart rate, battery and device information use the
//! standard Bluetooth SIG characteristics; the ECG stream uses a vendor
//! service with a data characteristic and a control point.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use heartlink_types::{DeviceInfo, HeartRateReading, uuids};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::events::{
    ApiEvent, DeviceEvent, DeviceId, DiscoveredDevice, OperationEvent, RadioEvent,
    RadioEventReceiver, RadioEventSender, Resource, ResourceValue, StreamKind, Subscription,
    radio_channel,
};
use crate::traits::RadioStack;
use crate::util::create_identifier;

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// GATT layout of a sensor family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    /// ECG frame notifications.
    pub ecg_data: Uuid,
    /// ECG control point.
    pub ecg_control: Uuid,
    /// Opcode written to the control point to start streaming.
    pub ecg_start_opcode: u8,
    /// Opcode written to the control point to stop streaming.
    pub ecg_stop_opcode: u8,
    pub heart_rate_measurement: Uuid,
    pub battery_level: Uuid,
    pub manufacturer_name: Uuid,
    pub model_number: Uuid,
    pub serial_number: Uuid,
    pub firmware_revision: Uuid,
    /// Only peripherals advertising one of these services are reported by
    /// discovery. Empty reports every peripheral.
    pub advertised_services: Vec<Uuid>,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            ecg_data: uuids::ECG_DATA,
            ecg_control: uuids::ECG_CONTROL,
            ecg_start_opcode: 0x01,
            ecg_stop_opcode: 0x00,
            heart_rate_measurement: uuids::HEART_RATE_MEASUREMENT,
            battery_level: uuids::BATTERY_LEVEL,
            manufacturer_name: uuids::MANUFACTURER_NAME,
            model_number: uuids::MODEL_NUMBER,
            serial_number: uuids::SERIAL_NUMBER,
            firmware_revision: uuids::FIRMWARE_REVISION,
            advertised_services: vec![uuids::ECG_SERVICE, uuids::HEART_RATE_SERVICE],
        }
    }
}

impl GattProfile {
    /// Control-point command starting the ECG stream: the start opcode
    /// followed by the sampling frequency as little-endian u16.
    pub fn ecg_start_command(&self, frequency_hz: u16) -> Vec<u8> {
        let mut command = vec![self.ecg_start_opcode];
        command.extend_from_slice(&frequency_hz.to_le_bytes());
        command
    }

    /// Control-point command stopping the ECG stream.
    pub fn ecg_stop_command(&self) -> Vec<u8> {
        vec![self.ecg_stop_opcode]
    }

    /// Whether an advertisement listing `services` should be reported.
    pub fn matches_advertisement(&self, services: &[Uuid]) -> bool {
        self.advertised_services.is_empty()
            || services
                .iter()
                .any(|uuid| self.advertised_services.contains(uuid))
    }

    /// Turn a notification into a resource value, if it belongs to a stream
    /// this profile knows.
    fn notification_value(&self, notification: ValueNotification) -> Option<ResourceValue> {
        if notification.uuid == self.ecg_data {
            Some(ResourceValue::EcgFrame(Bytes::from(notification.value)))
        } else if notification.uuid == self.heart_rate_measurement {
            match HeartRateReading::from_measurement(&notification.value) {
                Ok(reading) => Some(ResourceValue::HeartRate(reading)),
                Err(e) => {
                    debug!(error = %e, "Dropping malformed heart rate measurement");
                    None
                }
            }
        } else if notification.uuid == self.battery_level {
            notification.value.first().copied().map(ResourceValue::Battery)
        } else {
            None
        }
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or(Error::ConnectionFailed {
        device_id: None,
        reason: ConnectionFailureReason::AdapterUnavailable,
    })
}

#[derive(Default)]
struct Registry {
    peripherals: HashMap<String, Peripheral>,
    identifiers: HashMap<PeripheralId, String>,
    connected: HashSet<String>,
    pumps: HashMap<String, JoinHandle<()>>,
}

impl Registry {
    fn insert(&mut self, identifier: String, peripheral: Peripheral) {
        self.identifiers
            .insert(peripheral.id(), identifier.clone());
        self.peripherals.insert(identifier, peripheral);
    }

    fn stop_pump(&mut self, identifier: &str) {
        if let Some(pump) = self.pumps.remove(identifier) {
            pump.abort();
        }
    }
}

/// Radio stack backed by a btleplug adapter.
pub struct BleRadio {
    adapter: Adapter,
    profile: Arc<GattProfile>,
    events: RadioEventSender,
    registry: Arc<Mutex<Registry>>,
    discovering: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

impl std::fmt::Debug for BleRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleRadio")
            .field("profile", &self.profile)
            .field("discovering", &self.discovering.load(Ordering::Relaxed))
            .finish()
    }
}

impl BleRadio {
    /// Open the first Bluetooth adapter.
    pub async fn new(profile: GattProfile) -> Result<(Self, RadioEventReceiver)> {
        let adapter = get_adapter().await?;
        Self::with_adapter(adapter, profile).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(
        adapter: Adapter,
        profile: GattProfile,
    ) -> Result<(Self, RadioEventReceiver)> {
        let (events, receiver) = radio_channel();
        let central_events = adapter.events().await?;
        let profile = Arc::new(profile);
        let registry = Arc::new(Mutex::new(Registry::default()));
        let discovering = Arc::new(AtomicBool::new(false));

        let watcher = AdapterWatcher {
            adapter: adapter.clone(),
            profile: Arc::clone(&profile),
            events: events.clone(),
            registry: Arc::clone(&registry),
            discovering: Arc::clone(&discovering),
        };
        let watcher = tokio::spawn(watcher.run(central_events));

        Ok((
            Self {
                adapter,
                profile,
                events,
                registry,
                discovering,
                watcher,
            },
            receiver,
        ))
    }

    /// The profile in use.
    pub fn profile(&self) -> &GattProfile {
        &self.profile
    }

    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    /// Find the peripheral for `device`, falling back to the adapter's own
    /// list for devices not seen by this radio's discovery.
    async fn peripheral(&self, device: &DeviceId) -> Result<Peripheral> {
        if let Some(peripheral) = lock(&self.registry).peripherals.get(&device.id) {
            return Ok(peripheral.clone());
        }

        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let identifier = create_identifier(&properties.address.to_string(), &peripheral.id());
            if identifier.eq_ignore_ascii_case(&device.id) {
                lock(&self.registry).insert(device.id.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }
        Err(Error::DeviceNotFound(device.id.clone()))
    }

    async fn read_battery(&self, peripheral: &Peripheral) -> Result<u8> {
        let characteristic = characteristic(peripheral, self.profile.battery_level)?;
        let data = peripheral.read(&characteristic).await?;
        data.first()
            .copied()
            .ok_or_else(|| Error::Radio("empty battery level".to_string()))
    }

    async fn read_device_info(&self, peripheral: &Peripheral) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            manufacturer: read_string(peripheral, self.profile.manufacturer_name).await?,
            model: read_string(peripheral, self.profile.model_number).await?,
            serial: read_string(peripheral, self.profile.serial_number).await?,
            firmware: read_string(peripheral, self.profile.firmware_revision).await?,
        })
    }
}

impl Drop for BleRadio {
    fn drop(&mut self) {
        self.watcher.abort();
        let mut registry = lock(&self.registry);
        for (_, pump) in registry.pumps.drain() {
            pump.abort();
        }
    }
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| Error::CharacteristicNotFound(uuid.to_string()))
}

/// Read a UTF-8 string characteristic. Missing characteristics read as
/// empty.
async fn read_string(peripheral: &Peripheral, uuid: Uuid) -> Result<String> {
    let Ok(characteristic) = characteristic(peripheral, uuid) else {
        return Ok(String::new());
    };
    let data = peripheral.read(&characteristic).await?;
    Ok(String::from_utf8_lossy(&data)
        .trim_end_matches('\0')
        .trim()
        .to_string())
}

async fn open_link(peripheral: &Peripheral) -> btleplug::Result<NotificationStream> {
    peripheral.connect().await?;
    peripheral.discover_services().await?;
    peripheral.notifications().await
}

async fn pump_notifications(
    device: DeviceId,
    mut notifications: NotificationStream,
    profile: Arc<GattProfile>,
    events: RadioEventSender,
) {
    while let Some(notification) = notifications.next().await {
        let Some(value) = profile.notification_value(notification) else {
            continue;
        };
        let event = RadioEvent::Operation(OperationEvent::Notification {
            device: device.clone(),
            value,
        });
        if events.send(event).is_err() {
            break;
        }
    }
    debug!(device = %device, "Notification stream ended");
}

/// Watches adapter-wide events for discoveries and link loss.
struct AdapterWatcher {
    adapter: Adapter,
    profile: Arc<GattProfile>,
    events: RadioEventSender,
    registry: Arc<Mutex<Registry>>,
    discovering: Arc<AtomicBool>,
}

impl AdapterWatcher {
    async fn run(self, mut central_events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>) {
        while let Some(event) = central_events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    if self.discovering.load(Ordering::Relaxed) {
                        self.report_discovered(&id).await;
                    }
                }
                CentralEvent::DeviceDisconnected(id) => self.report_link_lost(&id),
                _ => {}
            }
        }
        debug!("Adapter event stream ended");
    }

    async fn report_discovered(&self, id: &PeripheralId) {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!(error = %e, "Discovered peripheral vanished");
                return;
            }
        };
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "Could not read peripheral properties");
                return;
            }
        };
        if !self.profile.matches_advertisement(&properties.services) {
            return;
        }

        let identifier = create_identifier(&properties.address.to_string(), id);
        lock(&self.registry).insert(identifier.clone(), peripheral);

        let device = DeviceId {
            id: identifier,
            name: properties.local_name,
        };
        let _ = self
            .events
            .send(RadioEvent::Api(ApiEvent::Discovered(DiscoveredDevice {
                device,
                rssi: properties.rssi,
            })));
    }

    fn report_link_lost(&self, id: &PeripheralId) {
        let identifier = {
            let mut registry = lock(&self.registry);
            let Some(identifier) = registry.identifiers.get(id).cloned() else {
                return;
            };
            // Whoever removes the link from `connected` reports it.
            if !registry.connected.remove(&identifier) {
                return;
            }
            registry.stop_pump(&identifier);
            identifier
        };
        warn!(device = %identifier, "Link lost");
        let _ = self
            .events
            .send(RadioEvent::Device(DeviceEvent::Disconnected(DeviceId::new(
                identifier,
            ))));
    }
}

#[async_trait]
impl RadioStack for BleRadio {
    async fn start_discovery(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        self.discovering.store(true, Ordering::Relaxed);
        info!("BLE discovery started");
        self.emit(RadioEvent::Api(ApiEvent::DiscoveryStarted));
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.discovering.store(false, Ordering::Relaxed);
        self.adapter.stop_scan().await?;
        info!("BLE discovery stopped");
        self.emit(RadioEvent::Api(ApiEvent::DiscoveryStopped));
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        let device = device.clone();
        let events = self.events.clone();
        let registry = Arc::clone(&self.registry);
        let profile = Arc::clone(&self.profile);

        tokio::spawn(async move {
            match open_link(&peripheral).await {
                Ok(notifications) => {
                    let pump = tokio::spawn(pump_notifications(
                        device.clone(),
                        notifications,
                        profile,
                        events.clone(),
                    ));
                    {
                        let mut registry = lock(&registry);
                        registry.stop_pump(&device.id);
                        registry.connected.insert(device.id.clone());
                        registry.pumps.insert(device.id.clone(), pump);
                    }
                    let _ = events.send(RadioEvent::Device(DeviceEvent::Connected(device)));
                }
                Err(e) => {
                    let _ = events.send(RadioEvent::Device(DeviceEvent::Error {
                        device,
                        error: e.to_string(),
                    }));
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        let device = device.clone();
        let events = self.events.clone();
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            // Stop notifications first so none follow the disconnect event.
            let was_linked = {
                let mut registry = lock(&registry);
                registry.stop_pump(&device.id);
                registry.connected.contains(&device.id)
            };
            match peripheral.disconnect().await {
                Ok(()) => {
                    let still_linked = lock(&registry).connected.remove(&device.id);
                    if still_linked || !was_linked {
                        let _ =
                            events.send(RadioEvent::Device(DeviceEvent::Disconnected(device)));
                    }
                }
                Err(e) => {
                    let _ = events.send(RadioEvent::Device(DeviceEvent::Error {
                        device,
                        error: e.to_string(),
                    }));
                }
            }
        });
        Ok(())
    }

    async fn request(&self, device: &DeviceId, resource: Resource) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        let value = match resource {
            Resource::Battery => self.read_battery(&peripheral).await.map(ResourceValue::Battery),
            Resource::DeviceInfo => self
                .read_device_info(&peripheral)
                .await
                .map(ResourceValue::DeviceInfo),
            Resource::Ecg | Resource::HeartRate => return Err(Error::Unsupported(resource)),
        };

        let event = match value {
            Ok(value) => OperationEvent::Response {
                device: device.clone(),
                value,
            },
            Err(e) => OperationEvent::Failed {
                device: device.clone(),
                resource,
                error: e.to_string(),
            },
        };
        self.emit(RadioEvent::Operation(event));
        Ok(())
    }

    async fn subscribe(&self, device: &DeviceId, subscription: Subscription) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        match subscription {
            Subscription::Ecg { frequency_hz } => {
                let data = characteristic(&peripheral, self.profile.ecg_data)?;
                let control = characteristic(&peripheral, self.profile.ecg_control)?;
                peripheral.subscribe(&data).await?;
                peripheral
                    .write(
                        &control,
                        &self.profile.ecg_start_command(frequency_hz),
                        WriteType::WithResponse,
                    )
                    .await?;
            }
            Subscription::HeartRate => {
                let measurement = characteristic(&peripheral, self.profile.heart_rate_measurement)?;
                peripheral.subscribe(&measurement).await?;
            }
        }
        debug!(device = %device, ?subscription, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, device: &DeviceId, kind: StreamKind) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        match kind {
            StreamKind::Ecg => {
                let control = characteristic(&peripheral, self.profile.ecg_control)?;
                peripheral
                    .write(
                        &control,
                        &self.profile.ecg_stop_command(),
                        WriteType::WithResponse,
                    )
                    .await?;
                let data = characteristic(&peripheral, self.profile.ecg_data)?;
                peripheral.unsubscribe(&data).await?;
            }
            StreamKind::HeartRate => {
                let measurement = characteristic(&peripheral, self.profile.heart_rate_measurement)?;
                peripheral.unsubscribe(&measurement).await?;
            }
        }
        debug!(device = %device, ?kind, "Unsubscribed");
        Ok(())
    }
}
