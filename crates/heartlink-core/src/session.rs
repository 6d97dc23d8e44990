//! Device session state machine.
//!
//! A [`DeviceSession`] owns the conversation with one sensor over a
//! [`RadioStack`]. It issues operations on the radio and a single dispatcher
//! task turns the radio's [`RadioEvent`]s into completed operations, state
//! transitions and decoded stream values.
//!
//! ```text
//! Discovered -> Connecting -> Connected -> Subscribing -> Streaming
//!                                 |              |            |
//!                                 +-------> Disconnecting <---+
//!                                                 |
//!                                            Disconnected
//! ```
//!
//! `Errored` is reachable from any non-terminal state. A new connection
//! attempt may start from `Discovered`, `Disconnected` or `Errored`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use heartlink_types::{DeviceInfo, EcgPacket, HeartRateReading, packet};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::events::{
    ApiEvent, DeviceEvent, DeviceId, DiscoveredDevice, OperationEvent, RadioEvent,
    RadioEventReceiver, Resource, ResourceValue, StreamKind, Subscription,
};
use crate::traits::RadioStack;
use crate::util::broadcast_stream;

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Discovered,
    Connecting,
    Connected,
    Subscribing(StreamKind),
    Streaming,
    Disconnecting,
    Disconnected,
    Errored,
}

impl SessionState {
    /// Whether the link is up.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Subscribing(_) | Self::Streaming
        )
    }

    /// Whether a new connection attempt may start from this state.
    pub fn can_connect(self) -> bool {
        matches!(self, Self::Discovered | Self::Disconnected | Self::Errored)
    }
}

/// Link status projected to the shared key-value store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub connected: bool,
    /// Last reported battery level in percent.
    pub battery: Option<u8>,
}

/// A device whose connect or disconnect completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDevice {
    pub device: DeviceId,
}

/// Configuration for a [`DeviceSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `connect` waits for the radio's confirmation.
    /// Default: 15 seconds.
    pub connect_timeout: Duration,
    /// How long `disconnect` waits for the radio's confirmation.
    /// Default: 10 seconds.
    pub disconnect_timeout: Duration,
    /// Buffer of the ECG and heart-rate broadcast streams.
    /// Default: 256.
    pub stream_capacity: usize,
    /// Buffer of the discovery broadcast stream.
    /// Default: 64.
    pub discovery_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            disconnect_timeout: Duration::from_secs(10),
            stream_capacity: 256,
            discovery_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the disconnect timeout.
    #[must_use]
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the ECG and heart-rate stream capacity.
    #[must_use]
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "connect_timeout must be > 0".to_string(),
            ));
        }
        if self.disconnect_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "disconnect_timeout must be > 0".to_string(),
            ));
        }
        if self.stream_capacity == 0 || self.discovery_capacity == 0 {
            return Err(Error::InvalidConfig(
                "stream capacities must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

struct PendingOp {
    device: DeviceId,
    reply: oneshot::Sender<Result<()>>,
}

struct PendingRequest {
    id: u64,
    device: DeviceId,
    resource: Resource,
    reply: oneshot::Sender<Result<ResourceValue>>,
}

/// Subscription bookkeeping captured before a radio call, restored if the
/// call fails.
#[derive(Debug, Clone, Copy)]
struct StreamFlags {
    state: SessionState,
    ecg_frequency: Option<u16>,
    heart_rate: bool,
}

struct Inner {
    state: SessionState,
    device: Option<DeviceId>,
    pending_connect: Option<PendingOp>,
    pending_disconnect: Option<PendingOp>,
    requests: VecDeque<PendingRequest>,
    next_request: u64,
    ecg_frequency: Option<u16>,
    heart_rate: bool,
    connection: CancellationToken,
}

impl Inner {
    fn is_current(&self, device: &DeviceId) -> bool {
        self.device.as_ref().is_some_and(|d| d.same_device(device))
    }

    fn has_subscriptions(&self) -> bool {
        self.ecg_frequency.is_some() || self.heart_rate
    }

    fn is_subscribed(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Ecg => self.ecg_frequency.is_some(),
            StreamKind::HeartRate => self.heart_rate,
        }
    }

    fn stream_flags(&self) -> StreamFlags {
        StreamFlags {
            state: self.state,
            ecg_frequency: self.ecg_frequency,
            heart_rate: self.heart_rate,
        }
    }

    fn ensure_connected(&self, device: &DeviceId) -> Result<()> {
        if self.is_current(device) && self.state.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

/// State shared between the session handle and its dispatcher task.
struct Shared {
    inner: Mutex<Inner>,
    discovery: broadcast::Sender<DiscoveredDevice>,
    ecg: broadcast::Sender<EcgPacket>,
    heart_rate: broadcast::Sender<HeartRateReading>,
    state: watch::Sender<SessionState>,
    status: watch::Sender<LinkStatus>,
    dropped_frames: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, next: SessionState) {
        if inner.state != next {
            debug!(from = ?inner.state, to = ?next, "Session state change");
            inner.state = next;
            self.state.send_replace(next);
        }
    }

    /// Undo a subscription change the radio refused. A link that dropped in
    /// the meantime has already cleared everything.
    fn restore_streams(&self, device: &DeviceId, previous: StreamFlags) {
        let mut inner = self.lock();
        if inner.ensure_connected(device).is_err() {
            return;
        }
        inner.ecg_frequency = previous.ecg_frequency;
        inner.heart_rate = previous.heart_rate;
        self.set_state(&mut inner, previous.state);
    }

    fn set_connected(&self, connected: bool) {
        self.status.send_if_modified(|status| {
            let changed = status.connected != connected;
            status.connected = connected;
            changed
        });
    }

    fn set_battery(&self, level: u8) {
        self.status.send_if_modified(|status| {
            let changed = status.battery != Some(level);
            status.battery = Some(level);
            changed
        });
    }

    fn handle(&self, event: RadioEvent) {
        match event {
            RadioEvent::Api(event) => self.handle_api(event),
            RadioEvent::Device(event) => self.handle_device(event),
            RadioEvent::Operation(event) => self.handle_operation(event),
        }
    }

    fn handle_api(&self, event: ApiEvent) {
        match event {
            ApiEvent::DiscoveryStarted => debug!("Discovery started"),
            ApiEvent::Discovered(found) => {
                // No scanner listening is fine.
                let _ = self.discovery.send(found);
            }
            ApiEvent::DiscoveryStopped => debug!("Discovery stopped"),
            ApiEvent::AdapterError(error) => warn!(%error, "Adapter error"),
        }
    }

    fn handle_device(&self, event: DeviceEvent) {
        let mut inner = self.lock();
        match event {
            DeviceEvent::Connected(device) => {
                match inner
                    .pending_connect
                    .take_if(|op| op.device.same_device(&device))
                {
                    Some(op) => {
                        inner.connection = CancellationToken::new();
                        self.set_state(&mut inner, SessionState::Connected);
                        self.set_connected(true);
                        info!(device = %device, "Connected");
                        let _ = op.reply.send(Ok(()));
                    }
                    None => {
                        warn!(device = %device, "Connection confirmed with no pending connect, dropping");
                    }
                }
            }
            DeviceEvent::Disconnected(device) => {
                if !inner.is_current(&device) {
                    debug!(device = %device, "Disconnect of inactive device, ignoring");
                    return;
                }
                inner.connection.cancel();
                inner.ecg_frequency = None;
                inner.heart_rate = false;
                for request in inner.requests.drain(..) {
                    let _ = request.reply.send(Err(Error::NotConnected));
                }
                self.set_connected(false);

                if let Some(op) = inner.pending_connect.take() {
                    warn!(device = %device, "Link dropped before connection was confirmed");
                    self.set_state(&mut inner, SessionState::Errored);
                    let _ = op.reply.send(Err(Error::connection_failed(
                        device.id.clone(),
                        ConnectionFailureReason::DroppedBeforeConfirmation,
                    )));
                } else {
                    self.set_state(&mut inner, SessionState::Disconnected);
                }
                if let Some(op) = inner.pending_disconnect.take() {
                    let _ = op.reply.send(Ok(()));
                }
                info!(device = %device, "Disconnected");
            }
            DeviceEvent::Error { device, error } => {
                if let Some(op) = inner
                    .pending_connect
                    .take_if(|op| op.device.same_device(&device))
                {
                    warn!(device = %device, %error, "Connect failed");
                    self.set_state(&mut inner, SessionState::Errored);
                    let _ = op.reply.send(Err(Error::Radio(error)));
                } else if let Some(op) = inner
                    .pending_disconnect
                    .take_if(|op| op.device.same_device(&device))
                {
                    warn!(device = %device, %error, "Disconnect failed");
                    inner.connection.cancel();
                    self.set_connected(false);
                    self.set_state(&mut inner, SessionState::Errored);
                    let _ = op.reply.send(Err(Error::Radio(error)));
                } else {
                    warn!(device = %device, %error, "Device error with no pending operation, dropping");
                }
            }
        }
    }

    fn handle_operation(&self, event: OperationEvent) {
        match event {
            OperationEvent::Response { device, value } => {
                if let ResourceValue::Battery(level) = value {
                    self.set_battery(level);
                }
                let mut inner = self.lock();
                match take_request(&mut inner.requests, &device, value.resource()) {
                    Some(request) => {
                        let _ = request.reply.send(Ok(value));
                    }
                    None => debug!(device = %device, resource = ?value.resource(), "Unsolicited response, dropping"),
                }
            }
            OperationEvent::Failed {
                device,
                resource,
                error,
            } => {
                let mut inner = self.lock();
                match take_request(&mut inner.requests, &device, resource) {
                    Some(request) => {
                        debug!(device = %device, ?resource, %error, "Request failed");
                        let _ = request.reply.send(Err(Error::Radio(error)));
                    }
                    None => {
                        warn!(device = %device, ?resource, %error, "Failure for unknown request, dropping");
                    }
                }
            }
            OperationEvent::Notification { device, value } => {
                if !self.lock().is_current(&device) {
                    debug!(device = %device, "Notification from inactive device, dropping");
                    return;
                }
                self.handle_notification(value);
            }
        }
    }

    fn handle_notification(&self, value: ResourceValue) {
        match value {
            ResourceValue::EcgFrame(frame) => match packet::decode(&frame) {
                Ok(packet) => {
                    self.mark_streaming(StreamKind::Ecg);
                    // Lossy: nobody listening drops the packet.
                    let _ = self.ecg.send(packet);
                }
                Err(e) => {
                    self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, len = frame.len(), "Dropping malformed ECG frame");
                }
            },
            ResourceValue::HeartRate(reading) => {
                self.mark_streaming(StreamKind::HeartRate);
                let _ = self.heart_rate.send(reading);
            }
            ResourceValue::Battery(level) => self.set_battery(level),
            ResourceValue::DeviceInfo(_) => debug!("Unsolicited device info, ignoring"),
        }
    }

    fn mark_streaming(&self, kind: StreamKind) {
        let mut inner = self.lock();
        if inner.is_subscribed(kind)
            && matches!(
                inner.state,
                SessionState::Connected | SessionState::Subscribing(_)
            )
        {
            self.set_state(&mut inner, SessionState::Streaming);
        }
    }

    /// Drop every pending operation; their callers observe `Cancelled`.
    fn shutdown(&self) {
        let mut inner = self.lock();
        inner.pending_connect = None;
        inner.pending_disconnect = None;
        inner.requests.clear();
        inner.connection.cancel();
        self.set_connected(false);
    }

    fn abandon_connect(&self, device: &DeviceId) -> bool {
        let mut inner = self.lock();
        let abandoned = inner
            .pending_connect
            .take_if(|op| op.device.same_device(device))
            .is_some();
        if abandoned {
            self.set_state(&mut inner, SessionState::Errored);
        }
        abandoned
    }

    fn abandon_disconnect(&self, device: &DeviceId) -> bool {
        let mut inner = self.lock();
        let abandoned = inner
            .pending_disconnect
            .take_if(|op| op.device.same_device(device))
            .is_some();
        if abandoned {
            inner.connection.cancel();
            self.set_connected(false);
            self.set_state(&mut inner, SessionState::Errored);
        }
        abandoned
    }
}

fn take_request(
    requests: &mut VecDeque<PendingRequest>,
    device: &DeviceId,
    resource: Resource,
) -> Option<PendingRequest> {
    let position = requests
        .iter()
        .position(|r| r.resource == resource && r.device.same_device(device))?;
    requests.remove(position)
}

async fn run_dispatcher(
    shared: Arc<Shared>,
    mut events: RadioEventReceiver,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Session dispatcher cancelled");
                break;
            }
            event = events.recv() => match event {
                Some(event) => shared.handle(event),
                None => {
                    debug!("Radio event channel closed");
                    break;
                }
            }
        }
    }
    shared.shutdown();
}

/// A session with one sensor.
///
/// All methods take `&self`; wrap the session in an `Arc` to share it
/// between tasks. Dropping the session stops its dispatcher and cancels any
/// pending operation.
pub struct DeviceSession {
    radio: Arc<dyn RadioStack>,
    shared: Arc<Shared>,
    config: SessionConfig,
    dispatcher: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl DeviceSession {
    /// Create a session over `radio`, consuming its event channel.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        radio: Arc<dyn RadioStack>,
        events: RadioEventReceiver,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (discovery, _) = broadcast::channel(config.discovery_capacity);
        let (ecg, _) = broadcast::channel(config.stream_capacity);
        let (heart_rate, _) = broadcast::channel(config.stream_capacity);
        let (state, _) = watch::channel(SessionState::Discovered);
        let (status, _) = watch::channel(LinkStatus::default());

        // No connection yet, so the connection token starts out cancelled.
        let connection = CancellationToken::new();
        connection.cancel();

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SessionState::Discovered,
                device: None,
                pending_connect: None,
                pending_disconnect: None,
                requests: VecDeque::new(),
                next_request: 0,
                ecg_frequency: None,
                heart_rate: false,
                connection,
            }),
            discovery,
            ecg,
            heart_rate,
            state,
            status,
            dropped_frames: AtomicU64::new(0),
        });

        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::clone(&shared),
            events,
            shutdown.clone(),
        ));

        Ok(Self {
            radio,
            shared,
            config,
            dispatcher,
            shutdown,
        })
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Watch the link status (connected flag and battery level).
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status.subscribe()
    }

    /// The device of the current or last connection attempt.
    pub fn device(&self) -> Option<DeviceId> {
        self.shared.lock().device.clone()
    }

    /// Token cancelled when the current connection ends.
    ///
    /// While no connection is up the returned token is already cancelled.
    pub fn connection_token(&self) -> CancellationToken {
        self.shared.lock().connection.clone()
    }

    /// Number of ECG frames dropped because they failed to decode.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }

    /// Start discovery and stream the devices found.
    ///
    /// Every call returns a fresh stream; the same device may be reported
    /// more than once.
    pub async fn scan(&self) -> Result<BoxStream<'static, DiscoveredDevice>> {
        // Subscribe first so nothing found right after start is missed.
        let receiver = self.shared.discovery.subscribe();
        self.radio.start_discovery().await?;
        info!("Scanning for devices");
        Ok(broadcast_stream(receiver))
    }

    /// Stop discovery.
    pub async fn stop_scan(&self) -> Result<()> {
        self.radio.stop_discovery().await
    }

    /// Connect to `device`, waiting for the radio's confirmation.
    ///
    /// # Errors
    ///
    /// - [`Error::OperationPending`] if another connect is outstanding
    /// - [`Error::InvalidState`] if the session is connected or disconnecting
    /// - [`Error::Timeout`] if the radio does not answer within
    ///   [`SessionConfig::connect_timeout`]
    /// - any error the radio reports for the attempt
    pub async fn connect(&self, device: &DeviceId) -> Result<ConnectedDevice> {
        let mut reply = {
            let mut inner = self.shared.lock();
            if inner.pending_connect.is_some() {
                return Err(Error::OperationPending {
                    operation: "connect",
                });
            }
            if !inner.state.can_connect() {
                return Err(Error::InvalidState {
                    operation: "connect",
                    state: inner.state,
                });
            }
            let (tx, rx) = oneshot::channel();
            inner.pending_connect = Some(PendingOp {
                device: device.clone(),
                reply: tx,
            });
            inner.device = Some(device.clone());
            inner.ecg_frequency = None;
            inner.heart_rate = false;
            self.shared.set_state(&mut inner, SessionState::Connecting);
            rx
        };

        info!(device = %device, "Connecting");
        if let Err(e) = self.radio.connect(device).await {
            self.shared.abandon_connect(device);
            return Err(e);
        }

        let result = match tokio::time::timeout(self.config.connect_timeout, &mut reply).await {
            Ok(result) => result,
            Err(_) if self.shared.abandon_connect(device) => {
                warn!(device = %device, timeout = ?self.config.connect_timeout, "Connect timed out");
                return Err(Error::timeout("connect", self.config.connect_timeout));
            }
            // Confirmed right as the timer fired.
            Err(_) => reply.await,
        };
        result.map_err(|_| Error::Cancelled)??;

        Ok(ConnectedDevice {
            device: device.clone(),
        })
    }

    /// Disconnect from `device`, waiting for the radio's confirmation.
    ///
    /// # Errors
    ///
    /// - [`Error::OperationPending`] if another disconnect is outstanding
    /// - [`Error::NotConnected`] if `device` is not connected or connecting
    /// - [`Error::Timeout`] if the radio does not answer within
    ///   [`SessionConfig::disconnect_timeout`]
    pub async fn disconnect(&self, device: &DeviceId) -> Result<ConnectedDevice> {
        let mut reply = {
            let mut inner = self.shared.lock();
            if inner.pending_disconnect.is_some() {
                return Err(Error::OperationPending {
                    operation: "disconnect",
                });
            }
            let linked = inner.state.is_connected() || inner.state == SessionState::Connecting;
            if !inner.is_current(device) || !linked {
                return Err(Error::NotConnected);
            }
            let (tx, rx) = oneshot::channel();
            inner.pending_disconnect = Some(PendingOp {
                device: device.clone(),
                reply: tx,
            });
            self.shared
                .set_state(&mut inner, SessionState::Disconnecting);
            rx
        };

        info!(device = %device, "Disconnecting");
        if let Err(e) = self.radio.disconnect(device).await {
            self.shared.abandon_disconnect(device);
            return Err(e);
        }

        let result = match tokio::time::timeout(self.config.disconnect_timeout, &mut reply).await {
            Ok(result) => result,
            Err(_) if self.shared.abandon_disconnect(device) => {
                warn!(device = %device, timeout = ?self.config.disconnect_timeout, "Disconnect timed out");
                return Err(Error::timeout(
                    "disconnect",
                    self.config.disconnect_timeout,
                ));
            }
            Err(_) => reply.await,
        };
        result.map_err(|_| Error::Cancelled)??;

        Ok(ConnectedDevice {
            device: device.clone(),
        })
    }

    /// Start the ECG stream at `frequency_hz`, replacing any previous ECG
    /// subscription.
    pub async fn subscribe_ecg(&self, device: &DeviceId, frequency_hz: u16) -> Result<()> {
        self.subscribe(device, Subscription::Ecg { frequency_hz })
            .await
    }

    /// Stop the ECG stream.
    pub async fn unsubscribe_ecg(&self, device: &DeviceId) -> Result<()> {
        self.unsubscribe(device, StreamKind::Ecg).await
    }

    /// Start heart-rate notifications.
    pub async fn subscribe_heart_rate(&self, device: &DeviceId) -> Result<()> {
        self.subscribe(device, Subscription::HeartRate).await
    }

    /// Stop heart-rate notifications.
    pub async fn unsubscribe_heart_rate(&self, device: &DeviceId) -> Result<()> {
        self.unsubscribe(device, StreamKind::HeartRate).await
    }

    async fn subscribe(&self, device: &DeviceId, subscription: Subscription) -> Result<()> {
        let previous = {
            let mut inner = self.shared.lock();
            inner.ensure_connected(device)?;
            let previous = inner.stream_flags();
            match subscription {
                Subscription::Ecg { frequency_hz } => inner.ecg_frequency = Some(frequency_hz),
                Subscription::HeartRate => inner.heart_rate = true,
            }
            if inner.state == SessionState::Connected {
                self.shared
                    .set_state(&mut inner, SessionState::Subscribing(subscription.kind()));
            }
            previous
        };
        debug!(device = %device, ?subscription, "Subscribing");
        let result = self.radio.subscribe(device, subscription).await;
        if let Err(e) = &result {
            warn!(device = %device, ?subscription, error = %e, "Subscribe failed");
            self.shared.restore_streams(device, previous);
        }
        result
    }

    async fn unsubscribe(&self, device: &DeviceId, kind: StreamKind) -> Result<()> {
        let previous = {
            let mut inner = self.shared.lock();
            inner.ensure_connected(device)?;
            let previous = inner.stream_flags();
            match kind {
                StreamKind::Ecg => inner.ecg_frequency = None,
                StreamKind::HeartRate => inner.heart_rate = false,
            }
            if !inner.has_subscriptions() {
                self.shared.set_state(&mut inner, SessionState::Connected);
            }
            previous
        };
        debug!(device = %device, ?kind, "Unsubscribing");
        let result = self.radio.unsubscribe(device, kind).await;
        if let Err(e) = &result {
            warn!(device = %device, ?kind, error = %e, "Unsubscribe failed");
            self.shared.restore_streams(device, previous);
        }
        result
    }

    /// Read the battery level in percent.
    ///
    /// There is no internal timeout; the call completes when the radio
    /// answers or the link drops.
    pub async fn get_battery(&self, device: &DeviceId) -> Result<u8> {
        match self.request(device, Resource::Battery).await? {
            ResourceValue::Battery(level) => Ok(level),
            other => Err(unexpected(other)),
        }
    }

    /// Read the device information strings.
    pub async fn get_device_info(&self, device: &DeviceId) -> Result<DeviceInfo> {
        match self.request(device, Resource::DeviceInfo).await? {
            ResourceValue::DeviceInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&self, device: &DeviceId, resource: Resource) -> Result<ResourceValue> {
        let (id, reply) = {
            let mut inner = self.shared.lock();
            inner.ensure_connected(device)?;
            let id = inner.next_request;
            inner.next_request += 1;
            let (tx, rx) = oneshot::channel();
            inner.requests.push_back(PendingRequest {
                id,
                device: device.clone(),
                resource,
                reply: tx,
            });
            (id, rx)
        };

        if let Err(e) = self.radio.request(device, resource).await {
            self.shared.lock().requests.retain(|r| r.id != id);
            return Err(e);
        }
        reply.await.map_err(|_| Error::Cancelled)?
    }

    /// Subscribe to decoded ECG packets.
    pub fn ecg_packets(&self) -> broadcast::Receiver<EcgPacket> {
        self.shared.ecg.subscribe()
    }

    /// Decoded ECG packets as a lossy stream.
    pub fn ecg_stream(&self) -> BoxStream<'static, EcgPacket> {
        broadcast_stream(self.ecg_packets())
    }

    /// Subscribe to heart-rate readings.
    pub fn heart_rate_readings(&self) -> broadcast::Receiver<HeartRateReading> {
        self.shared.heart_rate.subscribe()
    }

    /// Heart-rate readings as a lossy stream.
    pub fn heart_rate_stream(&self) -> BoxStream<'static, HeartRateReading> {
        broadcast_stream(self.heart_rate_readings())
    }

    /// Stop the dispatcher. Pending operations complete with
    /// [`Error::Cancelled`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether the dispatcher is still consuming radio events.
    pub fn is_running(&self) -> bool {
        !self.dispatcher.is_finished()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn unexpected(value: ResourceValue) -> Error {
    Error::Radio(format!("unexpected {:?} response", value.resource()))
}
