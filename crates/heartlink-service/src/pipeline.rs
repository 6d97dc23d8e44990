//! Background work around a device session.
//!
//! A [`Pipeline`] owns two kinds of task:
//!
//! - the status projection, which mirrors the session's [`LinkStatus`] into
//!   the key-value store for as long as the pipeline lives;
//! - connection tasks (accumulator flush, battery poll, upload timer), which
//!   hang off the session's connection token and stop together when the
//!   device disconnects.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use heartlink_core::{Accumulator, DeviceId, DeviceSession, LinkStatus};
use heartlink_store::kv::{BATTERY_KEY, CONNECTED_KEY};
use heartlink_store::{KeyValueStore, Store};

use crate::config::TimersConfig;
use crate::error::Result;
use crate::upload::UploadScheduler;

/// Periods of the connection timers.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Default: 10 seconds.
    pub flush_interval: Duration,
    /// Default: 5 minutes.
    pub battery_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            battery_interval: Duration::from_secs(300),
        }
    }
}

impl From<&TimersConfig> for PipelineConfig {
    fn from(timers: &TimersConfig) -> Self {
        Self {
            flush_interval: Duration::from_secs(timers.flush_secs),
            battery_interval: Duration::from_secs(timers.battery_secs),
        }
    }
}

/// Move accumulated records into the store.
///
/// Records that fail to store are put back for the next flush.
pub async fn flush(accumulator: &Accumulator, store: &Mutex<Store>) -> Result<usize> {
    let records = accumulator.drain();
    if records.is_empty() {
        return Ok(0);
    }

    let result = store.lock().await.append_batch(&records);
    match result {
        Ok(count) => {
            debug!("Flushed {} sample records", count);
            Ok(count)
        }
        Err(e) => {
            for record in records {
                accumulator.append(record);
            }
            Err(e.into())
        }
    }
}

/// Write a link status to the key-value store.
///
/// Unchanged values are not rewritten. A missing battery level leaves the
/// stored one as it was.
pub fn project_status(kv: &KeyValueStore, status: &LinkStatus) -> Result<()> {
    kv.set(CONNECTED_KEY, &status.connected)?;
    if let Some(battery) = status.battery {
        kv.set(BATTERY_KEY, &battery)?;
    }
    Ok(())
}

/// Tasks started for one connection.
#[derive(Debug)]
pub struct ConnectionTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ConnectionTasks {
    /// Stop the tasks without waiting for the connection to end.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }

    /// Wait for every task to finish.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Connection task panicked: {}", e);
            }
        }
    }
}

/// Wires a session to local storage and the upload timer.
pub struct Pipeline {
    session: Arc<DeviceSession>,
    accumulator: Accumulator,
    store: Arc<Mutex<Store>>,
    kv: Arc<KeyValueStore>,
    scheduler: Option<Arc<UploadScheduler>>,
    config: PipelineConfig,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        session: Arc<DeviceSession>,
        accumulator: Accumulator,
        store: Arc<Mutex<Store>>,
        kv: Arc<KeyValueStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            session,
            accumulator,
            store,
            kv,
            scheduler: None,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Also run the upload timer while connected.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<UploadScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Mirror the link status into the key-value store until shutdown.
    pub fn spawn_status_projection(&self) -> JoinHandle<()> {
        let status = self.session.status();
        let kv = self.kv.clone();
        let token = self.shutdown.clone();
        tokio::spawn(run_status_projection(status, kv, token))
    }

    /// Start the timers for the current connection.
    ///
    /// They stop when the session's connection token is cancelled or the
    /// pipeline shuts down. The flush task flushes once more on the way out.
    pub fn spawn_connection_tasks(&self, device: &DeviceId) -> ConnectionTasks {
        let connection = self.session.connection_token();
        let token = self.shutdown.child_token();
        {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = connection.cancelled() => token.cancel(),
                    _ = token.cancelled() => {}
                }
            });
        }

        let mut handles = vec![
            tokio::spawn(run_flush_timer(
                self.accumulator.clone(),
                self.store.clone(),
                self.config.flush_interval,
                token.clone(),
            )),
            tokio::spawn(run_battery_poll(
                self.session.clone(),
                device.clone(),
                self.config.battery_interval,
                token.clone(),
            )),
        ];

        if let Some(scheduler) = self.scheduler.clone() {
            let token = token.clone();
            handles.push(tokio::spawn(async move { scheduler.run(token).await }));
        }

        info!(device = %device, "Started {} connection tasks", handles.len());
        ConnectionTasks { token, handles }
    }

    /// Stop every task started by this pipeline.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_status_projection(
    mut status: watch::Receiver<LinkStatus>,
    kv: Arc<KeyValueStore>,
    token: CancellationToken,
) {
    loop {
        let current = *status.borrow_and_update();
        if let Err(e) = project_status(&kv, &current) {
            warn!("Failed to write link status: {}", e);
        }

        tokio::select! {
            _ = token.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Status projection stopped");
}

async fn run_flush_timer(
    accumulator: Accumulator,
    store: Arc<Mutex<Store>>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = flush(&accumulator, &store).await {
                    error!("Failed to store samples: {}", e);
                }
            }
        }
    }

    if let Err(e) = flush(&accumulator, &store).await {
        error!("Failed to store samples on disconnect: {}", e);
    }
    debug!("Flush timer stopped");
}

async fn run_battery_poll(
    session: Arc<DeviceSession>,
    device: DeviceId,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // The session applies no timeout to one-shot reads.
        let read = tokio::time::timeout(period, session.get_battery(&device));
        tokio::select! {
            _ = token.cancelled() => break,
            result = read => match result {
                Ok(Ok(level)) => debug!(device = %device, "Battery at {}%", level),
                Ok(Err(e)) => warn!(device = %device, "Battery read failed: {}", e),
                Err(_) => warn!(device = %device, "Battery read timed out"),
            },
        }
    }
    debug!("Battery poll stopped");
}
