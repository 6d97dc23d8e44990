//! Periodic upload of the local sample database.
//!
//! An [`UploadScheduler`] is ticked on a timer. Each tick uploads a snapshot
//! of the local store when it holds samples and the last successful upload
//! is at least one interval old. Failures leave the data and the last
//! upload time untouched, so the next due tick tries again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use heartlink_core::Clock;
use heartlink_store::kv::LAST_UPLOAD_KEY;
use heartlink_store::{KeyValueStore, Store};

use crate::auth::{AuthSession, check_status};
use crate::error::{Error, Result};

/// MIME type of the uploaded database.
pub const SQLITE_MIME: &str = "application/vnd.sqlite3";

/// A snapshot of the local store ready to send.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub payload: Vec<u8>,
    /// Newest row included in the payload.
    pub through: i64,
}

/// Sends a database snapshot somewhere.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, payload: Vec<u8>, at: OffsetDateTime) -> Result<()>;
}

/// Where uploads come from.
#[async_trait]
pub trait UploadSource: Send + Sync {
    async fn is_empty(&self) -> Result<bool>;
    /// Snapshot the data, or `None` if there is nothing to send.
    async fn snapshot(&self) -> Result<Option<UploadBatch>>;
    /// Remove the rows contained in an uploaded batch.
    async fn clear(&self, batch: &UploadBatch) -> Result<()>;
}

#[async_trait]
impl UploadSource for Mutex<Store> {
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.lock().await.is_empty()?)
    }

    async fn snapshot(&self) -> Result<Option<UploadBatch>> {
        let store = self.lock().await;
        let Some(through) = store.last_id()? else {
            return Ok(None);
        };
        Ok(Some(UploadBatch {
            payload: store.snapshot()?,
            through,
        }))
    }

    async fn clear(&self, batch: &UploadBatch) -> Result<()> {
        self.lock().await.delete_through(batch.through)?;
        Ok(())
    }
}

/// Remembers when the last upload succeeded.
pub trait UploadStateStore: Send + Sync {
    fn last_upload(&self) -> Result<Option<OffsetDateTime>>;
    fn record_upload(&self, at: OffsetDateTime) -> Result<()>;
}

impl UploadStateStore for KeyValueStore {
    fn last_upload(&self) -> Result<Option<OffsetDateTime>> {
        let Some(secs) = self.get::<i64>(LAST_UPLOAD_KEY)? else {
            return Ok(None);
        };
        OffsetDateTime::from_unix_timestamp(secs)
            .map(Some)
            .map_err(|e| Error::Store(heartlink_store::Error::InvalidTimestamp(e.to_string())))
    }

    fn record_upload(&self, at: OffsetDateTime) -> Result<()> {
        self.set(LAST_UPLOAD_KEY, &at.unix_timestamp())?;
        Ok(())
    }
}

/// Uploads to `POST {base}/api/studies/{study}/files` as multipart.
#[derive(Debug, Clone)]
pub struct StudyUploader {
    client: Client,
    base_url: String,
    study_id: String,
    user_id: String,
    auth: Arc<AuthSession>,
}

impl StudyUploader {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        study_id: impl Into<String>,
        user_id: impl Into<String>,
        auth: Arc<AuthSession>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            study_id: study_id.into(),
            user_id: user_id.into(),
            auth,
        }
    }

    /// The upload endpoint.
    pub fn url(&self) -> String {
        format!(
            "{}/api/studies/{}/files",
            self.base_url.trim_end_matches('/'),
            self.study_id
        )
    }

    /// The file name sent for an upload made at `at`.
    pub fn file_name(&self, at: OffsetDateTime) -> String {
        format!("{}_{}.sqlite3", self.user_id, at.unix_timestamp())
    }
}

#[async_trait]
impl Uploader for StudyUploader {
    async fn upload(&self, payload: Vec<u8>, at: OffsetDateTime) -> Result<()> {
        let url = self.url();
        let file_name = self.file_name(at);
        info!("Uploading {} bytes as {}", payload.len(), file_name);

        self.auth
            .authorize(|token| {
                let client = self.client.clone();
                let url = url.clone();
                let file_name = file_name.clone();
                let payload = payload.clone();
                async move {
                    let part = Part::bytes(payload)
                        .file_name(file_name)
                        .mime_str(SQLITE_MIME)?;
                    let response = client
                        .post(url)
                        .bearer_auth(token)
                        .multipart(Form::new().part("file", part))
                        .send()
                        .await?;
                    debug!(status = %response.status(), "Upload response");
                    Ok::<_, Error>(check_status(response.status()))
                }
            })
            .await
    }
}

/// Scheduler timing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum time between successful uploads.
    /// Default: 15 minutes.
    pub interval: Duration,
    /// How often [`UploadScheduler::run`] ticks.
    /// Default: 1 minute.
    pub check_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            check_period: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn check_period(mut self, period: Duration) -> Self {
        self.check_period = period;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_period.is_zero() {
            return Err(Error::InvalidConfig(
                "upload check period must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Whether an upload is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Uploading,
}

/// What a [`tick`](UploadScheduler::tick) did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick is uploading.
    Busy,
    /// The local store holds nothing.
    Empty,
    /// The last upload is too recent.
    NotDue { remaining: Duration },
    Uploaded { bytes: usize },
    /// Something failed; the data is kept for the next tick.
    Failed { error: String },
}

/// Decides when to upload and performs the upload.
pub struct UploadScheduler {
    source: Arc<dyn UploadSource>,
    uploader: Arc<dyn Uploader>,
    state: Arc<dyn UploadStateStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    uploading: AtomicBool,
}

/// Clears the uploading flag even if the tick future is dropped.
struct UploadingGuard<'a>(&'a AtomicBool);

impl Drop for UploadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UploadScheduler {
    pub fn new(
        source: Arc<dyn UploadSource>,
        uploader: Arc<dyn Uploader>,
        state: Arc<dyn UploadStateStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            source,
            uploader,
            state,
            clock,
            config,
            uploading: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.uploading.load(Ordering::Acquire) {
            SchedulerState::Uploading
        } else {
            SchedulerState::Idle
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Upload if there is data and an upload is due.
    pub async fn tick(&self) -> TickOutcome {
        self.run_guarded(false).await
    }

    /// Upload if there is data, regardless of the last upload time.
    pub async fn upload_now(&self) -> TickOutcome {
        self.run_guarded(true).await
    }

    async fn run_guarded(&self, force: bool) -> TickOutcome {
        if self
            .uploading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Upload already in progress");
            return TickOutcome::Busy;
        }
        let _guard = UploadingGuard(&self.uploading);

        let outcome = self.try_upload(force).await;
        match &outcome {
            TickOutcome::Uploaded { bytes } => info!("Uploaded {} bytes", bytes),
            TickOutcome::Failed { error } => warn!("Upload failed: {}", error),
            other => debug!(?other, "Upload skipped"),
        }
        outcome
    }

    async fn try_upload(&self, force: bool) -> TickOutcome {
        match self.source.is_empty().await {
            Ok(true) => return TickOutcome::Empty,
            Ok(false) => {}
            Err(e) => return failed(e),
        }

        let now = self.clock.now();
        let last = self.state.last_upload().unwrap_or_else(|e| {
            warn!("Failed to read last upload time: {}", e);
            None
        });
        if let Some(last) = last.filter(|_| !force) {
            let elapsed = Duration::try_from(now - last).unwrap_or_default();
            if elapsed < self.config.interval {
                return TickOutcome::NotDue {
                    remaining: self.config.interval - elapsed,
                };
            }
        }

        let batch = match self.source.snapshot().await {
            Ok(Some(batch)) => batch,
            Ok(None) => return TickOutcome::Empty,
            Err(e) => return failed(e),
        };
        let bytes = batch.payload.len();

        if let Err(e) = self.uploader.upload(batch.payload.clone(), now).await {
            return failed(e);
        }

        if let Err(e) = self.source.clear(&batch).await {
            error!("Uploaded but failed to clear local samples: {}", e);
            return failed(e);
        }
        if let Err(e) = self.state.record_upload(now) {
            warn!("Failed to record upload time: {}", e);
        }

        TickOutcome::Uploaded { bytes }
    }

    /// Tick every [`check_period`](SchedulerConfig::check_period) until
    /// `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!("Upload timer stopped");
    }
}

fn failed(error: Error) -> TickOutcome {
    TickOutcome::Failed {
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use heartlink_core::ManualClock;
    use heartlink_types::SampleRecord;

    #[derive(Debug, Default)]
    struct RecordingUploader {
        uploads: std::sync::Mutex<Vec<(usize, OffsetDateTime)>>,
        fail: AtomicBool,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(&self, payload: Vec<u8>, at: OffsetDateTime) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Unauthorized);
            }
            self.uploads.lock().unwrap().push((payload.len(), at));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryState(std::sync::Mutex<Option<OffsetDateTime>>);

    impl UploadStateStore for MemoryState {
        fn last_upload(&self) -> Result<Option<OffsetDateTime>> {
            Ok(*self.0.lock().unwrap())
        }

        fn record_upload(&self, at: OffsetDateTime) -> Result<()> {
            *self.0.lock().unwrap() = Some(at);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<Mutex<Store>>,
        uploader: Arc<RecordingUploader>,
        state: Arc<MemoryState>,
        clock: Arc<ManualClock>,
        scheduler: Arc<UploadScheduler>,
    }

    fn fixture(uploader: RecordingUploader) -> Fixture {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let uploader = Arc::new(uploader);
        let state = Arc::new(MemoryState::default());
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        ));
        let scheduler = Arc::new(UploadScheduler::new(
            store.clone(),
            uploader.clone(),
            state.clone(),
            clock.clone(),
            SchedulerConfig::default(),
        ));
        Fixture {
            store,
            uploader,
            state,
            clock,
            scheduler,
        }
    }

    async fn add_samples(store: &Mutex<Store>) {
        store
            .lock()
            .await
            .append_batch(&[SampleRecord::new(OffsetDateTime::UNIX_EPOCH, vec![1, 2, 3])])
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_store_does_not_upload() {
        let f = fixture(RecordingUploader::default());
        assert_eq!(f.scheduler.tick().await, TickOutcome::Empty);
        assert_eq!(f.uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_upload_clears_store_and_records_time() {
        let f = fixture(RecordingUploader::default());
        add_samples(&f.store).await;

        assert!(matches!(f.scheduler.tick().await, TickOutcome::Uploaded { .. }));
        assert!(f.store.lock().await.is_empty().unwrap());
        assert_eq!(f.state.last_upload().unwrap(), Some(f.clock.now()));
        assert_eq!(f.uploader.uploads.lock().unwrap()[0].1, f.clock.now());
    }

    #[tokio::test]
    async fn test_upload_waits_for_interval() {
        let f = fixture(RecordingUploader::default());
        add_samples(&f.store).await;
        f.scheduler.tick().await;

        add_samples(&f.store).await;
        f.clock.advance(Duration::from_secs(10 * 60));
        assert_eq!(
            f.scheduler.tick().await,
            TickOutcome::NotDue {
                remaining: Duration::from_secs(5 * 60)
            }
        );

        f.clock.advance(Duration::from_secs(5 * 60));
        assert!(matches!(f.scheduler.tick().await, TickOutcome::Uploaded { .. }));
        assert_eq!(f.uploader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_upload_now_ignores_interval() {
        let f = fixture(RecordingUploader::default());
        add_samples(&f.store).await;
        f.scheduler.tick().await;

        add_samples(&f.store).await;
        assert!(matches!(f.scheduler.tick().await, TickOutcome::NotDue { .. }));
        assert!(matches!(
            f.scheduler.upload_now().await,
            TickOutcome::Uploaded { .. }
        ));
        assert_eq!(f.scheduler.upload_now().await, TickOutcome::Empty);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_data_and_time() {
        let f = fixture(RecordingUploader::default());
        f.uploader.fail.store(true, Ordering::SeqCst);
        add_samples(&f.store).await;

        assert!(matches!(f.scheduler.tick().await, TickOutcome::Failed { .. }));
        assert!(!f.store.lock().await.is_empty().unwrap());
        assert_eq!(f.state.last_upload().unwrap(), None);
        assert_eq!(f.scheduler.state(), SchedulerState::Idle);

        f.uploader.fail.store(false, Ordering::SeqCst);
        assert!(matches!(f.scheduler.tick().await, TickOutcome::Uploaded { .. }));
    }

    #[tokio::test]
    async fn test_repeated_ticks_upload_once() {
        let f = fixture(RecordingUploader::default());
        add_samples(&f.store).await;

        f.scheduler.tick().await;
        for _ in 0..3 {
            f.scheduler.tick().await;
        }
        assert_eq!(f.uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_while_uploading_is_a_noop() {
        let f = fixture(RecordingUploader {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        add_samples(&f.store).await;

        let scheduler = f.scheduler.clone();
        let first = tokio::spawn(async move { scheduler.tick().await });
        tokio::task::yield_now().await;
        while f.scheduler.state() != SchedulerState::Uploading {
            tokio::task::yield_now().await;
        }

        assert_eq!(f.scheduler.tick().await, TickOutcome::Busy);
        assert!(matches!(first.await.unwrap(), TickOutcome::Uploaded { .. }));
        assert_eq!(f.uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rows_added_during_upload_survive() {
        let f = fixture(RecordingUploader::default());
        add_samples(&f.store).await;
        let batch = f.store.snapshot().await.unwrap().unwrap();
        add_samples(&f.store).await;

        f.store.clear(&batch).await.unwrap();
        assert_eq!(f.store.lock().await.count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let f = fixture(RecordingUploader::default());
        add_samples(&f.store).await;
        let token = CancellationToken::new();

        let scheduler = f.scheduler.clone();
        let child = token.clone();
        let task = tokio::spawn(async move { scheduler.run(child).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.uploader.calls.load(Ordering::SeqCst), 1);

        token.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_kv_upload_state() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KeyValueStore::open(dir.path().join("state.json")).unwrap();
        assert_eq!(kv.last_upload().unwrap(), None);

        let at = OffsetDateTime::from_unix_timestamp(1_700_000_123).unwrap();
        kv.record_upload(at).unwrap();
        assert_eq!(kv.last_upload().unwrap(), Some(at));
    }

    #[test]
    fn test_scheduler_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(900));
        assert!(config.validate().is_ok());
        assert!(
            SchedulerConfig::default()
                .check_period(Duration::ZERO)
                .validate()
                .is_err()
        );
    }
}
