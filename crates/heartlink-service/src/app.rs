//! Assembly of sessions, stores and the upload chain from a [`Config`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use heartlink_core::ble::{BleRadio, GattProfile};
use heartlink_core::{Clock, DeviceSession, DiscoveredDevice, Error as CoreError};
use heartlink_store::{KeyValueStore, Store};

use crate::auth::{AuthSession, HttpTokenSource};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::upload::{StudyUploader, UploadScheduler};

/// Open a session on the system Bluetooth adapter.
pub async fn open_session(config: &Config) -> Result<DeviceSession> {
    let (radio, events) = BleRadio::new(GattProfile::default()).await?;
    Ok(DeviceSession::new(
        Arc::new(radio),
        events,
        config.session_config(),
    )?)
}

/// Whether `found` is the device named by `address`.
///
/// Matches the identifier or the advertised name, ignoring case. Any device
/// matches when `address` is `None`.
pub fn matches_address(found: &DiscoveredDevice, address: Option<&str>) -> bool {
    let Some(address) = address else {
        return true;
    };
    found.device.id.eq_ignore_ascii_case(address)
        || found
            .device
            .name
            .as_deref()
            .is_some_and(|name| name.eq_ignore_ascii_case(address))
}

/// Scan until a matching device shows up or `timeout` elapses.
pub async fn find_device(
    session: &DeviceSession,
    address: Option<&str>,
    timeout: Duration,
) -> Result<DiscoveredDevice> {
    let mut found = session.scan().await?;
    let result = tokio::time::timeout(timeout, async {
        while let Some(device) = found.next().await {
            if matches_address(&device, address) {
                return Some(device);
            }
            debug!(device = %device.device, "Ignoring device");
        }
        None
    })
    .await;
    session.stop_scan().await?;

    match result {
        Ok(Some(device)) => {
            info!(device = %device.device, "Found device");
            Ok(device)
        }
        Ok(None) | Err(_) => Err(CoreError::DeviceNotFound(
            address.unwrap_or("any heartlink sensor").to_string(),
        )
        .into()),
    }
}

/// Build the upload chain, or `None` when uploads are disabled.
///
/// The key-value store doubles as token store and upload state.
pub fn build_scheduler(
    config: &Config,
    store: Arc<Mutex<Store>>,
    kv: Arc<KeyValueStore>,
    clock: Arc<dyn Clock>,
) -> Result<Option<Arc<UploadScheduler>>> {
    if !config.upload.enabled {
        return Ok(None);
    }
    let scheduler_config = config.scheduler_config();
    scheduler_config.validate()?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;
    let source = HttpTokenSource::new(client.clone(), config.credentials(), clock.clone());
    let auth = Arc::new(AuthSession::new(Arc::new(source), kv.clone(), clock.clone()));
    let uploader = StudyUploader::new(
        client,
        &config.upload.base_url,
        &config.upload.study_id,
        &config.upload.user_id,
        auth,
    );

    Ok(Some(Arc::new(UploadScheduler::new(
        store,
        Arc::new(uploader),
        kv,
        clock,
        scheduler_config,
    ))))
}

/// Fail unless uploads are configured.
pub fn require_scheduler(
    scheduler: Option<Arc<UploadScheduler>>,
) -> Result<Arc<UploadScheduler>> {
    scheduler.ok_or_else(|| Error::InvalidConfig("uploads are disabled ([upload] enabled = false)".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use heartlink_core::{DeviceId, MockRadioBuilder, SessionConfig, SystemClock};

    fn found(id: &str, name: Option<&str>) -> DiscoveredDevice {
        DiscoveredDevice {
            device: DeviceId {
                id: id.into(),
                name: name.map(Into::into),
            },
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_matches_address() {
        let device = found("AA:BB:CC:DD:EE:FF", Some("HL-0042"));
        assert!(matches_address(&device, None));
        assert!(matches_address(&device, Some("aa:bb:cc:dd:ee:ff")));
        assert!(matches_address(&device, Some("hl-0042")));
        assert!(!matches_address(&device, Some("HL-0043")));
        assert!(!matches_address(&found("x", None), Some("HL-0042")));
    }

    #[tokio::test]
    async fn test_find_device_picks_match() {
        let (radio, events) = MockRadioBuilder::new()
            .nearby(found("one", Some("HL-1")))
            .nearby(found("two", Some("HL-2")))
            .build();
        let radio = Arc::new(radio);
        let session = DeviceSession::new(radio.clone(), events, SessionConfig::default()).unwrap();

        let device = find_device(&session, Some("HL-2"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(device.device.id, "two");
        assert!(!radio.is_discovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_device_times_out() {
        let (radio, events) = MockRadioBuilder::new().nearby(found("one", None)).build();
        let session = DeviceSession::new(Arc::new(radio), events, SessionConfig::default()).unwrap();

        let result = find_device(&session, Some("missing"), Duration::from_secs(3)).await;
        assert!(matches!(
            result,
            Err(Error::Device(CoreError::DeviceNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_build_scheduler_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let kv = Arc::new(KeyValueStore::open(dir.path().join("state.json")).unwrap());

        let scheduler =
            build_scheduler(&Config::default(), store, kv, Arc::new(SystemClock)).unwrap();
        assert!(scheduler.is_none());
        assert!(matches!(
            require_scheduler(scheduler),
            Err(Error::InvalidConfig(_))
        ));
    }
}
