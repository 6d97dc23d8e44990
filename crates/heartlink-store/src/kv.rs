//! Small JSON-file key-value store.
//!
//! Holds state shared with other processes on the same machine (link
//! status) and state that must survive restarts (auth token, last upload
//! time). Every change is written through to disk immediately; writes that
//! would not change a value are skipped.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Whether a sensor is connected (`bool`).
pub const CONNECTED_KEY: &str = "connected";

/// Last battery level in percent (integer).
pub const BATTERY_KEY: &str = "battery";

/// Cached authentication token.
pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// Time of the last successful upload.
pub const LAST_UPLOAD_KEY: &str = "last_upload";

/// A JSON object persisted to a single file.
#[derive(Debug)]
pub struct KeyValueStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl KeyValueStore {
    /// Open the store at `path`, loading existing values if the file exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Map::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Open the default location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_kv_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read a value. Missing keys read as `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.lock().get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Write a value. Returns whether the stored value changed.
    ///
    /// The in-memory copy only changes once the file is written, so a failed
    /// write can simply be retried.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<bool> {
        let value = serde_json::to_value(value)?;
        let mut values = self.lock();
        if values.get(key) == Some(&value) {
            return Ok(false);
        }
        let mut next = values.clone();
        next.insert(key.to_string(), value);
        self.persist(&next)?;
        *values = next;
        debug!(key, "Key-value store updated");
        Ok(true)
    }

    /// Remove a key. Returns whether it was present.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut values = self.lock();
        if !values.contains_key(key) {
            return Ok(false);
        }
        let mut next = values.clone();
        next.remove(key);
        self.persist(&next)?;
        *values = next;
        debug!(key, "Key-value store entry removed");
        Ok(true)
    }

    /// Write the whole map to a temporary file and move it into place.
    fn persist(&self, values: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("kv.json");

        let kv = KeyValueStore::open(&path).unwrap();
        assert_eq!(kv.get::<bool>(CONNECTED_KEY).unwrap(), None);
        assert!(kv.set(CONNECTED_KEY, &true).unwrap());
        assert!(kv.set(BATTERY_KEY, &87u8).unwrap());

        let reopened = KeyValueStore::open(&path).unwrap();
        assert_eq!(reopened.get::<bool>(CONNECTED_KEY).unwrap(), Some(true));
        assert_eq!(reopened.get::<u8>(BATTERY_KEY).unwrap(), Some(87));
    }

    #[test]
    fn test_unchanged_value_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KeyValueStore::open(dir.path().join("kv.json")).unwrap();
        assert!(kv.set(BATTERY_KEY, &50u8).unwrap());
        assert!(!kv.set(BATTERY_KEY, &50u8).unwrap());
        assert!(kv.set(BATTERY_KEY, &49u8).unwrap());
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        let kv = KeyValueStore::open(&path).unwrap();
        kv.set(AUTH_TOKEN_KEY, &"secret").unwrap();

        assert!(kv.remove(AUTH_TOKEN_KEY).unwrap());
        assert!(!kv.remove(AUTH_TOKEN_KEY).unwrap());
        let reopened = KeyValueStore::open(&path).unwrap();
        assert_eq!(reopened.get::<String>(AUTH_TOKEN_KEY).unwrap(), None);
    }

    #[test]
    fn test_failed_write_leaves_value_unset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        let kv = KeyValueStore::open(&path).unwrap();

        // A directory at the target path makes the rename fail.
        std::fs::create_dir(&path).unwrap();
        assert!(kv.set(CONNECTED_KEY, &true).is_err());
        assert_eq!(kv.get::<bool>(CONNECTED_KEY).unwrap(), None);

        std::fs::remove_dir(&path).unwrap();
        assert!(kv.set(CONNECTED_KEY, &true).unwrap());
        let reopened = KeyValueStore::open(&path).unwrap();
        assert_eq!(reopened.get::<bool>(CONNECTED_KEY).unwrap(), Some(true));
    }

    #[test]
    fn test_failed_remove_keeps_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        let kv = KeyValueStore::open(&path).unwrap();
        kv.set(BATTERY_KEY, &50u8).unwrap();

        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        assert!(kv.remove(BATTERY_KEY).is_err());
        assert_eq!(kv.get::<u8>(BATTERY_KEY).unwrap(), Some(50));

        std::fs::remove_dir(&path).unwrap();
        assert!(kv.remove(BATTERY_KEY).unwrap());
        let reopened = KeyValueStore::open(&path).unwrap();
        assert_eq!(reopened.get::<u8>(BATTERY_KEY).unwrap(), None);
    }

    #[test]
    fn test_empty_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, "").unwrap();
        let kv = KeyValueStore::open(&path).unwrap();
        assert_eq!(kv.get::<bool>(CONNECTED_KEY).unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            KeyValueStore::open(&path),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_wrong_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KeyValueStore::open(dir.path().join("kv.json")).unwrap();
        kv.set(BATTERY_KEY, &"full").unwrap();
        assert!(kv.get::<u8>(BATTERY_KEY).is_err());
    }
}
