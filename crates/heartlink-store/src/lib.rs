//! Local persistence for heartlink.
//!
//! This crate provides:
//!
//! - [`Store`]: a SQLite database of ECG sample batches waiting to be
//!   uploaded. The database file is itself the upload payload.
//! - [`KeyValueStore`]: a small JSON file for link status, the cached auth
//!   token and the last upload time.
//!
//! # Example
//!
//! ```no_run
//! use heartlink_store::Store;
//! use heartlink_types::SampleRecord;
//! use time::OffsetDateTime;
//!
//! let mut store = Store::open_default()?;
//! store.append_batch(&[SampleRecord::new(OffsetDateTime::now_utc(), vec![12, -4])])?;
//!
//! if !store.is_empty()? {
//!     let payload = store.snapshot()?;
//!     println!("{} bytes to upload", payload.len());
//! }
//! # Ok::<(), heartlink_store::Error>(())
//! ```

mod error;
pub mod kv;
mod schema;
mod store;

pub use error::{Error, Result};
pub use kv::KeyValueStore;
pub use store::{Store, delete_store_file};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/heartlink/samples.sqlite3`
/// - macOS: `~/Library/Application Support/heartlink/samples.sqlite3`
/// - Windows: `C:\Users\<user>\AppData\Local\heartlink\samples.sqlite3`
pub fn default_db_path() -> std::path::PathBuf {
    default_data_dir().join("samples.sqlite3")
}

/// Default key-value store path, next to the database.
pub fn default_kv_path() -> std::path::PathBuf {
    default_data_dir().join("state.json")
}

fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("heartlink")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths_share_a_directory() {
        let db = default_db_path();
        let kv = default_kv_path();
        assert_eq!(db.parent(), kv.parent());
        assert!(db.ends_with("heartlink/samples.sqlite3"));
    }
}
