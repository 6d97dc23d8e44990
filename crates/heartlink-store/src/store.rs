//! Main store implementation.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use time::OffsetDateTime;
use tracing::{debug, info};

use heartlink_types::SampleRecord;

use crate::error::{Error, Result};
use crate::schema;

/// SQLite-based store for ECG sample batches.
///
/// Batches accumulate here between uploads. An upload notes
/// [`last_id`](Store::last_id), sends a [`snapshot`](Store::snapshot) of the
/// whole database and, on success, removes the uploaded rows with
/// [`delete_through`](Store::delete_through). Rows appended meanwhile stay.
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn, path: None })
    }

    /// Path of the database file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn to_millis(timestamp: OffsetDateTime) -> i64 {
    (timestamp.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(millis: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|e| Error::InvalidTimestamp(format!("{}: {}", millis, e)))
}

// Sample operations
impl Store {
    /// Append a batch of records in a single transaction.
    ///
    /// Either every record is stored or none is.
    pub fn append_batch(&mut self, records: &[SampleRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO ecg_samples (timestamp, samples) VALUES (?1, ?2)")?;
            for record in records {
                let samples = serde_json::to_string(&record.samples)?;
                stmt.execute(rusqlite::params![to_millis(record.timestamp), samples])?;
            }
        }
        tx.commit()?;

        debug!("Appended {} sample records", records.len());
        Ok(records.len())
    }

    /// Whether no samples are stored.
    pub fn is_empty(&self) -> Result<bool> {
        let exists: bool =
            self.conn
                .query_row("SELECT EXISTS(SELECT 1 FROM ecg_samples)", [], |row| {
                    row.get(0)
                })?;
        Ok(!exists)
    }

    /// Number of stored sample records.
    pub fn count(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM ecg_samples", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// All stored records, oldest first.
    pub fn records(&self) -> Result<Vec<SampleRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT timestamp, samples FROM ecg_samples ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (millis, samples) = row?;
            records.push(SampleRecord::new(
                from_millis(millis)?,
                serde_json::from_str(&samples)?,
            ));
        }
        Ok(records)
    }

    /// Row id of the newest record, if any.
    pub fn last_id(&self) -> Result<Option<i64>> {
        let id: Option<i64> =
            self.conn
                .query_row("SELECT MAX(id) FROM ecg_samples", [], |row| row.get(0))?;
        Ok(id)
    }

    /// Delete every stored sample. Returns the number of rows removed.
    pub fn delete_all(&self) -> Result<usize> {
        let deleted = self.conn.execute("DELETE FROM ecg_samples", [])?;
        info!("Deleted {} sample records", deleted);
        Ok(deleted)
    }

    /// Delete samples up to and including row `id`.
    ///
    /// Rows appended after a snapshot was taken survive when the snapshot's
    /// [`last_id`](Self::last_id) is passed here.
    pub fn delete_through(&self, id: i64) -> Result<usize> {
        let deleted = self
            .conn
            .execute("DELETE FROM ecg_samples WHERE id <= ?1", [id])?;
        info!("Deleted {} sample records", deleted);
        Ok(deleted)
    }

    /// A consistent copy of the whole database as bytes.
    ///
    /// Written with `VACUUM INTO`, so pending WAL content is included and
    /// the copy is compact.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("snapshot.sqlite3");
        self.conn
            .execute("VACUUM INTO ?1", [target.to_string_lossy().as_ref()])?;
        let bytes = std::fs::read(&target)?;
        debug!("Snapshot is {} bytes", bytes.len());
        Ok(bytes)
    }

    /// Close the store and delete its database file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InMemory`] for an in-memory store and
    /// [`Error::StoreFileMissing`] if the file no longer exists.
    pub fn delete_store_file(self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Err(Error::InMemory);
        };
        self.conn.close().map_err(|(_, e)| Error::Database(e))?;
        delete_store_file(&path)
    }
}

/// Delete a database file together with its WAL and shared-memory files.
///
/// # Errors
///
/// Returns [`Error::StoreFileMissing`] if `path` does not exist.
pub fn delete_store_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::StoreFileMissing(path.to_path_buf()));
    }
    std::fs::remove_file(path)?;

    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)?;
        }
    }

    info!("Deleted store file {}", path.display());
    Ok(())
}
