//! Error types for heartlink-store.

use std::path::PathBuf;

/// Result type for heartlink-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in heartlink-store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The store file to delete does not exist.
    #[error("Store file not found: {0}")]
    StoreFileMissing(PathBuf),

    /// The operation needs a file-backed store.
    #[error("Store is not backed by a file")]
    InMemory,

    /// Invalid timestamp.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
