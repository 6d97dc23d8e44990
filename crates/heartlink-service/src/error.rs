//! Error types for the heartlink service.

use thiserror::Error;

/// Errors from authentication, upload and pipeline operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Transport-level HTTP failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server rejected the token twice in a row.
    #[error("Request unauthorized after re-authenticating")]
    Unauthorized,

    /// The token endpoint refused to issue a token.
    #[error("Token endpoint returned {status}: {message}")]
    TokenRejected { status: u16, message: String },

    /// Local storage failure.
    #[error("Store error: {0}")]
    Store(#[from] heartlink_store::Error),

    /// Device or session failure.
    #[error("Device error: {0}")]
    Device(#[from] heartlink_core::Error),

    /// A value in the configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, Error>;
