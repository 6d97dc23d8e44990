//! ECG collection pipeline and authenticated upload for heartlink sensors.
//!
//! This crate provides:
//! - [`Pipeline`]: connection-scoped timers that flush accumulated samples
//!   into the local store, poll the battery and drive uploads, plus the
//!   link-status projection into the shared key-value store
//! - [`UploadScheduler`]: periodic upload of the local sample database
//! - [`AuthSession`]: bearer-token cache with single-flight acquisition and
//!   one retry on 401
//! - [`Config`]: TOML configuration for the `heartlink` binary
//!
//! # Configuration
//!
//! The binary reads `~/.config/heartlink/config.toml`:
//!
//! ```toml
//! [device]
//! address = "HL-0042"
//! ecg_frequency_hz = 128
//!
//! [chart]
//! time_interval_secs = 4
//!
//! [timers]
//! flush_secs = 10
//! battery_secs = 300
//!
//! [upload]
//! enabled = true
//! base_url = "https://api.example.com"
//! study_id = "study-1"
//! user_id = "participant-7"
//! interval_secs = 900
//!
//! [auth]
//! token_url = "https://auth.example.com/oauth/token"
//! client_id = "heartlink"
//! client_secret = "..."
//! username = "participant-7"
//! password = "..."
//! ```

pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod upload;

pub use auth::{
    AuthSession, AuthTokenPair, Authorized, Credentials, HttpTokenSource, MemoryTokenStore,
    TokenSource, TokenStore,
};
pub use config::{Config, ConfigError, ValidationError, default_config_path};
pub use error::{Error, Result};
pub use pipeline::{ConnectionTasks, Pipeline, PipelineConfig};
pub use upload::{
    SchedulerConfig, SchedulerState, StudyUploader, TickOutcome, UploadBatch, UploadScheduler,
    UploadSource, UploadStateStore, Uploader,
};
