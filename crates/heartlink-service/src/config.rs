//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use heartlink_core::{ChartOptions, SessionConfig};

use crate::auth::Credentials;
use crate::upload::SchedulerConfig;

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which sensor to use and how to stream from it.
    pub device: DeviceConfig,
    /// Live chart buffer.
    pub chart: ChartConfig,
    /// Local files.
    pub storage: StorageConfig,
    /// Connection-scoped timers.
    pub timers: TimersConfig,
    /// Remote upload target.
    pub upload: UploadConfig,
    /// Token endpoint and login.
    pub auth: AuthConfig,
    /// Connect/disconnect timing.
    pub session: SessionSettings,
}

impl Config {
    /// Load configuration from the default path, or defaults if absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration, collecting every problem found.
    ///
    /// ```
    /// use heartlink_service::Config;
    ///
    /// Config::default().validate().expect("defaults are valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.device.validate());
        errors.extend(self.chart.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.timers.validate());
        errors.extend(self.upload.validate());
        if self.upload.enabled {
            errors.extend(self.auth.validate());
        }
        errors.extend(self.session.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .connect_timeout(Duration::from_secs(self.session.connect_timeout_secs))
            .disconnect_timeout(Duration::from_secs(self.session.disconnect_timeout_secs))
            .stream_capacity(self.session.stream_capacity)
    }

    pub fn chart_options(&self) -> ChartOptions {
        ChartOptions::default()
            .frequency_hz(self.device.ecg_frequency_hz)
            .time_interval_secs(self.chart.time_interval_secs)
            .range(self.chart.min_value, self.chart.max_value)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .interval(Duration::from_secs(self.upload.interval_secs))
            .check_period(Duration::from_secs(self.timers.upload_check_secs))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            token_url: self.auth.token_url.clone(),
            client_id: self.auth.client_id.clone(),
            client_secret: self.auth.client_secret.clone(),
            username: self.auth.username.clone(),
            password: self.auth.password.clone(),
        }
    }
}

/// Sensor selection and streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identifier or advertised name. The first sensor found is used
    /// when unset.
    pub address: Option<String>,
    /// ECG sampling frequency requested from the sensor.
    pub ecg_frequency_hz: u16,
    /// Also stream heart rate.
    pub heart_rate: bool,
    /// How long to scan before giving up.
    pub scan_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            ecg_frequency_hz: 128,
            heart_rate: true,
            scan_timeout_secs: 30,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(address) = &self.address
            && address.trim().is_empty()
        {
            errors.push(ValidationError::new(
                "device.address",
                "address cannot be empty (omit it to use the first sensor found)",
            ));
        }
        if self.ecg_frequency_hz == 0 {
            errors.push(ValidationError::new(
                "device.ecg_frequency_hz",
                "frequency must be greater than 0",
            ));
        }
        if self.scan_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "device.scan_timeout_secs",
                "scan timeout must be greater than 0",
            ));
        }

        errors
    }
}

/// Chart buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    /// Seconds of signal shown at once.
    pub time_interval_secs: u16,
    pub min_value: i16,
    pub max_value: i16,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            time_interval_secs: 4,
            min_value: -2048,
            max_value: 2047,
        }
    }
}

impl ChartConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.time_interval_secs == 0 {
            errors.push(ValidationError::new(
                "chart.time_interval_secs",
                "time interval must be greater than 0",
            ));
        }
        if self.min_value >= self.max_value {
            errors.push(ValidationError::new(
                "chart.min_value",
                format!(
                    "min_value {} must be below max_value {}",
                    self.min_value, self.max_value
                ),
            ));
        }

        errors
    }
}

/// Local storage paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Sample database file.
    pub database: PathBuf,
    /// Key-value state file.
    pub state_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: heartlink_store::default_db_path(),
            state_file: heartlink_store::default_kv_path(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.database.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.database",
                "database path cannot be empty",
            ));
        }
        if self.state_file.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.state_file",
                "state file path cannot be empty",
            ));
        }
        if !self.database.as_os_str().is_empty() && self.database == self.state_file {
            errors.push(ValidationError::new(
                "storage.state_file",
                "state file must differ from the database",
            ));
        }

        errors
    }
}

/// Minimum timer period in seconds.
pub const MIN_TIMER_SECS: u64 = 1;
/// Maximum timer period in seconds (1 day).
pub const MAX_TIMER_SECS: u64 = 86_400;

/// Periods of the timers that run while a sensor is connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    /// Move accumulated samples into the database.
    pub flush_secs: u64,
    /// Poll the battery level.
    pub battery_secs: u64,
    /// Check whether an upload is due.
    pub upload_check_secs: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            flush_secs: 10,
            battery_secs: 300,
            upload_check_secs: 60,
        }
    }
}

impl TimersConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        [
            ("timers.flush_secs", self.flush_secs),
            ("timers.battery_secs", self.battery_secs),
            ("timers.upload_check_secs", self.upload_check_secs),
        ]
        .into_iter()
        .filter(|(_, secs)| !(MIN_TIMER_SECS..=MAX_TIMER_SECS).contains(secs))
        .map(|(field, secs)| {
            ValidationError::new(
                field,
                format!(
                    "period {} is out of range ({}-{} seconds)",
                    secs, MIN_TIMER_SECS, MAX_TIMER_SECS
                ),
            )
        })
        .collect()
    }
}

/// Remote upload target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub enabled: bool,
    /// Server base URL, e.g. `https://api.example.com`.
    pub base_url: String,
    pub study_id: String,
    pub user_id: String,
    /// Minimum seconds between uploads.
    pub interval_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            study_id: String::new(),
            user_id: String::new(),
            interval_secs: 15 * 60,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !self.enabled {
            return errors;
        }

        if !is_http_url(&self.base_url) {
            errors.push(ValidationError::new(
                "upload.base_url",
                format!(
                    "invalid URL '{}': must start with http:// or https://",
                    self.base_url
                ),
            ));
        }
        for (field, value) in [
            ("upload.study_id", &self.study_id),
            ("upload.user_id", &self.user_id),
        ] {
            if value.trim().is_empty() {
                errors.push(ValidationError::new(field, "cannot be empty"));
            }
        }
        if self.interval_secs == 0 {
            errors.push(ValidationError::new(
                "upload.interval_secs",
                "interval must be greater than 0",
            ));
        }

        errors
    }
}

/// Token endpoint and password-grant login.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !is_http_url(&self.token_url) {
            errors.push(ValidationError::new(
                "auth.token_url",
                format!(
                    "invalid URL '{}': must start with http:// or https://",
                    self.token_url
                ),
            ));
        }
        for (field, value) in [
            ("auth.client_id", &self.client_id),
            ("auth.client_secret", &self.client_secret),
            ("auth.username", &self.username),
            ("auth.password", &self.password),
        ] {
            if value.is_empty() {
                errors.push(ValidationError::new(field, "cannot be empty"));
            }
        }

        errors
    }
}

/// Session timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub connect_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
    /// Buffer of the ECG and heart-rate streams.
    pub stream_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            disconnect_timeout_secs: defaults.disconnect_timeout.as_secs(),
            stream_capacity: defaults.stream_capacity,
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.connect_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "session.connect_timeout_secs",
                "timeout must be greater than 0",
            ));
        }
        if self.disconnect_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "session.disconnect_timeout_secs",
                "timeout must be greater than 0",
            ));
        }
        if self.stream_capacity == 0 {
            errors.push(ValidationError::new(
                "session.stream_capacity",
                "capacity must be greater than 0",
            ));
        }

        errors
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `upload.base_url`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("heartlink")
        .join("config.toml")
}
