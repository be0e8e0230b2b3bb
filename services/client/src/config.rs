//! Configuration management for the meshcap client.
//!
//! Configuration is layered: built-in defaults, optional config files, then
//! environment variables prefixed with `MESHCAP` (e.g. `MESHCAP__API__BASE_URL`).

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Service-level settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Conversion API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Capture device configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Job polling configuration
    #[serde(default)]
    pub polling: PollingConfig,

    /// Password gate configuration
    #[serde(default)]
    pub gate: GateConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Name used in logs
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Prometheus listener port (disabled when unset)
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// How a recording reaches the conversion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadProtocol {
    /// Multipart POST straight to `/api/upload`
    #[default]
    Direct,
    /// Pre-signed URL indirection through object storage
    Presigned,
}

impl UploadProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadProtocol::Direct => "direct",
            UploadProtocol::Presigned => "presigned",
        }
    }
}

/// Conversion API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Host serving the `/api/*` endpoints (empty = relative)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Upload protocol variant
    #[serde(default)]
    pub protocol: UploadProtocol,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Capture device configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Hard ceiling on a single recording in seconds
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Container formats to try, most preferred first
    #[serde(default = "default_container_preferences")]
    pub container_preferences: Vec<String>,
}

/// Job polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Delay between status queries in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Maximum number of status queries before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Password gate configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GateConfig {
    /// Shared secret required to unlock a session
    #[serde(default)]
    pub secret: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "meshcap".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_max_duration_secs() -> u64 {
    60
}
fn default_container_preferences() -> Vec<String> {
    vec![
        "video/webm;codecs=vp9,opus".to_string(),
        "video/webm;codecs=vp8,opus".to_string(),
        "video/webm".to_string(),
        "video/mp4".to_string(),
    ]
}
fn default_poll_interval_ms() -> u64 {
    2500
}
fn default_max_attempts() -> u32 {
    60 // ~2.5 minutes at the default interval
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            protocol: UploadProtocol::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration_secs(),
            container_preferences: default_container_preferences(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Sources, later overriding earlier:
    /// 1. `config/meshcap` and `/etc/meshcap/client` if present
    /// 2. `explicit_file`, when given (must exist)
    /// 3. Environment variables (e.g. `MESHCAP__POLLING__MAX_ATTEMPTS`)
    pub fn load(explicit_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("config/meshcap").required(false))
            .add_source(File::with_name("/etc/meshcap/client").required(false));

        if let Some(path) = explicit_file {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("MESHCAP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("capture.container_preferences"),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.capture.max_duration_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.max_duration_secs".to_string(),
                message: "Recording ceiling must be greater than 0".to_string(),
            });
        }

        if self.polling.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "polling.max_attempts".to_string(),
                message: "At least one status query is required".to_string(),
            });
        }

        if self.polling.interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "polling.interval_ms".to_string(),
                message: "Poll interval must be greater than 0".to_string(),
            });
        }

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "logging.format".to_string(),
                    message: format!("unknown format '{other}', expected json or pretty"),
                })
            }
        }

        Ok(())
    }

    /// Get the recording ceiling as Duration
    pub fn max_recording(&self) -> Duration {
        Duration::from_secs(self.capture.max_duration_secs)
    }

    /// Get the poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }
}

impl ApiConfig {
    /// Join an absolute API path (`/api/...`) onto the configured base.
    pub fn api_url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Get the request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return format!("/{}", path.trim_start_matches('/'));
    }
    format!("{}/{}", base, path.trim_start_matches('/'))
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = ClientConfig::default();
        assert_eq!(config.capture.max_duration_secs, 60);
        assert_eq!(config.polling.max_attempts, 60);
        assert_eq!(config.poll_interval(), Duration::from_millis(2500));
        assert_eq!(config.api.protocol, UploadProtocol::Direct);
        assert_eq!(config.capture.container_preferences[0], "video/webm;codecs=vp9,opus");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = ClientConfig::default();
        config.polling.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = ClientConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_url_joins_without_double_slash() {
        let mut api = ApiConfig::default();
        api.base_url = "http://gpu-box:8000/".to_string();
        assert_eq!(api.api_url("/api/upload"), "http://gpu-box:8000/api/upload");

        api.base_url = String::new();
        assert_eq!(api.api_url("/api/upload"), "/api/upload");
    }

    #[test]
    fn test_protocol_deserializes_from_snake_case() {
        let protocol: UploadProtocol = serde_json::from_str("\"presigned\"").unwrap();
        assert_eq!(protocol, UploadProtocol::Presigned);
        assert_eq!(protocol.as_str(), "presigned");
    }
}
