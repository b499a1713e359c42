//! Configuration management for the occupancy monitor.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use crate::capture::{CameraSource, CaptureHints};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the monitor service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Camera acquisition configuration
    #[serde(default)]
    pub camera: CameraConfig,

    /// Occupancy detection configuration
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Primary stream configuration
    #[serde(default)]
    pub stream: StreamConfig,

    /// Mobile relay configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port, also used when building local-network share links
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Which capture backend to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Real devices and network streams through GStreamer
    #[default]
    Gstreamer,
    /// In-memory scene, for demos and tests
    Synthetic,
}

/// Camera acquisition configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Capture backend
    #[serde(default)]
    pub backend: CaptureBackend,

    /// Local device index used when no URL is configured
    #[serde(default)]
    pub default_index: u32,

    /// Network stream URL (e.g., "rtsp://camera:554/stream" or a DroidCam HTTP feed)
    #[serde(default)]
    pub url: Option<String>,

    /// Open attempts per acquisition
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,

    /// Fixed delay between open attempts in milliseconds
    #[serde(default = "default_open_retry_delay_ms")]
    pub open_retry_delay_ms: u64,

    /// Consecutive read failures before the session is released
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Frames discarded after every delivered frame on network sources
    #[serde(default = "default_network_skip_frames")]
    pub network_skip_frames: u32,

    /// Requested capture width for local devices
    #[serde(default = "default_target_width")]
    pub target_width: u32,

    /// Requested capture height for local devices
    #[serde(default = "default_target_height")]
    pub target_height: u32,

    /// Requested capture frame rate for local devices
    #[serde(default = "default_capture_fps")]
    pub target_fps: u32,

    /// Bound on waiting for a pipeline to start, in milliseconds
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Bound on waiting for a single frame, in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Bound on waiting for the session while it is being reconfigured
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// Bound on waiting for in-flight reads before a reconfiguration
    #[serde(default = "default_configure_wait_ms")]
    pub configure_wait_ms: u64,

    /// Local device indices probed by enumeration are `0..probe_max_index`
    #[serde(default = "default_probe_max_index")]
    pub probe_max_index: u32,
}

/// Occupancy detection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Per-pixel intensity delta (0-255) above which a pixel counts as changed
    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: u8,

    /// Changed-pixel ratio above which a region is occupied
    #[serde(default = "default_occupied_ratio")]
    pub occupied_ratio: f64,
}

/// Primary stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Frames wider than this are downscaled, preserving aspect ratio
    #[serde(default = "default_max_width")]
    pub max_width: u32,

    /// Delivery pacing in frames per second
    #[serde(default = "default_stream_fps")]
    pub target_fps: f32,

    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Pause after a failed read in milliseconds
    #[serde(default = "default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,

    /// Release the camera once the last viewer disconnects
    #[serde(default = "default_true")]
    pub release_when_idle: bool,

    /// Placeholder frame width
    #[serde(default = "default_target_width")]
    pub placeholder_width: u32,

    /// Placeholder frame height
    #[serde(default = "default_target_height")]
    pub placeholder_height: u32,
}

/// Mobile relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Session token lifetime in seconds
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Interval between frames on a relay stream in milliseconds
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,

    /// Interval between expired-token sweeps in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Largest accepted pushed frame in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
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

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter
    #[serde(default)]
    pub enabled: bool,

    /// Exporter listen port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_open_attempts() -> u32 {
    3
}
fn default_open_retry_delay_ms() -> u64 {
    1000
}
fn default_max_consecutive_failures() -> u32 {
    30
}
fn default_network_skip_frames() -> u32 {
    2
}
fn default_target_width() -> u32 {
    640
}
fn default_target_height() -> u32 {
    480
}
fn default_capture_fps() -> u32 {
    30
}
fn default_open_timeout_ms() -> u64 {
    5000
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_lock_wait_ms() -> u64 {
    3000
}
fn default_configure_wait_ms() -> u64 {
    10_000
}
fn default_probe_max_index() -> u32 {
    6
}
fn default_pixel_threshold() -> u8 {
    30
}
fn default_occupied_ratio() -> f64 {
    0.05
}
fn default_max_width() -> u32 {
    1280
}
fn default_stream_fps() -> f32 {
    30.0
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}
fn default_read_retry_delay_ms() -> u64 {
    100
}
fn default_true() -> bool {
    true
}
fn default_token_ttl_secs() -> u64 {
    3600
}
fn default_frame_interval_ms() -> u64 {
    100
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_max_frame_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_port() -> u16 {
    9100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::default(),
            default_index: 0,
            url: None,
            open_attempts: default_open_attempts(),
            open_retry_delay_ms: default_open_retry_delay_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            network_skip_frames: default_network_skip_frames(),
            target_width: default_target_width(),
            target_height: default_target_height(),
            target_fps: default_capture_fps(),
            open_timeout_ms: default_open_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            configure_wait_ms: default_configure_wait_ms(),
            probe_max_index: default_probe_max_index(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: default_pixel_threshold(),
            occupied_ratio: default_occupied_ratio(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            target_fps: default_stream_fps(),
            jpeg_quality: default_jpeg_quality(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            read_retry_delay_ms: default_read_retry_delay_ms(),
            release_when_idle: true,
            placeholder_width: default_target_width(),
            placeholder_height: default_target_height(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
            frame_interval_ms: default_frame_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_frame_bytes: default_max_frame_bytes(),
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

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with LOTWATCH_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Override with environment variables (e.g., LOTWATCH__CAMERA__URL)
            .add_source(
                Environment::with_prefix("LOTWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("LOTWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.server.host.is_empty() {
            return Err(ConfigValidationError::MissingField("server.host".to_string()));
        }

        if let Some(url) = &self.camera.url {
            if !CameraSource::is_stream_url(url) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "camera.url".to_string(),
                    message: "URL must start with rtsp://, rtsps://, http:// or https://"
                        .to_string(),
                });
            }
        }

        if self.camera.open_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.open_attempts".to_string(),
                message: "At least one open attempt is required".to_string(),
            });
        }

        if self.camera.max_consecutive_failures == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.max_consecutive_failures".to_string(),
                message: "Failure threshold must be greater than 0".to_string(),
            });
        }

        if self.camera.target_width == 0 || self.camera.target_height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.target_width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if self.camera.target_fps == 0 || self.stream.target_fps <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.target_fps/stream.target_fps".to_string(),
                message: "FPS must be greater than 0".to_string(),
            });
        }

        if !(self.detection.occupied_ratio > 0.0 && self.detection.occupied_ratio < 1.0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.occupied_ratio".to_string(),
                message: "Ratio must be between 0 and 1 (exclusive)".to_string(),
            });
        }

        if self.stream.max_width == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "stream.max_width".to_string(),
                message: "Width cap must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "stream.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if self.stream.placeholder_width == 0 || self.stream.placeholder_height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "stream.placeholder_width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if self.relay.token_ttl_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "relay.token_ttl_secs".to_string(),
                message: "Token lifetime must be greater than 0".to_string(),
            });
        }

        if self.relay.frame_interval_ms == 0 || self.relay.sweep_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "relay.frame_interval_ms/sweep_interval_secs".to_string(),
                message: "Intervals must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Source selected at startup.
    pub fn initial_source(&self) -> CameraSource {
        match &self.camera.url {
            Some(url) => CameraSource::Network(url.clone()),
            None => CameraSource::Local(self.camera.default_index),
        }
    }
}

impl CameraConfig {
    /// Get the inter-attempt open delay as Duration.
    pub fn open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.open_retry_delay_ms)
    }

    /// Get the reader lock wait as Duration.
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Get the reconfiguration lock wait as Duration.
    pub fn configure_wait(&self) -> Duration {
        Duration::from_millis(self.configure_wait_ms)
    }

    /// Capture hints handed to the backend on every open.
    pub fn hints(&self) -> CaptureHints {
        CaptureHints {
            width: self.target_width,
            height: self.target_height,
            fps: self.target_fps,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

impl StreamConfig {
    /// Get the reconnection delay as Duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Get the read retry delay as Duration.
    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }
}

impl RelayConfig {
    /// Get the token lifetime as Duration.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Get the relay frame interval as Duration.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Get the sweep interval as Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
