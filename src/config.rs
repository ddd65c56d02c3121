//! Runtime configuration.
//!
//! Settings come from an optional TOML file, then command-line flags and
//! their environment variables override individual values (see `main.rs`).
//! Only configuration errors are fatal at startup; everything else degrades.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid frame dimensions")]
    InvalidDimensions,
    #[error("invalid frame rate (must be 1-120 fps)")]
    InvalidFrameRate,
    #[error("invalid jpeg quality (must be 1-100)")]
    InvalidQuality,
    #[error("max_viewers must be at least 1")]
    InvalidViewerLimit,
    #[error("{0} retry policy needs at least one attempt")]
    InvalidRetry(&'static str),
    #[error("{0} retry backoff must be a finite number of at least 1")]
    InvalidBackoff(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("invalid multipart boundary {0:?}")]
    InvalidBoundary(String),
    #[error("basic auth username and password are required")]
    MissingCredentials,
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
    #[error("failed to serialize settings: {0}")]
    SerializeError(String),
}

/// Which camera implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    /// Synthetic test pattern.
    #[default]
    Mock,
    /// Native capture via `nokhwa` (requires the `camera` feature).
    Nokhwa,
}

/// Camera capture configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub backend: CameraBackend,
    /// Camera device index.
    pub device_index: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Target frames per second.
    pub fps: u32,
    /// JPEG quality, 1-100.
    pub quality: u8,
    /// Mock only: stop producing frames after this many.
    pub stall_after_frames: Option<u64>,
    /// Retry policy for bringing the camera up.
    pub init: RetryPolicy,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackend::default(),
            device_index: 0,
            width: 640,
            height: 480,
            fps: 30,
            quality: 80,
            stall_after_frames: None,
            init: RetryPolicy::fixed(10, Duration::from_secs(2)),
        }
    }
}

impl CameraConfig {
    /// Validates the configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if self.fps == 0 || self.fps > 120 {
            return Err(ConfigError::InvalidFrameRate);
        }
        if self.quality == 0 || self.quality > 100 {
            return Err(ConfigError::InvalidQuality);
        }
        check_retry("camera", &self.init)
    }
}

fn check_retry(name: &'static str, policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.attempts == 0 {
        return Err(ConfigError::InvalidRetry(name));
    }
    if !policy.has_valid_backoff() {
        return Err(ConfigError::InvalidBackoff(name));
    }
    Ok(())
}

/// Which temperature sensor to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SensorBackend {
    /// No sensor; the overlay and status stay unavailable.
    #[default]
    None,
    /// Scripted readings for testing.
    Mock,
    /// Kernel thermal zone (board/CPU temperature).
    Thermal,
    /// DHT11/DHT22 through the Linux IIO driver.
    Dht,
}

/// Unit used when formatting readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TempUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

/// Behaviour of the mock sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockSensorConfig {
    pub celsius: f32,
    pub humidity: Option<f32>,
    /// Number of reads that fail before readings start succeeding.
    pub transient_failures: u32,
}

impl Default for MockSensorConfig {
    fn default() -> Self {
        Self {
            celsius: 21.5,
            humidity: Some(45.0),
            transient_failures: 0,
        }
    }
}

/// Temperature sensor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub backend: SensorBackend,
    /// GPIO line the DHT sensor's data pin is wired to.
    pub gpio: u32,
    /// Where IIO devices are listed.
    pub iio_root: PathBuf,
    /// Thermal zone file holding millidegrees Celsius.
    pub thermal_path: PathBuf,
    /// Time between overlay updates, in milliseconds.
    pub interval_ms: u64,
    pub unit: TempUnit,
    /// Retry policy for opening the sensor.
    pub init: RetryPolicy,
    /// Retry policy for a single reading.
    pub read: RetryPolicy,
    pub mock: MockSensorConfig,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            backend: SensorBackend::default(),
            gpio: 4,
            iio_root: PathBuf::from("/sys/bus/iio/devices"),
            thermal_path: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            interval_ms: 5000,
            unit: TempUnit::default(),
            init: RetryPolicy::fixed(5, Duration::from_secs(1)),
            read: RetryPolicy::fixed(3, Duration::from_secs(1)),
            mock: MockSensorConfig::default(),
        }
    }
}

impl SensorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("sensor.interval_ms"));
        }
        check_retry("sensor init", &self.init)?;
        check_retry("sensor read", &self.read)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Concurrent stream viewers allowed.
    pub max_viewers: usize,
    /// Name shown on the page and in status text.
    pub display_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// How long a viewer waits for a frame before a placeholder is sent.
    pub frame_timeout_ms: u64,
    /// Multipart boundary token.
    pub boundary: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5000,
            max_viewers: 3,
            display_name: "Dog".to_string(),
            username: None,
            password: None,
            frame_timeout_ms: 5000,
            boundary: "frame".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_viewers == 0 {
            return Err(ConfigError::InvalidViewerLimit);
        }
        if self.frame_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval("server.frame_timeout_ms"));
        }
        let token_char = |c: char| c.is_ascii_alphanumeric() || "'()+_,-./:=?".contains(c);
        if self.boundary.is_empty() || self.boundary.len() > 70 || !self.boundary.chars().all(token_char)
        {
            return Err(ConfigError::InvalidBoundary(self.boundary.clone()));
        }
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Ok(()),
            _ => Err(ConfigError::MissingCredentials),
        }
    }
}

/// How the capture worker is isolated from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Separate child process.
    #[default]
    Process,
    /// Threads inside the serving process.
    Thread,
}

/// Restart policy for a capture worker that exits on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Give up after this many restarts; unlimited when absent.
    pub max_restarts: Option<u32>,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: None,
            delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `restart` (1-based), doubling each time.
    pub fn delay_for(&self, restart: u32) -> Duration {
        let shift = restart.saturating_sub(1).min(16);
        let delay = self.delay_ms.saturating_mul(1 << shift).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Capture worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub isolation: Isolation,
    /// How long teardown may take before the worker counts as unresponsive.
    pub join_timeout_ms: u64,
    pub restart: RestartPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            isolation: Isolation::default(),
            join_timeout_ms: 5000,
            restart: RestartPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Full configuration file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Checks every section. Call after all overrides are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.camera.validate()?;
        self.sensor.validate()
    }

    /// The part of the configuration the capture worker needs.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            camera: self.camera.clone(),
            sensor: self.sensor.clone(),
        }
    }
}

/// Settings handed to the capture worker.
///
/// The process worker receives these as a TOML string argument, so no
/// credentials ever reach the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkerSettings {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
}

impl WorkerSettings {
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}
