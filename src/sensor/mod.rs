//! Temperature sensors and the overlay they feed.
//!
//! Sensors are slow and flaky (a DHT22 fails its checksum regularly), so
//! every read goes through a bounded retry in [`OverlayUpdater`], and a
//! sensor that never comes up just means "no overlay".

mod font;
mod overlay;

pub use font::{render_text, GLYPH_HEIGHT, GLYPH_WIDTH};
pub use overlay::{render_overlay, CycleOutcome, OverlayUpdater};

use crate::config::{SensorBackend, SensorConfig, TempUnit};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

const EIO: i32 = 5;

/// Errors that can occur while talking to a sensor.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor not found: {0}")]
    NotFound(String),
    #[error("failed to open sensor: {0}")]
    OpenFailed(String),
    /// Checksum or timing error on a single reading; expected to clear on retry.
    #[error("transient read failure: {0}")]
    Transient(String),
    #[error("malformed sensor value {0:?}")]
    Malformed(String),
    #[error("sensor not initialized")]
    NotInitialized,
    #[error("sensor unavailable")]
    Unavailable,
    #[error("sensor i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SensorError {
    /// Maps an I/O error, treating EIO and timeouts as transient.
    fn from_read(e: io::Error) -> Self {
        if e.raw_os_error() == Some(EIO) || e.kind() == io::ErrorKind::TimedOut {
            SensorError::Transient(e.to_string())
        } else {
            SensorError::Io(e)
        }
    }
}

/// One temperature (and optionally humidity) measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub celsius: f32,
    /// Relative humidity in percent, for sensors that report it.
    pub humidity: Option<f32>,
    pub taken_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(celsius: f32, humidity: Option<f32>) -> Self {
        Self {
            celsius,
            humidity,
            taken_at: Utc::now(),
        }
    }

    pub fn fahrenheit(&self) -> f32 {
        self.celsius * 9.0 / 5.0 + 32.0
    }

    /// Short form used on the overlay, e.g. `21.5°C 45%`.
    pub fn format(&self, unit: TempUnit) -> String {
        let temp = match unit {
            TempUnit::Celsius => format!("{:.1}°C", self.celsius),
            TempUnit::Fahrenheit => format!("{:.1}°F", self.fahrenheit()),
        };
        match self.humidity {
            Some(h) => format!("{temp} {h:.0}%"),
            None => temp,
        }
    }
}

/// Trait for temperature sensor implementations.
pub trait Sensor: Send {
    /// Locates and prepares the sensor.
    fn open(&mut self) -> Result<(), SensorError>;

    /// Takes a single reading. May fail transiently.
    fn read(&mut self) -> Result<Reading, SensorError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// One step of a [`MockSensor`] script.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockRead {
    Value(f32),
    Fail,
}

/// Scripted sensor for tests.
///
/// Plays back its script one read at a time, then keeps returning the
/// steady value.
#[derive(Debug)]
pub struct MockSensor {
    steady: f32,
    humidity: Option<f32>,
    script: VecDeque<MockRead>,
    failing_opens: u32,
    opened: bool,
    reads: Arc<AtomicU32>,
    opens: Arc<AtomicU32>,
}

impl MockSensor {
    pub fn new(celsius: f32, humidity: Option<f32>) -> Self {
        Self {
            steady: celsius,
            humidity,
            script: VecDeque::new(),
            failing_opens: 0,
            opened: false,
            reads: Arc::new(AtomicU32::new(0)),
            opens: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Outcomes returned by the first reads, in order.
    pub fn with_script(mut self, script: impl IntoIterator<Item = MockRead>) -> Self {
        self.script = script.into_iter().collect();
        self
    }

    /// Makes the first `n` reads fail transiently.
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.with_script((0..n).map(|_| MockRead::Fail))
    }

    /// Makes the first `n` opens fail.
    pub fn with_failing_opens(mut self, n: u32) -> Self {
        self.failing_opens = n;
        self
    }

    pub fn read_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.reads)
    }

    pub fn open_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.opens)
    }
}

impl Sensor for MockSensor {
    fn open(&mut self) -> Result<(), SensorError> {
        let call = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failing_opens {
            return Err(SensorError::OpenFailed(format!(
                "mock sensor refused open #{call}"
            )));
        }
        self.opened = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        if !self.opened {
            return Err(SensorError::NotInitialized);
        }
        let call = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        match self.script.pop_front() {
            Some(MockRead::Fail) => Err(SensorError::Transient(format!(
                "mock checksum mismatch on read #{call}"
            ))),
            Some(MockRead::Value(celsius)) => Ok(Reading::new(celsius, self.humidity)),
            None => Ok(Reading::new(self.steady, self.humidity)),
        }
    }

    fn describe(&self) -> String {
        "mock sensor".to_string()
    }
}

/// Reads a kernel thermal zone, which reports millidegrees Celsius.
#[derive(Debug)]
pub struct ThermalZoneSensor {
    path: PathBuf,
}

impl ThermalZoneSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Sensor for ThermalZoneSensor {
    fn open(&mut self) -> Result<(), SensorError> {
        if !self.path.is_file() {
            return Err(SensorError::NotFound(self.path.display().to_string()));
        }
        // A first read proves the zone is actually readable
        self.read().map(|_| ())
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        let millis = read_milli(&self.path)?;
        Ok(Reading::new(millis / 1000.0, None))
    }

    fn describe(&self) -> String {
        format!("thermal zone {}", self.path.display())
    }
}

/// DHT11/DHT22 exposed by the Linux `dht11` IIO driver.
///
/// The device-tree overlay names the node `dht11@<gpio in hex>`, which is
/// how the configured GPIO line is matched to an IIO device.
#[derive(Debug)]
pub struct DhtSensor {
    iio_root: PathBuf,
    gpio: u32,
    device: Option<PathBuf>,
}

impl DhtSensor {
    pub fn new(iio_root: impl Into<PathBuf>, gpio: u32) -> Self {
        Self {
            iio_root: iio_root.into(),
            gpio,
            device: None,
        }
    }

    /// Finds the IIO device for the configured GPIO line.
    pub fn discover(&self) -> Result<PathBuf, SensorError> {
        let wanted = format!("dht11@{:x}", self.gpio);
        let entries = fs::read_dir(&self.iio_root)
            .map_err(|e| SensorError::NotFound(format!("{}: {e}", self.iio_root.display())))?;

        let mut fallback = None;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = fs::read_to_string(path.join("name")).unwrap_or_default();
            if !name.trim().starts_with("dht11") {
                continue;
            }
            let node = fs::read_link(path.join("of_node"))
                .ok()
                .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()));
            if node.as_deref() == Some(wanted.as_str()) {
                return Ok(path);
            }
            fallback.get_or_insert(path);
        }

        match fallback {
            Some(path) => {
                tracing::warn!(
                    gpio = self.gpio,
                    device = %path.display(),
                    "no dht11 node for configured gpio, using first dht11 device"
                );
                Ok(path)
            }
            None => Err(SensorError::NotFound(format!(
                "no dht11 device under {}",
                self.iio_root.display()
            ))),
        }
    }
}

impl Sensor for DhtSensor {
    fn open(&mut self) -> Result<(), SensorError> {
        let device = self.discover()?;
        tracing::info!(gpio = self.gpio, device = %device.display(), "dht sensor found");
        self.device = Some(device);
        Ok(())
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        let device = self.device.as_ref().ok_or(SensorError::NotInitialized)?;
        let celsius = read_milli(&device.join("in_temp_input"))? / 1000.0;
        let humidity = match read_milli(&device.join("in_humidityrelative_input")) {
            Ok(milli) => Some(milli / 1000.0),
            Err(SensorError::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        Ok(Reading::new(celsius, humidity))
    }

    fn describe(&self) -> String {
        format!("dht sensor on gpio {}", self.gpio)
    }
}

fn read_milli(path: &Path) -> Result<f32, SensorError> {
    let raw = fs::read_to_string(path).map_err(SensorError::from_read)?;
    let trimmed = raw.trim();
    trimmed
        .parse::<i64>()
        .map(|v| v as f32)
        .map_err(|_| SensorError::Malformed(trimmed.to_string()))
}

/// Builds the sensor selected by the configuration, if any.
pub fn build_sensor(config: &SensorConfig) -> Option<Box<dyn Sensor>> {
    match config.backend {
        SensorBackend::None => None,
        SensorBackend::Mock => Some(Box::new(
            MockSensor::new(config.mock.celsius, config.mock.humidity)
                .with_transient_failures(config.mock.transient_failures),
        )),
        SensorBackend::Thermal => Some(Box::new(ThermalZoneSensor::new(&config.thermal_path))),
        SensorBackend::Dht => Some(Box::new(DhtSensor::new(&config.iio_root, config.gpio))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_dht(root: &Path, index: u32, node: &str, temp: &str) -> PathBuf {
        let device = root.join(format!("iio:device{index}"));
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("name"), "dht11\n").unwrap();
        fs::write(device.join("in_temp_input"), temp).unwrap();
        fs::write(device.join("in_humidityrelative_input"), "41300\n").unwrap();
        let node_dir = root.join("nodes").join(node);
        fs::create_dir_all(&node_dir).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(&node_dir, device.join("of_node")).unwrap();
        device
    }

    #[test]
    fn test_reading_format() {
        let reading = Reading::new(21.54, Some(44.6));
        assert_eq!(reading.format(TempUnit::Celsius), "21.5°C 45%");

        let dry = Reading::new(100.0, None);
        assert_eq!(dry.format(TempUnit::Fahrenheit), "212.0°F");
    }

    #[test]
    fn test_mock_script_then_steady() {
        let mut sensor =
            MockSensor::new(20.0, None).with_script([MockRead::Fail, MockRead::Value(25.0)]);
        sensor.open().unwrap();

        assert!(matches!(sensor.read(), Err(SensorError::Transient(_))));
        assert_eq!(sensor.read().unwrap().celsius, 25.0);
        assert_eq!(sensor.read().unwrap().celsius, 20.0);
        assert_eq!(sensor.read_counter().load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_mock_read_before_open() {
        let mut sensor = MockSensor::new(20.0, None);
        assert!(matches!(sensor.read(), Err(SensorError::NotInitialized)));
    }

    #[test]
    fn test_thermal_zone_reads_millidegrees() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temp");
        fs::write(&path, "48312\n").unwrap();

        let mut sensor = ThermalZoneSensor::new(&path);
        sensor.open().unwrap();
        let reading = sensor.read().unwrap();
        assert!((reading.celsius - 48.312).abs() < 1e-3);
        assert_eq!(reading.humidity, None);
    }

    #[test]
    fn test_thermal_zone_missing() {
        let dir = TempDir::new().unwrap();
        let mut sensor = ThermalZoneSensor::new(dir.path().join("nope"));
        assert!(matches!(sensor.open(), Err(SensorError::NotFound(_))));
    }

    #[test]
    fn test_thermal_zone_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temp");
        fs::write(&path, "hot\n").unwrap();
        let mut sensor = ThermalZoneSensor::new(&path);
        assert!(matches!(sensor.read(), Err(SensorError::Malformed(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_dht_discovered_by_gpio() {
        let dir = TempDir::new().unwrap();
        fake_dht(dir.path(), 0, "dht11@4", "20000\n");
        let wanted = fake_dht(dir.path(), 1, "dht11@11", "23400\n");

        let mut sensor = DhtSensor::new(dir.path(), 17);
        assert_eq!(sensor.discover().unwrap(), wanted);

        sensor.open().unwrap();
        let reading = sensor.read().unwrap();
        assert!((reading.celsius - 23.4).abs() < 1e-3);
        assert!((reading.humidity.unwrap() - 41.3).abs() < 1e-3);
    }

    #[test]
    fn test_dht_missing() {
        let dir = TempDir::new().unwrap();
        let mut sensor = DhtSensor::new(dir.path(), 4);
        assert!(matches!(sensor.open(), Err(SensorError::NotFound(_))));
    }

    #[test]
    fn test_build_sensor_none() {
        assert!(build_sensor(&SensorConfig::default()).is_none());
    }
}
