//! Metrics collection and registry.

use crate::capture::{InitReport, TargetState};
use crate::worker::SendOutcome;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Prometheus metrics registry for the camera pipeline.
pub struct Metrics {
    registry: Registry,

    // Frame pipeline
    frames_relayed: IntCounter,
    frames_dropped: IntCounter,
    placeholders_sent: IntCounter,

    // Viewers
    active_viewers: IntGauge,
    viewers_rejected: IntCounter,

    // Sensor
    sensor_readings: IntCounter,
    sensor_unavailable: IntCounter,

    // Worker and hardware
    worker_restarts: IntCounter,
    camera_ready: IntGauge,
    sensor_ready: IntGauge,
}

impl Metrics {
    /// Creates a new registry with all metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let frames_relayed = IntCounter::new(
            "dogcam_frames_relayed_total",
            "Frames accepted into the cross-boundary slot",
        )?;
        let frames_dropped = IntCounter::new(
            "dogcam_frames_dropped_total",
            "Frames discarded because the slot was still full",
        )?;
        let placeholders_sent = IntCounter::new(
            "dogcam_placeholders_sent_total",
            "Placeholder images sent to viewers during capture stalls",
        )?;
        let active_viewers = IntGauge::new("dogcam_active_viewers", "Viewers currently streaming")?;
        let viewers_rejected = IntCounter::new(
            "dogcam_viewers_rejected_total",
            "Stream requests turned away at capacity",
        )?;
        let sensor_readings = IntCounter::new(
            "dogcam_sensor_readings_total",
            "Successful sensor readings received from the worker",
        )?;
        let sensor_unavailable = IntCounter::new(
            "dogcam_sensor_unavailable_total",
            "Overlay cycles that ended without a reading",
        )?;
        let worker_restarts = IntCounter::new(
            "dogcam_worker_restarts_total",
            "Capture worker restarts after an unexpected exit",
        )?;
        let camera_ready = IntGauge::new("dogcam_camera_ready", "Camera state (1=ready, 0=not ready)")?;
        let sensor_ready = IntGauge::new("dogcam_sensor_ready", "Sensor state (1=ready, 0=not ready)")?;

        registry.register(Box::new(frames_relayed.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(placeholders_sent.clone()))?;
        registry.register(Box::new(active_viewers.clone()))?;
        registry.register(Box::new(viewers_rejected.clone()))?;
        registry.register(Box::new(sensor_readings.clone()))?;
        registry.register(Box::new(sensor_unavailable.clone()))?;
        registry.register(Box::new(worker_restarts.clone()))?;
        registry.register(Box::new(camera_ready.clone()))?;
        registry.register(Box::new(sensor_ready.clone()))?;

        Ok(Self {
            registry,
            frames_relayed,
            frames_dropped,
            placeholders_sent,
            active_viewers,
            viewers_rejected,
            sensor_readings,
            sensor_unavailable,
            worker_restarts,
            camera_ready,
            sensor_ready,
        })
    }

    pub fn record_send(&self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Queued => self.frames_relayed.inc(),
            SendOutcome::Dropped => self.frames_dropped.inc(),
            SendOutcome::Closed => {}
        }
    }

    pub fn record_placeholder(&self) {
        self.placeholders_sent.inc();
    }

    pub fn viewer_started(&self) {
        self.active_viewers.inc();
    }

    pub fn viewer_finished(&self) {
        self.active_viewers.dec();
    }

    pub fn viewer_rejected(&self) {
        self.viewers_rejected.inc();
    }

    pub fn record_reading(&self, available: bool) {
        if available {
            self.sensor_readings.inc();
        } else {
            self.sensor_unavailable.inc();
        }
    }

    pub fn record_restart(&self) {
        self.worker_restarts.inc();
    }

    pub fn record_hardware(&self, report: &InitReport) {
        let ready = |state: TargetState| i64::from(state == TargetState::Ready);
        self.camera_ready.set(ready(report.camera));
        self.sensor_ready.set(ready(report.sensor));
    }

    pub fn active_viewers(&self) -> i64 {
        self.active_viewers.get()
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_metrics_update() {
        let metrics = Metrics::new().unwrap();

        metrics.record_send(SendOutcome::Queued);
        metrics.record_send(SendOutcome::Dropped);
        metrics.record_send(SendOutcome::Dropped);
        metrics.viewer_started();
        metrics.viewer_started();
        metrics.viewer_finished();
        metrics.record_hardware(&InitReport {
            camera: TargetState::Ready,
            sensor: TargetState::Failed,
        });

        let output = metrics.encode().unwrap();
        assert!(output.contains("dogcam_frames_relayed_total 1"));
        assert!(output.contains("dogcam_frames_dropped_total 2"));
        assert!(output.contains("dogcam_active_viewers 1"));
        assert!(output.contains("dogcam_camera_ready 1"));
        assert!(output.contains("dogcam_sensor_ready 0"));
    }

    #[test]
    fn test_metrics_encode() {
        let metrics = Metrics::new().unwrap();
        let output = metrics.encode().unwrap();

        assert!(output.contains("dogcam_placeholders_sent_total"));
        assert!(output.contains("dogcam_viewers_rejected_total"));
        assert!(output.contains("dogcam_worker_restarts_total"));
    }
}
