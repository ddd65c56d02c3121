//! Periodic sensor reads rendered onto the video.

use super::font::{render_text, text_width, GLYPH_HEIGHT};
use super::Reading;
use crate::capture::{HardwareSupervisor, OverlaySlot, TargetState};
use crate::config::{SensorConfig, TempUnit};
use crate::retry::RetryPolicy;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use image::{Rgba, RgbaImage};
use std::sync::Arc;
use std::time::Duration;

const SCALE: u32 = 3;
const PADDING: u32 = 6;
const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 128]);
const FOREGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Renders `text` as white glyphs on a half-transparent black box.
pub fn render_overlay(text: &str) -> RgbaImage {
    let width = text_width(text, SCALE) + 2 * PADDING;
    let height = GLYPH_HEIGHT * SCALE + 2 * PADDING;
    let mut overlay = RgbaImage::from_pixel(width, height, BACKGROUND);
    render_text(&mut overlay, text, PADDING, PADDING, SCALE, FOREGROUND);
    overlay
}

/// What one update cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A reading was taken and its overlay installed.
    Updated(Reading),
    /// Reads kept failing; the overlay was cleared.
    Cleared,
    /// The sensor is not Ready; no overlay.
    SensorUnavailable,
}

/// Keeps the overlay in step with the sensor.
///
/// Each cycle tries a bounded number of reads. On success the formatted
/// reading is rendered and installed; otherwise the overlay is removed so
/// viewers never see a stale value.
pub struct OverlayUpdater {
    supervisor: Arc<HardwareSupervisor>,
    overlay: OverlaySlot,
    read_policy: RetryPolicy,
    interval: Duration,
    unit: TempUnit,
}

impl OverlayUpdater {
    pub fn new(supervisor: Arc<HardwareSupervisor>, overlay: OverlaySlot, config: &SensorConfig) -> Self {
        Self {
            supervisor,
            overlay,
            read_policy: config.read,
            interval: config.interval(),
            unit: config.unit,
        }
    }

    /// Runs a single read-and-render cycle.
    pub fn cycle(&self) -> CycleOutcome {
        self.cycle_until(&crossbeam_channel::never())
    }

    /// A cycle whose read retries give up once `stop` fires.
    fn cycle_until(&self, stop: &Receiver<()>) -> CycleOutcome {
        if self.supervisor.sensor_state() != TargetState::Ready {
            self.overlay.clear();
            return CycleOutcome::SensorUnavailable;
        }

        match self.read_policy.run_until("sensor read", stop, |_| self.supervisor.read_sensor()) {
            Ok(reading) => {
                self.overlay.set(render_overlay(&reading.format(self.unit)));
                tracing::debug!(celsius = reading.celsius, humidity = ?reading.humidity, "overlay updated");
                CycleOutcome::Updated(reading)
            }
            Err(e) => {
                if self.overlay.is_set() {
                    tracing::warn!(attempts = e.attempts, error = %e.last, "sensor read failed, clearing overlay");
                }
                self.overlay.clear();
                CycleOutcome::Cleared
            }
        }
    }

    /// Runs cycles every interval until `stop` fires or disconnects.
    /// `report` sees every outcome.
    pub fn run(&self, stop: &Receiver<()>, mut report: impl FnMut(&CycleOutcome) -> bool) {
        loop {
            let outcome = self.cycle_until(stop);
            if !report(&outcome) {
                return;
            }
            match stop.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}
