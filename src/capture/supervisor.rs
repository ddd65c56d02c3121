//! Ownership and bring-up of the camera and sensor.
//!
//! Both targets go through `Uninitialized -> Initializing -> Ready | Failed`.
//! Their retry loops run side by side so a dead sensor never delays video,
//! and `Failed` is terminal until the worker restarts.

use super::{Camera, Frame, FrameEncoder, LatestFrameSink, OverlaySlot};
use crate::config::{CameraConfig, WorkerSettings};
use crate::retry::RetryPolicy;
use crate::sensor::{Reading, Sensor, SensorError};
use crossbeam_channel::{Receiver, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause after a failed capture before asking the camera again.
const CAPTURE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of one hardware target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Uninitialized,
    Initializing,
    Ready,
    /// Retries exhausted; the capability stays off until restart.
    Failed,
    /// Not configured at all.
    Absent,
}

impl TargetState {
    pub fn as_code(self) -> u8 {
        match self {
            TargetState::Uninitialized => 0,
            TargetState::Initializing => 1,
            TargetState::Ready => 2,
            TargetState::Failed => 3,
            TargetState::Absent => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => TargetState::Uninitialized,
            1 => TargetState::Initializing,
            2 => TargetState::Ready,
            3 => TargetState::Failed,
            4 => TargetState::Absent,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetState::Uninitialized => "uninitialized",
            TargetState::Initializing => "initializing",
            TargetState::Ready => "ready",
            TargetState::Failed => "failed",
            TargetState::Absent => "absent",
        };
        f.write_str(s)
    }
}

/// Outcome of an [`HardwareSupervisor::initialize`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitReport {
    pub camera: TargetState,
    pub sensor: TargetState,
}

struct Target<H> {
    state: TargetState,
    handle: Option<H>,
}

impl<H> Target<H> {
    fn new(handle: Option<H>, missing: TargetState) -> Self {
        let state = if handle.is_some() {
            TargetState::Uninitialized
        } else {
            missing
        };
        Self { state, handle }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the camera and sensor handles for the lifetime of a capture worker.
///
/// Once the camera is Ready the supervisor runs the capture/encode loop on
/// its own thread, writing every frame into the [`LatestFrameSink`] with the
/// current overlay blended in.
pub struct HardwareSupervisor {
    camera_config: CameraConfig,
    sensor_policy: RetryPolicy,
    camera: Mutex<Target<Box<dyn Camera>>>,
    sensor: Mutex<Target<Box<dyn Sensor>>>,
    sink: Arc<LatestFrameSink>,
    overlay: OverlaySlot,
    running: Arc<AtomicBool>,
    capture_thread: Mutex<Option<JoinHandle<Box<dyn Camera>>>>,
    stop: Receiver<()>,
}

impl HardwareSupervisor {
    /// Takes ownership of the handles. A missing camera starts out Failed,
    /// a missing sensor starts out Absent.
    pub fn new(
        camera: Option<Box<dyn Camera>>,
        sensor: Option<Box<dyn Sensor>>,
        settings: &WorkerSettings,
        sink: Arc<LatestFrameSink>,
        overlay: OverlaySlot,
    ) -> Self {
        Self {
            camera_config: settings.camera.clone(),
            sensor_policy: settings.sensor.init,
            camera: Mutex::new(Target::new(camera, TargetState::Failed)),
            sensor: Mutex::new(Target::new(sensor, TargetState::Absent)),
            sink,
            overlay,
            running: Arc::new(AtomicBool::new(false)),
            capture_thread: Mutex::new(None),
            stop: crossbeam_channel::never(),
        }
    }

    /// Abandons bring-up retries once `stop` fires or disconnects.
    pub fn with_stop(mut self, stop: Receiver<()>) -> Self {
        self.stop = stop;
        self
    }

    fn stopping(&self) -> bool {
        !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
    }

    pub fn camera_state(&self) -> TargetState {
        lock(&self.camera).state
    }

    pub fn sensor_state(&self) -> TargetState {
        lock(&self.sensor).state
    }

    /// Brings up every target that has not been tried yet.
    ///
    /// Safe to call repeatedly: Ready and Failed targets are left alone, and
    /// a target already being initialized by another caller is skipped.
    pub fn initialize(&self) -> InitReport {
        thread::scope(|scope| {
            let camera = scope.spawn(|| self.init_camera());
            let sensor = scope.spawn(|| self.init_sensor());
            InitReport {
                camera: camera.join().unwrap_or(TargetState::Failed),
                sensor: sensor.join().unwrap_or(TargetState::Failed),
            }
        })
    }

    fn init_camera(&self) -> TargetState {
        let mut camera = {
            let mut target = lock(&self.camera);
            if target.state != TargetState::Uninitialized {
                return target.state;
            }
            match target.handle.take() {
                Some(camera) => {
                    target.state = TargetState::Initializing;
                    camera
                }
                None => {
                    target.state = TargetState::Failed;
                    return target.state;
                }
            }
        };

        let config = &self.camera_config;
        let opened = config.init.run_until("camera init", &self.stop, |_| camera.open(config));

        let state = match opened {
            Ok(()) => match self.start_capture(camera) {
                Ok(()) => TargetState::Ready,
                Err(e) => {
                    tracing::error!(error = %e, "failed to start capture thread");
                    TargetState::Failed
                }
            },
            Err(e) if self.stopping() => {
                tracing::info!(attempts = e.attempts, "camera bring-up abandoned for shutdown");
                lock(&self.camera).handle = Some(camera);
                TargetState::Failed
            }
            Err(e) => {
                tracing::error!(
                    camera = %camera.describe(),
                    attempts = e.attempts,
                    error = %e.last,
                    "camera failed to initialize, serving without video"
                );
                lock(&self.camera).handle = Some(camera);
                TargetState::Failed
            }
        };
        lock(&self.camera).state = state;
        state
    }

    fn init_sensor(&self) -> TargetState {
        let mut sensor = {
            let mut target = lock(&self.sensor);
            if target.state != TargetState::Uninitialized {
                return target.state;
            }
            match target.handle.take() {
                Some(sensor) => {
                    target.state = TargetState::Initializing;
                    sensor
                }
                None => {
                    target.state = TargetState::Absent;
                    return target.state;
                }
            }
        };

        let opened = self.sensor_policy.run_until("sensor init", &self.stop, |_| sensor.open());
        let state = match opened {
            Ok(()) => {
                tracing::info!(sensor = %sensor.describe(), "sensor ready");
                TargetState::Ready
            }
            Err(e) if self.stopping() => {
                tracing::info!(attempts = e.attempts, "sensor bring-up abandoned for shutdown");
                TargetState::Failed
            }
            Err(e) => {
                tracing::error!(
                    sensor = %sensor.describe(),
                    attempts = e.attempts,
                    error = %e.last,
                    "sensor failed to initialize, serving without overlay"
                );
                TargetState::Failed
            }
        };

        let mut target = lock(&self.sensor);
        target.handle = Some(sensor);
        target.state = state;
        state
    }

    fn start_capture(&self, camera: Box<dyn Camera>) -> std::io::Result<()> {
        tracing::info!(camera = %camera.describe(), "camera ready, starting capture");
        self.running.store(true, Ordering::Release);

        let sink = Arc::clone(&self.sink);
        let overlay = self.overlay.clone();
        let running = Arc::clone(&self.running);
        let encoder = FrameEncoder::new(self.camera_config.quality);
        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || capture_loop(camera, &sink, &overlay, encoder, &running))?;
        *lock(&self.capture_thread) = Some(handle);
        Ok(())
    }

    /// Takes one sensor reading. Fails with [`SensorError::Unavailable`]
    /// unless the sensor is Ready.
    pub fn read_sensor(&self) -> Result<Reading, SensorError> {
        let mut target = lock(&self.sensor);
        if target.state != TargetState::Ready {
            return Err(SensorError::Unavailable);
        }
        match target.handle.as_mut() {
            Some(sensor) => sensor.read(),
            None => Err(SensorError::Unavailable),
        }
    }

    /// Stops the capture loop and closes the camera.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let handle = lock(&self.capture_thread).take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(mut camera) => {
                    camera.close();
                    lock(&self.camera).handle = Some(camera);
                }
                Err(_) => tracing::error!("capture thread panicked"),
            }
        }
    }
}

impl Drop for HardwareSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_loop(
    mut camera: Box<dyn Camera>,
    sink: &LatestFrameSink,
    overlay: &OverlaySlot,
    encoder: FrameEncoder,
    running: &AtomicBool,
) -> Box<dyn Camera> {
    let mut sequence = 0u64;
    let mut failures = 0u64;

    while running.load(Ordering::Acquire) {
        match camera.capture() {
            Ok(mut image) => {
                if failures > 0 {
                    tracing::info!(failures, "camera recovered");
                    failures = 0;
                }
                let current = overlay.current();
                match encoder.encode(&mut image, current.as_deref()) {
                    Ok(jpeg) => {
                        sequence += 1;
                        sink.write(Frame::new(jpeg, sequence));
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping frame that failed to encode"),
                }
            }
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % 100 == 0 {
                    tracing::warn!(failures, error = %e, "frame capture failed");
                }
                thread::sleep(CAPTURE_ERROR_BACKOFF);
            }
        }
    }

    tracing::debug!(frames = sequence, "capture loop stopped");
    camera
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockCamera;
    use crate::config::SensorBackend;
    use crate::sensor::MockSensor;
    use std::sync::atomic::AtomicU32;

    fn settings(camera_attempts: u32, sensor_attempts: u32, sensor_delay_ms: u64) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.camera.width = 32;
        settings.camera.height = 24;
        settings.camera.fps = 120;
        settings.camera.init = RetryPolicy::fixed(camera_attempts, Duration::ZERO);
        settings.sensor.backend = SensorBackend::Mock;
        settings.sensor.init =
            RetryPolicy::fixed(sensor_attempts, Duration::from_millis(sensor_delay_ms));
        settings
    }

    fn supervisor(
        camera: MockCamera,
        sensor: Option<MockSensor>,
        settings: &WorkerSettings,
    ) -> (HardwareSupervisor, Arc<LatestFrameSink>, Arc<AtomicU32>) {
        let opens = camera.open_counter();
        let sink = Arc::new(LatestFrameSink::new());
        let sensor = sensor.map(|s| Box::new(s) as Box<dyn Sensor>);
        let supervisor = HardwareSupervisor::new(
            Some(Box::new(camera)),
            sensor,
            settings,
            Arc::clone(&sink),
            OverlaySlot::new(),
        );
        (supervisor, sink, opens)
    }

    #[test]
    fn test_camera_retried_exactly_then_failed() {
        let settings = settings(4, 1, 0);
        let (supervisor, sink, opens) =
            supervisor(MockCamera::new().with_failing_opens(100), None, &settings);

        let report = supervisor.initialize();
        assert_eq!(report.camera, TargetState::Failed);
        assert_eq!(report.sensor, TargetState::Absent);
        assert_eq!(opens.load(Ordering::SeqCst), 4);

        // Failed is terminal
        supervisor.initialize();
        assert_eq!(opens.load(Ordering::SeqCst), 4);
        assert!(sink.latest().is_none());
    }

    #[test]
    fn test_initialize_is_idempotent_after_success() {
        let settings = settings(3, 1, 0);
        let (supervisor, sink, opens) =
            supervisor(MockCamera::new().with_failing_opens(2), None, &settings);

        assert_eq!(supervisor.initialize().camera, TargetState::Ready);
        assert_eq!(opens.load(Ordering::SeqCst), 3);

        assert_eq!(supervisor.initialize().camera, TargetState::Ready);
        assert_eq!(opens.load(Ordering::SeqCst), 3);

        let frame = sink.wait_for_next(Duration::from_secs(2)).unwrap();
        assert!(frame.is_jpeg());
        supervisor.shutdown();
    }

    #[test]
    fn test_failing_sensor_does_not_block_video() {
        let settings = settings(1, 3, 150);
        let sensor = MockSensor::new(20.0, None).with_failing_opens(100);
        let sensor_opens = sensor.open_counter();
        let (supervisor, sink, _) = supervisor(MockCamera::new(), Some(sensor), &settings);

        let report = supervisor.initialize();
        assert_eq!(report.camera, TargetState::Ready);
        assert_eq!(report.sensor, TargetState::Failed);
        assert_eq!(sensor_opens.load(Ordering::SeqCst), 3);
        // Frames were flowing while the sensor was still retrying
        assert!(sink.generation() > 1);
        assert!(matches!(
            supervisor.read_sensor(),
            Err(SensorError::Unavailable)
        ));
    }

    #[test]
    fn test_sensor_ready_reads() {
        let settings = settings(1, 1, 0);
        let (supervisor, _, _) = supervisor(
            MockCamera::new(),
            Some(MockSensor::new(19.5, Some(50.0))),
            &settings,
        );

        assert!(matches!(
            supervisor.read_sensor(),
            Err(SensorError::Unavailable)
        ));
        assert_eq!(supervisor.initialize().sensor, TargetState::Ready);
        assert_eq!(supervisor.read_sensor().unwrap().celsius, 19.5);
    }

    #[test]
    fn test_stop_cuts_bring_up_short() {
        let mut settings = settings(10, 5, 1000);
        settings.camera.init = RetryPolicy::fixed(10, Duration::from_secs(2));
        let camera = MockCamera::new().with_failing_opens(u32::MAX);
        let opens = camera.open_counter();
        let sensor = MockSensor::new(20.0, None).with_failing_opens(u32::MAX);
        let (tx, stop) = crossbeam_channel::bounded::<()>(0);
        let supervisor = HardwareSupervisor::new(
            Some(Box::new(camera)),
            Some(Box::new(sensor)),
            &settings,
            Arc::new(LatestFrameSink::new()),
            OverlaySlot::new(),
        )
        .with_stop(stop);

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            drop(tx);
        });
        let start = std::time::Instant::now();
        let report = supervisor.initialize();
        stopper.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(report.camera, TargetState::Failed);
        assert_eq!(report.sensor, TargetState::Failed);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_camera_is_failed() {
        let settings = settings(1, 1, 0);
        let supervisor = HardwareSupervisor::new(
            None,
            None,
            &settings,
            Arc::new(LatestFrameSink::new()),
            OverlaySlot::new(),
        );
        assert_eq!(supervisor.camera_state(), TargetState::Failed);
        assert_eq!(supervisor.initialize().camera, TargetState::Failed);
    }

    #[test]
    fn test_state_codes_round_trip() {
        for code in 0..5 {
            assert_eq!(TargetState::from_code(code).unwrap().as_code(), code);
        }
        assert!(TargetState::from_code(9).is_none());
    }
}
