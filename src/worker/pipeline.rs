//! The capture pipeline that runs inside a worker.
//!
//! ```text
//! camera -> encode(+overlay) -> LatestFrameSink -> relay -> EventSink
//! sensor -> OverlayUpdater --------------------------------^
//! ```

use super::{StopSignal, WorkerEvent};
use crate::capture::{build_camera, Camera, HardwareSupervisor, LatestFrameSink, OverlaySlot};
use crate::config::WorkerSettings;
use crate::sensor::{build_sensor, CycleOutcome, OverlayUpdater, Sensor};
use crossbeam_channel::select;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// How long the relay waits on the sink before rechecking for shutdown.
const RELAY_POLL: Duration = Duration::from_millis(500);

/// The consumer of worker events has gone away.
#[derive(Debug, Error)]
#[error("event consumer closed")]
pub struct PeerClosed;

/// Where a pipeline delivers its events.
pub trait EventSink: Send {
    fn emit(&mut self, event: WorkerEvent) -> Result<(), PeerClosed>;
}

/// Writes events to a pipe, typically the worker process's stdout.
pub struct PipeSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> PipeSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> EventSink for PipeSink<W> {
    fn emit(&mut self, event: WorkerEvent) -> Result<(), PeerClosed> {
        if !super::wire::fits(&event) {
            tracing::warn!(limit = super::wire::MAX_PAYLOAD, "frame too large for the event pipe, dropped");
            return Ok(());
        }
        match super::wire::write_event(&mut self.writer, &event) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(PeerClosed),
            Err(e) => {
                tracing::warn!(error = %e, "event pipe write failed");
                Err(PeerClosed)
            }
        }
    }
}

/// Why [`run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    Stopped,
    PeerClosed,
}

type SharedSink = Arc<Mutex<Box<dyn EventSink>>>;

fn emit(events: &SharedSink, event: WorkerEvent) -> Result<(), PeerClosed> {
    events
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .emit(event)
}

/// Builds hardware from `settings` and runs until `stop` fires or the
/// event consumer disappears.
pub fn run_from_settings(
    settings: &WorkerSettings,
    events: Box<dyn EventSink>,
    stop: &StopSignal,
) -> PipelineExit {
    let camera = match build_camera(&settings.camera) {
        Ok(camera) => Some(camera),
        Err(e) => {
            tracing::error!(error = %e, "no usable camera");
            None
        }
    };
    let sensor = build_sensor(&settings.sensor);
    run(camera, sensor, settings, events, stop)
}

/// Runs the pipeline with the given hardware handles.
pub fn run(
    camera: Option<Box<dyn Camera>>,
    sensor: Option<Box<dyn Sensor>>,
    settings: &WorkerSettings,
    events: Box<dyn EventSink>,
    stop: &StopSignal,
) -> PipelineExit {
    let sink = Arc::new(LatestFrameSink::new());
    let overlay = OverlaySlot::new();
    let halt = StopSignal::new();
    let supervisor = Arc::new(
        HardwareSupervisor::new(camera, sensor, settings, Arc::clone(&sink), overlay.clone())
            .with_stop(halt.receiver().clone()),
    );
    let events: SharedSink = Arc::new(Mutex::new(events));

    let relay = {
        let sink = Arc::clone(&sink);
        let events = Arc::clone(&events);
        let halt = halt.clone();
        thread::Builder::new()
            .name("relay".into())
            .spawn(move || relay_loop(&sink, &events, &halt))
    };

    let hardware = {
        let supervisor = Arc::clone(&supervisor);
        let events = Arc::clone(&events);
        let halt = halt.clone();
        let sensor_config = settings.sensor.clone();
        thread::Builder::new().name("hardware".into()).spawn(move || {
            let report = supervisor.initialize();
            if emit(&events, WorkerEvent::Hardware(report)).is_err() {
                halt.trigger();
                return;
            }
            let updater = OverlayUpdater::new(Arc::clone(&supervisor), overlay, &sensor_config);
            updater.run(halt.receiver(), |outcome| {
                let event = match outcome {
                    CycleOutcome::Updated(reading) => WorkerEvent::Reading(*reading),
                    CycleOutcome::Cleared | CycleOutcome::SensorUnavailable => {
                        WorkerEvent::SensorUnavailable
                    }
                };
                let delivered = emit(&events, event).is_ok();
                if !delivered {
                    halt.trigger();
                }
                delivered
            });
        })
    };

    let (relay, hardware) = match (relay, hardware) {
        (Ok(relay), Ok(hardware)) => (relay, hardware),
        (relay, hardware) => {
            tracing::error!("failed to spawn pipeline threads");
            halt.trigger();
            for handle in [relay.ok(), hardware.ok()].into_iter().flatten() {
                let _ = handle.join();
            }
            supervisor.shutdown();
            return PipelineExit::PeerClosed;
        }
    };

    select! {
        recv(stop.receiver()) -> _ => {},
        recv(halt.receiver()) -> _ => {},
    }
    let exit = if halt.is_triggered() {
        PipelineExit::PeerClosed
    } else {
        PipelineExit::Stopped
    };
    halt.trigger();

    if relay.join().is_err() {
        tracing::error!("relay thread panicked");
    }
    if hardware.join().is_err() {
        tracing::error!("hardware thread panicked");
    }
    supervisor.shutdown();
    tracing::info!(?exit, "capture pipeline stopped");
    exit
}

fn relay_loop(sink: &LatestFrameSink, events: &SharedSink, halt: &StopSignal) {
    let mut seen = 0;
    while !halt.is_triggered() {
        let Some((generation, frame)) = sink.wait_newer_than(seen, RELAY_POLL) else {
            continue;
        };
        seen = generation;
        if emit(events, WorkerEvent::Frame(frame)).is_err() {
            tracing::debug!("frame consumer closed, stopping relay");
            halt.trigger();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, MockCamera, TargetState};
    use crate::config::SensorBackend;
    use crate::retry::RetryPolicy;
    use crate::sensor::MockSensor;
    use crossbeam_channel::Sender;

    struct ChannelSink(Sender<WorkerEvent>);

    impl EventSink for ChannelSink {
        fn emit(&mut self, event: WorkerEvent) -> Result<(), PeerClosed> {
            self.0.send(event).map_err(|_| PeerClosed)
        }
    }

    fn settings() -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.camera.width = 64;
        settings.camera.height = 48;
        settings.camera.fps = 60;
        settings.camera.init = RetryPolicy::fixed(1, Duration::ZERO);
        settings.sensor.backend = SensorBackend::Mock;
        settings.sensor.init = RetryPolicy::fixed(1, Duration::ZERO);
        settings.sensor.interval_ms = 50;
        settings
    }

    #[test]
    fn test_pipeline_emits_state_frames_and_readings() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = StopSignal::new();
        let worker = {
            let stop = stop.clone();
            thread::spawn(move || {
                run(
                    Some(Box::new(MockCamera::new())),
                    Some(Box::new(MockSensor::new(24.0, None))),
                    &settings(),
                    Box::new(ChannelSink(tx)),
                    &stop,
                )
            })
        };

        let mut saw_hardware = false;
        let mut frames = 0;
        let mut readings = 0;
        while !(saw_hardware && frames >= 3 && readings >= 1) {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                WorkerEvent::Hardware(report) => {
                    assert_eq!(report.camera, TargetState::Ready);
                    assert_eq!(report.sensor, TargetState::Ready);
                    saw_hardware = true;
                }
                WorkerEvent::Frame(frame) => {
                    assert!(frame.is_jpeg());
                    frames += 1;
                }
                WorkerEvent::Reading(reading) => {
                    assert_eq!(reading.celsius, 24.0);
                    readings += 1;
                }
                WorkerEvent::SensorUnavailable => {}
            }
        }

        stop.trigger();
        assert_eq!(worker.join().unwrap(), PipelineExit::Stopped);
    }

    #[test]
    fn test_pipeline_stops_when_consumer_leaves() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = StopSignal::new();
        drop(rx);

        let exit = run(
            Some(Box::new(MockCamera::new())),
            None,
            &settings(),
            Box::new(ChannelSink(tx)),
            &stop,
        );
        assert_eq!(exit, PipelineExit::PeerClosed);
    }

    #[test]
    fn test_pipe_sink_reports_broken_pipe() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sink = PipeSink::new(Closed);
        assert!(sink.emit(WorkerEvent::SensorUnavailable).is_err());

        let mut ok = PipeSink::new(Vec::new());
        ok.emit(WorkerEvent::SensorUnavailable).unwrap();
        assert_eq!(ok.writer.len(), 5);
    }

    #[test]
    fn test_pipe_sink_drops_oversized_frame() {
        let mut sink = PipeSink::new(Vec::new());
        let huge = Frame::new(vec![0; crate::worker::wire::MAX_PAYLOAD], 1);
        sink.emit(WorkerEvent::Frame(huge)).unwrap();
        assert!(sink.writer.is_empty());

        sink.emit(WorkerEvent::SensorUnavailable).unwrap();
        assert_eq!(sink.writer.len(), 5);
    }
}
