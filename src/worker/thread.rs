//! Capture worker on threads inside the serving process.

use super::pipeline::{self, EventSink, PeerClosed, PipelineExit};
use super::{CaptureWorker, Dispatch, SendOutcome, StopSignal, WorkerError, WorkerEvent};
use crate::capture::Camera;
use crate::config::WorkerSettings;
use crate::sensor::Sensor;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct DispatchSink(Dispatch);

impl EventSink for DispatchSink {
    fn emit(&mut self, event: WorkerEvent) -> Result<(), PeerClosed> {
        match self.0.dispatch(event) {
            SendOutcome::Closed => Err(PeerClosed),
            SendOutcome::Queued | SendOutcome::Dropped => Ok(()),
        }
    }
}

/// The capture pipeline on a background thread.
///
/// No isolation from driver hangs; meant for development and tests.
pub struct ThreadWorker {
    stop: StopSignal,
    done: Receiver<()>,
    handle: Option<JoinHandle<PipelineExit>>,
}

impl ThreadWorker {
    /// Builds hardware from `settings` on the worker thread and runs it.
    pub fn spawn(settings: &WorkerSettings, dispatch: Dispatch) -> io::Result<Self> {
        let settings = settings.clone();
        Self::start(dispatch, move |events, stop| {
            pipeline::run_from_settings(&settings, events, stop)
        })
    }

    /// Runs the pipeline with hardware handles supplied by the caller.
    pub fn with_hardware(
        camera: Option<Box<dyn Camera>>,
        sensor: Option<Box<dyn Sensor>>,
        settings: &WorkerSettings,
        dispatch: Dispatch,
    ) -> io::Result<Self> {
        let settings = settings.clone();
        Self::start(dispatch, move |events, stop| {
            pipeline::run(camera, sensor, &settings, events, stop)
        })
    }

    fn start<F>(dispatch: Dispatch, body: F) -> io::Result<Self>
    where
        F: FnOnce(Box<dyn EventSink>, &StopSignal) -> PipelineExit + Send + 'static,
    {
        let stop = StopSignal::new();
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let handle = {
            let stop = stop.clone();
            thread::Builder::new().name("capture-worker".into()).spawn(move || {
                let _done = done_tx;
                dispatch.set_running(true);
                let exit = body(Box::new(DispatchSink(dispatch.clone())), &stop);
                dispatch.set_running(false);
                exit
            })?
        };
        tracing::info!("capture worker thread started");
        Ok(Self {
            stop,
            done,
            handle: Some(handle),
        })
    }
}

impl CaptureWorker for ThreadWorker {
    fn shutdown(mut self: Box<Self>, timeout: Duration) -> Result<(), WorkerError> {
        self.stop.trigger();
        if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(timeout) {
            tracing::error!(?timeout, "capture worker thread unresponsive");
            return Err(WorkerError::Unresponsive(timeout));
        }
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(exit) => tracing::info!(?exit, "capture worker thread stopped"),
                Err(_) => tracing::error!("capture worker thread panicked"),
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "capture thread".to_string()
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MockCamera, TargetState};
    use crate::metrics::Metrics;
    use crate::retry::RetryPolicy;
    use crate::worker::{frame_channel, WorkerStatus};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::watch;

    fn settings() -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.camera.width = 32;
        settings.camera.height = 24;
        settings.camera.init = RetryPolicy::fixed(1, Duration::ZERO);
        settings
    }

    #[test]
    fn test_frames_reach_the_channel() {
        let (tx, rx) = frame_channel();
        let (status_tx, status_rx) = watch::channel(WorkerStatus::default());
        let dispatch = Dispatch::new(tx, status_tx, Arc::new(Metrics::new().unwrap()));

        let worker = ThreadWorker::with_hardware(
            Some(Box::new(MockCamera::new())),
            None,
            &settings(),
            dispatch,
        )
        .unwrap();

        let first = rx.receive(Duration::from_secs(5)).unwrap();
        let second = rx.receive(Duration::from_secs(5)).unwrap();
        assert!(first.is_jpeg());
        assert!(second.sequence() > first.sequence());

        let deadline = Instant::now() + Duration::from_secs(5);
        while status_rx.borrow().hardware.is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let status = status_rx.borrow().clone();
        assert!(status.running);
        assert_eq!(status.hardware.unwrap().camera, TargetState::Ready);
        assert_eq!(status.hardware.unwrap().sensor, TargetState::Absent);

        Box::new(worker).shutdown(Duration::from_secs(5)).unwrap();
        assert!(!status_rx.borrow().running);
    }

    #[test]
    fn test_shutdown_with_failed_camera() {
        let (tx, _rx) = frame_channel();
        let (status_tx, _status_rx) = watch::channel(WorkerStatus::default());
        let dispatch = Dispatch::new(tx, status_tx, Arc::new(Metrics::new().unwrap()));

        let worker = ThreadWorker::with_hardware(
            Some(Box::new(MockCamera::new().with_failing_opens(u32::MAX))),
            None,
            &settings(),
            dispatch,
        )
        .unwrap();

        let start = Instant::now();
        Box::new(worker).shutdown(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_shutdown_during_camera_retries() {
        let (tx, _rx) = frame_channel();
        let (status_tx, _status_rx) = watch::channel(WorkerStatus::default());
        let dispatch = Dispatch::new(tx, status_tx, Arc::new(Metrics::new().unwrap()));
        let mut settings = settings();
        settings.camera.init = RetryPolicy::fixed(10, Duration::from_secs(2));

        let worker = ThreadWorker::with_hardware(
            Some(Box::new(MockCamera::new().with_failing_opens(u32::MAX))),
            None,
            &settings,
            dispatch,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let start = Instant::now();
        Box::new(worker).shutdown(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
