//! The isolated capture worker and its link to the server.
//!
//! The worker owns all hardware. It talks to the serving side only through
//! [`WorkerEvent`]s: frames go into the capacity-one [`frame_channel`],
//! readings and hardware state go onto a [`WorkerStatus`] watch. Two
//! flavours run the same [`pipeline`]:
//!
//! - [`ProcessWorker`] re-executes the binary as a child process and reads
//!   events from its stdout, so a wedged driver cannot stall the server.
//! - [`ThreadWorker`] runs the pipeline on threads in this process.

mod channel;
pub mod pipeline;
mod process;
mod thread;
pub mod wire;

pub use channel::{frame_channel, FrameReceiver, FrameSender, ReceiveError, SendOutcome};
pub use process::{run_child, ProcessWorker, WorkerCommand};
pub use thread::ThreadWorker;
pub use wire::{WireError, WorkerEvent};

use crate::capture::InitReport;
use crate::metrics::Metrics;
use crate::sensor::Reading;
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Errors from starting or stopping a capture worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn capture worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to pass settings to worker: {0}")]
    Settings(#[from] crate::config::ConfigError),
    /// Teardown did not finish within the join timeout.
    #[error("capture worker did not exit within {0:?}")]
    Unresponsive(Duration),
}

/// What the server currently knows about the worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStatus {
    /// Latest sensor reading; `None` when the last cycle had none.
    pub reading: Option<Reading>,
    pub hardware: Option<InitReport>,
    /// Whether a worker is currently alive.
    pub running: bool,
}

/// A running capture worker.
pub trait CaptureWorker: Send {
    /// Stops the worker, waiting at most `timeout`.
    fn shutdown(self: Box<Self>, timeout: Duration) -> Result<(), WorkerError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// One-shot stop signal shared by threads.
///
/// Threads wait on [`receiver`](Self::receiver) with `recv_timeout`;
/// triggering drops the only sender so every waiter sees a disconnect.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes worker events on the serving side.
#[derive(Clone)]
pub struct Dispatch {
    frames: FrameSender,
    status: watch::Sender<WorkerStatus>,
    metrics: Arc<Metrics>,
}

impl Dispatch {
    pub fn new(frames: FrameSender, status: watch::Sender<WorkerStatus>, metrics: Arc<Metrics>) -> Self {
        Self {
            frames,
            status,
            metrics,
        }
    }

    /// Handles one event. Frames are offered to the slot without waiting.
    pub fn dispatch(&self, event: WorkerEvent) -> SendOutcome {
        match event {
            WorkerEvent::Frame(frame) => {
                let outcome = self.frames.try_send(frame);
                self.metrics.record_send(outcome);
                return outcome;
            }
            WorkerEvent::Reading(reading) => {
                self.metrics.record_reading(true);
                self.status.send_modify(|s| s.reading = Some(reading));
            }
            WorkerEvent::SensorUnavailable => {
                self.metrics.record_reading(false);
                self.status.send_modify(|s| s.reading = None);
            }
            WorkerEvent::Hardware(report) => {
                tracing::info!(camera = %report.camera, sensor = %report.sensor, "worker hardware state");
                self.metrics.record_hardware(&report);
                self.status.send_modify(|s| s.hardware = Some(report));
            }
        }
        SendOutcome::Queued
    }

    pub fn set_running(&self, running: bool) {
        self.status.send_modify(|s| {
            s.running = running;
            if !running {
                s.reading = None;
            }
        });
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
