//! Dogcam
//!
//! A live MJPEG camera feed with an optional temperature overlay, served to
//! a bounded number of viewers while all camera and sensor I/O runs in an
//! isolated capture worker.
//!
//! # Architecture
//!
//! ```text
//!  capture worker (child process)           serving process
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │ camera → encode → LatestFrame│ stdout │ frame channel (1 slot)       │
//! │ sensor → overlay     Sink    │ ─────→ │   → FrameFeed (watch)        │
//! │              relay ──────────│        │   → StreamBroadcaster × N    │
//! └──────────────────────────────┘        │ ViewerAdmission, /status     │
//!                                         └──────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - **Degrade, don't crash**: a camera or sensor that never comes up means
//!   no video or no overlay, never a dead server
//! - **Never block the producer**: frames that find the slot full are dropped
//! - **Bounded everything**: retries, viewers, waits and teardown all have limits
//!
//! # Example
//!
//! ```no_run
//! use dogcam::{App, Config};
//!
//! # async fn run() -> Result<(), dogcam::Error> {
//! let mut config = Config::default();
//! config.server.username = Some("admin".into());
//! config.server.password = Some("secret".into());
//!
//! let app = App::start(config).await?;
//! println!("listening on {}", app.local_addr());
//! app.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

mod app;
pub mod capture;
pub mod config;
pub mod metrics;
pub mod retry;
pub mod sensor;
pub mod serve;
pub mod worker;

pub use app::App;
pub use capture::{Frame, HardwareSupervisor, LatestFrameSink, TargetState};
pub use config::{Config, ConfigError, WorkerSettings};
pub use serve::{StreamBroadcaster, ViewerAdmission, ViewerPermit};
pub use worker::{frame_channel, CaptureWorker, WorkerError, WorkerStatus};

use thiserror::Error;

/// Errors that stop the server from starting or shutting down cleanly.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] serve::ServerError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("metrics error: {0}")]
    Metrics(#[from] metrics::MetricsError),

    #[error("failed to build placeholder image: {0}")]
    Encode(#[from] capture::EncodeError),
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
