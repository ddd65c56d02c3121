//! Prometheus metrics for the camera pipeline.
//!
//! Exposed as Prometheus text on `GET /metrics`.
//!
//! # Metrics Exposed
//!
//! ## Frame Pipeline
//! - `dogcam_frames_relayed_total` - Frames accepted into the cross-boundary slot
//! - `dogcam_frames_dropped_total` - Frames discarded because the slot was full
//! - `dogcam_placeholders_sent_total` - Placeholders sent during capture stalls
//!
//! ## Viewers
//! - `dogcam_active_viewers` - Viewers currently streaming
//! - `dogcam_viewers_rejected_total` - Requests turned away at capacity
//!
//! ## Hardware
//! - `dogcam_sensor_readings_total` / `dogcam_sensor_unavailable_total`
//! - `dogcam_worker_restarts_total` - Capture worker restarts
//! - `dogcam_camera_ready` / `dogcam_sensor_ready` - 1 when Ready

mod collector;

pub use collector::{Metrics, MetricsError};
