//! Camera input, encoding and the latest-frame sink.
//!
//! Everything in here runs inside the capture worker. The camera is driven
//! by [`HardwareSupervisor`], every frame is composited with the current
//! overlay and JPEG-encoded, and the result lands in a [`LatestFrameSink`]
//! that only ever holds the newest frame.

mod camera;
mod encode;
mod frame;
mod sink;
mod supervisor;

#[cfg(feature = "camera")]
pub use camera::NokhwaCamera;
pub use camera::{build_camera, Camera, CameraError, MockCamera};
pub use encode::{blend, placeholder_jpeg, EncodeError, FrameEncoder, OverlaySlot};
pub use frame::{is_jpeg, Frame};
pub use sink::LatestFrameSink;
pub use supervisor::{HardwareSupervisor, InitReport, TargetState};
