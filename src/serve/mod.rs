//! The serving side: viewer admission, MJPEG streams and HTTP routes.
//!
//! Frames arrive from the capture worker on the [`FrameReceiver`](crate::worker::FrameReceiver);
//! [`FrameFeed`] republishes them on a watch that every
//! [`StreamBroadcaster`] reads independently.

pub mod admission;
mod auth;
mod feed;
pub mod server;
pub mod stream;

pub use admission::{CapacityExceeded, ViewerAdmission, ViewerPermit};
pub use auth::Credentials;
pub use feed::FrameFeed;
pub use server::{router, AppState, ServerError};
pub use stream::{StreamBroadcaster, StreamSettings};
