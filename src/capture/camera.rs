//! Camera abstraction for frame capture.
//!
//! This module provides a trait-based abstraction over camera hardware,
//! allowing for both real camera input and mock implementations for testing.
//! Cameras hand back raw RGB images; encoding happens in
//! [`FrameEncoder`](super::FrameEncoder) so the overlay can be composited first.

use crate::config::CameraConfig;
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that can occur during camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to open camera: {0}")]
    OpenFailed(String),
    #[error("failed to configure camera: {0}")]
    ConfigFailed(String),
    #[error("failed to capture frame: {0}")]
    CaptureFailed(String),
    #[error("camera not initialized")]
    NotInitialized,
}

/// Trait for camera implementations.
///
/// This abstraction allows swapping between real camera hardware
/// and mock implementations for testing.
pub trait Camera: Send {
    /// Opens and initializes the camera with the given configuration.
    fn open(&mut self, config: &CameraConfig) -> Result<(), CameraError>;

    /// Blocks until the next frame is available and returns it.
    fn capture(&mut self) -> Result<RgbImage, CameraError>;

    /// Checks if the camera is currently open.
    fn is_open(&self) -> bool;

    /// Closes the camera and releases resources.
    fn close(&mut self);

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Mock camera for testing that generates a moving test pattern.
///
/// Can be told to fail its first `n` opens, and to stall (return capture
/// errors) after a number of frames, to exercise the retry and placeholder
/// paths.
#[derive(Debug, Default)]
pub struct MockCamera {
    config: Option<CameraConfig>,
    sequence: u64,
    failing_opens: u32,
    stall_after: Option<u64>,
    open_calls: Arc<AtomicU32>,
    last_frame: Option<Instant>,
}

impl MockCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the first `n` calls to `open` fail.
    pub fn with_failing_opens(mut self, n: u32) -> Self {
        self.failing_opens = n;
        self
    }

    /// Stops producing frames after `frames` successful captures.
    pub fn with_stall_after(mut self, frames: u64) -> Self {
        self.stall_after = Some(frames);
        self
    }

    /// Shared counter of `open` calls, readable after the camera is boxed.
    pub fn open_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.open_calls)
    }

    fn pace(&mut self, fps: u32) {
        let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        if let Some(last) = self.last_frame {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame = Some(Instant::now());
    }
}

impl Camera for MockCamera {
    fn open(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
        let call = self.open_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failing_opens {
            return Err(CameraError::OpenFailed(format!(
                "mock camera refused open #{call}"
            )));
        }
        config
            .validate()
            .map_err(|e| CameraError::ConfigFailed(e.to_string()))?;
        self.config = Some(config.clone());
        self.sequence = 0;
        if let Some(frames) = config.stall_after_frames {
            self.stall_after = Some(frames);
        }
        tracing::info!("MockCamera opened at {}x{}", config.width, config.height);
        Ok(())
    }

    fn capture(&mut self) -> Result<RgbImage, CameraError> {
        let (width, height, fps) = {
            let config = self.config.as_ref().ok_or(CameraError::NotInitialized)?;
            (config.width, config.height, config.fps)
        };
        self.pace(fps);

        if self.stall_after.is_some_and(|limit| self.sequence >= limit) {
            return Err(CameraError::CaptureFailed("mock camera stalled".into()));
        }

        // Diagonal gradient that scrolls one pixel per frame
        let offset = self.sequence as u32;
        let image = RgbImage::from_fn(width, height, |x, y| {
            let v = ((x + y + offset) % 256) as u8;
            Rgb([v, v / 2, 255 - v])
        });

        self.sequence += 1;
        Ok(image)
    }

    fn is_open(&self) -> bool {
        self.config.is_some()
    }

    fn close(&mut self) {
        self.config = None;
        tracing::info!("MockCamera closed");
    }

    fn describe(&self) -> String {
        "mock camera".to_string()
    }
}

/// Native camera backed by `nokhwa`.
///
/// `nokhwa` device handles cannot leave the thread that opened them, so the
/// device lives on its own thread and frames are requested over a channel.
#[cfg(feature = "camera")]
pub struct NokhwaCamera {
    index: u32,
    device: Option<DeviceThread>,
}

#[cfg(feature = "camera")]
struct DeviceThread {
    requests: crossbeam_channel::Sender<()>,
    frames: crossbeam_channel::Receiver<Result<RgbImage, CameraError>>,
    handle: std::thread::JoinHandle<()>,
}

#[cfg(feature = "camera")]
impl NokhwaCamera {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            device: None,
        }
    }
}

#[cfg(feature = "camera")]
fn open_device(index: u32, config: &CameraConfig) -> Result<nokhwa::Camera, CameraError> {
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{
        CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
    };

    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
        CameraFormat::new(
            Resolution::new(config.width, config.height),
            FrameFormat::MJPEG,
            config.fps,
        ),
    ));
    let mut device = nokhwa::Camera::new(CameraIndex::Index(index), requested)
        .map_err(|e| CameraError::DeviceNotFound(e.to_string()))?;
    device
        .open_stream()
        .map_err(|e| CameraError::OpenFailed(e.to_string()))?;
    tracing::info!(index, format = ?device.camera_format(), "camera opened");
    Ok(device)
}

#[cfg(feature = "camera")]
fn grab(device: &mut nokhwa::Camera) -> Result<RgbImage, CameraError> {
    use nokhwa::pixel_format::RgbFormat;

    let buffer = device
        .frame()
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
    let decoded = buffer
        .decode_image::<RgbFormat>()
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
    let (width, height) = (decoded.width(), decoded.height());
    RgbImage::from_raw(width, height, decoded.into_raw())
        .ok_or_else(|| CameraError::CaptureFailed("short frame buffer".into()))
}

#[cfg(feature = "camera")]
impl Camera for NokhwaCamera {
    fn open(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
        config
            .validate()
            .map_err(|e| CameraError::ConfigFailed(e.to_string()))?;
        self.close();

        let (opened_tx, opened_rx) = crossbeam_channel::bounded(1);
        let (requests, request_rx) = crossbeam_channel::bounded::<()>(1);
        let (frame_tx, frames) = crossbeam_channel::bounded(1);
        let index = self.index;
        let config = config.clone();
        let handle = std::thread::Builder::new()
            .name("nokhwa".into())
            .spawn(move || {
                let mut device = match open_device(index, &config) {
                    Ok(device) => {
                        let _ = opened_tx.send(Ok(()));
                        device
                    }
                    Err(e) => {
                        let _ = opened_tx.send(Err(e));
                        return;
                    }
                };
                while request_rx.recv().is_ok() {
                    if frame_tx.send(grab(&mut device)).is_err() {
                        break;
                    }
                }
                if let Err(e) = device.stop_stream() {
                    tracing::warn!(error = %e, "failed to stop camera stream");
                }
            })
            .map_err(|e| CameraError::OpenFailed(e.to_string()))?;

        match opened_rx.recv() {
            Ok(Ok(())) => {
                self.device = Some(DeviceThread {
                    requests,
                    frames,
                    handle,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(CameraError::OpenFailed("camera thread exited".into())),
        }
    }

    fn capture(&mut self) -> Result<RgbImage, CameraError> {
        let device = self.device.as_ref().ok_or(CameraError::NotInitialized)?;
        device
            .requests
            .send(())
            .map_err(|_| CameraError::CaptureFailed("camera thread exited".into()))?;
        device
            .frames
            .recv()
            .map_err(|_| CameraError::CaptureFailed("camera thread exited".into()))?
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn close(&mut self) {
        if let Some(device) = self.device.take() {
            drop(device.requests);
            drop(device.frames);
            if device.handle.join().is_err() {
                tracing::error!("camera thread panicked");
            }
        }
    }

    fn describe(&self) -> String {
        format!("camera #{}", self.index)
    }
}

/// Builds the camera selected by the configuration.
pub fn build_camera(config: &CameraConfig) -> Result<Box<dyn Camera>, CameraError> {
    use crate::config::CameraBackend;

    match config.backend {
        CameraBackend::Mock => Ok(Box::new(MockCamera::new())),
        #[cfg(feature = "camera")]
        CameraBackend::Nokhwa => Ok(Box::new(NokhwaCamera::new(config.device_index))),
        #[cfg(not(feature = "camera"))]
        CameraBackend::Nokhwa => Err(CameraError::DeviceNotFound(
            "built without the `camera` feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> CameraConfig {
        CameraConfig {
            width: 32,
            height: 24,
            fps: 120,
            ..CameraConfig::default()
        }
    }

    #[test]
    fn test_mock_camera_lifecycle() {
        let mut camera = MockCamera::new();
        let config = small_config();

        assert!(!camera.is_open());

        camera.open(&config).unwrap();
        assert!(camera.is_open());

        let image = camera.capture().unwrap();
        assert_eq!(image.dimensions(), (32, 24));

        let next = camera.capture().unwrap();
        assert_ne!(image.get_pixel(0, 0), next.get_pixel(0, 0));

        camera.close();
        assert!(!camera.is_open());
    }

    #[test]
    fn test_capture_without_open() {
        let mut camera = MockCamera::new();
        assert!(matches!(camera.capture(), Err(CameraError::NotInitialized)));
    }

    #[test]
    fn test_failing_opens_are_counted() {
        let mut camera = MockCamera::new().with_failing_opens(2);
        let counter = camera.open_counter();
        let config = small_config();

        assert!(camera.open(&config).is_err());
        assert!(camera.open(&config).is_err());
        assert!(camera.open(&config).is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_stall_after_frames() {
        let mut camera = MockCamera::new().with_stall_after(1);
        camera.open(&small_config()).unwrap();

        assert!(camera.capture().is_ok());
        assert!(matches!(
            camera.capture(),
            Err(CameraError::CaptureFailed(_))
        ));
    }
}
