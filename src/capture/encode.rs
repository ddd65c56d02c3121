//! JPEG encoding with overlay compositing.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage, RgbaImage};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Errors produced while encoding a frame.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// The overlay currently installed for the encode path.
///
/// Written by the overlay updater, read by the capture loop once per frame.
/// Cloning shares the same slot.
#[derive(Clone, Default)]
pub struct OverlaySlot {
    inner: Arc<Mutex<Option<Arc<RgbaImage>>>>,
}

impl OverlaySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an overlay for subsequent frames.
    pub fn set(&self, overlay: RgbaImage) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(overlay));
    }

    /// Removes the overlay.
    pub fn clear(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns the overlay to apply to the next frame, if any.
    pub fn current(&self) -> Option<Arc<RgbaImage>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_set(&self) -> bool {
        self.current().is_some()
    }
}

/// Encodes raw camera images into JPEG frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
    /// Top-left position of the overlay.
    margin: u32,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            margin: 8,
        }
    }

    /// Blends `overlay` into `image`, then JPEG-encodes the result.
    pub fn encode(
        &self,
        image: &mut RgbImage,
        overlay: Option<&RgbaImage>,
    ) -> Result<Bytes, EncodeError> {
        if let Some(overlay) = overlay {
            blend(image, overlay, self.margin, self.margin);
        }
        encode_jpeg(image, self.quality)
    }
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, EncodeError> {
    let mut out = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(image)?;
    Ok(Bytes::from(out))
}

/// Alpha-blends `overlay` onto `base` with its top-left corner at `(x0, y0)`.
/// Parts falling outside `base` are clipped.
pub fn blend(base: &mut RgbImage, overlay: &RgbaImage, x0: u32, y0: u32) {
    let (bw, bh) = base.dimensions();
    for (x, y, px) in overlay.enumerate_pixels() {
        let (bx, by) = (x0 + x, y0 + y);
        if bx >= bw || by >= bh {
            continue;
        }
        let alpha = px[3] as u16;
        if alpha == 0 {
            continue;
        }
        let dst = base.get_pixel_mut(bx, by);
        let mixed: [u8; 3] = std::array::from_fn(|c| {
            ((px[c] as u16 * alpha + dst[c] as u16 * (255 - alpha)) / 255) as u8
        });
        *dst = Rgb(mixed);
    }
}

/// A small valid JPEG sent to viewers while no frame is arriving.
pub fn placeholder_jpeg() -> Result<Bytes, EncodeError> {
    let image = RgbImage::from_pixel(16, 16, Rgb([32, 32, 32]));
    encode_jpeg(&image, 50)
}
