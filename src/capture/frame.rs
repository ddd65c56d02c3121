//! Frame type representing one encoded image.

use bytes::Bytes;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// A single JPEG-encoded frame from the camera pipeline.
///
/// Frames are immutable and cheap to clone: the encoded bytes are
/// reference counted, so handing the same frame to every viewer does not
/// copy the image.
#[derive(Clone)]
pub struct Frame {
    /// Encoded JPEG data.
    jpeg: Bytes,
    /// Monotonic sequence number assigned by the capture loop.
    sequence: u64,
}

impl Frame {
    /// Creates a new frame from encoded bytes.
    pub fn new(jpeg: impl Into<Bytes>, sequence: u64) -> Self {
        Self {
            jpeg: jpeg.into(),
            sequence,
        }
    }

    /// Returns the encoded image.
    #[inline]
    pub fn bytes(&self) -> &Bytes {
        &self.jpeg
    }

    /// Returns the sequence number.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.jpeg.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }

    /// Checks for JPEG start-of-image and end-of-image markers.
    pub fn is_jpeg(&self) -> bool {
        is_jpeg(&self.jpeg)
    }
}

/// Returns true if `data` starts with SOI and ends with EOI.
pub fn is_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&JPEG_SOI) && data.ends_with(&JPEG_EOI)
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("jpeg_bytes", &self.jpeg.len())
            .finish()
    }
}
