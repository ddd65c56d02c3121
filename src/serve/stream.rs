//! Per-viewer MJPEG stream.
//!
//! MJPEG is `multipart/x-mixed-replace`: each part is one JPEG, and the
//! browser replaces the image as parts arrive.

use super::admission::ViewerPermit;
use crate::capture::Frame;
use crate::metrics::Metrics;
use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What every stream shares: boundary, placeholder and frame timeout.
#[derive(Clone)]
pub struct StreamSettings {
    pub boundary: Arc<str>,
    pub frame_timeout: Duration,
    pub placeholder: Bytes,
}

impl StreamSettings {
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }
}

/// Formats one multipart part around `jpeg`.
pub fn part(boundary: &str, jpeg: &[u8]) -> Bytes {
    let head = format!("--{boundary}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut buf = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    buf.put_slice(head.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Turns the shared frame feed into one viewer's stream of parts.
///
/// Each viewer waits on its own watch receiver, so a slow connection only
/// ever skips frames. If no frame arrives within the timeout a placeholder
/// part goes out instead and the wait starts over.
pub struct StreamBroadcaster {
    frames: watch::Receiver<Option<Frame>>,
    settings: StreamSettings,
    metrics: Arc<Metrics>,
    started: bool,
}

impl StreamBroadcaster {
    pub fn new(frames: watch::Receiver<Option<Frame>>, settings: StreamSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            frames,
            settings,
            metrics,
            started: false,
        }
    }

    /// The next part, or `None` once the feed has closed.
    pub async fn next_part(&mut self) -> Option<Bytes> {
        if !self.started {
            self.started = true;
            // Start with the current frame rather than a blank wait.
            let current = self.frames.borrow_and_update().clone();
            if let Some(frame) = current {
                return Some(part(&self.settings.boundary, frame.bytes()));
            }
        }

        match tokio::time::timeout(self.settings.frame_timeout, self.frames.changed()).await {
            Ok(Ok(())) => {
                let frame = self.frames.borrow_and_update().clone();
                let jpeg = frame.as_ref().map_or(&self.settings.placeholder, Frame::bytes);
                Some(part(&self.settings.boundary, jpeg))
            }
            Ok(Err(_)) => None,
            Err(_) => {
                self.metrics.record_placeholder();
                tracing::trace!("no frame within timeout, sending placeholder");
                Some(part(&self.settings.boundary, &self.settings.placeholder))
            }
        }
    }

    /// Consumes the broadcaster and `permit` into a response body stream.
    ///
    /// The permit lives in the stream state, so it is released when the
    /// body is dropped, whether the peer hung up or the feed closed.
    pub fn into_stream(self, permit: ViewerPermit) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        futures::stream::unfold((self, permit), |(mut broadcaster, permit)| async move {
            let part = broadcaster.next_part().await?;
            Some((Ok(part), (broadcaster, permit)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::placeholder_jpeg;
    use crate::serve::admission::ViewerAdmission;
    use futures::StreamExt;

    fn settings(timeout: Duration) -> StreamSettings {
        StreamSettings {
            boundary: Arc::from("frame"),
            frame_timeout: timeout,
            placeholder: placeholder_jpeg().unwrap(),
        }
    }

    #[test]
    fn test_part_layout() {
        let part = part("frame", &[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\xFF\xD9\r\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_once_per_timeout() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (_tx, rx) = watch::channel(None);
        let mut broadcaster = StreamBroadcaster::new(rx, settings(Duration::from_secs(5)), Arc::clone(&metrics));

        let start = tokio::time::Instant::now();
        for n in 1..=2 {
            let part = broadcaster.next_part().await.unwrap();
            assert!(part.ends_with(b"\xFF\xD9\r\n"));
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_secs(5 * n));
            assert!(elapsed < Duration::from_secs(5 * n + 1));
        }
        assert!(metrics.encode().unwrap().contains("dogcam_placeholders_sent_total 2"));
    }

    #[tokio::test]
    async fn test_sends_new_frames_and_ends_with_feed() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, rx) = watch::channel(Some(Frame::new(vec![0xFF, 0xD8, 1, 0xFF, 0xD9], 1)));
        let mut broadcaster = StreamBroadcaster::new(rx, settings(Duration::from_secs(5)), metrics);

        let first = broadcaster.next_part().await.unwrap();
        assert!(first.windows(3).any(|w| w == [0xD8, 1, 0xFF]));

        tx.send_replace(Some(Frame::new(vec![0xFF, 0xD8, 2, 0xFF, 0xD9], 2)));
        let second = broadcaster.next_part().await.unwrap();
        assert!(second.windows(3).any(|w| w == [0xD8, 2, 0xFF]));

        drop(tx);
        assert!(broadcaster.next_part().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_permit() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let admission = ViewerAdmission::new(1, Arc::clone(&metrics));
        let (_tx, rx) = watch::channel(Some(Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 1)));

        let permit = admission.try_acquire().unwrap();
        let mut stream = Box::pin(
            StreamBroadcaster::new(rx, settings(Duration::from_secs(5)), metrics).into_stream(permit),
        );
        assert!(stream.next().await.is_some());
        assert_eq!(admission.available(), 0);

        drop(stream);
        assert_eq!(admission.available(), 1);
    }
}
