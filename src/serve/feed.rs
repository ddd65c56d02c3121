//! Fan-out from the frame channel to every stream.

use crate::capture::Frame;
use crate::worker::{FrameReceiver, ReceiveError, StopSignal};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::watch;

const POLL: Duration = Duration::from_millis(250);

/// Drains the frame channel on a dedicated thread and publishes each frame
/// on a watch, so every viewer sees the newest frame without competing for
/// it.
///
/// The watch stays open until [`FrameFeed::close`], even after every frame
/// sender is gone, so streams keep serving placeholders when the worker has
/// given up. Closing the feed ends every stream.
pub struct FrameFeed {
    frames: watch::Receiver<Option<Frame>>,
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl FrameFeed {
    pub fn spawn(receiver: FrameReceiver) -> io::Result<Self> {
        let (tx, frames) = watch::channel(None);
        let stop = StopSignal::new();
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("frame-feed".into())
                .spawn(move || fan_out(&receiver, &tx, &stop))?
        };
        Ok(Self {
            frames,
            stop,
            handle: Some(handle),
        })
    }

    /// A receiver whose next change is the next frame to arrive.
    pub fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        let mut rx = self.frames.clone();
        rx.borrow_and_update();
        rx
    }

    /// Stops publishing and closes the watch.
    pub fn close(&mut self) {
        self.stop.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("frame feed thread panicked");
            }
        }
    }
}

impl Drop for FrameFeed {
    fn drop(&mut self) {
        self.close();
    }
}

fn fan_out(receiver: &FrameReceiver, tx: &watch::Sender<Option<Frame>>, stop: &StopSignal) {
    while !stop.is_triggered() {
        match receiver.receive(POLL) {
            Ok(frame) => {
                tx.send_replace(Some(frame));
            }
            Err(ReceiveError::Timeout) => {}
            Err(ReceiveError::Closed) => {
                tracing::warn!("frame source gone, streams continue with placeholders");
                let _ = stop.receiver().recv();
                break;
            }
        }
    }
    tracing::debug!("frame feed stopped");
}
