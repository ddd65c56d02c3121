//! Capacity-one frame channel between the capture worker and the server.
//!
//! The producer never waits: if the slot is still occupied the new frame is
//! discarded (drop-newest) and the queued one stays until it is consumed.

use crate::capture::Frame;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;
use thiserror::Error;

/// Result of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The slot was empty and now holds the frame.
    Queued,
    /// The slot was full; the frame was discarded.
    Dropped,
    /// No receiver is left.
    Closed,
}

/// Why [`FrameReceiver::receive`] returned without a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReceiveError {
    #[error("no frame within timeout")]
    Timeout,
    #[error("frame channel closed")]
    Closed,
}

/// Producer half. Cloneable so a restarted worker can reuse the channel.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: Sender<Frame>,
}

/// Consumer half.
#[derive(Debug, Clone)]
pub struct FrameReceiver {
    rx: Receiver<Frame>,
}

/// Creates the single-slot channel.
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (FrameSender { tx }, FrameReceiver { rx })
}

impl FrameSender {
    /// Offers a frame without blocking.
    pub fn try_send(&self, frame: Frame) -> SendOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(frame)) => {
                tracing::trace!(sequence = frame.sequence(), "frame slot full, dropping newest");
                SendOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => SendOutcome::Closed,
        }
    }
}

impl FrameReceiver {
    /// Waits up to `timeout` for a frame.
    pub fn receive(&self, timeout: Duration) -> Result<Frame, ReceiveError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ReceiveError::Timeout,
            RecvTimeoutError::Disconnected => ReceiveError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![seq as u8; 4], seq)
    }

    #[test]
    fn test_full_slot_drops_newest_without_blocking() {
        let (tx, rx) = frame_channel();

        assert_eq!(tx.try_send(frame(1)), SendOutcome::Queued);
        let start = Instant::now();
        assert_eq!(tx.try_send(frame(2)), SendOutcome::Dropped);
        assert_eq!(tx.try_send(frame(3)), SendOutcome::Dropped);
        assert!(start.elapsed() < Duration::from_millis(50));

        assert_eq!(rx.receive(Duration::from_millis(10)).unwrap().sequence(), 1);
        assert!(matches!(
            rx.receive(Duration::from_millis(10)),
            Err(ReceiveError::Timeout)
        ));
    }

    #[test]
    fn test_slot_reopens_after_consume() {
        let (tx, rx) = frame_channel();
        tx.try_send(frame(1));
        rx.receive(Duration::from_millis(10)).unwrap();

        assert_eq!(tx.try_send(frame(2)), SendOutcome::Queued);
        assert_eq!(rx.receive(Duration::from_millis(10)).unwrap().sequence(), 2);
    }

    #[test]
    fn test_receive_times_out() {
        let (_tx, rx) = frame_channel();
        let start = Instant::now();
        assert!(matches!(
            rx.receive(Duration::from_millis(40)),
            Err(ReceiveError::Timeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_closed_both_ways() {
        let (tx, rx) = frame_channel();
        drop(rx);
        assert_eq!(tx.try_send(frame(1)), SendOutcome::Closed);

        let (tx, rx) = frame_channel();
        drop(tx);
        assert!(matches!(
            rx.receive(Duration::from_secs(1)),
            Err(ReceiveError::Closed)
        ));
    }
}
