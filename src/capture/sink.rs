//! Single-slot latest-frame holder with broadcast wakeup.

use super::Frame;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    /// Incremented on every write; 0 means nothing written yet.
    generation: u64,
}

/// Holds the most recently captured frame.
///
/// There is exactly one writer (the camera encode path). Every waiter is
/// woken on each write and reads whatever is newest at that moment, so a
/// waiter that was slow to wake skips intermediate frames rather than
/// replaying them.
#[derive(Default)]
pub struct LatestFrameSink {
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl LatestFrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the held frame and wakes all waiters.
    pub fn write(&self, frame: Frame) {
        let mut slot = self.lock();
        slot.frame = Some(frame);
        slot.generation += 1;
        drop(slot);
        self.changed.notify_all();
    }

    /// Returns the current generation (number of writes so far).
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Returns the latest frame without waiting.
    pub fn latest(&self) -> Option<Frame> {
        self.lock().frame.clone()
    }

    /// Blocks until the next write, or until `timeout` elapses.
    pub fn wait_for_next(&self, timeout: Duration) -> Option<Frame> {
        let seen = self.generation();
        self.wait_newer_than(seen, timeout).map(|(_, frame)| frame)
    }

    /// Blocks until a frame newer than generation `seen` exists.
    ///
    /// Returns the newest frame together with its generation so the caller
    /// can pass it back in on the next call without missing a write that
    /// landed between two calls.
    pub fn wait_newer_than(&self, seen: u64, timeout: Duration) -> Option<(u64, Frame)> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if slot.generation > seen {
                if let Some(frame) = slot.frame.clone() {
                    return Some((slot.generation, frame));
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .changed
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn frame(tag: u8, seq: u64) -> Frame {
        Frame::new(vec![tag; 8], seq)
    }

    #[test]
    fn test_wait_times_out_without_write() {
        let sink = LatestFrameSink::new();
        let start = Instant::now();
        assert!(sink.wait_for_next(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_blocked_waiter_sees_write() {
        let sink = Arc::new(LatestFrameSink::new());
        let waiter = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || sink.wait_for_next(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        sink.write(frame(1, 1));

        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got.sequence(), 1);
    }

    #[test]
    fn test_only_latest_of_two_writes_is_observed() {
        let sink = LatestFrameSink::new();
        let seen = sink.generation();
        sink.write(frame(1, 1));
        sink.write(frame(2, 2));

        let (generation, got) = sink.wait_newer_than(seen, Duration::from_secs(1)).unwrap();
        assert_eq!(generation, 2);
        assert_eq!(got.bytes().as_ref(), &[2u8; 8]);
    }

    #[test]
    fn test_all_waiters_are_woken() {
        let sink = Arc::new(LatestFrameSink::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || sink.wait_for_next(Duration::from_secs(5)))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        sink.write(frame(9, 42));

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap().unwrap().sequence(), 42);
        }
    }

    #[test]
    fn test_latest_without_waiting() {
        let sink = LatestFrameSink::new();
        assert!(sink.latest().is_none());
        sink.write(frame(3, 3));
        assert_eq!(sink.latest().unwrap().sequence(), 3);
    }
}
