//! Bounded viewer admission.

use crate::metrics::Metrics;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Every viewer slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all {capacity} viewer slots are in use")]
pub struct CapacityExceeded {
    pub capacity: usize,
}

/// A fixed pool of viewer slots.
///
/// Acquisition never waits. A slot comes back when its [`ViewerPermit`] is
/// dropped, whichever way the stream holding it ends.
pub struct ViewerAdmission {
    permits: Arc<Semaphore>,
    capacity: usize,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ViewerAdmission {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn try_acquire(&self) -> Result<ViewerPermit, CapacityExceeded> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.metrics.viewer_started();
                tracing::debug!(viewer = id, available = self.available(), "viewer admitted");
                Ok(ViewerPermit {
                    _permit: permit,
                    id,
                    metrics: Arc::clone(&self.metrics),
                })
            }
            Err(_) => {
                self.metrics.viewer_rejected();
                tracing::debug!(capacity = self.capacity, "viewer rejected at capacity");
                Err(CapacityExceeded {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One admitted viewer. Dropping it frees the slot.
pub struct ViewerPermit {
    _permit: OwnedSemaphorePermit,
    id: u64,
    metrics: Arc<Metrics>,
}

impl ViewerPermit {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for ViewerPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerPermit").field("id", &self.id).finish()
    }
}

impl Drop for ViewerPermit {
    fn drop(&mut self) {
        self.metrics.viewer_finished();
        tracing::debug!(viewer = self.id, "viewer left");
    }
}
