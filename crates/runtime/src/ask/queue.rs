//! Bounded ask admission
//!
//! One run is active at a time; further submissions wait in FIFO order up
//! to the queue limit and are rejected beyond it. Rejection is explicit,
//! never a silent drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::types::AskError;

/// FIFO admission gate in front of the orchestrator.
pub struct AskGate {
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
    queue_limit: usize,
}

/// Held for the duration of one run; releasing it starts the next queued
/// ask.
pub struct AskPermit {
    _permit: OwnedSemaphorePermit,
}

/// Occupies one queue slot while a submission waits in line. The slot is
/// given back on drop, so a waiter abandoned mid-wait (caller future
/// dropped on client disconnect) still releases it.
struct QueueSlot<'a> {
    gate: &'a AskGate,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.gate.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AskGate {
    pub fn new(concurrency: usize, queue_limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            queued: AtomicUsize::new(0),
            queue_limit,
        }
    }

    /// Admit a submission, waiting in line if a run is active.
    pub async fn admit(&self) -> Result<AskPermit, AskError> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(AskPermit { _permit: permit });
        }

        let waiting = self.queued.fetch_add(1, Ordering::SeqCst);
        let _slot = QueueSlot { gate: self };
        if waiting >= self.queue_limit {
            return Err(AskError::QueueFull {
                limit: self.queue_limit,
            });
        }

        // Semaphore wakeups are FIFO, which is exactly the queue order we
        // promise.
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => Ok(AskPermit { _permit: permit }),
            Err(_) => Err(AskError::Aborted),
        }
    }

    /// Submissions currently waiting in line.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}
