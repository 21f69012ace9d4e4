//! Bounded handoff queues
//!
//! All cross-thread traffic in the engine moves through these. The policy
//! follows the data path's best-effort nature: enqueues are non-blocking
//! and drop on a full queue (IP already assumes loss), dequeues block with
//! a bounded wait so workers can observe shutdown.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// A bounded multi-producer queue with non-blocking offer semantics.
pub struct PacketQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> PacketQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Non-blocking enqueue. Returns `false` if the queue was full and the
    /// item was dropped.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
        }
    }

    /// Dequeue, waiting up to `timeout`. Returns `None` on timeout so the
    /// caller can re-check its shutdown flag.
    pub fn take(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking dequeue.
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
