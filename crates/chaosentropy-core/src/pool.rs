//! Bounded pool of conditioned blocks between the conditioner and publisher.
//!
//! The pool never drops a block on its own: a full pool pushes back on the
//! conditioner, and only the administrative [`EntropyPool::reset`] discards
//! anything (counted).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::conditioning::ConditionedBlock;
use crate::queue::{BoundedQueue, PopError, PushError};

/// A push that did not land. The block comes back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    Full(ConditionedBlock),
    Closed(ConditionedBlock),
}

impl PoolError {
    pub fn into_block(self) -> ConditionedBlock {
        match self {
            Self::Full(b) | Self::Closed(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeError {
    Empty,
    /// Closed and drained.
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub occupancy: usize,
    pub capacity: usize,
    pub pushed: u64,
    pub taken: u64,
    pub high_watermark: usize,
    pub backpressure_waits: u64,
    pub reset_drops: u64,
}

/// Thread-safe bounded FIFO of [`ConditionedBlock`]s.
pub struct EntropyPool {
    queue: BoundedQueue<ConditionedBlock>,
    pushed: AtomicU64,
    taken: AtomicU64,
    high_watermark: AtomicUsize,
    backpressure_waits: AtomicU64,
    reset_drops: AtomicU64,
}

impl EntropyPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: BoundedQueue::new(capacity),
            pushed: AtomicU64::new(0),
            taken: AtomicU64::new(0),
            high_watermark: AtomicUsize::new(0),
            backpressure_waits: AtomicU64::new(0),
            reset_drops: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Append a block, waiting up to `timeout` while the pool is full.
    pub fn push(&self, block: ConditionedBlock, timeout: Duration) -> Result<(), PoolError> {
        match self.queue.push_waited(block, timeout) {
            Ok(waited) => {
                if waited {
                    self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
                }
                self.pushed.fetch_add(1, Ordering::Relaxed);
                self.high_watermark
                    .fetch_max(self.queue.len(), Ordering::Relaxed);
                Ok(())
            }
            Err(PushError::Full(b)) => {
                self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::Full(b))
            }
            Err(PushError::Closed(b)) => Err(PoolError::Closed(b)),
        }
    }

    /// Oldest block, waiting up to `timeout` while the pool is empty.
    pub fn take(&self, timeout: Duration) -> Result<ConditionedBlock, TakeError> {
        match self.queue.pop_timeout(timeout) {
            Ok(block) => {
                self.taken.fetch_add(1, Ordering::Relaxed);
                Ok(block)
            }
            Err(PopError::Empty) => Err(TakeError::Empty),
            Err(PopError::Closed) => Err(TakeError::Closed),
        }
    }

    /// Administrative clear. Returns the number of blocks dropped.
    pub fn reset(&self) -> usize {
        let dropped = self.queue.drain().len();
        if dropped > 0 {
            log::warn!("entropy pool reset: {dropped} blocks dropped");
            self.reset_drops
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    /// Refuse new blocks and wake all waiters. Remaining blocks can still be taken.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Remove whatever is left without counting it as taken.
    pub(crate) fn drain_remaining(&self) -> Vec<ConditionedBlock> {
        self.queue.drain()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            occupancy: self.queue.len(),
            capacity: self.queue.capacity(),
            pushed: self.pushed.load(Ordering::Relaxed),
            taken: self.taken.load(Ordering::Relaxed),
            high_watermark: self.high_watermark.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            reset_drops: self.reset_drops.load(Ordering::Relaxed),
        }
    }
}
