//! Bounded blocking queue of reserve buffers
//!
//! The single hand-off channel between the flush consumer, which offers
//! drained buffers, and starved writers, which poll or take them. `take` is
//! the pool's only backpressure point.

use crate::buffer::HintsBuffer;
use hintpool_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

struct Inner {
    buffers: VecDeque<Arc<HintsBuffer>>,
    interrupted: bool,
}

/// FIFO of recycled buffers with a fixed capacity
pub struct ReserveQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,
}

impl ReserveQueue {
    /// Create an empty queue holding at most `capacity` buffers
    pub fn new(capacity: usize) -> Self {
        ReserveQueue {
            inner: Mutex::new(Inner {
                buffers: VecDeque::with_capacity(capacity),
                interrupted: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Maximum number of queued buffers
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued buffers
    pub fn len(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    /// Whether no buffer is queued
    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffers.is_empty()
    }

    /// Enqueue a buffer, handing it back when the queue is full
    pub fn offer(&self, buffer: Arc<HintsBuffer>) -> std::result::Result<(), Arc<HintsBuffer>> {
        let mut inner = self.inner.lock();
        if inner.buffers.len() >= self.capacity {
            return Err(buffer);
        }
        inner.buffers.push_back(buffer);
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Dequeue without blocking
    pub fn poll(&self) -> Option<Arc<HintsBuffer>> {
        self.inner.lock().buffers.pop_front()
    }

    /// Dequeue, blocking until a buffer arrives
    ///
    /// Returns [`Error::Interrupted`] once [`ReserveQueue::interrupt`] has
    /// been called.
    pub fn take(&self) -> Result<Arc<HintsBuffer>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.interrupted {
                return Err(Error::Interrupted);
            }
            if let Some(buffer) = inner.buffers.pop_front() {
                return Ok(buffer);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Wake every blocked `take` with [`Error::Interrupted`], now and later
    pub fn interrupt(&self) {
        self.inner.lock().interrupted = true;
        self.available.notify_all();
    }

    /// Point-in-time copy of the queued buffers
    ///
    /// May be stale as soon as it returns.
    pub fn snapshot(&self) -> Vec<Arc<HintsBuffer>> {
        self.inner.lock().buffers.iter().cloned().collect()
    }

    /// Remove and return every queued buffer
    pub fn drain(&self) -> Vec<Arc<HintsBuffer>> {
        self.inner.lock().buffers.drain(..).collect()
    }
}

impl std::fmt::Debug for ReserveQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReserveQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
