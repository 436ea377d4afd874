//! Bounded pool of hint buffers
//!
//! Keeps one current buffer that all writers append to, a bounded queue of
//! recycled reserves, and a hard cap on buffers ever created. Under normal
//! load the pool holds two buffers: the one being written and a reserve to
//! switch to when it fills up.
//!
//! ## Write path
//!
//! ```text
//! 1. allocate(size) on the current buffer
//! 2. granted: write through the allocation, done
//! 3. refused: switch_current_buffer(previous)
//!    - someone else already switched: no-op
//!    - otherwise install a reserve, a new buffer, or block for a reserve
//! 4. if this thread performed the switch: flush_callback(previous)
//! 5. retry on the new current buffer
//! ```
//!
//! Only the thread whose switch succeeded invokes the flush callback, so
//! every retired buffer is flushed exactly once.

use crate::buffer::HintsBuffer;
use crate::reserve::ReserveQueue;
use arc_swap::ArcSwapOption;
use hintpool_core::{
    Error, HintsBufferConfig, HostId, Record, Result, Timestamp, ENTRY_OVERHEAD_SIZE,
};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a writer waits for the swap lock before re-checking the current buffer
const SWAP_LOCK_POLL: Duration = Duration::from_millis(1);

/// Receives every buffer retired by a swap
///
/// Invoked synchronously on the writer thread that performed the swap,
/// exactly once per retired buffer. Implementations must eventually persist
/// the buffer, recycle it, and return it with [`HintsBufferPool::offer`].
pub trait FlushCallback: Send + Sync {
    /// Take ownership of a retired, sealed buffer
    fn flush(&self, buffer: Arc<HintsBuffer>, pool: &HintsBufferPool);
}

impl<F> FlushCallback for F
where
    F: Fn(Arc<HintsBuffer>, &HintsBufferPool) + Send + Sync,
{
    fn flush(&self, buffer: Arc<HintsBuffer>, pool: &HintsBufferPool) {
        self(buffer, pool)
    }
}

/// Pool of fixed-capacity hint buffers with exactly-once flush hand-off
///
/// # Thread Safety
///
/// `write` may be called from any number of threads. Allocation inside a
/// buffer is lock-free; the swap is the only mutually exclusive section.
pub struct HintsBufferPool {
    /// Buffer all writers append to
    current: ArcSwapOption<HintsBuffer>,
    /// Recycled buffers waiting to become current
    reserve: ReserveQueue,
    /// Serializes lazy initialization, swaps, and close
    swap_lock: Mutex<()>,
    /// Buffers ever created; only modified under `swap_lock`
    allocated_buffers: AtomicUsize,
    config: HintsBufferConfig,
    flush_callback: Box<dyn FlushCallback>,
    /// Set once writes are no longer accepted
    closed: AtomicBool,
    /// Set once the pool's buffers were freed
    released: AtomicBool,
    /// `write` calls in progress, including their flush callbacks
    active_writes: AtomicUsize,
    writes_lock: Mutex<()>,
    writes_done: Condvar,
}

/// Registration of one `write` call, see [`HintsBufferPool::stop_writes`]
struct WriteGuard<'a> {
    pool: &'a HintsBufferPool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let pool = self.pool;
        // Only `stop_writes` waits, and it sets `closed` before reading the count
        if pool.active_writes.fetch_sub(1, Ordering::SeqCst) == 1 && pool.is_closed() {
            let _guard = pool.writes_lock.lock();
            pool.writes_done.notify_all();
        }
    }
}

impl HintsBufferPool {
    /// Create a pool, validating `config`
    ///
    /// No buffer is allocated until the first write.
    pub fn new(config: HintsBufferConfig, flush_callback: impl FlushCallback + 'static) -> Result<Self> {
        config.validate()?;
        Ok(HintsBufferPool {
            current: ArcSwapOption::from(None),
            reserve: ReserveQueue::new(config.max_buffers - 1),
            swap_lock: Mutex::new(()),
            allocated_buffers: AtomicUsize::new(0),
            config,
            flush_callback: Box::new(flush_callback),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            active_writes: AtomicUsize::new(0),
            writes_lock: Mutex::new(()),
            writes_done: Condvar::new(),
        })
    }

    /// Pool sizing
    pub fn config(&self) -> &HintsBufferConfig {
        &self.config
    }

    /// Capacity of every buffer in bytes
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Cap on buffers ever created
    pub fn max_buffers(&self) -> usize {
        self.config.max_buffers
    }

    /// Buffers created so far, never more than `max_buffers`
    pub fn allocated_buffers(&self) -> usize {
        self.allocated_buffers.load(Ordering::Acquire)
    }

    /// Buffers currently waiting in reserve
    pub fn reserve_len(&self) -> usize {
        self.reserve.len()
    }

    /// Whether [`HintsBufferPool::stop_writes`] or [`HintsBufferPool::close`]
    /// has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a `write`, failing once the pool stopped accepting writes
    fn enter_write(&self) -> Result<WriteGuard<'_>> {
        // SeqCst pairs with the store and load in `stop_writes`: either this
        // write sees `closed`, or `stop_writes` sees it registered.
        self.active_writes.fetch_add(1, Ordering::SeqCst);
        let guard = WriteGuard { pool: self };
        self.ensure_open()?;
        Ok(guard)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        Ok(())
    }

    /// Stage `hint` for every host in `host_ids`
    ///
    /// Blocks when the current buffer is full and the buffer budget is
    /// exhausted, until the flush consumer offers a buffer back.
    ///
    /// # Errors
    ///
    /// - [`Error::HintTooLarge`] if the hint cannot fit in an empty buffer
    /// - [`Error::Interrupted`] if the pool was closed while blocked
    /// - [`Error::PoolClosed`] after close
    /// - any serializer error from the record
    pub fn write<'h, R, I>(&self, host_ids: I, hint: &R) -> Result<()>
    where
        R: Record + ?Sized,
        I: IntoIterator<Item = &'h HostId>,
    {
        let _write = self.enter_write()?;
        let hint_size = hint.serialized_size(HintsBuffer::VERSION);
        let framed_size = hint_size.saturating_add(ENTRY_OVERHEAD_SIZE);
        if framed_size > self.config.buffer_size {
            return Err(Error::HintTooLarge {
                size: framed_size,
                capacity: self.config.buffer_size,
            });
        }

        let mut current = self.current_buffer()?;
        loop {
            if let Some(allocation) = current.allocate(hint_size) {
                return allocation.write(host_ids, hint);
            }

            let previous = current;
            if self.switch_current_buffer(&previous)? {
                self.flush_callback.flush(previous, self);
            }
            current = self.current_buffer()?;
        }
    }

    /// The buffer writers currently append to, created on first use
    pub fn current_buffer(&self) -> Result<Arc<HintsBuffer>> {
        if let Some(buffer) = self.current.load_full() {
            return Ok(buffer);
        }
        self.initialize_current_buffer()
    }

    fn initialize_current_buffer(&self) -> Result<Arc<HintsBuffer>> {
        let _guard = self.swap_lock.lock();
        self.ensure_open()?;
        if let Some(buffer) = self.current.load_full() {
            return Ok(buffer);
        }
        let buffer = self.create_buffer();
        self.current.store(Some(Arc::clone(&buffer)));
        Ok(buffer)
    }

    fn is_current(&self, buffer: &Arc<HintsBuffer>) -> bool {
        match &*self.current.load() {
            Some(current) => Arc::ptr_eq(current, buffer),
            None => false,
        }
    }

    /// Replace `previous` as the current buffer
    ///
    /// Returns `Ok(false)` if another thread already replaced it. This
    /// re-check under the lock is what keeps a buffer from being flushed
    /// twice.
    ///
    /// The lock is polled rather than waited on: a swap may hold it while
    /// blocked on the flush of an older buffer, and a writer still holding
    /// that older buffer must notice it was retired and let go of it, or
    /// the flush consumer could never recycle it.
    fn switch_current_buffer(&self, previous: &Arc<HintsBuffer>) -> Result<bool> {
        let _guard = loop {
            self.ensure_open()?;
            if !self.is_current(previous) {
                return Ok(false);
            }
            if let Some(guard) = self.swap_lock.try_lock_for(SWAP_LOCK_POLL) {
                break guard;
            }
        };
        self.ensure_open()?;
        if !self.is_current(previous) {
            return Ok(false);
        }

        let replacement = match self.reserve.poll() {
            Some(buffer) => buffer,
            None if self.allocated_buffers() >= self.config.max_buffers => {
                tracing::info!(
                    max_buffers = self.config.max_buffers,
                    "Hint buffer budget exhausted, waiting for a flushed buffer"
                );
                self.reserve.take()?
            }
            None => self.create_buffer(),
        };
        self.current.store(Some(replacement));

        tracing::debug!(
            allocated_buffers = self.allocated_buffers(),
            reserve = self.reserve.len(),
            "Switched current hints buffer"
        );
        Ok(true)
    }

    /// Only called with `swap_lock` held
    fn create_buffer(&self) -> Arc<HintsBuffer> {
        let allocated = self.allocated_buffers.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(
            buffer_size = self.config.buffer_size,
            allocated_buffers = allocated,
            "Allocating hints buffer"
        );
        Arc::new(HintsBuffer::create(self.config.buffer_size))
    }

    /// Earliest hint time for `host_id` across the current and reserve buffers
    ///
    /// Best effort: reserves are read from a snapshot that may race with
    /// concurrent swaps and offers. Buffers held by the flush consumer are
    /// not included.
    pub fn earliest_hint_for_host(&self, host_id: &HostId) -> Option<Timestamp> {
        self.current
            .load_full()
            .into_iter()
            .chain(self.reserve.snapshot())
            .filter_map(|buffer| buffer.earliest_hint_time(host_id))
            .min()
    }

    /// Forget `host_id`'s earliest hint time in the current and reserve buffers
    pub fn clear_earliest_hints_for_host(&self, host_id: &HostId) {
        if let Some(current) = self.current.load_full() {
            current.clear_earliest_hint(host_id);
        }
        for buffer in self.reserve.snapshot() {
            buffer.clear_earliest_hint(host_id);
        }
    }

    /// Return a flushed, recycled buffer for reuse
    ///
    /// After close the buffer is freed instead.
    ///
    /// # Panics
    ///
    /// Panics if the reserve queue is full. That can only happen if more
    /// buffers circulate than the pool ever created, and dropping one would
    /// lose hints.
    pub fn offer(&self, buffer: Arc<HintsBuffer>) {
        if self.is_closed() {
            tracing::warn!(
                capacity = buffer.capacity(),
                "Hints buffer offered to a closed pool, freeing it"
            );
            buffer.free();
            return;
        }

        debug_assert!(buffer.is_empty(), "offered hints buffer was not recycled");
        if let Err(rejected) = self.reserve.offer(buffer) {
            tracing::error!(
                reserve_capacity = self.reserve.capacity(),
                allocated_buffers = self.allocated_buffers(),
                buffer = ?rejected,
                "Reserve queue rejected a hints buffer"
            );
            panic!(
                "Failed to store hints buffer: reserve queue is full ({} buffers)",
                self.reserve.capacity()
            );
        }
    }

    /// Stop accepting writes and wait for the ones in progress
    ///
    /// Writers blocked on the buffer budget fail with [`Error::Interrupted`],
    /// later writes with [`Error::PoolClosed`]. Once this returns, no write
    /// will invoke the flush callback again, so the flush consumer can be
    /// stopped without losing a retired buffer. Buffers are left in place.
    ///
    /// Must not be called from inside the flush callback.
    pub fn stop_writes(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.reserve.interrupt();
        }

        let mut guard = self.writes_lock.lock();
        while self.active_writes.load(Ordering::SeqCst) > 0 {
            self.writes_done.wait(&mut guard);
        }
        drop(guard);

        // Swaps finish under the lock
        drop(self.swap_lock.lock());
    }

    /// Close the pool
    ///
    /// Runs [`HintsBufferPool::stop_writes`], then frees the current buffer
    /// and every reserve buffer. Hints still in the current buffer are not
    /// flushed.
    pub fn close(&self) {
        self.stop_writes();
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let _guard = self.swap_lock.lock();
        if let Some(current) = self.current.swap(None) {
            current.free();
        }
        let reserves = self.reserve.drain();
        let freed_reserves = reserves.len();
        for buffer in reserves {
            buffer.free();
        }
        tracing::debug!(
            allocated_buffers = self.allocated_buffers(),
            freed_reserves,
            "Hints buffer pool closed"
        );
    }
}

impl std::fmt::Debug for HintsBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HintsBufferPool")
            .field("config", &self.config)
            .field("allocated_buffers", &self.allocated_buffers())
            .field("reserve", &self.reserve)
            .field("closed", &self.is_closed())
            .finish()
    }
}
