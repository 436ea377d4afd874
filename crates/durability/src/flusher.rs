//! Flush consumer for retired buffers
//!
//! [`flush_channel`] builds a [`FlushCallback`] that only enqueues retired
//! buffers, so the writer that performed a swap returns immediately. A
//! [`HintsFlusher`] worker thread drains the queue:
//!
//! 1. Wait for in-flight writes on the buffer to finish
//! 2. Stream every host's hints to the [`HintsSink`]
//! 3. `sync` the sink
//! 4. Recycle the buffer and offer it back to the pool
//!
//! A buffer is recycled even when the sink fails, so writers are never
//! starved of buffers by a broken sink.

use crate::buffer::HintsBuffer;
use crate::pool::{FlushCallback, HintsBufferPool};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use hintpool_core::{HostId, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Pause between attempts to recycle a buffer that still has other handles
const RECYCLE_RETRY: Duration = Duration::from_millis(1);

/// Failed recycle attempts between warnings
const RECYCLE_WARN_EVERY: u32 = 1_000;

/// Persistence collaborator receiving flushed hints
pub trait HintsSink: Send + 'static {
    /// Persist one serialized hint for `host_id`
    fn append(&mut self, host_id: HostId, hint: &[u8]) -> Result<()>;

    /// Make everything appended so far durable
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Flush callback that hands retired buffers to a [`FlushReceiver`]
#[derive(Clone)]
pub struct ChannelFlushCallback {
    sender: Sender<Arc<HintsBuffer>>,
}

impl FlushCallback for ChannelFlushCallback {
    /// # Panics
    ///
    /// Panics if the [`FlushReceiver`] was dropped. The retired buffer holds
    /// acknowledged hints and could never be flushed or returned to the pool.
    /// Call [`HintsBufferPool::stop_writes`] before stopping the consumer.
    fn flush(&self, buffer: Arc<HintsBuffer>, _pool: &HintsBufferPool) {
        if let Err(rejected) = self.sender.send(buffer) {
            error!(
                buffer = ?rejected.0,
                "Flush consumer is gone while the pool still accepts writes"
            );
            panic!("Failed to hand off retired hints buffer: flush consumer is gone");
        }
    }
}

/// Receiving end of [`flush_channel`]
pub struct FlushReceiver {
    receiver: Receiver<Arc<HintsBuffer>>,
}

impl FlushReceiver {
    /// Retired buffers not yet picked up
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no retired buffer is waiting
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Next retired buffer, if one is already queued
    pub fn try_recv(&self) -> Option<Arc<HintsBuffer>> {
        self.receiver.try_recv().ok()
    }
}

/// Create a channel-backed flush callback and its receiver
///
/// Unbounded: the pool never has more than `max_buffers` buffers in flight.
pub fn flush_channel() -> (ChannelFlushCallback, FlushReceiver) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (ChannelFlushCallback { sender }, FlushReceiver { receiver })
}

/// Counters reported by [`HintsFlusher::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Buffers drained and returned to the pool
    pub buffers_flushed: u64,
    /// Hints handed to the sink successfully
    pub hints_flushed: u64,
    /// Failed appends, syncs, or corrupt entries
    pub sink_errors: u64,
}

struct FlushWorker<S> {
    pool: Arc<HintsBufferPool>,
    sink: S,
    stats: FlushStats,
    shutdown: Receiver<()>,
}

impl<S: HintsSink> FlushWorker<S> {
    /// The shutdown channel is never sent on, only disconnected
    fn shutdown_requested(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn run(&mut self, buffers: Receiver<Arc<HintsBuffer>>) {
        let shutdown = self.shutdown.clone();
        loop {
            crossbeam_channel::select! {
                recv(buffers) -> msg => match msg {
                    Ok(buffer) => self.flush(buffer),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }

        // Buffers retired before shutdown still hold hints
        while let Ok(buffer) = buffers.try_recv() {
            self.flush(buffer);
        }
    }

    fn flush(&mut self, buffer: Arc<HintsBuffer>) {
        buffer.wait_for_modifications();

        let mut hints = 0u64;
        for host_id in buffer.host_ids() {
            for entry in buffer.hints_for(&host_id) {
                match entry.and_then(|hint| self.sink.append(host_id, hint)) {
                    Ok(()) => hints += 1,
                    Err(e) => {
                        self.stats.sink_errors += 1;
                        error!(host_id = %host_id, error = %e, "Failed to persist hint");
                    }
                }
            }
        }
        if let Err(e) = self.sink.sync() {
            self.stats.sink_errors += 1;
            error!(error = %e, "Failed to sync hints sink");
        }

        self.stats.hints_flushed += hints;
        self.stats.buffers_flushed += 1;
        debug!(hints, "Flushed hints buffer");
        self.return_buffer(buffer);
    }

    fn return_buffer(&self, mut buffer: Arc<HintsBuffer>) {
        let mut attempts = 0u32;
        loop {
            if self.pool.is_closed() {
                buffer.free();
                return;
            }
            // Writers that raced with the swap may still hold a handle briefly
            let err = match HintsBuffer::recycle(&mut buffer) {
                Ok(()) => {
                    self.pool.offer(buffer);
                    return;
                }
                Err(e) => e,
            };

            // Its hints are already persisted, only the memory is given up
            if self.shutdown_requested() {
                warn!(error = %err, "Hints buffer still shared at shutdown, freeing it");
                buffer.free();
                return;
            }
            attempts += 1;
            if attempts % RECYCLE_WARN_EVERY == 0 {
                warn!(attempts, error = %err, "Hints buffer still shared, retrying recycle");
            }
            thread::sleep(RECYCLE_RETRY);
        }
    }
}

/// Background thread draining retired buffers into a [`HintsSink`]
///
/// # Example
///
/// ```ignore
/// let (callback, receiver) = flush_channel();
/// let pool = Arc::new(HintsBufferPool::new(config, callback)?);
/// let flusher = HintsFlusher::spawn(Arc::clone(&pool), receiver, sink)?;
///
/// pool.write(&[host_id], &hint)?;
///
/// pool.stop_writes();
/// let stats = flusher.shutdown()?;
/// pool.close();
/// ```
pub struct HintsFlusher {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<FlushStats>>,
}

impl HintsFlusher {
    /// Start the worker thread
    pub fn spawn<S: HintsSink>(
        pool: Arc<HintsBufferPool>,
        receiver: FlushReceiver,
        sink: S,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        let handle = thread::Builder::new()
            .name("hints-flusher".to_string())
            .spawn(move || {
                let mut worker = FlushWorker {
                    pool,
                    sink,
                    stats: FlushStats::default(),
                    shutdown: shutdown_rx,
                };
                worker.run(receiver.receiver);
                worker.stats
            })?;

        Ok(HintsFlusher {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Flush already-retired buffers, then stop the worker
    ///
    /// Call after [`HintsBufferPool::stop_writes`]: a buffer retired once
    /// the worker is gone cannot be flushed. Buffers other handles still
    /// hold at this point are freed instead of recycled.
    pub fn shutdown(mut self) -> Result<FlushStats> {
        self.stop()
    }

    fn stop(&mut self) -> Result<FlushStats> {
        // Disconnecting the shutdown channel wakes the select
        self.shutdown.take();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| hintpool_core::Error::Sink("hints flusher thread panicked".into())),
            None => Ok(FlushStats::default()),
        }
    }
}

impl Drop for HintsFlusher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Hints flusher stopped abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hintpool_core::{Error, Hint, HintsBufferConfig, Timestamp};
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct MemorySink {
        hints: Arc<Mutex<Vec<(HostId, Hint)>>>,
        syncs: Arc<Mutex<usize>>,
    }

    impl HintsSink for MemorySink {
        fn append(&mut self, host_id: HostId, hint: &[u8]) -> Result<()> {
            let hint = Hint::decode(hint, HintsBuffer::VERSION)?;
            self.hints.lock().push((host_id, hint));
            Ok(())
        }

        fn sync(&mut self) -> Result<()> {
            *self.syncs.lock() += 1;
            Ok(())
        }
    }

    struct FailingSink;

    impl HintsSink for FailingSink {
        fn append(&mut self, _: HostId, _: &[u8]) -> Result<()> {
            Err(Error::Sink("disk full".into()))
        }
    }

    fn pool_with_flusher<S: HintsSink>(sink: S) -> (Arc<HintsBufferPool>, HintsFlusher) {
        let (callback, receiver) = flush_channel();
        let config = HintsBufferConfig::default()
            .with_buffer_size(256)
            .with_max_buffers(2);
        let pool = Arc::new(HintsBufferPool::new(config, callback).unwrap());
        let flusher = HintsFlusher::spawn(Arc::clone(&pool), receiver, sink).unwrap();
        (pool, flusher)
    }

    fn hint(millis: i64) -> Hint {
        Hint::new(Timestamp::from_millis(millis), vec![millis as u8; 40])
    }

    #[test]
    fn test_flusher_persists_retired_buffers() {
        let sink = MemorySink::default();
        let (pool, flusher) = pool_with_flusher(sink.clone());
        let host = HostId::new();

        // 68 framed bytes per hint, 3 per buffer
        for i in 0..20 {
            pool.write(&[host], &hint(i)).unwrap();
        }
        pool.stop_writes();
        let stats = flusher.shutdown().unwrap();
        pool.close();

        let persisted = sink.hints.lock();
        assert_eq!(stats.hints_flushed as usize, persisted.len());
        assert_eq!(stats.sink_errors, 0);
        assert_eq!(*sink.syncs.lock(), stats.buffers_flushed as usize);
        // Only the final current buffer stays unflushed
        assert!(persisted.len() >= 18);
        for (i, (host_id, hint)) in persisted.iter().enumerate() {
            assert_eq!(*host_id, host);
            assert_eq!(hint.creation_time, Timestamp::from_millis(i as i64));
        }
        assert!(pool.allocated_buffers() <= 2);
    }

    #[test]
    fn test_failing_sink_still_recycles() {
        let (pool, flusher) = pool_with_flusher(FailingSink);
        let host = HostId::new();
        for i in 0..12 {
            pool.write(&[host], &hint(i)).unwrap();
        }
        pool.stop_writes();
        let stats = flusher.shutdown().unwrap();
        pool.close();

        assert!(stats.buffers_flushed >= 3);
        assert_eq!(stats.hints_flushed, 0);
        assert!(stats.sink_errors >= 9);
    }

    #[test]
    #[should_panic(expected = "flush consumer is gone")]
    fn test_callback_without_consumer_is_fatal() {
        let (callback, receiver) = flush_channel();
        drop(receiver);
        let pool = HintsBufferPool::new(HintsBufferConfig::default(), callback.clone()).unwrap();
        callback.flush(Arc::new(HintsBuffer::create(64)), &pool);
    }

    #[test]
    fn test_shutdown_frees_buffer_still_shared() {
        let sink = MemorySink::default();
        let (pool, flusher) = pool_with_flusher(sink.clone());
        let host = HostId::new();

        pool.write(&[host], &hint(0)).unwrap();
        let held = pool.current_buffer().unwrap();
        for i in 1..4 {
            pool.write(&[host], &hint(i)).unwrap();
        }
        // The worker flushed `held` and now retries recycling it
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(sink.hints.lock().len(), 3);

        let stats = flusher.shutdown().unwrap();
        assert_eq!(stats.buffers_flushed, 1);
        assert!(held.is_sealed());
        assert_eq!(pool.reserve_len(), 0);
        pool.close();
    }

    #[test]
    fn test_receiver_sees_retired_buffer() {
        let (callback, receiver) = flush_channel();
        let config = HintsBufferConfig::default()
            .with_buffer_size(100)
            .with_max_buffers(2);
        let pool = HintsBufferPool::new(config, callback).unwrap();
        let host = HostId::new();

        pool.write(&[host], &hint(1)).unwrap();
        assert!(receiver.is_empty());
        pool.write(&[host], &hint(2)).unwrap();
        assert_eq!(receiver.len(), 1);

        let retired = receiver.try_recv().unwrap();
        assert!(retired.is_sealed());
        assert_eq!(retired.hints_for(&host).count(), 1);
    }
}
