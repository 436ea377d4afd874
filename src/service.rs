//! Hints service entry point.
//!
//! Wires a [`HintsBufferPool`] to a [`HintsFlusher`] through a flush channel
//! and owns the shutdown order of the two.

use crate::Result;
use hintpool_core::{HintsBufferConfig, HostId, Record, Timestamp};
use hintpool_durability::{flush_channel, FlushStats, HintsBufferPool, HintsFlusher, HintsSink};
use parking_lot::Mutex;
use std::sync::Arc;

/// A running hint staging pipeline.
///
/// # Example
///
/// ```ignore
/// use hintpool::prelude::*;
///
/// let service = HintsService::builder()
///     .buffer_size(4 * 1024 * 1024)
///     .max_buffers(3)
///     .start(sink)?;
///
/// service.write(&[host_id], &Hint::new(Timestamp::now(), mutation))?;
///
/// // Graceful shutdown
/// let stats = service.close()?;
/// ```
pub struct HintsService {
    pool: Arc<HintsBufferPool>,
    flusher: Mutex<Option<HintsFlusher>>,
}

impl HintsService {
    /// Create a builder for service configuration.
    pub fn builder() -> HintsServiceBuilder {
        HintsServiceBuilder::new()
    }

    /// Stage a hint for every host in `host_ids`.
    ///
    /// May block while all buffers are waiting to be flushed.
    pub fn write<R: Record + ?Sized>(&self, host_ids: &[HostId], hint: &R) -> Result<()> {
        self.pool.write(host_ids, hint)
    }

    /// Earliest staged hint time for `host_id`.
    pub fn earliest_hint_for_host(&self, host_id: &HostId) -> Option<Timestamp> {
        self.pool.earliest_hint_for_host(host_id)
    }

    /// Forget the earliest staged hint time for `host_id`.
    pub fn clear_earliest_hints_for_host(&self, host_id: &HostId) {
        self.pool.clear_earliest_hints_for_host(host_id)
    }

    /// The underlying buffer pool.
    pub fn pool(&self) -> &Arc<HintsBufferPool> {
        &self.pool
    }

    /// Gracefully close the service.
    ///
    /// Stops accepting writes, flushes every retired buffer, stops the
    /// flusher, then frees the pool's buffers. Hints in the current buffer
    /// are not flushed. Later calls return empty stats.
    pub fn close(&self) -> Result<FlushStats> {
        let flusher = match self.flusher.lock().take() {
            Some(flusher) => flusher,
            None => return Ok(FlushStats::default()),
        };
        // No buffer can be retired once the consumer is gone
        self.pool.stop_writes();
        let stats = flusher.shutdown();
        self.pool.close();
        let stats = stats?;
        tracing::info!(
            buffers_flushed = stats.buffers_flushed,
            hints_flushed = stats.hints_flushed,
            sink_errors = stats.sink_errors,
            "Hints service closed"
        );
        Ok(stats)
    }
}

impl Drop for HintsService {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Hints service closed abnormally");
        }
    }
}

/// Builder for service configuration.
#[derive(Debug, Clone, Default)]
pub struct HintsServiceBuilder {
    config: HintsBufferConfig,
}

impl HintsServiceBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole pool configuration.
    pub fn config(mut self, config: HintsBufferConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the capacity of every buffer in bytes.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.config = self.config.with_buffer_size(buffer_size);
        self
    }

    /// Set the cap on buffers ever allocated.
    pub fn max_buffers(mut self, max_buffers: usize) -> Self {
        self.config = self.config.with_max_buffers(max_buffers);
        self
    }

    /// Validate the configuration and start the flusher thread.
    pub fn start<S: HintsSink>(self, sink: S) -> Result<HintsService> {
        let (callback, receiver) = flush_channel();
        let pool = Arc::new(HintsBufferPool::new(self.config, callback)?);
        let flusher = HintsFlusher::spawn(Arc::clone(&pool), receiver, sink)?;

        tracing::info!(
            buffer_size = self.config.buffer_size,
            max_buffers = self.config.max_buffers,
            "Hints service started"
        );
        Ok(HintsService {
            pool,
            flusher: Mutex::new(Some(flusher)),
        })
    }
}
