//! Buffer pool configuration
//!
//! Sizing is fixed when the pool is built and never changes afterwards.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Bytes of framing around every hint in a buffer: size, size CRC, body CRC
pub const ENTRY_OVERHEAD_SIZE: usize = 12;

/// Default capacity of a single buffer (32 MiB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024 * 1024;

/// Default cap on buffers ever allocated by one pool
pub const DEFAULT_MAX_BUFFERS: usize = 3;

/// Pool sizing
///
/// # Example
///
/// ```
/// use hintpool_core::HintsBufferConfig;
///
/// let config = HintsBufferConfig::default()
///     .with_buffer_size(1 << 20)
///     .with_max_buffers(4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HintsBufferConfig {
    /// Capacity in bytes of every buffer
    pub buffer_size: usize,
    /// Hard cap on buffers the pool may ever create
    pub max_buffers: usize,
}

impl Default for HintsBufferConfig {
    fn default() -> Self {
        HintsBufferConfig {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_buffers: DEFAULT_MAX_BUFFERS,
        }
    }
}

impl HintsBufferConfig {
    /// Set the per-buffer capacity
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the buffer budget
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    /// Largest hint payload that fits in an empty buffer
    pub fn max_hint_size(&self) -> usize {
        self.buffer_size.saturating_sub(ENTRY_OVERHEAD_SIZE)
    }

    /// Reject sizing the pool cannot operate with
    ///
    /// A single buffer cannot work: the writer that retires it would block
    /// waiting for a reserve that only its own flush can supply.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffers < 2 {
            return Err(Error::InvalidConfig(format!(
                "max_buffers must be at least 2, got {}",
                self.max_buffers
            )));
        }
        if self.buffer_size <= ENTRY_OVERHEAD_SIZE {
            return Err(Error::InvalidConfig(format!(
                "buffer_size must exceed the {} byte entry overhead, got {}",
                ENTRY_OVERHEAD_SIZE, self.buffer_size
            )));
        }
        if self.buffer_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "buffer_size {} exceeds u32::MAX",
                self.buffer_size
            )));
        }
        Ok(())
    }
}
