//! # hintpool
//!
//! Bounded in-memory staging of hints before they are persisted.
//!
//! Many writer threads append hints into a shared current buffer. When it
//! fills up the pool swaps in a recycled or fresh buffer and hands the full
//! one to a flush consumer exactly once. Total memory is capped: once every
//! buffer is in use, writers block until a flushed buffer comes back.
//!
//! ## Quick Start
//!
//! ```ignore
//! use hintpool::prelude::*;
//!
//! let service = HintsService::builder()
//!     .buffer_size(1 << 20)
//!     .max_buffers(3)
//!     .start(sink)?;
//!
//! service.write(&[host_id], &Hint::new(Timestamp::now(), mutation))?;
//! let earliest = service.earliest_hint_for_host(&host_id);
//!
//! service.close()?;
//! ```
//!
//! ## Layers
//!
//! - [`hintpool_core`] - Hosts, timestamps, hints, config, errors
//! - [`hintpool_durability`] - Buffers, pool, reserve queue, flusher

#![warn(missing_docs)]

mod service;

pub mod prelude;

// Re-export main entry points
pub use service::{HintsService, HintsServiceBuilder};

pub use hintpool_core::{
    Error, Hint, HintsBufferConfig, HostId, ProtocolVersion, Record, Result, Timestamp,
    ENTRY_OVERHEAD_SIZE,
};
pub use hintpool_durability::{
    flush_channel, Allocation, ChannelFlushCallback, FlushCallback, FlushReceiver, FlushStats,
    HintsBuffer, HintsBufferPool, HintsFlusher, HintsSink,
};
