//! Durability layer for hintpool
//!
//! This crate stages hints in memory before they are persisted:
//! - HintsBuffer: Fixed-capacity region with lock-free slot allocation
//! - Allocation: Scoped reservation, released on every exit path
//! - ReserveQueue: Bounded blocking queue of recycled buffers
//! - HintsBufferPool: Current buffer, swap protocol, backpressure
//! - HintsFlusher: Worker draining retired buffers into a sink

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod flusher;
pub mod pool;
pub mod reserve;

pub use buffer::{Allocation, HintsBuffer, HintsIter};
pub use flusher::{
    flush_channel, ChannelFlushCallback, FlushReceiver, FlushStats, HintsFlusher, HintsSink,
};
pub use pool::{FlushCallback, HintsBufferPool};
pub use reserve::ReserveQueue;
