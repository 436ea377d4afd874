//! Convenient imports for hintpool.
//!
//! ```ignore
//! use hintpool::prelude::*;
//! ```

// Main entry point
pub use crate::service::{HintsService, HintsServiceBuilder};

// Error handling
pub use hintpool_core::{Error, Result};

// Core types
pub use hintpool_core::{Hint, HintsBufferConfig, HostId, ProtocolVersion, Record, Timestamp};

// Pool and flushing
pub use hintpool_durability::{FlushCallback, FlushStats, HintsBuffer, HintsBufferPool, HintsSink};
