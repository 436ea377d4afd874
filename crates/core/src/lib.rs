//! Core types for hintpool
//!
//! This crate defines the types shared by every layer of the hint staging
//! system:
//! - [`HostId`]: Destination host of a hint
//! - [`Timestamp`]: Millisecond wall-clock time
//! - [`Hint`] and the [`Record`] serializer capability
//! - [`HintsBufferConfig`]: Pool sizing, validated at construction
//! - [`Error`]: Unified error type

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod hint;
pub mod types;

pub use config::{HintsBufferConfig, ENTRY_OVERHEAD_SIZE};
pub use error::{Error, Result};
pub use hint::{Hint, ProtocolVersion, Record};
pub use types::{HostId, Timestamp};
