//! Error types for hintpool
//!
//! A refused buffer allocation is not an error: it is `Option::None` and
//! drives the swap loop. Everything here is a real failure surfaced to the
//! caller.

use thiserror::Error;

/// All hintpool errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected at construction
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Hint can never fit in a buffer, however empty
    #[error("hint too large: {size} bytes framed, buffer capacity is {capacity}")]
    HintTooLarge {
        /// Framed size of the hint (payload plus entry overhead)
        size: usize,
        /// Capacity of a single buffer
        capacity: usize,
    },

    /// Protocol version the serializer cannot handle
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    /// Record could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Checksum mismatch or truncated entry
    #[error("corruption: {0}")]
    Corruption(String),

    /// Writer was woken while blocked on the buffer budget
    #[error("interrupted while waiting for a reserve buffer")]
    Interrupted,

    /// Pool has been closed
    #[error("buffer pool is closed")]
    PoolClosed,

    /// Buffer still has other live handles
    #[error("buffer still in use by {handles} other handle(s)")]
    BufferInUse {
        /// Number of other strong handles
        handles: usize,
    },

    /// Persistence collaborator failed
    #[error("sink error: {0}")]
    Sink(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for hintpool operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is retryable.
    ///
    /// Only sink failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Sink(_) | Error::Io(_))
    }

    /// Check if the caller should stop using the pool.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Interrupted | Error::PoolClosed | Error::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_too_large_message() {
        let e = Error::HintTooLarge {
            size: 2000,
            capacity: 1000,
        };
        assert_eq!(
            e.to_string(),
            "hint too large: 2000 bytes framed, buffer capacity is 1000"
        );
    }

    #[test]
    fn test_classification() {
        assert!(Error::Interrupted.is_fatal());
        assert!(Error::PoolClosed.is_fatal());
        assert!(!Error::Interrupted.is_retryable());
        assert!(Error::Sink("disk full".into()).is_retryable());
        assert!(!Error::Corruption("bad crc".into()).is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
