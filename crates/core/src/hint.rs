//! Hint records and the serializer capability
//!
//! Buffers never look inside a record. They ask a [`Record`] for its size
//! and hand it a slice of exactly that length to encode into.
//!
//! ## Hint layout
//!
//! ```text
//! V1: [creation_time: i64][mutation_len: u32][mutation ...]
//! V2: [creation_time: i64][gc_grace_seconds: u32][mutation_len: u32][mutation ...]
//! ```
//!
//! All integers are big-endian.

use crate::error::{Error, Result};
use crate::types::Timestamp;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

/// Messaging protocol version passed to serializers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    /// Oldest version that can still be encoded
    pub const MINIMUM: ProtocolVersion = ProtocolVersion(1);
    /// Version used for all new writes
    pub const CURRENT: ProtocolVersion = ProtocolVersion(2);

    /// Fail with [`Error::UnsupportedVersion`] outside `MINIMUM..=CURRENT`
    pub fn check(self) -> Result<Self> {
        if self < Self::MINIMUM || self > Self::CURRENT {
            return Err(Error::UnsupportedVersion(self.0));
        }
        Ok(self)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// A record that can be staged in a hints buffer
///
/// `serialize_into` always receives a slice of exactly
/// `serialized_size(version)` bytes.
pub trait Record {
    /// Timestamp used for per-host earliest-hint tracking
    fn timestamp(&self) -> Timestamp;

    /// Encoded size in bytes for `version`
    fn serialized_size(&self, version: ProtocolVersion) -> usize;

    /// Encode into `out`
    fn serialize_into(&self, version: ProtocolVersion, out: &mut [u8]) -> Result<()>;
}

/// Grace period assumed for hints decoded from V1 payloads (10 days)
pub const DEFAULT_GC_GRACE_SECONDS: u32 = 864_000;

/// A mutation addressed to hosts that could not receive it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    /// When the hint was created
    pub creation_time: Timestamp,
    /// Seconds after which the hint is no longer worth replaying
    pub gc_grace_seconds: u32,
    /// Opaque serialized mutation
    pub mutation: Vec<u8>,
}

impl Hint {
    /// Create a hint with the default grace period
    pub fn new(creation_time: Timestamp, mutation: impl Into<Vec<u8>>) -> Self {
        Hint {
            creation_time,
            gc_grace_seconds: DEFAULT_GC_GRACE_SECONDS,
            mutation: mutation.into(),
        }
    }

    /// Override the grace period
    pub fn with_gc_grace_seconds(mut self, gc_grace_seconds: u32) -> Self {
        self.gc_grace_seconds = gc_grace_seconds;
        self
    }

    fn header_size(version: ProtocolVersion) -> usize {
        if version >= ProtocolVersion(2) {
            16
        } else {
            12
        }
    }

    /// Decode a hint encoded with `version`
    pub fn decode(bytes: &[u8], version: ProtocolVersion) -> Result<Hint> {
        version.check()?;
        let header = Self::header_size(version);
        if bytes.len() < header {
            return Err(Error::Corruption(format!(
                "hint header truncated: {} of {} bytes",
                bytes.len(),
                header
            )));
        }

        let creation_time = Timestamp::from_millis(BigEndian::read_i64(&bytes[0..8]));
        let (gc_grace_seconds, len_at) = if header == 16 {
            (BigEndian::read_u32(&bytes[8..12]), 12)
        } else {
            (DEFAULT_GC_GRACE_SECONDS, 8)
        };
        let mutation_len = BigEndian::read_u32(&bytes[len_at..len_at + 4]) as usize;

        let body = &bytes[header..];
        if body.len() != mutation_len {
            return Err(Error::Corruption(format!(
                "hint body length {} does not match declared {}",
                body.len(),
                mutation_len
            )));
        }

        Ok(Hint {
            creation_time,
            gc_grace_seconds,
            mutation: body.to_vec(),
        })
    }

    /// Encode into a fresh vector
    pub fn encode(&self, version: ProtocolVersion) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.serialized_size(version)];
        self.serialize_into(version, &mut out)?;
        Ok(out)
    }
}

impl Record for Hint {
    fn timestamp(&self) -> Timestamp {
        self.creation_time
    }

    fn serialized_size(&self, version: ProtocolVersion) -> usize {
        Self::header_size(version) + self.mutation.len()
    }

    fn serialize_into(&self, version: ProtocolVersion, out: &mut [u8]) -> Result<()> {
        version.check()?;
        let expected = self.serialized_size(version);
        if out.len() != expected {
            return Err(Error::Serialization(format!(
                "output slice is {} bytes, hint needs {}",
                out.len(),
                expected
            )));
        }
        let mutation_len = u32::try_from(self.mutation.len())
            .map_err(|_| Error::Serialization("mutation exceeds u32::MAX bytes".into()))?;

        BigEndian::write_i64(&mut out[0..8], self.creation_time.as_millis());
        let header = if version >= ProtocolVersion(2) {
            BigEndian::write_u32(&mut out[8..12], self.gc_grace_seconds);
            BigEndian::write_u32(&mut out[12..16], mutation_len);
            16
        } else {
            BigEndian::write_u32(&mut out[8..12], mutation_len);
            12
        };
        out[header..].copy_from_slice(&self.mutation);
        Ok(())
    }
}
