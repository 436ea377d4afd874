//! Identifier and time types
//!
//! - [`HostId`]: Unique identifier of a destination host
//! - [`Timestamp`]: Hint creation time in milliseconds since the Unix epoch

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a host that hints are addressed to
///
/// Used as the key of per-host bookkeeping inside every buffer:
/// - Earliest hint timestamp
/// - Offsets of committed hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(Uuid);

impl HostId {
    /// Create a new random HostId using UUID v4
    ///
    /// # Examples
    ///
    /// ```
    /// use hintpool_core::HostId;
    ///
    /// let a = HostId::new();
    /// let b = HostId::new();
    /// assert_ne!(a, b);
    /// ```
    pub fn new() -> Self {
        HostId(Uuid::new_v4())
    }

    /// Create HostId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        HostId(Uuid::from_bytes(bytes))
    }

    /// Get raw bytes representation
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for HostId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for HostId {
    fn from(uuid: Uuid) -> Self {
        HostId(uuid)
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch
///
/// Ordered, so the earliest of two timestamps is `a.min(b)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis())
    }

    /// Create from milliseconds since the epoch
    pub const fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    /// Milliseconds since the epoch
    pub const fn as_millis(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
