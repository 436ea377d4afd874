//! Fixed-capacity hint staging buffer
//!
//! A `HintsBuffer` is one contiguous memory region that many threads append
//! to at once. Space is reserved with a CAS on the write position, so two
//! allocations never overlap; each writer then fills its own range without
//! further coordination.
//!
//! ## Entry framing
//!
//! ```text
//! [size: u32][crc32(size): u32][hint bytes ...][crc32(size ++ hint): u32]
//! ```
//!
//! ## Lifecycle
//!
//! 1. Open: allocations advance the position
//! 2. Sealed: the first refused allocation seals the buffer, every later one
//!    is refused too
//! 3. Drained: the flush consumer waits for in-flight writers, reads every
//!    host's hints, then [`HintsBuffer::recycle`]s it back to open
//!
//! An entry becomes visible to readers only after its write completed, when
//! its offset is published to the owning hosts' offset lists.

use byteorder::{BigEndian, ByteOrder};
use dashmap::DashMap;
use hintpool_core::{Error, HostId, ProtocolVersion, Record, Result, Timestamp, ENTRY_OVERHEAD_SIZE};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Position value of a sealed buffer
const SEALED: usize = usize::MAX;

/// Bytes before the hint body: size and size checksum
const HEADER_SIZE: usize = 8;

/// A fixed-size region supporting concurrent, non-overlapping appends
pub struct HintsBuffer {
    slab: Box<[UnsafeCell<u8>]>,
    position: AtomicUsize,
    /// Earliest hint creation time per host
    earliest: DashMap<HostId, Timestamp>,
    /// Offsets of committed entries per host, in commit order
    offsets: DashMap<HostId, Vec<u32>>,
    /// Allocations not yet released
    writers: AtomicUsize,
    writers_lock: Mutex<()>,
    writers_done: Condvar,
}

// SAFETY: the slab is only written through `Allocation`, and allocations
// receive disjoint ranges from the position CAS. Committed ranges are only
// read after their offset was published through `offsets`, which orders the
// write before the read. `reset` requires `&mut self`.
unsafe impl Sync for HintsBuffer {}

impl HintsBuffer {
    /// Protocol version every entry in a buffer is encoded with
    pub const VERSION: ProtocolVersion = ProtocolVersion::CURRENT;

    /// Create an empty buffer of `capacity` bytes
    pub fn create(capacity: usize) -> HintsBuffer {
        let slab = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        HintsBuffer {
            slab,
            position: AtomicUsize::new(0),
            earliest: DashMap::new(),
            offsets: DashMap::new(),
            writers: AtomicUsize::new(0),
            writers_lock: Mutex::new(()),
            writers_done: Condvar::new(),
        }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.slab.len()
    }

    /// Bytes still available, zero once sealed
    pub fn remaining(&self) -> usize {
        match self.position.load(Ordering::Acquire) {
            SEALED => 0,
            position => self.capacity() - position,
        }
    }

    /// Whether the buffer refuses all further allocations
    pub fn is_sealed(&self) -> bool {
        self.position.load(Ordering::Acquire) == SEALED
    }

    /// Whether no space has been handed out since creation or the last reset
    pub fn is_empty(&self) -> bool {
        self.position.load(Ordering::Acquire) == 0
    }

    /// Refuse every subsequent allocation
    pub fn seal(&self) {
        // SeqCst pairs with the writer registration in `allocate` and the
        // load in `wait_for_modifications`.
        self.position.store(SEALED, Ordering::SeqCst);
    }

    /// Reserve room for a hint of `hint_size` serialized bytes
    ///
    /// Returns `None` when the remaining capacity is too small. That is the
    /// normal "buffer full" signal, not an error, and it seals the buffer.
    pub fn allocate(&self, hint_size: usize) -> Option<Allocation<'_>> {
        let total_size = hint_size.checked_add(ENTRY_OVERHEAD_SIZE)?;

        // Registered before the CAS so a consumer waiting for writers cannot
        // miss an allocation that is about to succeed.
        self.writers.fetch_add(1, Ordering::SeqCst);
        match self.allocate_bytes(total_size) {
            Some(offset) => Some(Allocation {
                buffer: self,
                offset,
                total_size,
            }),
            None => {
                self.release_writer();
                None
            }
        }
    }

    fn allocate_bytes(&self, total_size: usize) -> Option<usize> {
        let mut prev = self.position.load(Ordering::SeqCst);
        loop {
            if prev == SEALED {
                return None;
            }
            let next = match prev.checked_add(total_size) {
                Some(next) if next <= self.capacity() => next,
                _ => {
                    self.seal();
                    return None;
                }
            };
            match self.position.compare_exchange_weak(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(prev),
                Err(actual) => prev = actual,
            }
        }
    }

    fn release_writer(&self) {
        if self.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.writers_lock.lock();
            self.writers_done.notify_all();
        }
    }

    /// Block until every outstanding [`Allocation`] has been released
    ///
    /// Call on a sealed buffer before reading it, so that no granted write
    /// is still in progress.
    pub fn wait_for_modifications(&self) {
        let mut guard = self.writers_lock.lock();
        while self.writers.load(Ordering::SeqCst) > 0 {
            self.writers_done.wait(&mut guard);
        }
    }

    fn record_hint(&self, host_id: HostId, offset: usize, timestamp: Timestamp) {
        self.earliest
            .entry(host_id)
            .and_modify(|earliest| {
                if timestamp < *earliest {
                    *earliest = timestamp;
                }
            })
            .or_insert(timestamp);
        // Offsets fit: capacity is validated to be at most u32::MAX.
        self.offsets
            .entry(host_id)
            .or_default()
            .push(offset as u32);
    }

    /// Earliest hint creation time for `host_id`, `None` if it has no hints here
    pub fn earliest_hint_time(&self, host_id: &HostId) -> Option<Timestamp> {
        self.earliest.get(host_id).map(|entry| *entry.value())
    }

    /// Forget the earliest hint time tracked for `host_id`
    pub fn clear_earliest_hint(&self, host_id: &HostId) {
        self.earliest.remove(host_id);
    }

    /// Hosts with at least one committed hint
    pub fn host_ids(&self) -> Vec<HostId> {
        self.offsets.iter().map(|entry| *entry.key()).collect()
    }

    /// Committed hints for `host_id`, checksum-verified, in commit order
    pub fn hints_for(&self, host_id: &HostId) -> HintsIter<'_> {
        let offsets = self
            .offsets
            .get(host_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        HintsIter {
            buffer: self,
            offsets: offsets.into_iter(),
        }
    }

    /// Mutable view of a reserved range
    ///
    /// # Safety
    ///
    /// The caller must own `offset..offset + len` through an allocation and
    /// no other reference to that range may exist.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.capacity());
        // SAFETY: the range is inside the slab and the caller guarantees
        // exclusive access to it. `UnsafeCell<u8>` has the layout of `u8`.
        std::slice::from_raw_parts_mut(UnsafeCell::raw_get(self.slab.as_ptr().add(offset)), len)
    }

    /// Shared view of a committed range
    ///
    /// # Safety
    ///
    /// The range must not be written concurrently.
    unsafe fn committed(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.capacity());
        // SAFETY: the range is inside the slab and the caller guarantees no
        // concurrent writer. `UnsafeCell<u8>` has the layout of `u8`.
        std::slice::from_raw_parts(
            UnsafeCell::raw_get(self.slab.as_ptr().add(offset)) as *const u8,
            len,
        )
    }

    fn read_entry(&self, offset: usize) -> Result<&[u8]> {
        let capacity = self.capacity();
        if offset + ENTRY_OVERHEAD_SIZE > capacity {
            return Err(Error::Corruption(format!(
                "entry header at offset {} overruns capacity {}",
                offset, capacity
            )));
        }

        // SAFETY: offset was published by a completed write, the header lies
        // within capacity per the check above, and committed ranges are never
        // written again before `reset`.
        let header = unsafe { self.committed(offset, HEADER_SIZE) };
        let size = BigEndian::read_u32(&header[0..4]) as usize;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&header[0..4]);
        if crc.clone().finalize() != BigEndian::read_u32(&header[4..8]) {
            return Err(Error::Corruption(format!(
                "size checksum mismatch at offset {}",
                offset
            )));
        }
        if offset + size + ENTRY_OVERHEAD_SIZE > capacity {
            return Err(Error::Corruption(format!(
                "entry of {} bytes at offset {} overruns capacity {}",
                size, offset, capacity
            )));
        }

        // SAFETY: the bounds check above keeps the body inside the slab, and
        // it belongs to the same published entry as the header.
        let body = unsafe { self.committed(offset + HEADER_SIZE, size) };
        // SAFETY: the trailer ends at `offset + size + ENTRY_OVERHEAD_SIZE`,
        // checked above to be within capacity, and is part of the published entry.
        let trailer = unsafe { self.committed(offset + HEADER_SIZE + size, 4) };
        crc.update(body);
        if crc.finalize() != BigEndian::read_u32(trailer) {
            return Err(Error::Corruption(format!(
                "hint checksum mismatch at offset {}",
                offset
            )));
        }
        Ok(body)
    }

    /// Make the buffer open and empty again, keeping its memory
    pub fn reset(&mut self) {
        *self.position.get_mut() = 0;
        self.earliest.clear();
        self.offsets.clear();
    }

    /// Reset a drained buffer for reuse
    ///
    /// Fails with [`Error::BufferInUse`] while any other handle exists; the
    /// caller keeps its handle either way.
    pub fn recycle(buffer: &mut Arc<HintsBuffer>) -> Result<()> {
        let handles = Arc::strong_count(buffer) - 1;
        match Arc::get_mut(buffer) {
            Some(exclusive) => {
                exclusive.reset();
                Ok(())
            }
            None => Err(Error::BufferInUse {
                handles: handles.max(1),
            }),
        }
    }

    /// Give up this handle, sealing the buffer
    ///
    /// Backing memory is released once the last handle is dropped.
    pub fn free(self: Arc<Self>) {
        self.seal();
        let others = Arc::strong_count(&self) - 1;
        if others > 0 {
            tracing::debug!(
                capacity = self.capacity(),
                others,
                "Hints buffer freed while other handles remain"
            );
        }
    }
}

impl std::fmt::Debug for HintsBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HintsBuffer")
            .field("capacity", &self.capacity())
            .field("remaining", &self.remaining())
            .field("sealed", &self.is_sealed())
            .field("hosts", &self.offsets.len())
            .finish()
    }
}

/// Reservation of one entry's byte range
///
/// Consumed by [`Allocation::write`]. Dropping it, written or not, releases
/// the writer slot that [`HintsBuffer::wait_for_modifications`] waits on.
pub struct Allocation<'a> {
    buffer: &'a HintsBuffer,
    offset: usize,
    total_size: usize,
}

impl<'a> Allocation<'a> {
    /// Start of the reserved range
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the reserved range, framing included
    pub fn len(&self) -> usize {
        self.total_size
    }

    /// Always false: an allocation covers at least the entry framing
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Serialize `record` into the reserved range and index it by host
    ///
    /// On error nothing is published and the range stays unreadable.
    pub fn write<'h, R, I>(self, host_ids: I, record: &R) -> Result<()>
    where
        R: Record + ?Sized,
        I: IntoIterator<Item = &'h HostId>,
    {
        let hint_size = self.total_size - ENTRY_OVERHEAD_SIZE;
        // SAFETY: the range came from the position CAS and this allocation
        // is its only user.
        let slot = unsafe { self.buffer.slot_mut(self.offset, self.total_size) };

        BigEndian::write_u32(&mut slot[0..4], hint_size as u32);
        let mut crc = crc32fast::Hasher::new();
        crc.update(&slot[0..4]);
        BigEndian::write_u32(&mut slot[4..8], crc.clone().finalize());

        let body = HEADER_SIZE..HEADER_SIZE + hint_size;
        record.serialize_into(HintsBuffer::VERSION, &mut slot[body.clone()])?;
        crc.update(&slot[body]);
        BigEndian::write_u32(&mut slot[HEADER_SIZE + hint_size..], crc.finalize());

        let timestamp = record.timestamp();
        for host_id in host_ids {
            self.buffer.record_hint(*host_id, self.offset, timestamp);
        }
        Ok(())
    }
}

impl Drop for Allocation<'_> {
    fn drop(&mut self) {
        self.buffer.release_writer();
    }
}

/// Iterator over one host's committed hint payloads
pub struct HintsIter<'a> {
    buffer: &'a HintsBuffer,
    offsets: std::vec::IntoIter<u32>,
}

impl<'a> Iterator for HintsIter<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offsets.next()?;
        Some(self.buffer.read_entry(offset as usize))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.offsets.size_hint()
    }
}
