//! Contract tests for HintsBufferPool
//!
//! Covers the buffer lifecycle under concurrency:
//!
//! 1. Exactly one flush per retired buffer
//! 2. Buffer budget never exceeded
//! 3. Backpressure when the budget is exhausted
//! 4. Swap tie-break between racing writers
//! 5. Earliest-hint bookkeeping across buffers
//! 6. Interruption of blocked writers on close

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use hintpool_core::{
    Error, Hint, HintsBufferConfig, HostId, Record, Timestamp, ENTRY_OVERHEAD_SIZE,
};
use hintpool_durability::{HintsBuffer, HintsBufferPool};
use parking_lot::Mutex;
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

fn config(buffer_size: usize, max_buffers: usize) -> HintsBufferConfig {
    HintsBufferConfig::default()
        .with_buffer_size(buffer_size)
        .with_max_buffers(max_buffers)
}

/// Hint occupying exactly `framed` bytes of a buffer
fn sized_hint(millis: i64, framed: usize) -> Hint {
    let header = Hint::new(Timestamp::from_millis(0), Vec::new()).serialized_size(HintsBuffer::VERSION);
    Hint::new(
        Timestamp::from_millis(millis),
        vec![0x5A; framed - ENTRY_OVERHEAD_SIZE - header],
    )
}

type Retired = Arc<Mutex<Vec<Arc<HintsBuffer>>>>;

/// Pool whose callback parks retired buffers for the test to inspect
fn parking_pool(buffer_size: usize, max_buffers: usize) -> (Arc<HintsBufferPool>, Retired) {
    let retired: Retired = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&retired);
    let pool = HintsBufferPool::new(
        config(buffer_size, max_buffers),
        move |buffer: Arc<HintsBuffer>, _: &HintsBufferPool| sink.lock().push(buffer),
    )
    .unwrap();
    (Arc::new(pool), retired)
}

fn recycle_and_offer(pool: &HintsBufferPool, mut buffer: Arc<HintsBuffer>) {
    while HintsBuffer::recycle(&mut buffer).is_err() {
        thread::sleep(Duration::from_millis(1));
    }
    pool.offer(buffer);
}

fn committed_hints(buffer: &HintsBuffer) -> usize {
    buffer
        .host_ids()
        .iter()
        .map(|host| buffer.hints_for(host).count())
        .sum()
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn test_blocks_when_budget_exhausted_until_offer() {
    let (pool, retired) = parking_pool(1000, 2);
    let host = HostId::new();

    pool.write(&[host], &sized_hint(1, 600)).unwrap();
    let first = pool.current_buffer().unwrap();
    pool.write(&[host], &sized_hint(2, 600)).unwrap();
    assert_eq!(retired.lock().len(), 1);
    assert_eq!(pool.allocated_buffers(), 2);

    let writer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.write(&[host], &sized_hint(3, 600)))
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!writer.is_finished(), "writer should block on the exhausted budget");
    assert_eq!(pool.allocated_buffers(), 2);

    let recycled = retired.lock().remove(0);
    assert!(Arc::ptr_eq(&recycled, &first));
    drop(first);
    recycle_and_offer(&pool, recycled);

    writer.join().unwrap().unwrap();
    assert_eq!(pool.allocated_buffers(), 2);
    // The blocked writer retired the second buffer and moved into the recycled one
    assert_eq!(retired.lock().len(), 1);
    let current = pool.current_buffer().unwrap();
    assert_eq!(current.earliest_hint_time(&host), Some(Timestamp::from_millis(3)));
    assert_eq!(committed_hints(&current), 1);
}

#[test]
fn test_close_interrupts_blocked_writer() {
    let (pool, _retired) = parking_pool(1000, 2);
    let host = HostId::new();
    pool.write(&[host], &sized_hint(1, 600)).unwrap();
    pool.write(&[host], &sized_hint(2, 600)).unwrap();

    let writer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.write(&[host], &sized_hint(3, 600)))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!writer.is_finished());

    pool.close();
    let result = writer.join().unwrap();
    assert!(matches!(result, Err(Error::Interrupted)), "got {:?}", result);
}

// ============================================================================
// Swap Tie-Break
// ============================================================================

#[test]
fn test_racing_writers_swap_once() {
    for _ in 0..50 {
        let (pool, retired) = parking_pool(1000, 3);
        let host = HostId::new();

        // Fill the first buffer exactly so both racers are refused by it
        pool.write(&[host], &sized_hint(0, 1000)).unwrap();
        let first = pool.current_buffer().unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let racers: Vec<_> = (1..=2)
            .map(|i| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    pool.write(&[host], &sized_hint(i, 400))
                })
            })
            .collect();
        for racer in racers {
            racer.join().unwrap().unwrap();
        }

        let retired = retired.lock();
        assert_eq!(retired.len(), 1, "exactly one swap must flush");
        assert!(Arc::ptr_eq(&retired[0], &first));
        assert_eq!(pool.allocated_buffers(), 2);
        assert_eq!(committed_hints(&pool.current_buffer().unwrap()), 2);
    }
}

// ============================================================================
// Exactly-Once Flush Under Load
// ============================================================================

#[test]
fn test_every_retired_buffer_flushed_exactly_once() {
    const WRITERS: usize = 8;
    const HINTS_PER_WRITER: usize = 500;
    const MAX_BUFFERS: usize = 3;

    let checked_out: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));
    let flushed_hints = Arc::new(AtomicUsize::new(0));
    let flushes = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = crossbeam_channel::unbounded::<Arc<HintsBuffer>>();

    let pool = {
        let checked_out = Arc::clone(&checked_out);
        let flushes = Arc::clone(&flushes);
        Arc::new(
            HintsBufferPool::new(
                config(4096, MAX_BUFFERS),
                move |buffer: Arc<HintsBuffer>, pool: &HintsBufferPool| {
                    assert!(buffer.is_sealed(), "retired buffer must be sealed");
                    assert!(pool.allocated_buffers() <= MAX_BUFFERS);
                    let fresh = checked_out.lock().insert(Arc::as_ptr(&buffer) as usize);
                    assert!(fresh, "buffer flushed twice in one retirement");
                    flushes.fetch_add(1, Ordering::SeqCst);
                    tx.send(buffer).unwrap();
                },
            )
            .unwrap(),
        )
    };

    let consumer = {
        let pool = Arc::clone(&pool);
        let checked_out = Arc::clone(&checked_out);
        let flushed_hints = Arc::clone(&flushed_hints);
        thread::spawn(move || {
            while let Ok(buffer) = rx.recv_timeout(Duration::from_secs(2)) {
                buffer.wait_for_modifications();
                flushed_hints.fetch_add(committed_hints(&buffer), Ordering::SeqCst);
                checked_out.lock().remove(&(Arc::as_ptr(&buffer) as usize));
                recycle_and_offer(&pool, buffer);
            }
        })
    };

    let barrier = Arc::new(Barrier::new(WRITERS));
    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let host = HostId::new();
                barrier.wait();
                for i in 0..HINTS_PER_WRITER {
                    let framed = 40 + (w * 13 + i) % 200;
                    pool.write(&[host], &sized_hint(i as i64, framed)).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    consumer.join().unwrap();

    let current = pool.current_buffer().unwrap();
    current.wait_for_modifications();
    let staged = committed_hints(&current);
    assert_eq!(
        flushed_hints.load(Ordering::SeqCst) + staged,
        WRITERS * HINTS_PER_WRITER,
        "every hint lands in exactly one flushed or current buffer"
    );
    assert!(flushes.load(Ordering::SeqCst) > 0);
    assert!(pool.allocated_buffers() <= MAX_BUFFERS);
    assert!(checked_out.lock().is_empty());
}

// ============================================================================
// Earliest Hint Bookkeeping
// ============================================================================

#[test]
fn test_clear_then_query_returns_none() {
    let (pool, _) = parking_pool(4096, 2);
    let a = HostId::new();
    let b = HostId::new();
    pool.write(&[a, b], &sized_hint(10, 100)).unwrap();

    pool.clear_earliest_hints_for_host(&a);
    assert_eq!(pool.earliest_hint_for_host(&a), None);
    assert_eq!(pool.earliest_hint_for_host(&b), Some(Timestamp::from_millis(10)));
}

#[test]
fn test_retired_buffers_leave_the_earliest_query() {
    let (pool, retired) = parking_pool(1000, 3);
    let host = HostId::new();
    pool.write(&[host], &sized_hint(5, 600)).unwrap();
    pool.write(&[host], &sized_hint(9, 600)).unwrap();

    assert_eq!(retired.lock().len(), 1);
    assert_eq!(pool.earliest_hint_for_host(&host), Some(Timestamp::from_millis(9)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_earliest_is_minimum_written(
        writes in proptest::collection::vec((0usize..3, -1_000i64..1_000), 1..40)
    ) {
        let (pool, retired) = parking_pool(64 * 1024, 2);
        let hosts = [HostId::new(), HostId::new(), HostId::new()];

        for (host, millis) in &writes {
            pool.write(&[hosts[*host]], &sized_hint(*millis, 64)).unwrap();
        }
        prop_assert!(retired.lock().is_empty());

        for (i, host) in hosts.iter().enumerate() {
            let expected = writes
                .iter()
                .filter(|(h, _)| *h == i)
                .map(|(_, millis)| Timestamp::from_millis(*millis))
                .min();
            prop_assert_eq!(pool.earliest_hint_for_host(host), expected);
        }
    }

    #[test]
    fn prop_allocations_disjoint_and_bounded(
        sizes in proptest::collection::vec(0usize..120, 1..60)
    ) {
        let buffer = HintsBuffer::create(4096);
        let mut ranges = Vec::new();
        for size in &sizes {
            match buffer.allocate(*size) {
                Some(allocation) => ranges.push((allocation.offset(), allocation.len())),
                None => break,
            }
        }
        let mut end = 0;
        for (offset, len) in &ranges {
            prop_assert!(*offset >= end);
            end = offset + len;
        }
        prop_assert!(end <= buffer.capacity());
    }
}
