//! Lock-Free Multi-Producer Single-Consumer (MPSC) byte ring
//!
//! Producers reserve a region by CAS on the `head` cursor, copy their record
//! into it, then publish it by moving `committed` from the start of their
//! region to its end. Publication happens in reservation order, so the
//! consumer only ever copies out bytes that are completely written.
//!
//! Cursors are monotonic 64-bit counters and the physical index is
//! `cursor % capacity`, so `head == tail` always means empty. A write is still
//! rejected when `free <= len`: one byte of slack is kept and the largest
//! amount of live data is `capacity - 1` bytes.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;

use tracing::trace;

use super::{backoff, CacheLinePadded};
use crate::error::WriteError;
use crate::shim::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::shim::hint;
use crate::shim::sync::Arc;

/// Lock-free MPSC ring of bytes.
///
/// `write` may be called from any number of threads. `read` is meant for a
/// single consumer; a `read` that overlaps another one returns nothing
/// instead of racing on the tail. Use [`RingBuffer::split`] to get handles
/// that make the single consumer a compile-time property.
#[repr(C)]
pub struct RingBuffer {
    // Reservation cursor, contended by producers
    head: CacheLinePadded<AtomicU64>,
    // Publication cursor, everything below it is readable
    committed: CacheLinePadded<AtomicU64>,
    // Consumer side
    tail: CacheLinePadded<AtomicU64>,
    reading: AtomicBool,
    storage: Box<[UnsafeCell<u8>]>,
    capacity: u64,
}

// SAFETY: storage is only touched through disjoint reserved regions:
// - a producer writes [start, end) only after winning the CAS on head
// - the consumer reads [tail, committed) only, which no producer can reserve
//   again until tail moves past it
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Creates a zero-filled ring of `capacity` bytes.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");

        let storage = (0..capacity)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            head: CacheLinePadded::new(AtomicU64::new(0)),
            committed: CacheLinePadded::new(AtomicU64::new(0)),
            tail: CacheLinePadded::new(AtomicU64::new(0)),
            reading: AtomicBool::new(false),
            storage,
            capacity: capacity as u64,
        }
    }

    /// Appends `entry` as one contiguous record.
    ///
    /// Returns `false` if the record can never fit (one byte of the ring is
    /// always kept free, so at most `capacity - 1` bytes) or there is not
    /// enough free space right now. Records are never split across calls.
    ///
    /// Lock-free on reservation, but publication is in reservation order: a
    /// producer waits (spin, then yield) for earlier reservations to finish
    /// copying, so a producer preempted mid-copy delays the ones behind it.
    #[inline]
    pub fn write(&self, entry: &[u8]) -> bool {
        self.try_write(entry).is_ok()
    }

    /// Like [`write`](Self::write), but says why a record was rejected.
    pub fn try_write(&self, entry: &[u8]) -> Result<(), WriteError> {
        let len = entry.len() as u64;
        if len >= self.capacity {
            trace!(len = entry.len(), capacity = self.capacity, "record larger than ring");
            return Err(WriteError::TooLarge {
                len: entry.len(),
                capacity: self.capacity as usize - 1,
            });
        }
        if entry.is_empty() {
            return Ok(());
        }

        let start = loop {
            // tail first: a stale tail only makes the free check more conservative
            let tail = self.tail.value.load(Ordering::Acquire);
            let head = self.head.value.load(Ordering::Relaxed);

            let used = head.wrapping_sub(tail);
            if used.saturating_add(len) >= self.capacity {
                trace!(len = entry.len(), used, "ring full");
                return Err(WriteError::Full { len: entry.len() });
            }

            match self.head.value.compare_exchange_weak(
                head,
                head + len,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break head,
                Err(_) => hint::spin_loop(),
            }
        };

        // SAFETY: [start, start + len) was reserved by the CAS above and the
        // consumer cannot read it before we publish.
        unsafe { self.copy_in(start, entry) };
        self.publish(start, start + len);
        Ok(())
    }

    /// Copies out up to `batch_size` published bytes and releases them.
    ///
    /// Returns an empty vector when nothing is published or when another
    /// `read` is in progress.
    pub fn read(&self, batch_size: usize) -> Vec<u8> {
        if self
            .reading
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            trace!("overlapping read skipped");
            return Vec::new();
        }

        let batch = self.read_exclusive(batch_size);
        self.reading.store(false, Ordering::Release);
        batch
    }

    /// Splits the ring into a cloneable producer and a unique consumer.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let ring = Arc::new(self);
        (
            RingProducer {
                ring: Arc::clone(&ring),
            },
            RingConsumer { ring },
        )
    }

    /// Total size of the backing storage in bytes.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Bytes published and not yet read.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.value.load(Ordering::Acquire);
        let committed = self.committed.value.load(Ordering::Acquire);
        committed.wrapping_sub(tail) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest record that would be accepted right now.
    #[inline]
    pub fn free(&self) -> usize {
        let tail = self.tail.value.load(Ordering::Acquire);
        let head = self.head.value.load(Ordering::Acquire);
        let used = head.wrapping_sub(tail).min(self.capacity);
        (self.capacity - used).saturating_sub(1) as usize
    }

    /// Reads without claiming the consumer flag. Caller must be the only reader.
    fn read_exclusive(&self, batch_size: usize) -> Vec<u8> {
        let tail = self.tail.value.load(Ordering::Relaxed);
        let committed = self.committed.value.load(Ordering::Acquire);

        if tail == committed {
            return Vec::new();
        }

        let read_size = committed.wrapping_sub(tail).min(batch_size as u64) as usize;
        let mut batch = vec![0u8; read_size];

        // SAFETY: [tail, tail + read_size) is published and no producer can
        // reserve it until the tail store below.
        unsafe { self.copy_out(tail, &mut batch) };

        self.tail
            .value
            .store(tail + read_size as u64, Ordering::Release);
        batch
    }

    /// Waits for earlier reservations to publish, then publishes ours.
    #[inline]
    fn publish(&self, start: u64, end: u64) {
        let mut spins = 0;
        while self
            .committed
            .value
            .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            backoff(&mut spins);
        }
    }

    #[inline(always)]
    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    /// # Safety
    /// The caller must own `[pos, pos + src.len())` exclusively.
    unsafe fn copy_in(&self, pos: u64, src: &[u8]) {
        let capacity = self.capacity as usize;
        let offset = (pos % self.capacity) as usize;
        let base = self.base_ptr();

        // Handle wraparound
        let first_part = (capacity - offset).min(src.len());
        ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), first_part);

        if first_part < src.len() {
            ptr::copy_nonoverlapping(src.as_ptr().add(first_part), base, src.len() - first_part);
        }
    }

    /// # Safety
    /// `[pos, pos + dst.len())` must be published and not yet released.
    unsafe fn copy_out(&self, pos: u64, dst: &mut [u8]) {
        let capacity = self.capacity as usize;
        let offset = (pos % self.capacity) as usize;
        let base = self.base_ptr();

        let first_part = (capacity - offset).min(dst.len());
        ptr::copy_nonoverlapping(base.add(offset), dst.as_mut_ptr(), first_part);

        if first_part < dst.len() {
            ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first_part), dst.len() - first_part);
        }
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Producer side of a split [`RingBuffer`]. Clone it into every writer thread.
#[derive(Clone, Debug)]
pub struct RingProducer {
    ring: Arc<RingBuffer>,
}

impl RingProducer {
    #[inline]
    pub fn write(&self, entry: &[u8]) -> bool {
        self.ring.write(entry)
    }

    #[inline]
    pub fn try_write(&self, entry: &[u8]) -> Result<(), WriteError> {
        self.ring.try_write(entry)
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn free(&self) -> usize {
        self.ring.free()
    }
}

/// Consumer side of a split [`RingBuffer`]. There is exactly one.
#[derive(Debug)]
pub struct RingConsumer {
    ring: Arc<RingBuffer>,
}

impl RingConsumer {
    /// Copies out up to `batch_size` published bytes and releases them.
    pub fn read(&mut self, batch_size: usize) -> Vec<u8> {
        self.ring.read_exclusive(batch_size)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_hello_world() {
        let rb = RingBuffer::new(64);

        assert!(rb.write(b"hello world"));
        assert_eq!(rb.read(11), b"hello world");
        assert!(rb.is_empty());
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let rb = RingBuffer::new(8);

        assert!(!rb.write(&[7u8; 9]));
        assert_eq!(
            rb.try_write(&[7u8; 9]),
            Err(WriteError::TooLarge { len: 9, capacity: 7 })
        );
        assert!(rb.is_empty());
        assert_eq!(rb.free(), 7);
    }

    #[test]
    fn test_full_buffer_keeps_one_byte_slack() {
        let rb = RingBuffer::new(8);

        // A record of exactly `capacity` bytes can never fit, draining won't help
        let err = rb.try_write(&[1u8; 8]).unwrap_err();
        assert_eq!(err, WriteError::TooLarge { len: 8, capacity: 7 });
        assert!(!err.is_transient());

        assert!(rb.write(&[1u8; 7]));
        assert_eq!(rb.free(), 0);
        assert_eq!(rb.try_write(&[2u8]), Err(WriteError::Full { len: 1 }));

        assert_eq!(rb.read(3), vec![1u8; 3]);
        assert!(rb.write(&[2u8; 3])); // Now should succeed
        assert_eq!(rb.read(64), vec![1, 1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_single_producer_order() {
        let rb = RingBuffer::new(32);
        let entries: [&[u8]; 4] = [b"alpha", b"beta", b"gamma", b"delta"];

        for entry in entries {
            assert!(rb.write(entry));
        }

        let total: usize = entries.iter().map(|e| e.len()).sum();
        assert_eq!(rb.len(), total);
        assert_eq!(rb.read(total), b"alphabetagammadelta");
    }

    #[test]
    fn test_partial_reads() {
        let rb = RingBuffer::new(16);
        assert!(rb.write(b"0123456789"));

        assert_eq!(rb.read(4), b"0123");
        assert_eq!(rb.read(0), b"");
        assert_eq!(rb.read(100), b"456789");
        assert_eq!(rb.read(100), b"");
    }

    #[test]
    fn test_empty_read_is_noop() {
        let rb = RingBuffer::new(16);

        assert!(rb.read(8).is_empty());
        assert!(rb.read(8).is_empty());
        assert_eq!(rb.free(), 15);
        assert!(rb.write(b"after"));
        assert_eq!(rb.read(8), b"after");
    }

    #[test]
    fn test_wraparound() {
        let rb = RingBuffer::new(10);

        // 7-byte records against a 10-byte ring cross the end on most rounds
        for round in 0..50u8 {
            let record: Vec<u8> = (0..7).map(|i| round.wrapping_mul(7).wrapping_add(i)).collect();
            assert!(rb.write(&record));
            assert_eq!(rb.read(7), record, "round {}", round);
        }
    }

    #[test]
    fn test_empty_entry() {
        let rb = RingBuffer::new(4);
        assert!(rb.write(&[]));
        assert!(rb.is_empty());
    }

    #[test]
    fn test_concurrent_producers() {
        const PRODUCERS: usize = 8;
        const RECORDS: usize = 1000;
        const RECORD_SIZE: usize = 16;

        let (producer, mut consumer) = RingBuffer::new(1024).split();
        let mut stream = Vec::with_capacity(PRODUCERS * RECORDS * RECORD_SIZE);

        thread::scope(|s| {
            for id in 0..PRODUCERS {
                let producer = producer.clone();
                s.spawn(move || {
                    let record = [id as u8; RECORD_SIZE];
                    for _ in 0..RECORDS {
                        while !producer.write(&record) {
                            thread::yield_now();
                        }
                    }
                });
            }

            while stream.len() < PRODUCERS * RECORDS * RECORD_SIZE {
                let batch = consumer.read(100);
                if batch.is_empty() {
                    thread::yield_now();
                }
                stream.extend_from_slice(&batch);
            }
        });

        assert!(consumer.is_empty());

        // Order across producers is not asserted, only that records stay whole
        let mut per_producer = [0usize; PRODUCERS];
        for record in stream.chunks(RECORD_SIZE) {
            assert!(record.iter().all(|&b| b == record[0]), "torn record {:?}", record);
            per_producer[record[0] as usize] += 1;
        }
        assert_eq!(per_producer, [RECORDS; PRODUCERS]);
    }

    #[test]
    fn test_overlapping_reads_do_not_duplicate() {
        const TOTAL: usize = 4000;

        let rb = RingBuffer::new(256);
        let drained = AtomicUsize::new(0);

        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..TOTAL {
                    while !rb.write(&[(i % 251) as u8]) {
                        thread::yield_now();
                    }
                }
            });

            for _ in 0..3 {
                s.spawn(|| {
                    while drained.load(std::sync::atomic::Ordering::Relaxed) < TOTAL {
                        let n = rb.read(17).len();
                        drained.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
                        thread::yield_now();
                    }
                });
            }
        });

        assert_eq!(drained.into_inner(), TOTAL);
        assert!(rb.is_empty());
    }
}
