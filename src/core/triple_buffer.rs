//! Lock-Free triple-buffered write/flush coordinator
//!
//! Three fixed-size slots. Producers reserve byte ranges in the slot selected
//! by `write_index` and move on to the next slot (CAS on the index) when it is
//! full. The flusher drains the slot selected by `flush_index` and resets it.
//!
//! Each slot carries two counters:
//! - `reserved`: bytes handed out to producers (plus the `SEALED` bit while a
//!   flush owns the slot)
//! - `committed`: bytes whose `fill` callback has returned
//!
//! A flush seals the slot so no new reservation can land in it, waits until
//! `committed` catches up with `reserved`, drains, and only then resets the
//! offset. Without the seal and the wait, a reset could race a producer that
//! already passed its space check, and a drain could read a range whose
//! `fill` is still running.

use std::cell::UnsafeCell;
use std::fmt;
use std::slice;

use tracing::trace;

use super::{backoff, CacheLinePadded};
use crate::error::WriteError;
use crate::shim::atomic::{AtomicUsize, Ordering};
use crate::shim::hint;
use crate::shim::sync::Arc;

/// Number of slots producers and the flusher rotate through.
pub const SLOTS: usize = 3;

/// Set in `reserved` while a flush owns the slot.
const SEALED: usize = 1 << (usize::BITS - 1);

struct Slot {
    reserved: CacheLinePadded<AtomicUsize>,
    committed: CacheLinePadded<AtomicUsize>,
    data: Box<[UnsafeCell<u8>]>,
}

impl Slot {
    fn new(size: usize) -> Self {
        let data = (0..size)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            reserved: CacheLinePadded::new(AtomicUsize::new(0)),
            committed: CacheLinePadded::new(AtomicUsize::new(0)),
            data,
        }
    }

    /// # Safety
    /// `[offset, offset + len)` must be reserved by the caller and in bounds.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        let base = UnsafeCell::raw_get(self.data.as_ptr());
        slice::from_raw_parts_mut(base.add(offset), len)
    }

    /// # Safety
    /// The slot must be sealed with every writer of `[0, len)` committed.
    unsafe fn slice(&self, len: usize) -> &[u8] {
        let base = UnsafeCell::raw_get(self.data.as_ptr());
        slice::from_raw_parts(base, len)
    }
}

/// Publishes a reservation when dropped, including when `fill` panics,
/// so a flush never waits on a writer that is gone. A range left behind by a
/// panicking `fill` is zeroed first, never stale bytes from an earlier batch.
struct Commit<'a> {
    slot: &'a Slot,
    offset: usize,
    len: usize,
}

impl Drop for Commit<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // SAFETY: the range is still ours until the fetch_add below
            unsafe { self.slot.slice_mut(self.offset, self.len) }.fill(0);
        }
        self.slot.committed.value.fetch_add(self.len, Ordering::Release);
    }
}

/// Unseals and empties a slot when dropped, including when `drain` panics.
struct Reset<'a> {
    slot: &'a Slot,
}

impl Drop for Reset<'_> {
    fn drop(&mut self) {
        self.slot.committed.value.store(0, Ordering::Relaxed);
        self.slot.reserved.value.store(0, Ordering::Release);
    }
}

/// Lock-free triple buffer for many writers and one flusher.
///
/// Records never straddle slots, so a record must fit in one slot
/// (`buffer_size`). Once all three slots are full `write` gives up and
/// returns `false`; it does not spin waiting for the flusher.
pub struct TripleBuffer {
    slots: [Slot; SLOTS],
    write_index: CacheLinePadded<AtomicUsize>,
    flush_index: CacheLinePadded<AtomicUsize>,
    capacity: usize,
}

// SAFETY: a slot's bytes are written only inside a CAS-won reservation and
// read only by the flush holding the seal after all reservations committed.
unsafe impl Send for TripleBuffer {}
unsafe impl Sync for TripleBuffer {}

impl TripleBuffer {
    /// Creates three zero-filled slots of `buffer_size` bytes each.
    ///
    /// # Panics
    /// Panics if `buffer_size` is zero or does not leave room for the seal bit.
    pub fn new(buffer_size: usize) -> Self {
        assert!(
            buffer_size > 0 && buffer_size < SEALED,
            "buffer_size must be non-zero and below {}",
            SEALED
        );

        Self {
            slots: std::array::from_fn(|_| Slot::new(buffer_size)),
            write_index: CacheLinePadded::new(AtomicUsize::new(0)),
            flush_index: CacheLinePadded::new(AtomicUsize::new(0)),
            capacity: buffer_size,
        }
    }

    /// Reserves `length` bytes and lets `fill` write the record in place.
    ///
    /// `fill` receives a slice of exactly `length` bytes. Returns `false`
    /// without calling `fill` when the record is larger than a slot or all
    /// slots are full.
    #[inline]
    pub fn write(&self, length: usize, fill: impl FnOnce(&mut [u8])) -> bool {
        self.try_write(length, fill).is_ok()
    }

    /// Like [`write`](Self::write), but says why a record was rejected.
    pub fn try_write(&self, length: usize, fill: impl FnOnce(&mut [u8])) -> Result<(), WriteError> {
        if length > self.capacity {
            trace!(length, capacity = self.capacity, "record larger than slot");
            return Err(WriteError::TooLarge {
                len: length,
                capacity: self.capacity,
            });
        }
        if length == 0 {
            fill(&mut []);
            return Ok(());
        }

        let mut full_seen = 0;
        loop {
            let index = self.write_index.value.load(Ordering::Acquire);
            let slot = &self.slots[index];
            let offset = slot.reserved.value.load(Ordering::Acquire);

            if offset & SEALED != 0 || offset + length > self.capacity {
                full_seen += 1;
                if full_seen >= SLOTS {
                    trace!(length, "all slots full");
                    return Err(WriteError::Full { len: length });
                }

                // Switch to the next slot; losing the CAS means someone else did
                let next = (index + 1) % SLOTS;
                if self
                    .write_index
                    .value
                    .compare_exchange(index, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    trace!(from = index, to = next, "write slot rotated");
                }
                continue;
            }

            if slot
                .reserved
                .value
                .compare_exchange_weak(offset, offset + length, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let _commit = Commit {
                    slot,
                    offset,
                    len: length,
                };
                // SAFETY: the CAS above handed [offset, offset + length) to us
                // and a flush waits for `_commit` before reading it.
                fill(unsafe { slot.slice_mut(offset, length) });
                return Ok(());
            }

            hint::spin_loop();
        }
    }

    /// Drains the slot selected by `flush_index`, if it holds data.
    ///
    /// An empty slot advances `flush_index` instead (one attempt, no loop), so
    /// draining everything takes repeated calls. `drain` sees every byte
    /// written to the slot, then the slot is emptied for reuse. Returns
    /// immediately if another flush already owns the slot.
    pub fn flush(&self, drain: impl FnOnce(&[u8])) {
        let index = self.flush_index.value.load(Ordering::Acquire);
        let slot = &self.slots[index];
        let mut spins = 0;

        let length = loop {
            let offset = slot.reserved.value.load(Ordering::Acquire);

            if offset & SEALED != 0 {
                trace!(slot = index, "flush already in progress");
                return;
            }

            if offset == 0 {
                let next = (index + 1) % SLOTS;
                let _ = self.flush_index.value.compare_exchange(
                    index,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                return;
            }

            if slot
                .reserved
                .value
                .compare_exchange_weak(offset, offset | SEALED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break offset;
            }
            backoff(&mut spins);
        };

        let reset = Reset { slot };

        // Wait out writers that reserved before the seal
        while slot.committed.value.load(Ordering::Acquire) != length {
            backoff(&mut spins);
        }

        // SAFETY: the slot is sealed and all `length` bytes are committed
        drain(unsafe { slot.slice(length) });
        drop(reset);
    }

    /// Splits the buffer into cloneable writers and a unique flusher.
    pub fn split(self) -> (TripleWriter, TripleFlusher) {
        let buffer = Arc::new(self);
        (
            TripleWriter {
                buffer: Arc::clone(&buffer),
            },
            TripleFlusher { buffer },
        )
    }

    /// Size of each slot in bytes.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slot currently targeted by writers.
    pub fn write_index(&self) -> usize {
        self.write_index.value.load(Ordering::Acquire)
    }

    /// Slot the next flush looks at.
    pub fn flush_index(&self) -> usize {
        self.flush_index.value.load(Ordering::Acquire)
    }

    /// Bytes reserved across all slots, including ranges still being filled.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.reserved.value.load(Ordering::Acquire) & !SEALED)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TripleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TripleBuffer")
            .field("capacity", &self.capacity)
            .field("write_index", &self.write_index())
            .field("flush_index", &self.flush_index())
            .field("len", &self.len())
            .finish()
    }
}

/// Writer side of a split [`TripleBuffer`].
#[derive(Clone, Debug)]
pub struct TripleWriter {
    buffer: Arc<TripleBuffer>,
}

impl TripleWriter {
    #[inline]
    pub fn write(&self, length: usize, fill: impl FnOnce(&mut [u8])) -> bool {
        self.buffer.write(length, fill)
    }

    #[inline]
    pub fn try_write(&self, length: usize, fill: impl FnOnce(&mut [u8])) -> Result<(), WriteError> {
        self.buffer.try_write(length, fill)
    }

    /// Copies `record` into a fresh reservation.
    #[inline]
    pub fn write_bytes(&self, record: &[u8]) -> bool {
        self.buffer
            .write(record.len(), |dst| dst.copy_from_slice(record))
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

/// Flusher side of a split [`TripleBuffer`]. There is exactly one.
#[derive(Debug)]
pub struct TripleFlusher {
    buffer: Arc<TripleBuffer>,
}

impl TripleFlusher {
    pub fn flush(&mut self, drain: impl FnOnce(&[u8])) {
        self.buffer.flush(drain)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn copy_of(data: &[u8]) -> impl FnOnce(&mut [u8]) + '_ {
        move |dst| dst.copy_from_slice(data)
    }

    /// Flushes until every slot has been visited empty.
    fn drain_all(tb: &TripleBuffer) -> Vec<Vec<u8>> {
        let mut batches = Vec::new();
        let mut idle = 0;
        while idle < SLOTS {
            let mut got = None;
            tb.flush(|batch| got = Some(batch.to_vec()));
            match got {
                Some(batch) => {
                    idle = 0;
                    batches.push(batch);
                }
                None => idle += 1,
            }
        }
        batches
    }

    #[test]
    fn test_write() {
        let tb = TripleBuffer::new(64);
        let data = b"hello world";

        assert!(tb.write(data.len(), copy_of(data)));
        assert_eq!(tb.len(), data.len());

        let mut flushed = Vec::new();
        tb.flush(|batch| flushed.extend_from_slice(batch));
        assert_eq!(flushed, data);
        assert!(tb.is_empty());
    }

    #[test]
    fn test_write_overflow_rotates_then_rejects() {
        let tb = TripleBuffer::new(8);
        let data = b"12345678";

        assert!(tb.write(8, copy_of(data)));
        assert_eq!(tb.write_index(), 0);

        // Slot 0 is full: the next two land in slots 1 and 2
        assert!(tb.write(8, copy_of(data)));
        assert_eq!(tb.write_index(), 1);
        assert!(tb.write(8, copy_of(data)));
        assert_eq!(tb.write_index(), 2);

        // Nothing drained yet, every slot is full
        let mut called = false;
        assert_eq!(
            tb.try_write(8, |_| called = true),
            Err(WriteError::Full { len: 8 })
        );
        assert!(!called);
        assert_eq!(tb.len(), 24);

        let batches = drain_all(&tb);
        assert_eq!(batches, vec![data.to_vec(); 3]);

        assert!(tb.write(8, copy_of(data)));
    }

    #[test]
    fn test_oversized_record_rejected() {
        let tb = TripleBuffer::new(8);

        assert_eq!(
            tb.try_write(9, |_| panic!("fill must not run")),
            Err(WriteError::TooLarge { len: 9, capacity: 8 })
        );
        assert!(tb.is_empty());
        assert_eq!(tb.write_index(), 0);
    }

    #[test]
    fn test_zero_length_write() {
        let tb = TripleBuffer::new(8);
        let mut seen = None;

        assert!(tb.write(0, |dst| seen = Some(dst.len())));
        assert_eq!(seen, Some(0));
        assert!(tb.is_empty());
    }

    #[test]
    fn test_flush_empty_rotates_only() {
        let tb = TripleBuffer::new(16);

        for expected in [1, 2, 0] {
            tb.flush(|_| panic!("nothing to drain"));
            assert_eq!(tb.flush_index(), expected);
        }
        assert_eq!(tb.write_index(), 0);
        assert!(tb.is_empty());
    }

    #[test]
    fn test_flush_keeps_record_boundaries() {
        let tb = TripleBuffer::new(16);

        assert!(tb.write(5, copy_of(b"first")));
        assert!(tb.write(6, copy_of(b"second")));
        // 11 + 5 fits exactly
        assert!(tb.write(5, copy_of(b"third")));
        // Slot 0 full, goes to slot 1
        assert!(tb.write(6, copy_of(b"fourth")));

        let batches = drain_all(&tb);
        assert_eq!(batches, vec![b"firstsecondthird".to_vec(), b"fourth".to_vec()]);
    }

    #[test]
    fn test_write_and_flush_cycle() {
        let tb = TripleBuffer::new(16);
        let data: [&[u8]; 3] = [b"first", b"second", b"third"];

        for record in data {
            assert!(tb.write(record.len(), copy_of(record)));
            let mut flushed = Vec::new();
            tb.flush(|batch| flushed.extend_from_slice(batch));
            assert_eq!(flushed, record);
        }
    }

    #[test]
    fn test_concurrent_write() {
        const WRITERS: usize = 100;
        let data = b"concurrent write";

        let tb = TripleBuffer::new(64);
        let accepted = StdAtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..WRITERS {
                s.spawn(|| {
                    if tb.write(data.len(), copy_of(data)) {
                        accepted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                });
            }
        });

        // Three 64-byte slots hold four 16-byte records each
        let accepted = accepted.into_inner();
        assert_eq!(accepted, 12);

        let flushed: Vec<u8> = drain_all(&tb).concat();
        assert_eq!(flushed.len(), accepted * data.len());
        for record in flushed.chunks(data.len()) {
            assert_eq!(record, data);
        }
    }

    #[test]
    fn test_concurrent_flush_drains_once() {
        let tb = TripleBuffer::new(64);
        let data = b"flush concurrently";
        let drains = StdAtomicUsize::new(0);

        assert!(tb.write(data.len(), copy_of(data)));

        thread::scope(|s| {
            for _ in 0..10 {
                s.spawn(|| {
                    tb.flush(|batch| {
                        assert_eq!(batch, data);
                        drains.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    });
                });
            }
        });

        assert_eq!(drains.into_inner(), 1);
        assert!(tb.is_empty());
    }

    #[test]
    fn test_concurrent_write_and_flush() {
        const WRITERS: usize = 8;
        const RECORDS: usize = 500;
        const RECORD_SIZE: usize = 16;

        let (writer, mut flusher) = TripleBuffer::new(256).split();
        let done = StdAtomicUsize::new(0);
        let mut stream = Vec::new();

        thread::scope(|s| {
            for id in 0..WRITERS {
                let writer = writer.clone();
                let done = &done;
                s.spawn(move || {
                    let record = [id as u8; RECORD_SIZE];
                    for _ in 0..RECORDS {
                        while !writer.write_bytes(&record) {
                            thread::yield_now();
                        }
                    }
                    done.fetch_add(1, std::sync::atomic::Ordering::Release);
                });
            }

            while done.load(std::sync::atomic::Ordering::Acquire) < WRITERS {
                flusher.flush(|batch| stream.extend_from_slice(batch));
            }
        });

        let mut idle = 0;
        while idle < SLOTS {
            let before = stream.len();
            flusher.flush(|batch| stream.extend_from_slice(batch));
            idle = if stream.len() == before { idle + 1 } else { 0 };
        }

        assert_eq!(stream.len(), WRITERS * RECORDS * RECORD_SIZE);
        let mut per_writer = [0usize; WRITERS];
        for record in stream.chunks(RECORD_SIZE) {
            assert!(record.iter().all(|&b| b == record[0]), "torn record {:?}", record);
            per_writer[record[0] as usize] += 1;
        }
        assert_eq!(per_writer, [RECORDS; WRITERS]);
    }

    #[test]
    fn test_flush_waits_for_in_flight_writer() {
        let buffer = TripleBuffer::new(16);
        let tb = &buffer;
        let drained = Mutex::new(Vec::new());
        let (reserved_tx, reserved_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        thread::scope(|s| {
            let writer = s.spawn(move || {
                tb.write(8, move |dst| {
                    reserved_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    dst.copy_from_slice(b"complete");
                })
            });

            // The writer owns [0, 8) of slot 0 but has not filled it yet
            reserved_rx.recv().unwrap();
            let flush = s.spawn(|| tb.flush(|batch| drained.lock().unwrap().push(batch.to_vec())));

            // Slot 0 is sealed: the flush must not drain and new writes move on
            thread::sleep(Duration::from_millis(50));
            assert!(!flush.is_finished());
            assert!(drained.lock().unwrap().is_empty());
            assert!(tb.write(4, copy_of(b"next")));
            assert_eq!(tb.write_index(), 1);

            release_tx.send(()).unwrap();
            assert!(writer.join().unwrap());
            flush.join().unwrap();
        });

        assert_eq!(*drained.lock().unwrap(), vec![b"complete".to_vec()]);
        assert_eq!(drain_all(tb), vec![b"next".to_vec()]);
    }

    #[test]
    fn test_panicking_fill_still_commits() {
        let tb = TripleBuffer::new(16);

        // Leave a drained record behind in the slot's storage
        assert!(tb.write(4, copy_of(b"okay")));
        assert_eq!(drain_all(&tb), vec![b"okay".to_vec()]);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            tb.write(4, |dst| {
                dst[0] = 0xFF;
                panic!("serializer failed");
            });
        }));
        assert!(result.is_err());

        // The reservation is published as zeros, not as the old record, so
        // the flush does not hang
        assert_eq!(drain_all(&tb), vec![vec![0u8; 4]]);
        assert!(tb.write(4, copy_of(b"next")));
        assert_eq!(drain_all(&tb), vec![b"next".to_vec()]);
    }
}
