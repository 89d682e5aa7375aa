//! Core module: lock-free byte buffers for many producers and one consumer
//!
//! Design principles:
//! - Lock-Free: only atomic CAS loops, no Mutex/RwLock anywhere
//! - No-Allocation: storage is allocated once at construction
//! - Publish-before-drain: a consumer never sees bytes a producer is still copying
//!
//! `RingBuffer` and `TripleBuffer` are two alternative designs for the same
//! job; a pipeline picks one.

mod ring_buffer;
mod triple_buffer;

pub use ring_buffer::{RingBuffer, RingConsumer, RingProducer};
pub use triple_buffer::{TripleBuffer, TripleFlusher, TripleWriter, SLOTS};

use crate::shim::{hint, thread};

/// Spins before a contended loop starts yielding the thread.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Padding for cache line isolation (64 bytes on x86-64)
#[repr(C, align(64))]
pub(crate) struct CacheLinePadded<T> {
    pub(crate) value: T,
}

impl<T> CacheLinePadded<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

/// Back-off step for loops that wait on another thread's progress.
#[inline]
pub(crate) fn backoff(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}
