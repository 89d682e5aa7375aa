//! xsync - lock-free byte buffers for batched log/event flushing
//!
//! Architecture:
//! - Lock-Free: producers reserve space with CAS loops, no Mutex anywhere
//! - No-Allocation: storage is allocated once, records are copied in place
//! - Single consumer: a flusher drains completed bytes into a sink
//!
//! Two interchangeable buffers:
//! - [`RingBuffer`]: one circular byte array, drained in reservation order
//! - [`TripleBuffer`]: three slots, producers fill one while another is flushed
//!
//! ```
//! use xsync::{RingBuffer, TripleBuffer};
//!
//! let ring = RingBuffer::new(64);
//! assert!(ring.write(b"hello world"));
//! assert_eq!(ring.read(11), b"hello world");
//!
//! let triple = TripleBuffer::new(64);
//! assert!(triple.write(5, |dst| dst.copy_from_slice(b"event")));
//! triple.flush(|batch| assert_eq!(batch, b"event"));
//! ```

pub mod core;
pub mod error;
pub mod flusher;
pub mod sink;
mod shim;

pub use crate::core::{
    RingBuffer, RingConsumer, RingProducer, TripleBuffer, TripleFlusher, TripleWriter,
};
pub use error::{Error, Result, WriteError};
pub use flusher::{Drain, FlushStats, Flusher, FlusherConfig};
pub use sink::{IoSink, MmapJournal, Sink, TcpSink};
