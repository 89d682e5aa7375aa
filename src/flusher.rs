//! Background flusher: moves drained batches from a buffer into a sink
//!
//! One named thread per buffer. Every `interval` it drains the buffer until
//! the buffer reports idle, then parks. `shutdown` wakes it for a final drain,
//! syncs the sink and hands the sink back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::{RingConsumer, TripleFlusher, SLOTS};
use crate::error::{Error, Result};
use crate::sink::Sink;

/// Empty drains in a row before a round ends. One pass over every slot is
/// needed before a triple buffer can be called empty.
const IDLE_ROUNDS: usize = SLOTS;

/// Upper bound on batches per round so a busy buffer cannot starve shutdown.
const MAX_BATCHES_PER_ROUND: usize = 1024;

/// Consumer side of a buffer, as seen by the flusher.
pub trait Drain: Send {
    /// Moves one batch of at most `limit` bytes into `sink` (limits that a
    /// buffer cannot honor, like a triple buffer slot, are ignored).
    ///
    /// Returns the number of bytes moved; 0 means nothing was ready.
    fn drain_into(&mut self, sink: &mut dyn Sink, limit: usize) -> Result<usize>;
}

impl Drain for RingConsumer {
    fn drain_into(&mut self, sink: &mut dyn Sink, limit: usize) -> Result<usize> {
        let batch = self.read(limit);
        if batch.is_empty() {
            return Ok(0);
        }
        sink.write_batch(&batch)?;
        Ok(batch.len())
    }
}

impl Drain for TripleFlusher {
    fn drain_into(&mut self, sink: &mut dyn Sink, _limit: usize) -> Result<usize> {
        // The slot is released even if the sink fails; the error is reported after
        let mut outcome = Ok(0);
        self.flush(|batch| outcome = sink.write_batch(batch).map(|()| batch.len()));
        outcome
    }
}

impl<D: Drain + ?Sized> Drain for Box<D> {
    fn drain_into(&mut self, sink: &mut dyn Sink, limit: usize) -> Result<usize> {
        (**self).drain_into(sink, limit)
    }
}

/// Flusher configuration
#[derive(Debug, Clone)]
pub struct FlusherConfig {
    /// Pause between drain rounds
    pub interval: Duration,
    /// Largest batch read from a ring buffer at once
    pub batch_size: usize,
    /// Name of the flusher thread
    pub thread_name: String,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
            batch_size: 64 * 1024,
            thread_name: "xsync-flusher".to_string(),
        }
    }
}

impl FlusherConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// Flusher statistics
#[derive(Debug, Default)]
pub struct FlushStats {
    batches: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl FlushStats {
    /// Batches handed to the sink successfully.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Bytes handed to the sink successfully.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Batches the sink rejected. Their bytes are gone.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn record_batch(&self, bytes: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a running flusher thread.
pub struct Flusher<S> {
    stop: Arc<AtomicBool>,
    stats: Arc<FlushStats>,
    handle: JoinHandle<Result<S>>,
}

impl<S: Sink + 'static> Flusher<S> {
    /// Starts draining `source` into `sink` on a new thread.
    pub fn spawn<D: Drain + 'static>(source: D, sink: S, config: FlusherConfig) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(FlushStats::default());

        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn({
                let stop = Arc::clone(&stop);
                let stats = Arc::clone(&stats);
                move || run(source, sink, &config, &stop, &stats)
            })?;

        Ok(Self {
            stop,
            stats,
            handle,
        })
    }

    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Wakes the thread for an immediate drain round.
    pub fn wake(&self) {
        self.handle.thread().unpark();
    }

    /// Stops the thread after a final drain and returns the sink.
    ///
    /// Producers should be done writing; records written after the final
    /// drain stay in the buffer.
    pub fn shutdown(self) -> Result<S> {
        self.stop.store(true, Ordering::Release);
        self.handle.thread().unpark();
        self.handle.join().map_err(|_| Error::FlusherPanicked)?
    }
}

fn run<D: Drain, S: Sink>(
    mut source: D,
    mut sink: S,
    config: &FlusherConfig,
    stop: &AtomicBool,
    stats: &FlushStats,
) -> Result<S> {
    info!(
        interval_ms = config.interval.as_millis() as u64,
        batch_size = config.batch_size,
        "flusher started"
    );

    while !stop.load(Ordering::Acquire) {
        drain_round(&mut source, &mut sink, config.batch_size, stats);
        thread::park_timeout(config.interval);
    }

    // Final drain, not capped
    while drain_round(&mut source, &mut sink, config.batch_size, stats) {}
    sink.sync()?;

    info!(
        batches = stats.batches(),
        bytes = stats.bytes(),
        errors = stats.errors(),
        "flusher stopped"
    );
    Ok(sink)
}

/// Drains until the source is idle. Returns `true` if the round stopped at
/// `MAX_BATCHES_PER_ROUND` with data possibly left over.
fn drain_round<D: Drain>(source: &mut D, sink: &mut dyn Sink, limit: usize, stats: &FlushStats) -> bool {
    let mut idle = 0;
    for _ in 0..MAX_BATCHES_PER_ROUND {
        match source.drain_into(sink, limit) {
            Ok(0) => {
                idle += 1;
                if idle >= IDLE_ROUNDS {
                    return false;
                }
            }
            Ok(bytes) => {
                idle = 0;
                stats.record_batch(bytes);
                debug!(bytes, "batch flushed");
            }
            Err(e) => {
                idle += 1;
                stats.record_error();
                warn!(error = %e, "sink rejected batch");
                if idle >= IDLE_ROUNDS {
                    return false;
                }
            }
        }
    }
    true
}
