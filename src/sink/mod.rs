//! Sinks: where drained batches end up
//!
//! The buffers never do I/O themselves. A [`Flusher`](crate::flusher::Flusher)
//! hands every drained batch to a `Sink`.

mod journal;
mod tcp;

pub use journal::MmapJournal;
pub use tcp::TcpSink;

use std::io;

use crate::error::Result;

/// Destination for drained bytes.
pub trait Sink: Send {
    /// Persists or forwards one batch.
    ///
    /// Batches from a triple buffer hold whole records. Ring batches are
    /// byte-granular: a record may be split across two consecutive batches.
    fn write_batch(&mut self, batch: &[u8]) -> Result<()>;

    /// Pushes anything still buffered to its final destination.
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn write_batch(&mut self, batch: &[u8]) -> Result<()> {
        (**self).write_batch(batch)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }
}

/// In-memory sink, mostly for tests and demos.
impl Sink for Vec<u8> {
    fn write_batch(&mut self, batch: &[u8]) -> Result<()> {
        self.extend_from_slice(batch);
        Ok(())
    }
}

/// Adapter for any `io::Write` (files, stdout, `BufWriter`, ...).
#[derive(Debug)]
pub struct IoSink<W> {
    inner: W,
}

impl<W: io::Write + Send> IoSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write + Send> Sink for IoSink<W> {
    fn write_batch(&mut self, batch: &[u8]) -> Result<()> {
        self.inner.write_all(batch)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}
