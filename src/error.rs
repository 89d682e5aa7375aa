//! Error types
//!
//! Buffer writes fail in exactly two ways, which `WriteError` tells apart.
//! Everything on the I/O side (journal, sockets, flusher thread) reports
//! through the crate-wide `Error`.

use std::io;
use std::path::PathBuf;

/// Why a record was not accepted by a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The record can never fit. `capacity` is the largest record the buffer
    /// accepts (a ring keeps one byte free, a triple buffer takes a full slot).
    #[error("record of {len} bytes exceeds buffer capacity of {capacity} bytes")]
    TooLarge { len: usize, capacity: usize },
    /// Not enough free space right now; may succeed after a drain.
    #[error("no free space for a record of {len} bytes")]
    Full { len: usize },
}

impl WriteError {
    /// Returns `true` if retrying after the consumer drains can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, WriteError::Full { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("journal is full: {needed} bytes requested, {available} available")]
    JournalFull { needed: usize, available: usize },
    #[error("journal {path:?} is incompatible: {reason}")]
    IncompatibleJournal { path: PathBuf, reason: String },
    #[error("flusher thread panicked")]
    FlusherPanicked,
}

pub type Result<T> = std::result::Result<T, Error>;
