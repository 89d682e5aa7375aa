//! Memory-mapped append-only journal
//!
//! Drained batches are copied straight into a file mapping:
//! - No write syscalls on the flush path, the kernel writes pages back
//! - Reopening resumes at the stored write position
//! - `read` returns a slice into the mapping (zero-copy)
//!
//! Layout: a 64-byte header followed by `capacity` bytes of data.

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::Sink;
use crate::error::{Error, Result};

/// Header at the start of the mapping
#[repr(C, align(64))]
struct JournalHeader {
    magic: u64,     // Validates the file on reopen
    version: u32,   // Format version
    _reserved: u32, // Keeps the fields below 8-byte aligned
    capacity: u64,  // Data region size in bytes
    write_pos: u64, // Bytes appended so far
}

const MAGIC: u64 = u64::from_be_bytes(*b"XSYNCJNL");
const VERSION: u32 = 1;
const HEADER_SIZE: usize = std::mem::size_of::<JournalHeader>();

/// Append-only journal backed by a memory-mapped file.
pub struct MmapJournal {
    mmap: MmapMut,
    path: PathBuf,
    capacity: usize,
}

impl MmapJournal {
    /// Creates a journal or reopens an existing one.
    ///
    /// # Arguments
    /// * `path` - Journal file path
    /// * `capacity` - Data region size in bytes; must match when reopening
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let total_size = HEADER_SIZE + capacity;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let existing_len = file.metadata()?.len();
        let fresh = existing_len == 0;

        if fresh {
            file.set_len(total_size as u64)?;
        } else if existing_len != total_size as u64 {
            return Err(Error::IncompatibleJournal {
                path,
                reason: format!("file is {} bytes, expected {}", existing_len, total_size),
            });
        }

        // SAFETY: the file is open read/write and sized to `total_size`
        let mut mmap = unsafe { MmapOptions::new().len(total_size).map_mut(&file)? };

        // SAFETY: the mapping is page-aligned and at least HEADER_SIZE long
        let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut JournalHeader) };

        if fresh {
            header.magic = MAGIC;
            header.version = VERSION;
            header._reserved = 0;
            header.capacity = capacity as u64;
            header.write_pos = 0;
        } else if header.magic != MAGIC || header.version != VERSION {
            return Err(Error::IncompatibleJournal {
                path,
                reason: "unknown header".to_string(),
            });
        } else if header.capacity != capacity as u64 || header.write_pos > header.capacity {
            return Err(Error::IncompatibleJournal {
                path,
                reason: format!(
                    "capacity {} with write position {}, expected capacity {}",
                    header.capacity, header.write_pos, capacity
                ),
            });
        }

        debug!(path = %path.display(), capacity, len = header.write_pos, "journal opened");
        Ok(Self {
            mmap,
            path,
            capacity,
        })
    }

    /// Appends `data` at the end of the journal.
    ///
    /// Returns the data offset the bytes were written at.
    #[inline]
    pub fn append(&mut self, data: &[u8]) -> Result<usize> {
        let write_pos = self.len();
        let available = self.capacity - write_pos;

        if data.len() > available {
            return Err(Error::JournalFull {
                needed: data.len(),
                available,
            });
        }

        let start = HEADER_SIZE + write_pos;
        self.mmap[start..start + data.len()].copy_from_slice(data);
        self.header_mut().write_pos = (write_pos + data.len()) as u64;

        Ok(write_pos)
    }

    /// Zero-copy view of appended bytes, `None` if out of range.
    #[inline]
    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len() {
            return None;
        }
        Some(&self.mmap[HEADER_SIZE + offset..HEADER_SIZE + end])
    }

    /// Everything appended so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[HEADER_SIZE..HEADER_SIZE + self.len()]
    }

    /// Forgets all appended data; the file keeps its size.
    pub fn clear(&mut self) {
        self.header_mut().write_pos = 0;
    }

    /// Bytes appended so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.header().write_pos as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    #[inline(always)]
    fn header(&self) -> &JournalHeader {
        // SAFETY: the header lives at the start of the mapping
        unsafe { &*(self.mmap.as_ptr() as *const JournalHeader) }
    }

    #[inline(always)]
    fn header_mut(&mut self) -> &mut JournalHeader {
        // SAFETY: the header lives at the start of the mapping
        unsafe { &mut *(self.mmap.as_mut_ptr() as *mut JournalHeader) }
    }
}

impl Sink for MmapJournal {
    fn write_batch(&mut self, batch: &[u8]) -> Result<()> {
        self.append(batch).map(|_| ())
    }

    fn sync(&mut self) -> Result<()> {
        self.flush()
    }
}
