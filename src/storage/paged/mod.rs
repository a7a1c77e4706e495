//! Paged storage contract
//!
//! The blob engine never touches a file directly. It sees a flat byte space
//! split into fixed-size pages and talks to it through [`PagedStorage`]:
//!
//! ```text
//! offset:  0          page_size     2*page_size   3*page_size
//!          ├──────────────┼──────────────┼──────────────┤
//!          │   page 0     │   page 1     │   page 2     │ ...
//!          └──────────────┴──────────────┴──────────────┘
//!                 ▲ read_into / write_bytes may span pages
//! ```
//!
//! A write that lies entirely inside one page is atomic with respect to
//! concurrent reads of that page. Writes spanning pages are applied page by
//! page. Two backends ship with the crate:
//!
//! - [`MutexPagedStorage`]: one mutex over the file and the page vector
//! - [`LockFreePagedStorage`]: CAS-grown page table, seqlock pages

pub mod lock_free;
pub mod mutex;

pub use lock_free::LockFreePagedStorage;
pub use mutex::MutexPagedStorage;

use crate::config::{BackendKind, StorageConfig};
use crate::error::{Error, Result};
use std::path::Path;

/// Smallest page size a storage file may use
pub const MIN_PAGE_SIZE: usize = 256;

/// Largest page size a storage file may use
pub const MAX_PAGE_SIZE: usize = 16 * 1024 * 1024;

/// Byte-addressable storage backed by fixed-size pages
pub trait PagedStorage: Send + Sync {
    /// Size of every page in bytes (fixed for the lifetime of the storage)
    fn page_size(&self) -> usize;

    /// Number of addressable bytes (always a multiple of the page size)
    fn capacity(&self) -> u64;

    /// Fill `buf` with the bytes starting at `offset`
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Read `len` bytes starting at `offset`
    fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` starting at `offset`
    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Grow the storage so that every byte below `end_offset` is addressable
    fn ensure_capacity(&self, end_offset: u64) -> Result<()>;

    /// Persist dirty pages to the backing file
    fn flush(&self) -> Result<()>;
}

/// Validate a page size against the supported range
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::Config(format!(
            "page size {} must be a power of two in [{}, {}]",
            page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }
    Ok(())
}

/// Split the byte range `[offset, offset + len)` into per-page chunks
///
/// Yields `(page_index, offset_in_page, range_in_buffer)` triples.
pub(crate) fn page_chunks(
    offset: u64,
    len: usize,
    page_size: usize,
) -> impl Iterator<Item = (u64, usize, std::ops::Range<usize>)> {
    let page_size_u64 = page_size as u64;
    let mut done = 0usize;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let absolute = offset + done as u64;
        let page_index = absolute / page_size_u64;
        let in_page = (absolute % page_size_u64) as usize;
        let chunk = (page_size - in_page).min(len - done);
        let range = done..done + chunk;
        done += chunk;
        Some((page_index, in_page, range))
    })
}

/// Reject accesses past the addressable end of the storage
pub(crate) fn check_bounds(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| Error::InvalidArgument(format!("range overflow at offset {}", offset)))?;
    if end > capacity {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "access [{}, {}) past end of paged storage ({} bytes)",
                offset, end, capacity
            ),
        )));
    }
    Ok(())
}

/// Paged storage backend chosen at construction time
pub enum AnyPagedStorage {
    Mutex(MutexPagedStorage),
    LockFree(LockFreePagedStorage),
}

impl AnyPagedStorage {
    /// Open the backend named by the configuration
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self> {
        match config.backend {
            BackendKind::Mutex => Ok(Self::Mutex(MutexPagedStorage::open(path, config.page_size)?)),
            BackendKind::LockFree => Ok(Self::LockFree(LockFreePagedStorage::open(
                path,
                config.page_size,
            )?)),
        }
    }

    /// Backend name, for logs and stats
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Mutex(_) => BackendKind::Mutex,
            Self::LockFree(_) => BackendKind::LockFree,
        }
    }
}

impl PagedStorage for AnyPagedStorage {
    fn page_size(&self) -> usize {
        match self {
            Self::Mutex(s) => s.page_size(),
            Self::LockFree(s) => s.page_size(),
        }
    }

    fn capacity(&self) -> u64 {
        match self {
            Self::Mutex(s) => s.capacity(),
            Self::LockFree(s) => s.capacity(),
        }
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Mutex(s) => s.read_into(offset, buf),
            Self::LockFree(s) => s.read_into(offset, buf),
        }
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            Self::Mutex(s) => s.write_bytes(offset, data),
            Self::LockFree(s) => s.write_bytes(offset, data),
        }
    }

    fn ensure_capacity(&self, end_offset: u64) -> Result<()> {
        match self {
            Self::Mutex(s) => s.ensure_capacity(end_offset),
            Self::LockFree(s) => s.ensure_capacity(end_offset),
        }
    }

    fn flush(&self) -> Result<()> {
        match self {
            Self::Mutex(s) => s.flush(),
            Self::LockFree(s) => s.flush(),
        }
    }
}
