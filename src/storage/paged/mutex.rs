//! Mutex-guarded paged storage
//!
//! Correctness first: one mutex covers the file handle, the page vector and
//! the dirty set. Pages are loaded from the file on first touch and written
//! back on [`PagedStorage::flush`].

use super::{check_bounds, page_chunks, validate_page_size, PagedStorage};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

struct Inner {
    file: File,
    /// Page buffers, `None` until first touched
    pages: Vec<Option<Box<[u8]>>>,
    /// Pages modified since the last flush
    dirty: BTreeSet<u64>,
    /// Pages currently present in the file
    file_pages: u64,
}

/// Paged storage where every access goes through a single mutex
pub struct MutexPagedStorage {
    path: PathBuf,
    page_size: usize,
    inner: Mutex<Inner>,
}

impl MutexPagedStorage {
    /// Open or create the paged file at `path`
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len % page_size as u64 != 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "file length {} is not a multiple of page size {}",
                    file_len, page_size
                ),
            )));
        }
        let file_pages = file_len / page_size as u64;

        info!(path = ?path, page_size, pages = file_pages, "Opened mutex paged storage");

        Ok(Self {
            path,
            page_size,
            inner: Mutex::new(Inner {
                file,
                pages: (0..file_pages).map(|_| None).collect(),
                dirty: BTreeSet::new(),
                file_pages,
            }),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn page_mut<'a>(&self, inner: &'a mut Inner, index: u64) -> Result<&'a mut Box<[u8]>> {
        let slot = index as usize;
        if inner.pages[slot].is_none() {
            let mut buf = vec![0u8; self.page_size].into_boxed_slice();
            if index < inner.file_pages {
                inner
                    .file
                    .seek(SeekFrom::Start(index * self.page_size as u64))?;
                inner.file.read_exact(&mut buf)?;
            }
            inner.pages[slot] = Some(buf);
        }
        inner.pages[slot]
            .as_mut()
            .ok_or_else(|| Error::Internal(format!("page {} not resident", index)))
    }
}

impl PagedStorage for MutexPagedStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn capacity(&self) -> u64 {
        self.inner.lock().pages.len() as u64 * self.page_size as u64
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        check_bounds(
            offset,
            buf.len(),
            inner.pages.len() as u64 * self.page_size as u64,
        )?;
        for (page_index, in_page, range) in page_chunks(offset, buf.len(), self.page_size) {
            let page = self.page_mut(&mut inner, page_index)?;
            let len = range.len();
            buf[range].copy_from_slice(&page[in_page..in_page + len]);
        }
        Ok(())
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        check_bounds(
            offset,
            data.len(),
            inner.pages.len() as u64 * self.page_size as u64,
        )?;
        for (page_index, in_page, range) in page_chunks(offset, data.len(), self.page_size) {
            let page = self.page_mut(&mut inner, page_index)?;
            let len = range.len();
            page[in_page..in_page + len].copy_from_slice(&data[range]);
            inner.dirty.insert(page_index);
        }
        Ok(())
    }

    fn ensure_capacity(&self, end_offset: u64) -> Result<()> {
        let page_size = self.page_size as u64;
        let wanted = end_offset.div_ceil(page_size);
        let mut inner = self.inner.lock();
        let current = inner.pages.len() as u64;
        if wanted > current {
            for index in current..wanted {
                inner.pages.push(Some(vec![0u8; self.page_size].into_boxed_slice()));
                inner.dirty.insert(index);
            }
            debug!(from = current, to = wanted, "Grew mutex paged storage");
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        // Pages stay dirty until written and synced, so a failed flush can be
        // retried.
        let dirty: Vec<u64> = inner.dirty.iter().copied().collect();
        for &index in &dirty {
            let Inner { file, pages, .. } = &mut *inner;
            if let Some(page) = pages[index as usize].as_ref() {
                file.seek(SeekFrom::Start(index * self.page_size as u64))?;
                file.write_all(page)?;
            }
            inner.file_pages = inner.file_pages.max(index + 1);
        }
        inner.file.sync_data()?;
        inner.dirty.clear();
        debug!(pages = dirty.len(), "Flushed mutex paged storage");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_within_page() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = MutexPagedStorage::open(dir.path().join("pages.bin"), 256)?;
        storage.ensure_capacity(256)?;

        storage.write_bytes(10, b"hello")?;
        assert_eq!(storage.read_bytes(10, 5)?, b"hello");
        assert_eq!(storage.capacity(), 256);
        Ok(())
    }

    #[test]
    fn test_write_read_across_pages() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = MutexPagedStorage::open(dir.path().join("pages.bin"), 256)?;
        storage.ensure_capacity(1024)?;

        let data: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        storage.write_bytes(200, &data)?;
        assert_eq!(storage.read_bytes(200, data.len())?, data);
        Ok(())
    }

    #[test]
    fn test_read_past_end_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = MutexPagedStorage::open(dir.path().join("pages.bin"), 256)?;
        storage.ensure_capacity(256)?;

        assert!(matches!(storage.read_bytes(250, 10), Err(Error::Io(_))));
        Ok(())
    }

    #[test]
    fn test_persistence_after_flush() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pages.bin");
        {
            let storage = MutexPagedStorage::open(&path, 512)?;
            storage.ensure_capacity(2048)?;
            storage.write_bytes(1000, b"persisted")?;
            storage.flush()?;
        }

        let storage = MutexPagedStorage::open(&path, 512)?;
        assert_eq!(storage.capacity(), 2048);
        assert_eq!(storage.read_bytes(1000, 9)?, b"persisted");
        Ok(())
    }

    #[test]
    fn test_failed_flush_keeps_pages_dirty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pages.bin");
        let storage = MutexPagedStorage::open(&path, 256)?;
        storage.ensure_capacity(512)?;
        storage.write_bytes(300, b"survives a failed flush")?;

        // Page writes through a read-only handle fail
        let writable = std::mem::replace(&mut storage.inner.lock().file, File::open(&path)?);
        assert!(storage.flush().is_err());
        assert_eq!(storage.inner.lock().dirty.len(), 2);

        storage.inner.lock().file = writable;
        storage.flush()?;
        assert!(storage.inner.lock().dirty.is_empty());
        drop(storage);

        let reopened = MutexPagedStorage::open(&path, 256)?;
        assert_eq!(reopened.read_bytes(300, 23)?, b"survives a failed flush");
        Ok(())
    }

    #[test]
    fn test_rejects_misaligned_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pages.bin");
        std::fs::write(&path, vec![0u8; 300])?;

        assert!(MutexPagedStorage::open(&path, 256).is_err());
        Ok(())
    }
}
