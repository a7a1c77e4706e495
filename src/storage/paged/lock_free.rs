//! Lock-free paged storage
//!
//! ```text
//! segments: [AtomicPtr<Segment>; 4096]        (installed by CAS)
//!    └─→ Segment.pages: [AtomicPtr<Page>; 1024] (installed by CAS)
//!           └─→ Page { version (seqlock), dirty, words: [AtomicU64] }
//! ```
//!
//! Readers never block: they copy a page range optimistically and retry if
//! the page version moved underneath them. Writers claim a page by CAS on its
//! version (even → odd), store words, then publish the next even version.
//! The file handle is only locked to load a page on first touch and on flush.

use super::{check_bounds, page_chunks, validate_page_size, PagedStorage};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::hint::spin_loop;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, Ordering};
use tracing::{debug, info};

const SEGMENT_BITS: u32 = 10;
const PAGES_PER_SEGMENT: usize = 1 << SEGMENT_BITS;
const MAX_SEGMENTS: usize = 4096;
const WORD: usize = std::mem::size_of::<u64>();

/// One page: a seqlock-protected array of words
struct Page {
    version: AtomicU64,
    dirty: AtomicBool,
    words: Box<[AtomicU64]>,
}

impl Page {
    fn from_bytes(bytes: &[u8]) -> Self {
        let words = bytes
            .chunks_exact(WORD)
            .map(|chunk| {
                let mut word = [0u8; WORD];
                word.copy_from_slice(chunk);
                AtomicU64::new(u64::from_le_bytes(word))
            })
            .collect();
        Self {
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            words,
        }
    }

    fn zeroed(page_size: usize) -> Self {
        Self {
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            words: (0..page_size / WORD).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Optimistic read: retried until no writer overlapped the copy
    fn read(&self, in_page: usize, out: &mut [u8]) {
        loop {
            let before = self.version.load(Ordering::Acquire);
            if before & 1 == 1 {
                spin_loop();
                continue;
            }
            self.copy_out(in_page, out);
            fence(Ordering::Acquire);
            if self.version.load(Ordering::Relaxed) == before {
                return;
            }
        }
    }

    fn write(&self, in_page: usize, data: &[u8]) {
        let version = self.claim();
        fence(Ordering::Release);
        self.copy_in(in_page, data);
        self.dirty.store(true, Ordering::Relaxed);
        self.version.store(version + 2, Ordering::Release);
    }

    /// Spin until this thread moves the version from even to odd
    fn claim(&self) -> u64 {
        loop {
            let current = self.version.load(Ordering::Relaxed);
            if current & 1 == 0
                && self
                    .version
                    .compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return current;
            }
            spin_loop();
        }
    }

    fn copy_out(&self, in_page: usize, out: &mut [u8]) {
        let end = in_page + out.len();
        let mut pos = in_page;
        while pos < end {
            let word_start = pos / WORD * WORD;
            let bytes = self.words[pos / WORD].load(Ordering::Relaxed).to_le_bytes();
            let from = pos - word_start;
            let to = (end - word_start).min(WORD);
            let dst = pos - in_page;
            out[dst..dst + (to - from)].copy_from_slice(&bytes[from..to]);
            pos = word_start + to;
        }
    }

    fn copy_in(&self, in_page: usize, data: &[u8]) {
        let end = in_page + data.len();
        let mut pos = in_page;
        while pos < end {
            let word_start = pos / WORD * WORD;
            let slot = &self.words[pos / WORD];
            let from = pos - word_start;
            let to = (end - word_start).min(WORD);
            let src = pos - in_page;
            let mut bytes = if from == 0 && to == WORD {
                [0u8; WORD]
            } else {
                slot.load(Ordering::Relaxed).to_le_bytes()
            };
            bytes[from..to].copy_from_slice(&data[src..src + (to - from)]);
            slot.store(u64::from_le_bytes(bytes), Ordering::Relaxed);
            pos = word_start + to;
        }
    }

    fn snapshot(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        self.read(0, &mut buf);
        buf
    }
}

struct Segment {
    pages: Box<[AtomicPtr<Page>]>,
}

impl Segment {
    fn new() -> Self {
        Self {
            pages: (0..PAGES_PER_SEGMENT)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
        }
    }
}

/// Paged storage with CAS-based page table growth and seqlock pages
pub struct LockFreePagedStorage {
    path: PathBuf,
    page_size: usize,
    segments: Box<[AtomicPtr<Segment>]>,
    page_count: AtomicU64,
    file_pages: AtomicU64,
    file: Mutex<File>,
}

impl LockFreePagedStorage {
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
        if file_pages > (MAX_SEGMENTS * PAGES_PER_SEGMENT) as u64 {
            return Err(Error::CapacityExceeded(format!(
                "file has {} pages, lock-free page table holds at most {}",
                file_pages,
                MAX_SEGMENTS * PAGES_PER_SEGMENT
            )));
        }

        info!(path = ?path, page_size, pages = file_pages, "Opened lock-free paged storage");

        Ok(Self {
            path,
            page_size,
            segments: (0..MAX_SEGMENTS)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            page_count: AtomicU64::new(file_pages),
            file_pages: AtomicU64::new(file_pages),
            file: Mutex::new(file),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn segment(&self, index: usize) -> &Segment {
        let slot = &self.segments[index];
        let current = slot.load(Ordering::Acquire);
        if !current.is_null() {
            // SAFETY: installed segments are only freed in Drop, which needs &mut self.
            return unsafe { &*current };
        }
        let fresh = Box::into_raw(Box::new(Segment::new()));
        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            // SAFETY: we just installed `fresh`; it lives until Drop.
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                // SAFETY: `fresh` lost the race and was never shared.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: see above, installed pointers live until Drop.
                unsafe { &*winner }
            }
        }
    }

    fn page(&self, index: u64) -> Result<&Page> {
        let segment_index = (index >> SEGMENT_BITS) as usize;
        if segment_index >= MAX_SEGMENTS {
            return Err(Error::CapacityExceeded(format!(
                "page {} beyond lock-free page table",
                index
            )));
        }
        let slot = &self.segment(segment_index).pages[index as usize & (PAGES_PER_SEGMENT - 1)];
        let current = slot.load(Ordering::Acquire);
        if !current.is_null() {
            // SAFETY: installed pages are only freed in Drop.
            return Ok(unsafe { &*current });
        }

        let fresh = Box::into_raw(Box::new(self.load_page(index)?));
        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            // SAFETY: we just installed `fresh`; it lives until Drop.
            Ok(_) => Ok(unsafe { &*fresh }),
            Err(winner) => {
                // SAFETY: `fresh` lost the race and was never shared.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: installed pages are only freed in Drop.
                Ok(unsafe { &*winner })
            }
        }
    }

    fn installed_page(&self, index: u64) -> Option<&Page> {
        let segment = self.segments[(index >> SEGMENT_BITS) as usize].load(Ordering::Acquire);
        if segment.is_null() {
            return None;
        }
        // SAFETY: installed segments live until Drop.
        let segment = unsafe { &*segment };
        let page = segment.pages[index as usize & (PAGES_PER_SEGMENT - 1)].load(Ordering::Acquire);
        // SAFETY: installed pages live until Drop.
        (!page.is_null()).then(|| unsafe { &*page })
    }

    /// Write every dirty page below `page_count`, then sync
    ///
    /// Pages whose dirty flag was taken are pushed to `taken`.
    fn write_dirty_pages<'a>(
        &'a self,
        file: &mut File,
        page_count: u64,
        taken: &mut Vec<&'a Page>,
    ) -> Result<()> {
        for index in 0..page_count {
            let Some(page) = self.installed_page(index) else {
                continue;
            };
            if page.dirty.swap(false, Ordering::AcqRel) {
                taken.push(page);
                let bytes = page.snapshot(self.page_size);
                file.seek(SeekFrom::Start(index * self.page_size as u64))?;
                file.write_all(&bytes)?;
            }
        }
        let wanted_len = page_count * self.page_size as u64;
        if file.metadata()?.len() < wanted_len {
            file.set_len(wanted_len)?;
        }
        file.sync_data()?;
        Ok(())
    }

    fn load_page(&self, index: u64) -> Result<Page> {
        if index >= self.file_pages.load(Ordering::Acquire) {
            return Ok(Page::zeroed(self.page_size));
        }
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(index * self.page_size as u64))?;
        file.read_exact(&mut buf)?;
        Ok(Page::from_bytes(&buf))
    }
}

impl PagedStorage for LockFreePagedStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn capacity(&self) -> u64 {
        self.page_count.load(Ordering::Acquire) * self.page_size as u64
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.capacity())?;
        for (page_index, in_page, range) in page_chunks(offset, buf.len(), self.page_size) {
            self.page(page_index)?.read(in_page, &mut buf[range]);
        }
        Ok(())
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_bounds(offset, data.len(), self.capacity())?;
        for (page_index, in_page, range) in page_chunks(offset, data.len(), self.page_size) {
            self.page(page_index)?.write(in_page, &data[range]);
        }
        Ok(())
    }

    fn ensure_capacity(&self, end_offset: u64) -> Result<()> {
        let wanted = end_offset.div_ceil(self.page_size as u64);
        if wanted > (MAX_SEGMENTS * PAGES_PER_SEGMENT) as u64 {
            return Err(Error::CapacityExceeded(format!(
                "{} pages requested, lock-free page table holds at most {}",
                wanted,
                MAX_SEGMENTS * PAGES_PER_SEGMENT
            )));
        }
        let mut current = self.page_count.load(Ordering::Acquire);
        while current < wanted {
            match self.page_count.compare_exchange_weak(
                current,
                wanted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(from = current, to = wanted, "Grew lock-free paged storage");
                    break;
                }
                Err(actual) => current = actual,
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let page_count = self.page_count.load(Ordering::Acquire);
        let mut file = self.file.lock();
        let mut taken = Vec::new();
        if let Err(e) = self.write_dirty_pages(&mut file, page_count, &mut taken) {
            // Pages not yet written or synced go back to the next flush.
            for page in &taken {
                page.dirty.store(true, Ordering::Release);
            }
            return Err(e);
        }
        self.file_pages.fetch_max(page_count, Ordering::AcqRel);
        debug!(pages = taken.len(), "Flushed lock-free paged storage");
        Ok(())
    }
}

impl Drop for LockFreePagedStorage {
    fn drop(&mut self) {
        for segment in self.segments.iter_mut() {
            let segment = *segment.get_mut();
            if segment.is_null() {
                continue;
            }
            // SAFETY: &mut self guarantees no outstanding page references.
            let mut segment = unsafe { Box::from_raw(segment) };
            for page in segment.pages.iter_mut() {
                let page = *page.get_mut();
                if !page.is_null() {
                    // SAFETY: as above, each page pointer is owned by exactly one slot.
                    drop(unsafe { Box::from_raw(page) });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_write_read_within_page() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LockFreePagedStorage::open(dir.path().join("pages.bin"), 256)?;
        storage.ensure_capacity(256)?;

        storage.write_bytes(13, b"unaligned")?;
        assert_eq!(storage.read_bytes(13, 9)?, b"unaligned");
        assert_eq!(storage.read_bytes(0, 13)?, vec![0u8; 13]);
        Ok(())
    }

    #[test]
    fn test_write_read_across_pages() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LockFreePagedStorage::open(dir.path().join("pages.bin"), 256)?;
        storage.ensure_capacity(2048)?;

        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        storage.write_bytes(301, &data)?;
        assert_eq!(storage.read_bytes(301, data.len())?, data);
        Ok(())
    }

    #[test]
    fn test_read_past_end_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LockFreePagedStorage::open(dir.path().join("pages.bin"), 256)?;
        assert!(matches!(storage.read_bytes(0, 1), Err(Error::Io(_))));
        Ok(())
    }

    #[test]
    fn test_persistence_after_flush() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pages.bin");
        {
            let storage = LockFreePagedStorage::open(&path, 512)?;
            storage.ensure_capacity(4096)?;
            storage.write_bytes(700, b"lock-free bytes")?;
            storage.flush()?;
        }

        let storage = LockFreePagedStorage::open(&path, 512)?;
        assert_eq!(storage.capacity(), 4096);
        assert_eq!(storage.read_bytes(700, 15)?, b"lock-free bytes");
        Ok(())
    }

    #[test]
    fn test_failed_flush_keeps_pages_dirty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pages.bin");
        let storage = LockFreePagedStorage::open(&path, 256)?;
        storage.ensure_capacity(1024)?;
        storage.write_bytes(300, b"first page")?;
        storage.write_bytes(900, b"last page")?;

        // Page writes through a read-only handle fail
        let writable = std::mem::replace(&mut *storage.file.lock(), File::open(&path)?);
        assert!(storage.flush().is_err());
        for index in [1, 3] {
            let page = storage.installed_page(index).expect("installed");
            assert!(page.dirty.load(Ordering::Acquire), "page {} lost its dirty mark", index);
        }

        *storage.file.lock() = writable;
        storage.flush()?;
        drop(storage);

        let reopened = LockFreePagedStorage::open(&path, 256)?;
        assert_eq!(reopened.capacity(), 1024);
        assert_eq!(reopened.read_bytes(300, 10)?, b"first page");
        assert_eq!(reopened.read_bytes(900, 9)?, b"last page");
        Ok(())
    }

    #[test]
    fn test_concurrent_writers_on_one_page() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = Arc::new(LockFreePagedStorage::open(dir.path().join("pages.bin"), 1024)?);
        storage.ensure_capacity(1024)?;

        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let storage = Arc::clone(&storage);
                std::thread::spawn(move || -> Result<()> {
                    let offset = t as u64 * 64;
                    for round in 0..200u8 {
                        let block = [t.wrapping_add(round); 64];
                        storage.write_bytes(offset, &block)?;
                        let read = storage.read_bytes(offset, 64)?;
                        assert!(read.iter().all(|&b| b == read[0]), "torn read");
                    }
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("writer thread panicked")?;
        }
        Ok(())
    }
}
