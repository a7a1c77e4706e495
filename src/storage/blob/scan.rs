//! Sequential record scans
//!
//! Slots are laid out back to back from the end of the file header, so the
//! whole file can be walked by decoding one header at a time and skipping
//! `slot_size` bytes. PADDING is a single status byte that sends the walk to
//! the next page boundary.

use super::record::{
    read_header, read_payload, read_status_byte, RecordHeader, RecordId, RecordStatus,
    FIRST_RECORD_OFFSET, HEADER_SIZE,
};
use super::storage::BlobStorage;
use crate::error::{Error, Result};
use crate::storage::paged::PagedStorage;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Walk every slot from `start`, handing each header to `visit`
///
/// With `end = None` the walk stops at the first unwritten byte (status 0) or
/// at the end of the paged storage, which is how an existing file's tail is
/// found on open. With `end = Some(tail)` every byte below the tail must be
/// part of a slot. Returns the offset where the walk stopped.
pub(crate) fn scan_slots<P, F>(paged: &P, start: u64, end: Option<u64>, mut visit: F) -> Result<u64>
where
    P: PagedStorage + ?Sized,
    F: FnMut(u64, &RecordHeader) -> Result<()>,
{
    let page_size = paged.page_size() as u64;
    let limit = end.unwrap_or_else(|| paged.capacity());
    let mut offset = start;

    while offset < limit {
        let status = read_status_byte(paged, offset)?;
        if status == 0 {
            if end.is_some() {
                return Err(Error::CorruptedData(format!(
                    "unwritten slot at offset {} below tail {}",
                    offset, limit
                )));
            }
            break;
        }
        if status == RecordStatus::Padding.as_u8() {
            visit(offset, &padding_header())?;
            offset = next_page_boundary(offset, page_size);
            continue;
        }
        if page_size - offset % page_size < HEADER_SIZE as u64 {
            return Err(Error::CorruptedData(format!(
                "record header at offset {} crosses a page boundary",
                offset
            )));
        }

        let header = read_header(paged, offset)?;
        let next = offset + header.slot_size();
        if next > limit {
            return Err(Error::CorruptedData(format!(
                "record {} at offset {} runs past the end ({} > {})",
                header.record_id, offset, next, limit
            )));
        }
        visit(offset, &header)?;
        offset = next;
    }

    Ok(offset)
}

fn next_page_boundary(offset: u64, page_size: u64) -> u64 {
    (offset / page_size + 1) * page_size
}

fn padding_header() -> RecordHeader {
    RecordHeader {
        status: RecordStatus::Padding,
        record_id: RecordId(0),
        generation: 0,
        capacity: 0,
        actual_length: 0,
        moved_to: 0,
    }
}

/// A live record yielded by [`BlobStorage::records`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub id: RecordId,
    pub capacity: u32,
    pub payload: Vec<u8>,
}

/// Slot counts and live totals recomputed from the file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub actual: u64,
    pub moved: u64,
    pub deleted: u64,
    pub padding: u64,
    pub live_payload_bytes: u64,
    pub live_capacity_bytes: u64,
}

/// Lazy file-order iterator over ACTUAL records
///
/// The end of the walk is fixed when the iterator is created. Each record is
/// re-checked under its stripe lock before its payload is read, so payloads
/// are never torn. Every id is yielded at most once. A record that stays live
/// for the whole walk is yielded even if it is relocated behind the walk or
/// past its end: the MOVED slot it leaves ahead of the walk is resolved to the
/// record's current location.
pub struct RecordIter<'a, P: PagedStorage> {
    storage: &'a BlobStorage<P>,
    offset: u64,
    end: u64,
    yielded: HashSet<RecordId>,
    failed: bool,
}

impl<'a, P: PagedStorage> RecordIter<'a, P> {
    fn step(&mut self) -> Result<Option<BlobRecord>> {
        let paged = &self.storage.paged;
        let offset = self.offset;

        let status = read_status_byte(paged, offset)?;
        if status == 0 {
            return Err(Error::CorruptedData(format!(
                "unwritten slot at offset {} below tail {}",
                offset, self.end
            )));
        }
        if status == RecordStatus::Padding.as_u8() {
            self.offset = next_page_boundary(offset, paged.page_size() as u64);
            return Ok(None);
        }

        let header = read_header(paged, offset)?;
        // Slot capacity never changes, so the next offset is stable even if
        // the record is rewritten concurrently.
        self.offset = offset + header.slot_size();
        let id = header.record_id;
        if self.yielded.contains(&id) {
            return Ok(None);
        }

        let _guard = self.storage.lock_for(id).read();
        let current = read_header(paged, offset)?;
        if current.record_id != id {
            return Ok(None);
        }
        let (live_offset, live) = match current.status {
            RecordStatus::Actual => (offset, current),
            RecordStatus::Moved => match self.storage.resolve(id) {
                // Still ahead of the walk: it is picked up there
                Ok((at, _)) if at >= self.offset && at < self.end => return Ok(None),
                Ok(found) => found,
                Err(Error::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            },
            _ => return Ok(None),
        };

        let payload = read_payload(paged, live_offset, &live)?;
        self.yielded.insert(id);
        Ok(Some(BlobRecord {
            id,
            capacity: live.capacity,
            payload,
        }))
    }
}

impl<'a, P: PagedStorage> Iterator for RecordIter<'a, P> {
    type Item = Result<BlobRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed && self.offset < self.end {
            match self.step() {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

impl<P: PagedStorage> BlobStorage<P> {
    /// Iterate over live records in file order
    pub fn records(&self) -> RecordIter<'_, P> {
        RecordIter {
            storage: self,
            offset: FIRST_RECORD_OFFSET,
            end: self.size_in_bytes(),
            yielded: HashSet::new(),
            failed: false,
        }
    }

    /// Visit live records in file order until `visitor` returns `false`
    ///
    /// Returns the number of records visited.
    pub fn for_each_record<F>(&self, mut visitor: F) -> Result<u64>
    where
        F: FnMut(RecordId, &[u8]) -> bool,
    {
        let mut visited = 0;
        for record in self.records() {
            let record = record?;
            visited += 1;
            if !visitor(record.id, &record.payload) {
                break;
            }
        }
        Ok(visited)
    }

    /// Recompute the live totals by a full scan and compare them with the
    /// maintained counters
    ///
    /// Meant for a quiescent storage: concurrent writers make the comparison
    /// meaningless.
    pub fn verify(&self) -> Result<ScanReport> {
        let end = self.size_in_bytes();
        let mut report = ScanReport::default();

        scan_slots(&self.paged, FIRST_RECORD_OFFSET, Some(end), |_, header| {
            match header.status {
                RecordStatus::Actual => {
                    report.actual += 1;
                    report.live_payload_bytes += header.actual_length as u64;
                    report.live_capacity_bytes += header.capacity as u64;
                }
                RecordStatus::Moved => report.moved += 1,
                RecordStatus::Deleted => report.deleted += 1,
                RecordStatus::Padding => report.padding += 1,
            }
            Ok(())
        })?;

        let stats = self.stats();
        let mismatches: Vec<String> = [
            ("live records", stats.live_records, report.actual),
            ("live payload bytes", stats.live_payload_bytes, report.live_payload_bytes),
            ("live capacity bytes", stats.live_capacity_bytes, report.live_capacity_bytes),
            ("indexed records", self.index.len() as u64, report.actual),
        ]
        .iter()
        .filter(|(_, counted, scanned)| counted != scanned)
        .map(|(what, counted, scanned)| format!("{}: counted {}, scanned {}", what, counted, scanned))
        .collect();

        if !mismatches.is_empty() {
            return Err(Error::CorruptedData(format!(
                "counters disagree with scan: {}",
                mismatches.join("; ")
            )));
        }

        debug!(?report, "Verified blob storage");
        Ok(report)
    }
}
