//! Blob storage engine
//!
//! Ties the paged storage, the allocation strategy and the record codec
//! together. Callers address records by [`RecordId`]; offsets stay internal.
//!
//! Locking, from outermost to innermost:
//! - one per-record stripe (`RwLock<()>`), held for the whole operation
//! - the placement mutex (tail + free list), held only while a slot is chosen
//!   and its header written
//! - the counters mutex, held for a single counter update

use super::counters::{describe_metrics, CounterState, RecordCounters, StorageStats};
use super::free_list::FreeSpaceIndex;
use super::record::{
    read_file_header, read_header, read_payload, slot_size, write_file_header, write_header,
    write_padding, write_payload, FileHeader, FileState, RecordHeader, RecordId, RecordStatus,
    FIRST_RECORD_OFFSET, HEADER_SIZE, MAX_RECORD_CAPACITY,
};
use super::scan::scan_slots;
use super::strategy::SpaceAllocationStrategy;
use crate::config::{ReclaimPolicy, StorageConfig};
use crate::error::{Error, Result};
use crate::storage::paged::{AnyPagedStorage, PagedStorage};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// A free slot is only reused when its capacity is at most this many times
/// the capacity the strategy asked for
const MAX_REUSE_WASTE_FACTOR: u64 = 2;

/// Engine settings that are not part of the paged storage or the strategy
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub reclaim: ReclaimPolicy,
    pub lock_stripes: usize,
    pub max_chain_hops: usize,
    pub max_record_capacity: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for EngineOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            reclaim: config.reclaim,
            lock_stripes: config.lock_stripes.max(1),
            max_chain_hops: config.max_chain_hops.max(1),
            max_record_capacity: config.max_record_capacity.clamp(1, MAX_RECORD_CAPACITY),
        }
    }
}

/// How a write was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Payload fitted the reserved capacity
    InPlace,
    /// Payload moved to a new slot; the old one is a MOVED tombstone
    Relocated,
}

/// Public view of a live record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInfo {
    pub id: RecordId,
    pub payload_len: u32,
    pub capacity: u32,
}

pub(super) struct Placement {
    pub tail: u64,
    pub free: FreeSpaceIndex,
}

/// Page-backed storage of variable-length blobs with stable ids
pub struct BlobStorage<P: PagedStorage> {
    pub(super) paged: P,
    pub(super) strategy: Box<dyn SpaceAllocationStrategy>,
    pub(super) options: EngineOptions,
    pub(super) index: DashMap<RecordId, u64>,
    locks: Box<[RwLock<()>]>,
    pub(super) placement: Mutex<Placement>,
    published_tail: AtomicU64,
    next_record_id: AtomicU32,
    pub(super) counters: RecordCounters,
    closed: AtomicBool,
}

impl BlobStorage<AnyPagedStorage> {
    /// Open or create the storage file at `path` with the configured backend
    pub fn open<T: AsRef<Path>>(path: T, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let paged = AnyPagedStorage::open(path, config)?;
        info!(
            path = ?path,
            backend = %paged.kind(),
            strategy = ?config.strategy,
            reclaim = ?config.reclaim,
            "Opening blob storage"
        );
        Self::with_paged(paged, config.strategy.build(), EngineOptions::from(config))
    }
}

impl<P: PagedStorage> BlobStorage<P> {
    /// Build an engine over an already opened paged storage
    ///
    /// An empty paged storage is initialized; otherwise the file header is
    /// validated and the id index, live counters and free list are rebuilt
    /// by scanning every slot.
    pub fn with_paged(
        paged: P,
        strategy: Box<dyn SpaceAllocationStrategy>,
        options: EngineOptions,
    ) -> Result<Self> {
        describe_metrics();
        let page_size = paged.page_size();

        let (file_header, recovered) = if paged.capacity() == 0 {
            paged.ensure_capacity(page_size as u64)?;
            let header = FileHeader {
                state: FileState::Closed,
                ..FileHeader::new(page_size as u32)
            };
            write_file_header(&paged, &header)?;
            info!(page_size, "Initialized empty blob storage");
            (header, Recovered::empty())
        } else {
            let header = read_file_header(&paged)?;
            if header.page_size as usize != page_size {
                return Err(Error::Config(format!(
                    "storage was created with page size {}, opened with {}",
                    header.page_size, page_size
                )));
            }
            let recovered = Recovered::scan(&paged, &header, options.reclaim)?;
            (header, recovered)
        };

        let counters = recovered.reconcile(&file_header);
        let next_record_id = file_header.next_record_id.max(recovered.max_record_id + 1);

        let storage = Self {
            locks: (0..options.lock_stripes).map(|_| RwLock::new(())).collect(),
            index: recovered.index,
            placement: Mutex::new(Placement {
                tail: recovered.tail,
                free: recovered.free,
            }),
            published_tail: AtomicU64::new(recovered.tail),
            next_record_id: AtomicU32::new(next_record_id),
            counters: RecordCounters::new(counters),
            closed: AtomicBool::new(false),
            paged,
            strategy,
            options,
        };

        // Mark the file open so an unclean shutdown is detectable.
        storage.persist_header(FileState::Open)?;
        storage.paged.flush()?;

        info!(
            live_records = counters.live_records,
            size_in_bytes = recovered.tail,
            strategy = storage.strategy.name(),
            "Blob storage ready"
        );
        Ok(storage)
    }

    /// Store a new payload and return its id
    pub fn allocate(&self, payload: &[u8]) -> Result<RecordId> {
        let length = self.checked_length(payload.len())?;
        let capacity = self.capacity_for(payload.len())?;
        let id = self.mint_id()?;

        let _guard = self.lock_for(id).write();
        let (offset, capacity) = self.place_record(RecordHeader::actual(id, capacity, length))?;
        if let Err(e) = write_payload(&self.paged, offset, payload) {
            self.abandon_slot(offset, id, capacity);
            return Err(e);
        }
        self.index.insert(id, offset);
        self.counters.on_allocate(capacity, length);

        debug!(record = %id, offset, capacity, length, "Allocated record");
        Ok(id)
    }

    /// Read the current payload of a record
    pub fn read(&self, id: RecordId) -> Result<Vec<u8>> {
        let _guard = self.lock_for(id).read();
        let (offset, header) = self.resolve(id)?;
        read_payload(&self.paged, offset, &header)
    }

    /// Replace the payload of a record, relocating it if it no longer fits
    pub fn write(&self, id: RecordId, payload: &[u8]) -> Result<WriteOutcome> {
        let length = self.checked_length(payload.len())?;

        let _guard = self.lock_for(id).write();
        let (offset, header) = self.resolve(id)?;

        if length <= header.capacity
            && self
                .strategy
                .can_reuse(header.capacity as usize, payload.len())
        {
            write_payload(&self.paged, offset, payload)?;
            write_header(
                &self.paged,
                offset,
                &RecordHeader {
                    actual_length: length,
                    ..header
                },
            )?;
            self.counters.on_write_in_place(header.actual_length, length);
            debug!(record = %id, offset, length, "Wrote record in place");
            return Ok(WriteOutcome::InPlace);
        }

        self.relocate(id, offset, header, payload, length)?;
        Ok(WriteOutcome::Relocated)
    }

    /// Delete a record; its id is never handed out again
    pub fn delete(&self, id: RecordId) -> Result<()> {
        let _guard = self.lock_for(id).write();
        let (offset, header) = self.resolve(id)?;

        write_header(&self.paged, offset, &header.deleted())?;
        self.index.remove(&id);
        self.counters.on_delete(header.capacity, header.actual_length);

        if self.options.reclaim == ReclaimPolicy::FreeList {
            self.placement.lock().free.insert(offset, header.capacity);
        }

        debug!(record = %id, offset, capacity = header.capacity, "Deleted record");
        Ok(())
    }

    /// Whether `id` currently names a live record
    pub fn contains(&self, id: RecordId) -> bool {
        self.index.contains_key(&id)
    }

    /// Size and capacity of a live record
    pub fn record_info(&self, id: RecordId) -> Result<RecordInfo> {
        let _guard = self.lock_for(id).read();
        let (_, header) = self.resolve(id)?;
        Ok(RecordInfo {
            id,
            payload_len: header.actual_length,
            capacity: header.capacity,
        })
    }

    pub fn records_allocated(&self) -> u64 {
        self.counters.snapshot().records_allocated
    }

    pub fn records_deleted(&self) -> u64 {
        self.counters.snapshot().records_deleted
    }

    pub fn records_relocated(&self) -> u64 {
        self.counters.snapshot().records_relocated
    }

    pub fn live_records_count(&self) -> u64 {
        self.counters.snapshot().live_records
    }

    pub fn total_live_records_payload_bytes(&self) -> u64 {
        self.counters.snapshot().live_payload_bytes
    }

    pub fn total_live_records_capacity_bytes(&self) -> u64 {
        self.counters.snapshot().live_capacity_bytes
    }

    /// Bytes in use, file header included
    pub fn size_in_bytes(&self) -> u64 {
        self.published_tail.load(Ordering::Acquire)
    }

    /// All counters at once, taken under a single lock
    pub fn stats(&self) -> StorageStats {
        let state = self.counters.snapshot();
        StorageStats {
            records_allocated: state.records_allocated,
            records_deleted: state.records_deleted,
            records_relocated: state.records_relocated,
            live_records: state.live_records,
            live_payload_bytes: state.live_payload_bytes,
            live_capacity_bytes: state.live_capacity_bytes,
            size_in_bytes: self.size_in_bytes(),
        }
    }

    /// Number of deleted slots waiting for reuse
    pub fn reclaimable_slots(&self) -> usize {
        self.placement.lock().free.len()
    }

    /// Payload capacity of the deleted slots waiting for reuse
    pub fn reclaimable_capacity_bytes(&self) -> u64 {
        self.placement.lock().free.free_capacity()
    }

    pub fn page_size(&self) -> usize {
        self.paged.page_size()
    }

    pub fn strategy(&self) -> &dyn SpaceAllocationStrategy {
        self.strategy.as_ref()
    }

    /// Persist counters and dirty pages
    pub fn flush(&self) -> Result<()> {
        self.persist_header(FileState::Open)?;
        self.paged.flush()
    }

    /// Flush and mark the file as cleanly closed
    pub fn close(self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.persist_header(FileState::Closed)?;
        self.paged.flush()?;
        info!(
            live_records = self.live_records_count(),
            size_in_bytes = self.size_in_bytes(),
            "Closed blob storage"
        );
        Ok(())
    }

    // ---- internals shared with scan and compaction ----

    pub(super) fn lock_for(&self, id: RecordId) -> &RwLock<()> {
        &self.locks[id.0 as usize % self.locks.len()]
    }

    /// Resolve an id to the offset and header of its ACTUAL record
    pub(super) fn resolve(&self, id: RecordId) -> Result<(u64, RecordHeader)> {
        let start = self
            .index
            .get(&id)
            .map(|entry| *entry.value())
            .ok_or(Error::NotFound(id))?;
        let (offset, header) = self.follow_chain(start, id)?;
        if header.status == RecordStatus::Deleted {
            return Err(Error::NotFound(id));
        }
        if offset != start {
            self.index.insert(id, offset);
        }
        Ok((offset, header))
    }

    /// Walk MOVED tombstones from `start` to the record's terminal slot
    pub(super) fn follow_chain(&self, start: u64, id: RecordId) -> Result<(u64, RecordHeader)> {
        let tail = self.size_in_bytes();
        let mut offset = start;
        for _ in 0..=self.options.max_chain_hops {
            if offset < FIRST_RECORD_OFFSET || offset >= tail {
                return Err(Error::CorruptedData(format!(
                    "record {} points at offset {} outside [{}, {})",
                    id, offset, FIRST_RECORD_OFFSET, tail
                )));
            }
            let header = read_header(&self.paged, offset)?;
            if header.status == RecordStatus::Padding {
                return Err(Error::CorruptedData(format!(
                    "record {} resolves to padding at offset {}",
                    id, offset
                )));
            }
            if header.record_id != id {
                return Err(Error::CorruptedData(format!(
                    "offset {} holds record {} instead of {}",
                    offset, header.record_id, id
                )));
            }
            match header.status {
                RecordStatus::Moved => offset = header.moved_to,
                _ => return Ok((offset, header)),
            }
        }
        Err(Error::CorruptedData(format!(
            "record {} forwarding chain from offset {} exceeds {} hops",
            id, start, self.options.max_chain_hops
        )))
    }

    /// Store a record under an id minted by another storage
    pub(super) fn adopt(&self, id: RecordId, payload: &[u8]) -> Result<()> {
        let length = self.checked_length(payload.len())?;
        let capacity = self.capacity_for(payload.len())?;
        self.next_record_id
            .fetch_max(id.0.saturating_add(1), Ordering::AcqRel);

        let _guard = self.lock_for(id).write();
        if self.index.contains_key(&id) {
            return Err(Error::InvalidArgument(format!(
                "record {} already present",
                id
            )));
        }
        let (offset, capacity) = self.place_record(RecordHeader::actual(id, capacity, length))?;
        if let Err(e) = write_payload(&self.paged, offset, payload) {
            self.abandon_slot(offset, id, capacity);
            return Err(e);
        }
        self.index.insert(id, offset);
        self.counters.on_allocate(capacity, length);
        Ok(())
    }

    pub(super) fn next_record_id(&self) -> u32 {
        self.next_record_id.load(Ordering::Acquire)
    }

    pub(super) fn reserve_ids_up_to(&self, next_record_id: u32) {
        self.next_record_id
            .fetch_max(next_record_id, Ordering::AcqRel);
    }

    fn relocate(
        &self,
        id: RecordId,
        old_offset: u64,
        old_header: RecordHeader,
        payload: &[u8],
        length: u32,
    ) -> Result<()> {
        let capacity = self.capacity_for(payload.len())?;
        let fresh = RecordHeader {
            generation: old_header.generation,
            ..RecordHeader::actual(id, capacity, length)
        }
        .next_generation();
        let (new_offset, capacity) = self.place_record(fresh)?;
        if let Err(e) = write_payload(&self.paged, new_offset, payload) {
            self.abandon_slot(new_offset, id, capacity);
            return Err(e);
        }
        if let Err(e) = write_header(&self.paged, old_offset, &old_header.moved_to(new_offset)) {
            self.abandon_slot(new_offset, id, capacity);
            return Err(e);
        }
        self.index.insert(id, new_offset);
        self.counters
            .on_relocate(old_header.capacity, old_header.actual_length, capacity, length);

        debug!(
            record = %id,
            from = old_offset,
            to = new_offset,
            old_capacity = old_header.capacity,
            new_capacity = capacity,
            "Relocated record"
        );
        Ok(())
    }

    /// Choose a slot for a record and write its ACTUAL header there
    ///
    /// Returns the slot offset and the capacity actually reserved, which is
    /// larger than `header.capacity` when a free slot is reused.
    fn place_record(&self, header: RecordHeader) -> Result<(u64, u32)> {
        let id = header.record_id;
        let capacity = header.capacity;
        let length = header.actual_length;
        let mut placement = self.placement.lock();

        if self.options.reclaim == ReclaimPolicy::FreeList {
            let limit = (capacity as u64 * MAX_REUSE_WASTE_FACTOR)
                .max(capacity as u64 + 8)
                .min(u32::MAX as u64) as u32;
            let strategy = &self.strategy;
            let reused = placement.free.take_best_fit(length, limit, |slot_capacity| {
                strategy.can_reuse(slot_capacity as usize, length as usize)
            });
            if let Some((offset, slot_capacity)) = reused {
                let header = RecordHeader {
                    capacity: slot_capacity,
                    ..header
                };
                if let Err(e) = write_header(&self.paged, offset, &header) {
                    placement.free.insert(offset, slot_capacity);
                    return Err(e);
                }
                debug!(record = %id, offset, slot_capacity, "Reused free slot");
                return Ok((offset, slot_capacity));
            }
        }

        let page_size = self.paged.page_size() as u64;
        let previous_tail = placement.tail;
        let room_in_page = page_size - previous_tail % page_size;
        let start = if room_in_page < HEADER_SIZE as u64 {
            previous_tail + room_in_page
        } else {
            previous_tail
        };
        let end = start
            .checked_add(slot_size(capacity as u64))
            .ok_or_else(|| Error::CapacityExceeded("storage offset overflow".to_string()))?;

        self.paged.ensure_capacity(end)?;
        if start != previous_tail {
            write_padding(&self.paged, previous_tail)?;
        }
        write_header(&self.paged, start, &header)?;

        placement.tail = end;
        self.published_tail.store(end, Ordering::Release);
        Ok((start, capacity))
    }

    /// Best-effort: turn a half-written slot into a DELETED one
    fn abandon_slot(&self, offset: u64, id: RecordId, capacity: u32) {
        let header = RecordHeader::actual(id, capacity, 0).deleted();
        if let Err(e) = write_header(&self.paged, offset, &header) {
            warn!(record = %id, offset, error = %e, "Failed to abandon slot");
            return;
        }
        if self.options.reclaim == ReclaimPolicy::FreeList {
            self.placement.lock().free.insert(offset, capacity);
        }
    }

    fn checked_length(&self, len: usize) -> Result<u32> {
        if len > self.options.max_record_capacity as usize {
            return Err(Error::CapacityExceeded(format!(
                "payload of {} bytes exceeds maximum record capacity {}",
                len, self.options.max_record_capacity
            )));
        }
        Ok(len as u32)
    }

    fn capacity_for(&self, len: usize) -> Result<u32> {
        let capacity = self.strategy.capacity_for(len).max(len);
        if capacity > self.options.max_record_capacity as usize {
            return Err(Error::CapacityExceeded(format!(
                "{} strategy asked for {} bytes for a {}-byte payload, maximum is {}",
                self.strategy.name(),
                capacity,
                len,
                self.options.max_record_capacity
            )));
        }
        Ok(capacity as u32)
    }

    fn mint_id(&self) -> Result<RecordId> {
        self.next_record_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(1))
            .map(RecordId)
            .map_err(|_| Error::CapacityExceeded("record id space exhausted".to_string()))
    }

    fn persist_header(&self, state: FileState) -> Result<()> {
        let tail = self.placement.lock().tail;
        let counters = self.counters.snapshot();
        let header = FileHeader {
            page_size: self.paged.page_size() as u32,
            state,
            next_record_id: self.next_record_id(),
            tail,
            records_allocated: counters.records_allocated,
            records_relocated: counters.records_relocated,
            records_deleted: counters.records_deleted,
        };
        write_file_header(&self.paged, &header)
    }

    #[cfg(test)]
    pub(super) fn offset_of(&self, id: RecordId) -> Option<u64> {
        self.index.get(&id).map(|entry| *entry.value())
    }

    #[cfg(test)]
    pub(super) fn header_at(&self, offset: u64) -> Result<RecordHeader> {
        read_header(&self.paged, offset)
    }
}

impl<P: PagedStorage> Drop for BlobStorage<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!(error = %e, "Failed to close blob storage cleanly");
        }
    }
}

/// State rebuilt from the file when an existing storage is opened
struct Recovered {
    index: DashMap<RecordId, u64>,
    free: FreeSpaceIndex,
    tail: u64,
    max_record_id: u32,
    live: CounterState,
    moved_slots: u64,
    deleted_slots: u64,
}

impl Recovered {
    fn empty() -> Self {
        Self {
            index: DashMap::new(),
            free: FreeSpaceIndex::new(),
            tail: FIRST_RECORD_OFFSET,
            max_record_id: 0,
            live: CounterState::default(),
            moved_slots: 0,
            deleted_slots: 0,
        }
    }

    fn scan<P: PagedStorage>(paged: &P, header: &FileHeader, reclaim: ReclaimPolicy) -> Result<Self> {
        let mut recovered = Recovered::empty();
        let mut actual: HashMap<RecordId, (u64, RecordHeader)> = HashMap::new();
        let mut stale = Vec::new();

        let tail = scan_slots(paged, FIRST_RECORD_OFFSET, None, |offset, record| {
            recovered.max_record_id = recovered.max_record_id.max(record.record_id.0);
            match record.status {
                RecordStatus::Actual => match actual.entry(record.record_id) {
                    Entry::Vacant(slot) => {
                        slot.insert((offset, *record));
                    }
                    Entry::Occupied(mut slot) => {
                        if slot.get().1.is_newer_than(record) {
                            stale.push((offset, *record));
                        } else {
                            stale.push(slot.insert((offset, *record)));
                        }
                    }
                },
                RecordStatus::Moved => recovered.moved_slots += 1,
                RecordStatus::Deleted => {
                    recovered.deleted_slots += 1;
                    if reclaim == ReclaimPolicy::FreeList {
                        recovered.free.insert(offset, record.capacity);
                    }
                }
                RecordStatus::Padding => {}
            }
            Ok(())
        })?;

        // A relocation interrupted between writing the new copy and the
        // tombstone leaves two ACTUAL slots. The higher generation wins, wherever
        // it sits in the file.
        for (stale_offset, stale_header) in stale {
            let Some(&(winner, winner_header)) = actual.get(&stale_header.record_id) else {
                continue;
            };
            warn!(
                record = %stale_header.record_id,
                stale_offset,
                stale_generation = stale_header.generation,
                winner,
                winner_generation = winner_header.generation,
                "Duplicate live record, converting older copy to a tombstone"
            );
            write_header(paged, stale_offset, &stale_header.moved_to(winner))?;
            recovered.moved_slots += 1;
        }

        for (id, (offset, record)) in actual {
            recovered.index.insert(id, offset);
            recovered.live.live_records += 1;
            recovered.live.live_payload_bytes += record.actual_length as u64;
            recovered.live.live_capacity_bytes += record.capacity as u64;
        }

        if tail != header.tail {
            if header.state == FileState::Closed {
                warn!(header_tail = header.tail, scanned_tail = tail, "Tail in file header disagrees with scan");
            } else {
                debug!(header_tail = header.tail, scanned_tail = tail, "Tail recovered by scan");
            }
        }
        recovered.tail = tail;
        Ok(recovered)
    }

    /// Merge persisted history counters with the scanned live counters
    fn reconcile(&self, header: &FileHeader) -> CounterState {
        let mut state = CounterState {
            records_allocated: header.records_allocated,
            records_relocated: header.records_relocated,
            records_deleted: header.records_deleted,
            ..self.live
        };
        if header.state == FileState::Open {
            warn!("Storage was not closed cleanly, reconciling counters from scan");
            state.records_deleted = state.records_deleted.max(self.deleted_slots);
            state.records_relocated = state.records_relocated.max(self.moved_slots);
            state.records_allocated = state
                .records_allocated
                .max(state.live_records + state.records_deleted);
        }
        state
    }
}
