//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! BlobStorage<P>                       (records, ids, counters)
//!   ├─→ SpaceAllocationStrategy        (capacity per payload)
//!   ├─→ DashMap<RecordId, offset>      (id index)
//!   └─→ P: PagedStorage                (bytes in fixed-size pages)
//!        ├─→ MutexPagedStorage         (one lock, lazy pages)
//!        └─→ LockFreePagedStorage      (atomic page table, seqlock pages)
//! ```
//!
//! `AnyPagedStorage` picks the backend from configuration at open time.

pub mod blob;
pub mod paged;

pub use blob::{
    BlobRecord, BlobStorage, CompactionReport, ExactFit, PercentSlack, PowerOfTwo, RecordId,
    RecordInfo, RecordStatus, ScanReport, SpaceAllocationStrategy, StorageStats, StrategyConfig,
    WriteOutcome,
};
pub use paged::{AnyPagedStorage, LockFreePagedStorage, MutexPagedStorage, PagedStorage};
