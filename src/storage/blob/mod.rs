//! Blob Storage
//!
//! Variable-length records inside one paged file. Every record keeps the id
//! it was allocated with for its whole life; its offset may change when it
//! outgrows its slot.
//!
//! # Layout
//!
//! ```text
//! offset 0     64                              page boundary
//! │ FileHeader │ hdr(24) payload │ hdr(24) payl|oad │ hdr(24) payload │ P |
//!                                               ^ payloads may span pages
//!
//! Each slot is 24 + capacity bytes rounded up to 8. Headers never span
//! pages: when fewer than 24 bytes are left, a PADDING byte (P) is written
//! and the next slot starts on the next page.
//! ```
//!
//! # Relocation
//!
//! ```text
//! write(id, bigger payload)
//!   ├─→ fits capacity?  → overwrite payload + header in place
//!   └─→ otherwise       → new slot at the tail (or a reused free slot)
//!                         old header becomes MOVED → new offset
//!                         index[id] = new offset
//! ```
//!
//! Counters are maintained incrementally and can be checked against a full
//! scan with [`BlobStorage::verify`].

pub mod compaction;
pub mod counters;
pub mod free_list;
pub mod record;
pub mod scan;
pub mod storage;
pub mod strategy;

pub use compaction::CompactionReport;
pub use counters::{describe_metrics, StorageStats};
pub use free_list::FreeSpaceIndex;
pub use record::{FileHeader, FileState, Record, RecordHeader, RecordId, RecordStatus};
pub use scan::{BlobRecord, RecordIter, ScanReport};
pub use storage::{BlobStorage, EngineOptions, RecordInfo, WriteOutcome};
pub use strategy::{ExactFit, PercentSlack, PowerOfTwo, SpaceAllocationStrategy, StrategyConfig};
