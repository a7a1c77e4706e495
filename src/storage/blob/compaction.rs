//! Compaction by copying
//!
//! Live records are copied in file order into an empty storage under their
//! original ids. MOVED tombstones, DELETED slots and padding are left behind,
//! and every copy is placed with the target's own strategy, so the target may
//! end up with different capacities than the source.

use super::record::FIRST_RECORD_OFFSET;
use super::storage::BlobStorage;
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::storage::paged::{AnyPagedStorage, PagedStorage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// Outcome of a compaction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub records_copied: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl CompactionReport {
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

impl<P: PagedStorage> BlobStorage<P> {
    /// Copy every live record into `target`, keeping ids
    ///
    /// `target` must be freshly created. The source should not be written to
    /// while the copy runs: each id is copied once, but a payload written
    /// after its record was copied does not reach the target.
    pub fn compact_into<Q: PagedStorage>(&self, target: &BlobStorage<Q>) -> Result<CompactionReport> {
        if target.records_allocated() != 0 || target.size_in_bytes() != FIRST_RECORD_OFFSET {
            return Err(Error::InvalidArgument(
                "compaction target must be an empty storage".to_string(),
            ));
        }

        let started = Instant::now();
        let bytes_before = self.size_in_bytes();
        let mut records_copied = 0u64;

        for record in self.records() {
            let record = record?;
            target.adopt(record.id, &record.payload)?;
            records_copied += 1;
        }

        // Ids of deleted records must stay retired in the target too.
        target.reserve_ids_up_to(self.next_record_id());
        target.flush()?;

        let report = CompactionReport {
            records_copied,
            bytes_before,
            bytes_after: target.size_in_bytes(),
        };
        info!(
            records = report.records_copied,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Compaction complete"
        );
        Ok(report)
    }

    /// Compact into a new storage file at `dest`, opened with `config`
    pub fn compact_to_path<T: AsRef<Path>>(
        &self,
        dest: T,
        config: &StorageConfig,
    ) -> Result<CompactionReport> {
        let dest = dest.as_ref();
        if dest.exists() {
            return Err(Error::InvalidArgument(format!(
                "compaction destination {} already exists",
                dest.display()
            )));
        }
        let target = BlobStorage::<AnyPagedStorage>::open(dest, config)?;
        let report = self.compact_into(&target)?;
        target.close()?;
        Ok(report)
    }
}
