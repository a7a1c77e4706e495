//! Behavioural suite run against every paged storage backend
//!
//! The engine must not be able to tell the backends apart, so the same tests
//! are generated once per `BackendKind`.

use std::collections::HashMap;
use std::path::Path;
use streamblob::config::{BackendKind, ReclaimPolicy, StorageConfig};
use streamblob::storage::{AnyPagedStorage, BlobStorage, RecordId, StrategyConfig, WriteOutcome};
use streamblob::Error;

fn open(path: &Path, config: &StorageConfig) -> BlobStorage<AnyPagedStorage> {
    BlobStorage::open(path, config).expect("Failed to open storage")
}

/// Tiny deterministic generator so failures are reproducible
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

fn payload(seed: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed as usize + i * 31) as u8).collect()
}

macro_rules! backend_suite {
    ($name:ident, $backend:expr) => {
        mod $name {
            use super::*;

            fn config() -> StorageConfig {
                StorageConfig::default()
                    .with_backend($backend)
                    .with_page_size(4096)
            }

            #[test]
            fn test_end_to_end_scenario() {
                let dir = tempfile::tempdir().expect("tempdir");
                let config = config().with_strategy(StrategyConfig::ExactFit);
                let storage = open(&dir.path().join("blobs.sb"), &config);

                let id = storage.allocate(&[0xAB; 10]).expect("allocate");
                assert_eq!(id, RecordId(1));
                assert_eq!(storage.record_info(id).expect("info").capacity, 10);
                assert_eq!(storage.records_relocated(), 0);

                // Same size: rewritten where it is
                let replaced = payload(3, 10);
                assert_eq!(storage.write(id, &replaced).expect("write"), WriteOutcome::InPlace);
                assert_eq!(storage.records_relocated(), 0);
                assert_eq!(storage.read(id).expect("read"), replaced);

                let grown = payload(7, 50);
                assert_eq!(storage.write(id, &grown).expect("write"), WriteOutcome::Relocated);
                assert_eq!(storage.records_relocated(), 1);
                assert_eq!(storage.read(RecordId(1)).expect("read"), grown);
                assert_eq!(storage.record_info(id).expect("info").capacity, 50);

                storage.delete(id).expect("delete");
                assert_eq!(storage.records_deleted(), 1);
                assert_eq!(storage.live_records_count(), 0);
                assert!(matches!(storage.read(id), Err(Error::NotFound(_))));
                assert!(matches!(storage.delete(id), Err(Error::NotFound(_))));
                println!("✓ end-to-end scenario on {:?}", $backend);
            }

            #[test]
            fn test_round_trip_sizes() {
                let dir = tempfile::tempdir().expect("tempdir");
                let storage = open(&dir.path().join("blobs.sb"), &config());

                // Empty, tiny, page-sized and multi-page payloads
                let sizes = [0usize, 1, 23, 24, 25, 4095, 4096, 4097, 20_000];
                let ids: Vec<(RecordId, Vec<u8>)> = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, &len)| {
                        let data = payload(i as u64, len);
                        (storage.allocate(&data).expect("allocate"), data)
                    })
                    .collect();

                for (id, data) in &ids {
                    assert_eq!(&storage.read(*id).expect("read"), data);
                    let info = storage.record_info(*id).expect("info");
                    assert!(info.payload_len <= info.capacity);
                }
                storage.verify().expect("verify");
            }

            #[test]
            fn test_identity_survives_relocations() {
                let dir = tempfile::tempdir().expect("tempdir");
                let config = config().with_strategy(StrategyConfig::PowerOfTwo { min_capacity: 16 });
                let storage = open(&dir.path().join("blobs.sb"), &config);

                let id = storage.allocate(b"seed").expect("allocate");
                let neighbour = storage.allocate(b"neighbour").expect("allocate");
                let mut relocations = 0;
                for len in [10usize, 16, 17, 100, 1000, 5000, 3] {
                    let data = payload(len as u64, len);
                    if storage.write(id, &data).expect("write") == WriteOutcome::Relocated {
                        relocations += 1;
                    }
                    assert_eq!(storage.read(id).expect("read"), data);
                }

                // 16 → 32 → 128 → 1024 → 8192
                assert_eq!(relocations, 4);
                assert_eq!(storage.records_relocated(), 4);
                assert_eq!(storage.read(neighbour).expect("read"), b"neighbour");
                assert_eq!(storage.records_allocated(), 2);
            }

            #[test]
            fn test_counters_match_model_and_scan() {
                let dir = tempfile::tempdir().expect("tempdir");
                let storage = open(&dir.path().join("blobs.sb"), &config());
                let mut model: HashMap<RecordId, Vec<u8>> = HashMap::new();
                let mut rng = Lcg(42);

                for step in 0..600u64 {
                    let ids: Vec<RecordId> = model.keys().copied().collect();
                    match rng.below(10) {
                        0..=4 => {
                            let data = payload(step, rng.below(700) as usize);
                            let id = storage.allocate(&data).expect("allocate");
                            model.insert(id, data);
                        }
                        5..=7 if !ids.is_empty() => {
                            let id = ids[rng.below(ids.len() as u64) as usize];
                            let data = payload(step, rng.below(1500) as usize);
                            storage.write(id, &data).expect("write");
                            model.insert(id, data);
                        }
                        8..=9 if !ids.is_empty() => {
                            let id = ids[rng.below(ids.len() as u64) as usize];
                            storage.delete(id).expect("delete");
                            model.remove(&id);
                        }
                        _ => {}
                    }
                }

                assert_eq!(storage.live_records_count(), model.len() as u64);
                let payload_bytes: u64 = model.values().map(|v| v.len() as u64).sum();
                assert_eq!(storage.total_live_records_payload_bytes(), payload_bytes);
                assert!(storage.total_live_records_capacity_bytes() >= payload_bytes);

                let report = storage.verify().expect("verify");
                assert_eq!(report.actual, model.len() as u64);
                assert_eq!(report.moved, storage.records_relocated());
                assert_eq!(report.deleted, storage.records_deleted());

                let mut scanned = 0;
                storage
                    .for_each_record(|id, bytes| {
                        assert_eq!(model.get(&id).map(Vec::as_slice), Some(bytes));
                        scanned += 1;
                        true
                    })
                    .expect("scan");
                assert_eq!(scanned, model.len());
            }

            #[test]
            fn test_reopen_persists_records_and_counters() {
                let dir = tempfile::tempdir().expect("tempdir");
                let path = dir.path().join("blobs.sb");
                let config = config();

                let (kept, gone, stats) = {
                    let storage = open(&path, &config);
                    let kept = storage.allocate(&payload(1, 300)).expect("allocate");
                    let gone = storage.allocate(&payload(2, 50)).expect("allocate");
                    storage.write(kept, &payload(3, 9000)).expect("write");
                    storage.delete(gone).expect("delete");
                    let stats = storage.stats();
                    storage.close().expect("close");
                    (kept, gone, stats)
                };

                let storage = open(&path, &config);
                assert_eq!(storage.stats(), stats);
                assert_eq!(storage.read(kept).expect("read"), payload(3, 9000));
                assert!(matches!(storage.read(gone), Err(Error::NotFound(_))));
                // Deleted ids are never reissued
                assert_eq!(storage.allocate(b"fresh").expect("allocate"), RecordId(3));
                storage.verify().expect("verify");
            }

            #[test]
            fn test_capacity_exceeded() {
                let dir = tempfile::tempdir().expect("tempdir");
                let mut config = config().with_strategy(StrategyConfig::PowerOfTwo { min_capacity: 8 });
                config.max_record_capacity = 1024;
                let storage = open(&dir.path().join("blobs.sb"), &config);

                let id = storage.allocate(&[1u8; 1000]).expect("allocate");
                assert!(matches!(
                    storage.allocate(&[1u8; 1025]),
                    Err(Error::CapacityExceeded(_))
                ));
                assert!(matches!(
                    storage.write(id, &[1u8; 2000]),
                    Err(Error::CapacityExceeded(_))
                ));
                // The failed write left the record untouched
                assert_eq!(storage.read(id).expect("read"), vec![1u8; 1000]);
                assert_eq!(storage.live_records_count(), 1);
            }

            #[test]
            fn test_free_list_reuse() {
                let dir = tempfile::tempdir().expect("tempdir");
                let config = config()
                    .with_strategy(StrategyConfig::PowerOfTwo { min_capacity: 64 })
                    .with_reclaim(ReclaimPolicy::FreeList);
                let storage = open(&dir.path().join("blobs.sb"), &config);

                let ids: Vec<RecordId> = (0..10)
                    .map(|i| storage.allocate(&payload(i, 200)).expect("allocate"))
                    .collect();
                for id in ids.iter().step_by(2) {
                    storage.delete(*id).expect("delete");
                }
                let size = storage.size_in_bytes();

                for i in 0..5 {
                    storage.allocate(&payload(100 + i, 150)).expect("allocate");
                }
                assert_eq!(storage.size_in_bytes(), size);
                assert_eq!(storage.reclaimable_slots(), 0);
                storage.verify().expect("verify");
            }

            #[test]
            fn test_compaction_preserves_ids() {
                let dir = tempfile::tempdir().expect("tempdir");
                let config = config().with_strategy(StrategyConfig::ExactFit);
                let storage = open(&dir.path().join("blobs.sb"), &config);

                let mut expected = Vec::new();
                for i in 0..50u64 {
                    let id = storage.allocate(&payload(i, 40)).expect("allocate");
                    match i % 4 {
                        0 => storage.delete(id).expect("delete"),
                        1 => {
                            storage.write(id, &payload(i, 400)).expect("write");
                            expected.push((id, payload(i, 400)));
                        }
                        _ => expected.push((id, payload(i, 40))),
                    }
                }

                let dest = dir.path().join("compacted.sb");
                let report = storage.compact_to_path(&dest, &config).expect("compact");
                assert_eq!(report.records_copied, expected.len() as u64);
                assert!(report.bytes_reclaimed() > 0);

                let compacted = open(&dest, &config);
                for (id, data) in &expected {
                    assert_eq!(&compacted.read(*id).expect("read"), data);
                }
                let report = compacted.verify().expect("verify");
                assert_eq!(report.moved, 0);
                assert_eq!(report.deleted, 0);
                assert_eq!(compacted.allocate(b"after").expect("allocate"), RecordId(51));
            }
        }
    };
}

backend_suite!(mutex_backend, BackendKind::Mutex);
backend_suite!(lock_free_backend, BackendKind::LockFree);
