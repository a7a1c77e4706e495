//! Free-space index for deleted slots
//!
//! Deleted slots are bucketed by capacity, lowest offset first within a
//! bucket. Reuse is best-fit: the smallest acceptable capacity wins, so a
//! lookup costs one range walk over distinct capacities rather than a pass
//! over every free slot.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Reclaimable slots grouped by payload capacity
#[derive(Debug, Default)]
pub struct FreeSpaceIndex {
    buckets: BTreeMap<u32, BTreeSet<u64>>,
    /// offset → capacity, to keep a re-freed offset in one bucket only
    slots: HashMap<u64, u32>,
    free_capacity: u64,
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a deleted slot available for reuse
    pub fn insert(&mut self, offset: u64, capacity: u32) {
        if let Some(previous) = self.slots.insert(offset, capacity) {
            self.remove_from_bucket(previous, offset);
            self.free_capacity -= previous as u64;
        }
        self.buckets.entry(capacity).or_default().insert(offset);
        self.free_capacity += capacity as u64;
    }

    /// Remove and return the smallest slot with capacity in `min..=max`
    /// accepted by `fits`
    ///
    /// Among slots of the chosen capacity the lowest offset is returned.
    pub fn take_best_fit<F>(&mut self, min: u32, max: u32, mut fits: F) -> Option<(u64, u32)>
    where
        F: FnMut(u32) -> bool,
    {
        if min > max {
            return None;
        }
        let capacity = self
            .buckets
            .range(min..=max)
            .map(|(&capacity, _)| capacity)
            .find(|&capacity| fits(capacity))?;
        let offsets = self.buckets.get_mut(&capacity)?;
        let offset = offsets.pop_first()?;
        if offsets.is_empty() {
            self.buckets.remove(&capacity);
        }
        self.slots.remove(&offset);
        self.free_capacity -= capacity as u64;
        Some((offset, capacity))
    }

    fn remove_from_bucket(&mut self, capacity: u32, offset: u64) {
        if let Some(offsets) = self.buckets.get_mut(&capacity) {
            offsets.remove(&offset);
            if offsets.is_empty() {
                self.buckets.remove(&capacity);
            }
        }
    }

    /// Number of reclaimable slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total payload capacity of reclaimable slots
    pub fn free_capacity(&self) -> u64 {
        self.free_capacity
    }
}
