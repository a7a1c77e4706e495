//! Record accounting
//!
//! All counters live behind one narrow mutex so that paired updates (a
//! relocation changes both capacity and payload totals, a delete changes the
//! live count and the deleted count) are always observed together.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Consistent snapshot of a storage's accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub records_allocated: u64,
    pub records_deleted: u64,
    pub records_relocated: u64,
    pub live_records: u64,
    pub live_payload_bytes: u64,
    pub live_capacity_bytes: u64,
    pub size_in_bytes: u64,
}

impl StorageStats {
    /// Live records as a share of all records ever allocated
    pub fn live_ratio(&self) -> f64 {
        if self.records_allocated == 0 {
            0.0
        } else {
            self.live_records as f64 / self.records_allocated as f64
        }
    }

    /// Live payload as a share of the storage size
    pub fn payload_utilization(&self) -> f64 {
        if self.size_in_bytes == 0 {
            0.0
        } else {
            self.live_payload_bytes as f64 / self.size_in_bytes as f64
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CounterState {
    pub records_allocated: u64,
    pub records_deleted: u64,
    pub records_relocated: u64,
    pub live_records: u64,
    pub live_payload_bytes: u64,
    pub live_capacity_bytes: u64,
}

/// Incrementally maintained counters
#[derive(Debug, Default)]
pub(crate) struct RecordCounters {
    state: Mutex<CounterState>,
}

impl RecordCounters {
    pub fn new(initial: CounterState) -> Self {
        let counters = Self {
            state: Mutex::new(initial),
        };
        counters.publish_gauges(&initial);
        counters
    }

    pub fn snapshot(&self) -> CounterState {
        *self.state.lock()
    }

    pub fn on_allocate(&self, capacity: u32, length: u32) {
        let mut state = self.state.lock();
        state.records_allocated += 1;
        state.live_records += 1;
        state.live_capacity_bytes += capacity as u64;
        state.live_payload_bytes += length as u64;
        self.publish_gauges(&state);
        counter!("streamblob_records_allocated_total").increment(1);
    }

    pub fn on_write_in_place(&self, old_length: u32, new_length: u32) {
        let mut state = self.state.lock();
        state.live_payload_bytes = state.live_payload_bytes - old_length as u64 + new_length as u64;
        self.publish_gauges(&state);
    }

    pub fn on_relocate(&self, old_capacity: u32, old_length: u32, new_capacity: u32, new_length: u32) {
        let mut state = self.state.lock();
        state.records_relocated += 1;
        state.live_capacity_bytes =
            state.live_capacity_bytes - old_capacity as u64 + new_capacity as u64;
        state.live_payload_bytes = state.live_payload_bytes - old_length as u64 + new_length as u64;
        self.publish_gauges(&state);
        counter!("streamblob_records_relocated_total").increment(1);
    }

    pub fn on_delete(&self, capacity: u32, length: u32) {
        let mut state = self.state.lock();
        state.records_deleted += 1;
        state.live_records -= 1;
        state.live_capacity_bytes -= capacity as u64;
        state.live_payload_bytes -= length as u64;
        self.publish_gauges(&state);
        counter!("streamblob_records_deleted_total").increment(1);
    }

    fn publish_gauges(&self, state: &CounterState) {
        gauge!("streamblob_live_records").set(state.live_records as f64);
        gauge!("streamblob_live_payload_bytes").set(state.live_payload_bytes as f64);
        gauge!("streamblob_live_capacity_bytes").set(state.live_capacity_bytes as f64);
    }
}

/// Register metric descriptions with whatever recorder is installed
pub fn describe_metrics() {
    describe_counter!(
        "streamblob_records_allocated_total",
        "Records allocated since the storage was created"
    );
    describe_counter!(
        "streamblob_records_relocated_total",
        "Records moved to a larger slot"
    );
    describe_counter!("streamblob_records_deleted_total", "Records deleted");
    describe_gauge!("streamblob_live_records", "Records currently live");
    describe_gauge!(
        "streamblob_live_payload_bytes",
        "Payload bytes held by live records"
    );
    describe_gauge!(
        "streamblob_live_capacity_bytes",
        "Capacity bytes reserved by live records"
    );
}
