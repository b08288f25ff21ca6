//! Lock-free parameter cache shared between host and server.
//!
//! One record per parameter. The host is the only writer of `pending` and
//! the only setter of `changed`; the server's draining loop is the only
//! clearer of `changed` and the only writer of `value`.

use crate::error::Result;
use crate::shared_memory::SharedRegion;
use std::sync::atomic::{AtomicU32, Ordering};

#[repr(C)]
pub struct ParamRecord {
    value: AtomicU32,
    pending: AtomicU32,
    changed: AtomicU32,
}

pub struct ParamCache {
    region: SharedRegion,
    capacity: usize,
}

impl ParamCache {
    fn region_len(capacity: usize) -> usize {
        capacity.max(1) * std::mem::size_of::<ParamRecord>()
    }

    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        Ok(Self {
            region: SharedRegion::create(name, Self::region_len(capacity))?,
            capacity,
        })
    }

    pub fn open(name: &str, capacity: usize) -> Result<Self> {
        Ok(Self {
            region: SharedRegion::open(name, Self::region_len(capacity))?,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn records(&self) -> &[ParamRecord] {
        // SAFETY: the region holds `capacity` records, is page aligned, and
        // zero bytes are valid atomics
        unsafe {
            std::slice::from_raw_parts(self.region.as_ptr() as *const ParamRecord, self.capacity)
        }
    }

    /// Host side: queue `value` for parameter `index`. Returns false when the
    /// index is outside the cache.
    pub fn write(&self, index: usize, value: f32) -> bool {
        let Some(record) = self.records().get(index) else {
            return false;
        };
        record.pending.store(value.to_bits(), Ordering::Relaxed);
        record.changed.store(1, Ordering::Release);
        true
    }

    /// Last value applied by the server (or seeded from the engine).
    pub fn value(&self, index: usize) -> Option<f32> {
        self.records()
            .get(index)
            .map(|r| f32::from_bits(r.value.load(Ordering::Acquire)))
    }

    pub fn is_pending(&self, index: usize) -> bool {
        self.records()
            .get(index)
            .is_some_and(|r| r.changed.load(Ordering::Acquire) != 0)
    }

    /// Server side: record the engine's current value.
    pub fn seed(&self, index: usize, value: f32) {
        if let Some(record) = self.records().get(index) {
            record.value.store(value.to_bits(), Ordering::Release);
        }
    }

    /// Server side: apply every pending update among the first `limit`
    /// records. The flag is consumed before `pending` is read, so a write
    /// racing the drain is seen now or on the next drain, never lost.
    pub fn drain(&self, limit: usize, mut apply: impl FnMut(usize, f32)) -> usize {
        let mut applied = 0;
        for (index, record) in self.records().iter().take(limit).enumerate() {
            if record.changed.swap(0, Ordering::AcqRel) == 0 {
                continue;
            }
            let value = f32::from_bits(record.pending.load(Ordering::Acquire));
            apply(index, value);
            record.value.store(value.to_bits(), Ordering::Release);
            applied += 1;
        }
        applied
    }
}
