use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::device::BackendId;
use crate::{DiskError, DiskResult, CACHE_UNIT_BITS, CACHE_UNIT_BYTES, CACHE_UNIT_SECTORS};

/// Number of slots in the direct-mapped table.
const SLOT_COUNT: usize = 1021;

// Spreading multipliers for the slot index.
const DEV_MUL: u64 = 524_287;
const DISK_MUL: u64 = 2_606_459;

#[derive(Default)]
struct CacheSlot {
    dev_id: u32,
    disk_id: u64,
    sector: u64,
    data: Option<Box<[u8]>>,
}

impl CacheSlot {
    fn matches(&self, dev_id: BackendId, disk_id: u64, sector: u64) -> bool {
        self.data.is_some()
            && self.dev_id == dev_id.0
            && self.disk_id == disk_id
            && self.sector == sector
    }
}

/// Direct-mapped table of cache-unit-sized sector buffers. An index collision
/// silently evicts the previous occupant; there is no chaining. The borrow
/// returned by `fetch` is what keeps a slot alive while the caller copies out
/// of it, so no per-slot lock flag exists.
pub struct SectorCache {
    slots: Vec<CacheSlot>,
    hits: u64,
    misses: u64,
}

impl SectorCache {
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(SLOT_COUNT, CacheSlot::default);

        Self {
            slots,
            hits: 0,
            misses: 0,
        }
    }

    fn index(dev_id: BackendId, disk_id: u64, sector: u64) -> usize {
        let mixed = (dev_id.0 as u64)
            .wrapping_mul(DEV_MUL)
            .wrapping_add(disk_id.wrapping_mul(DISK_MUL))
            .wrapping_add(sector >> CACHE_UNIT_BITS);

        (mixed % SLOT_COUNT as u64) as usize
    }

    /// Look up one cache unit. `sector` must be unit-aligned.
    pub fn fetch(&mut self, dev_id: BackendId, disk_id: u64, sector: u64) -> Option<&[u8]> {
        let index = Self::index(dev_id, disk_id, sector);

        if self.slots[index].matches(dev_id, disk_id, sector) {
            self.hits += 1;
            self.slots[index].data.as_deref()
        } else {
            self.misses += 1;
            None
        }
    }

    /// Install one unit, evicting whatever occupied the slot. `data` must be
    /// exactly one cache unit. On allocation failure the slot is left empty
    /// and the caller carries on uncached.
    pub fn store(
        &mut self,
        dev_id: BackendId,
        disk_id: u64,
        sector: u64,
        data: &[u8],
    ) -> DiskResult<()> {
        debug_assert_eq!(data.len(), CACHE_UNIT_BYTES);
        debug_assert_eq!(sector & (CACHE_UNIT_SECTORS - 1), 0);

        let slot = &mut self.slots[Self::index(dev_id, disk_id, sector)];
        slot.data = None;

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(CACHE_UNIT_BYTES).is_err() {
            return Err(DiskError::AllocationFailure);
        }
        buffer.extend_from_slice(data);

        slot.data = Some(buffer.into_boxed_slice());
        slot.dev_id = dev_id.0;
        slot.disk_id = disk_id;
        slot.sector = sector;

        Ok(())
    }

    /// Drop the unit containing `sector`, if it is cached.
    pub fn invalidate(&mut self, dev_id: BackendId, disk_id: u64, sector: u64) {
        let sector = sector & !(CACHE_UNIT_SECTORS - 1);
        let index = Self::index(dev_id, disk_id, sector);

        if self.slots[index].matches(dev_id, disk_id, sector) {
            self.slots[index].data = None;
        }
    }

    pub fn invalidate_all(&mut self) {
        for slot in &mut self.slots {
            slot.data = None;
        }
    }

    /// `(hits, misses)` since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl Default for SectorCache {
    fn default() -> Self {
        Self::new()
    }
}
