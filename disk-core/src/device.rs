use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::DiskResult;

/// Identity of a registered backend. Doubles as the device-type half of the
/// sector cache key, so devices of unrelated families never alias cache slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendId(pub u32);

/// An open device produced by a successful probe. Sector and count arguments
/// are in the device's own logical sector units. Closing the device is `Drop`.
pub trait DiskDevice {
    /// Distinguishes devices of the same family in the sector cache. Two
    /// opens of the same underlying device must report the same id, so that
    /// partitions of one disk share cached sectors.
    fn disk_id(&self) -> u64;

    /// log2 of the device's addressing granularity in bytes.
    fn log_sector_size(&self) -> u8 {
        crate::SECTOR_BITS
    }

    /// Total extent in logical sectors, if the device knows it.
    fn total_sectors(&self) -> Option<u64>;

    fn read(&mut self, sector: u64, count: u64, buffer: &mut [u8]) -> DiskResult<()>;

    fn write(&mut self, sector: u64, count: u64, buffer: &[u8]) -> DiskResult<()>;
}

/// A device family that can claim names.
pub trait DiskBackend {
    /// Try to open `name`. `Err(UnknownDevice)` means the name belongs to no
    /// device of this family and probing continues with the next backend;
    /// any other error aborts the open. Escaped separators (`\,`) reach the
    /// backend as written.
    fn probe(&mut self, name: &str) -> DiskResult<Box<dyn DiskDevice>>;
}

pub(crate) struct BackendRegistry {
    entries: Vec<(BackendId, Box<dyn DiskBackend>)>,
    next_id: u32,
}

impl BackendRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    /// The most recently registered backend probes first.
    pub(crate) fn register(&mut self, backend: Box<dyn DiskBackend>) -> BackendId {
        let id = BackendId(self.next_id);
        self.next_id += 1;
        self.entries.insert(0, (id, backend));
        id
    }

    pub(crate) fn unregister(&mut self, id: BackendId) {
        self.entries.retain(|(entry, _)| *entry != id);
    }

    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (BackendId, &mut Box<dyn DiskBackend>)> {
        self.entries.iter_mut().map(|(id, backend)| (*id, backend))
    }
}
