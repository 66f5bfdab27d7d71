#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod cache;
pub mod device;
pub mod disk;
pub mod impls;
pub mod partition;

use alloc::string::String;
use core::fmt::Display;

pub use cache::SectorCache;
pub use device::{BackendId, DiskBackend, DiskDevice};
pub use disk::{Disk, DiskIo, MonotonicClock, ReadHook};
pub use partition::{Partition, PartitionChain, PartitionResolver};

/// Size in bytes of the fixed physical addressing unit. Devices with larger
/// logical sectors are still addressed in these units by everything above the
/// backend boundary.
pub const SECTOR_SIZE: u64 = 512;
pub const SECTOR_BITS: u8 = 9;

/// log2 of the number of physical sectors cached together as one unit.
pub const CACHE_UNIT_BITS: u8 = 6;
/// Physical sectors per cache unit.
pub const CACHE_UNIT_SECTORS: u64 = 1 << CACHE_UNIT_BITS;
/// Bytes per cache unit.
pub const CACHE_UNIT_BYTES: usize = (SECTOR_SIZE as usize) << CACHE_UNIT_BITS;

pub type DiskResult<T> = Result<T, DiskError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskError {
    /// No registered backend claimed the name.
    UnknownDevice(String),
    /// The device exists but the partition specification matched nothing.
    UnknownPartition(String),
    OutOfPartition,
    OutOfDisk(String),
    /// The backend reported a sector size the cache cannot handle.
    NotImplemented(u64),
    IoFailure(String),
    AllocationFailure,
}

impl Display for DiskError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnknownDevice(name) => write!(f, "disk `{name}' not found"),
            Self::UnknownPartition(name) => write!(f, "no such partition on `{name}'"),
            Self::OutOfPartition => {
                write!(f, "attempt to read or write outside of partition")
            }
            Self::OutOfDisk(name) => {
                write!(f, "attempt to read or write outside of disk `{name}'")
            }
            Self::NotImplemented(size) => {
                write!(f, "sector sizes of {size} bytes aren't supported yet")
            }
            Self::IoFailure(name) => write!(f, "I/O error on device `{name}'"),
            Self::AllocationFailure => write!(f, "out of memory"),
        }
    }
}
