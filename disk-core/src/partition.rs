use alloc::vec::Vec;

use crate::disk::{Disk, DiskIo};
use crate::DiskResult;

/// One level of containment. `start` is relative to the enclosing level (or
/// the whole device for the outermost), both fields in physical sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub start: u64,
    pub len: u64,
}

/// Nested partitions, innermost first. Address translation walks the levels
/// in order, adding each level's start; teardown is `Drop`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionChain {
    levels: Vec<Partition>,
}

impl PartitionChain {
    /// `levels` must be ordered innermost to outermost.
    pub fn from_levels(levels: Vec<Partition>) -> Self {
        Self { levels }
    }

    pub fn levels(&self) -> &[Partition] {
        &self.levels
    }

    /// Length of the innermost partition in physical sectors.
    pub fn len(&self) -> u64 {
        self.levels.first().map_or(0, |part| part.len)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Parses a partition specification and builds the chain, typically by
/// reading partition tables off the freshly opened device through `io`.
pub trait PartitionResolver {
    /// `Ok(None)` means the specification matched no partition.
    fn probe(
        &self,
        io: &mut DiskIo,
        disk: &mut Disk,
        spec: &str,
    ) -> DiskResult<Option<PartitionChain>>;
}
