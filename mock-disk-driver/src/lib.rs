//! In-memory backends, a controllable clock and a toy partition resolver for
//! exercising `disk-core` without real hardware.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use disk_core::{
    Disk, DiskBackend, DiskDevice, DiskError, DiskIo, DiskResult, MonotonicClock, Partition,
    PartitionChain, PartitionResolver, SECTOR_BITS,
};

pub use disk_core::impls::SystemClock;

/// A clock the test moves forward by hand.
#[derive(Clone)]
pub struct MockClock(Rc<Cell<u64>>);

impl MockClock {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(0)))
    }

    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for MockClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

struct RamDiskSpec {
    name: String,
    data: Rc<RefCell<Vec<u8>>>,
    id: u64,
    log_sector_size: u8,
}

/// Backend serving RAM-backed disks by name. The underlying byte storage is
/// handed back from `add_disk` so tests can seed and inspect it directly, and
/// every device transfer is counted.
pub struct RamDiskBackend {
    disks: Vec<RamDiskSpec>,
    next_id: u64,
    reads: Rc<Cell<u64>>,
    writes: Rc<Cell<u64>>,
}

impl RamDiskBackend {
    pub fn new() -> Self {
        Self {
            disks: Vec::new(),
            next_id: 0,
            reads: Rc::new(Cell::new(0)),
            writes: Rc::new(Cell::new(0)),
        }
    }

    /// A zero-filled disk of `sectors` 512-byte sectors.
    pub fn add_disk(&mut self, name: &str, sectors: u64) -> Rc<RefCell<Vec<u8>>> {
        self.add_disk_with_sector_size(name, sectors, SECTOR_BITS)
    }

    /// `sectors` counts the device's own logical sectors here.
    pub fn add_disk_with_sector_size(
        &mut self,
        name: &str,
        sectors: u64,
        log_sector_size: u8,
    ) -> Rc<RefCell<Vec<u8>>> {
        let data = Rc::new(RefCell::new(vec![0u8; (sectors << log_sector_size) as usize]));

        self.disks.push(RamDiskSpec {
            name: String::from(name),
            data: Rc::clone(&data),
            id: self.next_id,
            log_sector_size,
        });
        self.next_id += 1;

        data
    }

    /// Backend call counter for reads; shared with every device this backend
    /// hands out.
    pub fn reads(&self) -> Rc<Cell<u64>> {
        Rc::clone(&self.reads)
    }

    pub fn writes(&self) -> Rc<Cell<u64>> {
        Rc::clone(&self.writes)
    }
}

impl Default for RamDiskBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskBackend for RamDiskBackend {
    fn probe(&mut self, name: &str) -> DiskResult<Box<dyn DiskDevice>> {
        for spec in &self.disks {
            if spec.name == name {
                return Ok(Box::new(RamDisk {
                    name: spec.name.clone(),
                    data: Rc::clone(&spec.data),
                    id: spec.id,
                    log_sector_size: spec.log_sector_size,
                    reads: Rc::clone(&self.reads),
                    writes: Rc::clone(&self.writes),
                }));
            }
        }

        Err(DiskError::UnknownDevice(String::from(name)))
    }
}

pub struct RamDisk {
    name: String,
    data: Rc<RefCell<Vec<u8>>>,
    id: u64,
    log_sector_size: u8,
    reads: Rc<Cell<u64>>,
    writes: Rc<Cell<u64>>,
}

impl RamDisk {
    fn byte_range(&self, sector: u64, count: u64, total_bytes: usize) -> DiskResult<(usize, usize)> {
        let start = (sector << self.log_sector_size) as usize;
        let len = (count << self.log_sector_size) as usize;

        if start + len > total_bytes {
            return Err(DiskError::IoFailure(self.name.clone()));
        }

        Ok((start, len))
    }
}

impl DiskDevice for RamDisk {
    fn disk_id(&self) -> u64 {
        self.id
    }

    fn log_sector_size(&self) -> u8 {
        self.log_sector_size
    }

    fn total_sectors(&self) -> Option<u64> {
        Some((self.data.borrow().len() >> self.log_sector_size) as u64)
    }

    fn read(&mut self, sector: u64, count: u64, buffer: &mut [u8]) -> DiskResult<()> {
        self.reads.set(self.reads.get() + 1);

        let data = self.data.borrow();
        let (start, len) = self.byte_range(sector, count, data.len())?;
        buffer[..len].copy_from_slice(&data[start..start + len]);

        Ok(())
    }

    fn write(&mut self, sector: u64, count: u64, buffer: &[u8]) -> DiskResult<()> {
        self.writes.set(self.writes.get() + 1);

        let mut data = self.data.borrow_mut();
        let total = data.len();
        let (start, len) = self.byte_range(sector, count, total)?;
        data[start..start + len].copy_from_slice(&buffer[..len]);

        Ok(())
    }
}

/// Claims one name and then fails every transfer, for error-path tests.
pub struct BrokenDiskBackend {
    name: String,
    sectors: u64,
}

impl BrokenDiskBackend {
    pub fn new(name: &str, sectors: u64) -> Self {
        Self {
            name: String::from(name),
            sectors,
        }
    }
}

impl DiskBackend for BrokenDiskBackend {
    fn probe(&mut self, name: &str) -> DiskResult<Box<dyn DiskDevice>> {
        if name != self.name {
            return Err(DiskError::UnknownDevice(String::from(name)));
        }

        Ok(Box::new(BrokenDisk {
            name: self.name.clone(),
            sectors: self.sectors,
        }))
    }
}

struct BrokenDisk {
    name: String,
    sectors: u64,
}

impl DiskDevice for BrokenDisk {
    fn disk_id(&self) -> u64 {
        0
    }

    fn total_sectors(&self) -> Option<u64> {
        Some(self.sectors)
    }

    fn read(&mut self, _sector: u64, _count: u64, _buffer: &mut [u8]) -> DiskResult<()> {
        Err(DiskError::IoFailure(self.name.clone()))
    }

    fn write(&mut self, _sector: u64, _count: u64, _buffer: &[u8]) -> DiskResult<()> {
        Err(DiskError::IoFailure(self.name.clone()))
    }
}

/// Fails the probe itself with an I/O error, which must abort the whole open
/// rather than fall through to the next backend.
pub struct FailingProbeBackend {
    name: String,
}

impl FailingProbeBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
        }
    }
}

impl DiskBackend for FailingProbeBackend {
    fn probe(&mut self, name: &str) -> DiskResult<Box<dyn DiskDevice>> {
        if name == self.name {
            Err(DiskError::IoFailure(String::from(name)))
        } else {
            Err(DiskError::UnknownDevice(String::from(name)))
        }
    }
}

/// Number of entries in the toy partition table at sector 0.
pub const TABLE_ENTRIES: usize = 8;

/// Resolver for a toy partition table: sector 0 holds [`TABLE_ENTRIES`]
/// records of `{start: u64 le, len: u64 le}`; a zero length marks an empty
/// slot. Specifications are 1-based entry numbers, fdisk style. The table is
/// read back through the engine, so resolution itself exercises (and warms)
/// the cache.
pub struct SectorTableResolver;

fn read_u64_le(buffer: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

impl PartitionResolver for SectorTableResolver {
    fn probe(
        &self,
        io: &mut DiskIo,
        disk: &mut Disk,
        spec: &str,
    ) -> DiskResult<Option<PartitionChain>> {
        let index = match spec.parse::<usize>() {
            Ok(index) if (1..=TABLE_ENTRIES).contains(&index) => index - 1,
            _ => return Ok(None),
        };

        let mut table = [0u8; 512];
        io.read(disk, 0, 0, &mut table)?;

        let start = read_u64_le(&table, index * 16);
        let len = read_u64_le(&table, index * 16 + 8);

        if len == 0 {
            return Ok(None);
        }

        log::trace!(target: "disk", "table entry {spec}: start {start}, len {len}");

        Ok(Some(PartitionChain::from_levels(vec![Partition {
            start,
            len,
        }])))
    }
}

/// Writes entry `index` (1-based) of the toy table directly into the backing
/// storage of a RAM disk.
pub fn write_table_entry(data: &Rc<RefCell<Vec<u8>>>, index: usize, start: u64, len: u64) {
    assert!((1..=TABLE_ENTRIES).contains(&index));

    let offset = (index - 1) * 16;
    let mut data = data.borrow_mut();
    data[offset..offset + 8].copy_from_slice(&start.to_le_bytes());
    data[offset + 8..offset + 16].copy_from_slice(&len.to_le_bytes());
}

#[cfg(test)]
mod tests;
