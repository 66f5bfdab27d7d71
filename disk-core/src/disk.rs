use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, trace};

use crate::cache::SectorCache;
use crate::device::{BackendId, BackendRegistry, DiskBackend, DiskDevice};
use crate::partition::{PartitionChain, PartitionResolver};
use crate::{
    DiskError, DiskResult, CACHE_UNIT_BITS, CACHE_UNIT_BYTES, CACHE_UNIT_SECTORS, SECTOR_BITS,
    SECTOR_SIZE,
};

/// Milliseconds of quiet after a close before every cached sector is presumed
/// stale. Removable media may have been swapped during the gap.
const CACHE_TIMEOUT_MS: u64 = 2_000;

pub trait MonotonicClock {
    fn now_ms(&self) -> u64;
}

/// Read observation callback: `(physical_sector, offset_in_sector, len)`.
/// Called once per physical sector delivered by a read, in ascending order.
pub type ReadHook = Box<dyn FnMut(u64, u64, u64)>;

/// An open disk, possibly scoped to a partition. Obtained from
/// [`DiskIo::open`] and exclusively owned by the caller until dropped or
/// passed to [`DiskIo::close`].
pub struct Disk {
    name: String,
    backend: BackendId,
    device: Box<dyn DiskDevice>,
    partition: Option<PartitionChain>,
    log_sector_size: u8,
    total_sectors: Option<u64>,
    read_hook: Option<ReadHook>,
}

impl Disk {
    /// The device part of the name this disk was opened with, escapes intact.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition(&self) -> Option<&PartitionChain> {
        self.partition.as_ref()
    }

    pub fn log_sector_size(&self) -> u8 {
        self.log_sector_size
    }

    /// Usable extent in physical sectors: the innermost partition's length,
    /// else the whole device, else unknown.
    pub fn size(&self) -> Option<u64> {
        if let Some(chain) = &self.partition {
            return Some(chain.len());
        }

        self.total_physical()
    }

    pub fn set_read_hook(&mut self, hook: ReadHook) {
        self.read_hook = Some(hook);
    }

    pub fn clear_read_hook(&mut self) {
        self.read_hook = None;
    }

    /// Device extent in physical sectors, if known.
    fn total_physical(&self) -> Option<u64> {
        self.total_sectors
            .map(|total| total << (self.log_sector_size - SECTOR_BITS))
    }

    /// A physical sector number in the device's own addressing units.
    fn transform_sector(&self, sector: u64) -> u64 {
        sector >> (self.log_sector_size - SECTOR_BITS)
    }
}

impl core::fmt::Debug for Disk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Disk")
            .field("name", &self.name)
            .field("partition", &self.partition)
            .field("log_sector_size", &self.log_sector_size)
            .field("total_sectors", &self.total_sectors)
            .finish()
    }
}

/// The disk subsystem: backend registry, partition resolution and the shared
/// sector cache. All handles opened through one `DiskIo` share its cache,
/// keyed by backend and device id, so partitions of one disk alias cached
/// sectors on purpose.
pub struct DiskIo {
    registry: BackendRegistry,
    cache: SectorCache,
    resolver: Option<Box<dyn PartitionResolver>>,
    clock: Box<dyn MonotonicClock>,
    last_use_ms: u64,
}

impl DiskIo {
    pub fn new(clock: Box<dyn MonotonicClock>) -> Self {
        Self {
            registry: BackendRegistry::new(),
            cache: SectorCache::new(),
            resolver: None,
            clock,
            last_use_ms: 0,
        }
    }

    pub fn register(&mut self, backend: Box<dyn DiskBackend>) -> BackendId {
        self.registry.register(backend)
    }

    pub fn unregister(&mut self, id: BackendId) {
        self.registry.unregister(id);
    }

    pub fn set_partition_resolver(&mut self, resolver: Box<dyn PartitionResolver>) {
        self.resolver = Some(resolver);
    }

    pub fn invalidate_all(&mut self) {
        self.cache.invalidate_all();
    }

    /// `(hits, misses)` of the shared sector cache.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    /// Open `<device>[,<partition-spec>]`. A `\,` escape does not split the
    /// name. Backends are probed newest-registered first; a probe returning
    /// `UnknownDevice` passes the name along, anything else aborts.
    pub fn open(&mut self, name: &str) -> DiskResult<Disk> {
        trace!(target: "disk", "opening `{name}'");

        match self.open_inner(name) {
            Ok(disk) => Ok(disk),
            Err(err) => {
                debug!(target: "disk", "opening `{name}' failed: {err}");
                Err(err)
            }
        }
    }

    fn open_inner(&mut self, name: &str) -> DiskResult<Disk> {
        let (device_name, part_spec) = split_name(name);

        let (backend, device) = self.probe_backends(device_name, name)?;

        let log_sector_size = device.log_sector_size();
        if log_sector_size < SECTOR_BITS || log_sector_size > SECTOR_BITS + CACHE_UNIT_BITS {
            return Err(DiskError::NotImplemented(1u64 << log_sector_size));
        }

        let mut disk = Disk {
            name: String::from(device_name),
            backend,
            total_sectors: device.total_sectors(),
            device,
            partition: None,
            log_sector_size,
            read_hook: None,
        };

        if let Some(spec) = part_spec {
            // The resolver reads partition tables back through `self`, so it
            // has to be taken out for the duration of the probe.
            let resolver = self.resolver.take();
            let probed = match &resolver {
                Some(resolver) => resolver.probe(self, &mut disk, spec),
                None => Ok(None),
            };
            self.resolver = resolver;

            match probed? {
                Some(chain) => disk.partition = Some(chain),
                None => return Err(DiskError::UnknownPartition(String::from(name))),
            }
        }

        // Anything cached across a long quiet period may describe media that
        // has since been removed or swapped.
        let now = self.clock.now_ms();
        if now > self.last_use_ms + CACHE_TIMEOUT_MS {
            self.cache.invalidate_all();
        }
        self.last_use_ms = now;

        Ok(disk)
    }

    fn probe_backends(
        &mut self,
        device_name: &str,
        full_name: &str,
    ) -> DiskResult<(BackendId, Box<dyn DiskDevice>)> {
        for (id, backend) in self.registry.iter_mut() {
            match backend.probe(device_name) {
                Ok(device) => return Ok((id, device)),
                Err(DiskError::UnknownDevice(_)) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(DiskError::UnknownDevice(String::from(full_name)))
    }

    /// Dropping the disk closes it too; going through here additionally
    /// resets the staleness timer, as an explicit close marks a moment after
    /// which the media may change.
    pub fn close(&mut self, disk: Disk) {
        trace!(target: "disk", "closing `{}'", disk.name);

        self.last_use_ms = self.clock.now_ms();
        drop(disk);
    }

    /// Read `buf.len()` bytes starting `offset` bytes into the
    /// partition-relative `sector`. Neither needs to be aligned to anything.
    pub fn read(&mut self, disk: &mut Disk, sector: u64, offset: u64, buf: &mut [u8]) -> DiskResult<()> {
        let (abs_sector, offset) = adjust_range(disk, sector, offset, buf.len()).map_err(|err| {
            debug!(target: "disk", "read out of range: sector {sector:#x} ({err})");
            err
        })?;

        self.read_adjusted(disk, abs_sector, offset, buf)?;

        // Replay what was delivered, one physical sector at a time.
        if let Some(hook) = disk.read_hook.as_mut() {
            let mut sector = abs_sector;
            let mut offset = offset;
            let mut left = buf.len() as u64;

            while left > 0 {
                let chunk = (SECTOR_SIZE - offset).min(left);
                hook(sector, offset, chunk);
                sector += 1;
                left -= chunk;
                offset = 0;
            }
        }

        Ok(())
    }

    /// The read engine proper. `sector` is absolute on the device; the write
    /// engine also comes through here to read raw sectors with no partition
    /// translation in the way.
    fn read_adjusted(
        &mut self,
        disk: &mut Disk,
        mut sector: u64,
        mut offset: u64,
        buf: &mut [u8],
    ) -> DiskResult<()> {
        let mut pos = 0usize;
        let mut size = buf.len();

        // Head fragment, up to the first cache unit boundary.
        if offset != 0 || sector & (CACHE_UNIT_SECTORS - 1) != 0 {
            let start_sector = sector & !(CACHE_UNIT_SECTORS - 1);
            let skew = (sector - start_sector) << SECTOR_BITS;
            let len = (CACHE_UNIT_BYTES as u64 - skew - offset).min(size as u64) as usize;

            self.read_small(disk, start_sector, skew + offset, &mut buf[..len])?;

            pos += len;
            size -= len;
            offset += len as u64;
            sector += offset >> SECTOR_BITS;
            offset &= SECTOR_SIZE - 1;
        }

        // Bulk middle: whole cache units. Scan forward for the first cached
        // unit and satisfy the run of misses before it with a single backend
        // call (agglomeration), storing each unit as it lands.
        while size >= CACHE_UNIT_BYTES {
            let units_left = (size >> (SECTOR_BITS + CACHE_UNIT_BITS)) as u64;
            let disk_id = disk.device.disk_id();
            let mut hit = None;

            for unit in 0..units_left {
                let unit_sector = sector + (unit << CACHE_UNIT_BITS);
                if let Some(data) = self.cache.fetch(disk.backend, disk_id, unit_sector) {
                    // Copy now; storing the miss run below may evict this slot.
                    let at = pos + ((unit as usize) << (CACHE_UNIT_BITS + SECTOR_BITS));
                    buf[at..at + CACHE_UNIT_BYTES].copy_from_slice(data);
                    hit = Some(unit);
                    break;
                }
            }

            let run = hit.unwrap_or(units_left);

            if run > 0 {
                let bytes = (run as usize) << (CACHE_UNIT_BITS + SECTOR_BITS);
                let count = run << (CACHE_UNIT_BITS + SECTOR_BITS - disk.log_sector_size);

                disk.device
                    .read(disk.transform_sector(sector), count, &mut buf[pos..pos + bytes])?;

                for unit in 0..run {
                    let at = pos + ((unit as usize) << (CACHE_UNIT_BITS + SECTOR_BITS));
                    let stored = self.cache.store(
                        disk.backend,
                        disk_id,
                        sector + (unit << CACHE_UNIT_BITS),
                        &buf[at..at + CACHE_UNIT_BYTES],
                    );
                    if stored.is_err() {
                        break;
                    }
                }

                sector += run << CACHE_UNIT_BITS;
                pos += bytes;
                size -= bytes;
            }

            if hit.is_some() {
                sector += CACHE_UNIT_SECTORS;
                pos += CACHE_UNIT_BYTES;
                size -= CACHE_UNIT_BYTES;
            }
        }

        // Tail fragment.
        if size > 0 {
            self.read_small(disk, sector, 0, &mut buf[pos..])?;
        }

        Ok(())
    }

    /// One fragment smaller than a cache unit and not crossing a unit
    /// boundary. `sector` is absolute and unit-aligned; `offset` is the byte
    /// position inside the unit.
    fn read_small(
        &mut self,
        disk: &mut Disk,
        sector: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> DiskResult<()> {
        let disk_id = disk.device.disk_id();

        if let Some(data) = self.cache.fetch(disk.backend, disk_id, sector) {
            let offset = offset as usize;
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
            return Ok(());
        }

        // Read the whole unit so the rest of it lands in the cache, unless
        // the unit would run past the end of the device. Failure here is not
        // final; the uncached path below still gets its chance.
        let whole_unit_fits = disk
            .total_physical()
            .map_or(true, |total| sector + CACHE_UNIT_SECTORS < total);

        if whole_unit_fits {
            if let Some(mut unit) = try_alloc(CACHE_UNIT_BYTES) {
                let count = 1u64 << (CACHE_UNIT_BITS + SECTOR_BITS - disk.log_sector_size);

                if disk
                    .device
                    .read(disk.transform_sector(sector), count, &mut unit)
                    .is_ok()
                {
                    let offset = offset as usize;
                    buf.copy_from_slice(&unit[offset..offset + buf.len()]);

                    if let Err(err) = self.cache.store(disk.backend, disk_id, sector, &unit) {
                        trace!(target: "disk", "cache store failed: {err}");
                    }

                    return Ok(());
                }
            }
        }

        // Read only the bytes actually needed, sized and aligned to the
        // device's logical sector size.
        let log = disk.log_sector_size;
        let sector = sector + (offset >> SECTOR_BITS);
        let aligned = sector & !((1u64 << (log - SECTOR_BITS)) - 1);
        let offset = (offset & (SECTOR_SIZE - 1)) + ((sector - aligned) << SECTOR_BITS);
        let num = (buf.len() as u64 + offset + (1u64 << log) - 1) >> log;

        let mut tmp = try_alloc((num << log) as usize).ok_or(DiskError::AllocationFailure)?;

        if let Err(err) = disk
            .device
            .read(disk.transform_sector(aligned), num, &mut tmp)
        {
            debug!(target: "disk", "`{}' read failed", disk.name);
            return Err(err);
        }

        let offset = offset as usize;
        buf.copy_from_slice(&tmp[offset..offset + buf.len()]);

        Ok(())
    }

    /// Write `buf.len()` bytes starting `offset` bytes into the
    /// partition-relative `sector`. Writes are never cached; every touched
    /// sector's cache entry is dropped instead.
    pub fn write(&mut self, disk: &mut Disk, sector: u64, offset: u64, buf: &[u8]) -> DiskResult<()> {
        trace!(target: "disk", "writing `{}'", disk.name);

        let (abs_sector, offset) = adjust_range(disk, sector, offset, buf.len())?;

        let log = disk.log_sector_size;
        let logical_bytes = 1usize << log;
        // Physical sectors per logical sector.
        let logical_units = 1u64 << (log - SECTOR_BITS);

        let mut sector = abs_sector & !(logical_units - 1);
        let mut skew = (offset + ((abs_sector - sector) << SECTOR_BITS)) as usize;
        let mut pos = 0usize;
        let mut size = buf.len();
        let disk_id = disk.device.disk_id();

        while size > 0 {
            if skew != 0 || size < logical_bytes {
                // Read-modify-write one whole logical sector. The sector is
                // already absolute, so the read skips partition translation.
                let mut tmp = try_alloc(logical_bytes).ok_or(DiskError::AllocationFailure)?;
                self.read_adjusted(disk, sector, 0, &mut tmp)?;

                let len = (logical_bytes - skew).min(size);
                tmp[skew..skew + len].copy_from_slice(&buf[pos..pos + len]);

                self.cache.invalidate(disk.backend, disk_id, sector);

                disk.device.write(disk.transform_sector(sector), 1, &tmp)?;

                sector += logical_units;
                pos += len;
                size -= len;
                skew = 0;
            } else {
                let len = size & !(logical_bytes - 1);
                let count = (size >> log) as u64;

                disk.device
                    .write(disk.transform_sector(sector), count, &buf[pos..pos + len])?;

                for _ in 0..count {
                    self.cache.invalidate(disk.backend, disk_id, sector);
                    sector += logical_units;
                }

                pos += len;
                size -= len;
            }
        }

        Ok(())
    }
}

/// Makes a partition-relative range device-absolute: folds `offset` into
/// `sector`, walks the partition chain innermost to outermost checking bounds
/// at every level, then checks the device extent. Every read and write passes
/// through here before the cache or a backend sees the range.
fn adjust_range(disk: &Disk, sector: u64, offset: u64, size: usize) -> DiskResult<(u64, u64)> {
    let mut sector = sector + (offset >> SECTOR_BITS);
    let offset = offset & (SECTOR_SIZE - 1);
    let units_needed = (offset + size as u64 + SECTOR_SIZE - 1) >> SECTOR_BITS;

    if let Some(chain) = &disk.partition {
        for part in chain.levels() {
            if sector >= part.len || part.len - sector < units_needed {
                return Err(DiskError::OutOfPartition);
            }
            sector += part.start;
        }
    }

    if let Some(total) = disk.total_physical() {
        if sector >= total || units_needed > total - sector {
            return Err(DiskError::OutOfDisk(disk.name.clone()));
        }
    }

    Ok((sector, offset))
}

/// Location of the first ',' not escaped by a '\'. Escapes stay in the device
/// part; unescaping is the backend's business.
fn split_name(name: &str) -> (&str, Option<&str>) {
    let bytes = name.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() && bytes[i + 1] == b',' => i += 2,
            b',' => return (&name[..i], Some(&name[i + 1..])),
            _ => i += 1,
        }
    }

    (name, None)
}

fn try_alloc(len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    if buf.try_reserve_exact(len).is_err() {
        return None;
    }

    buf.resize(len, 0);
    Some(buf)
}
