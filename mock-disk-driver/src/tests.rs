use std::cell::{Cell, RefCell};
use std::rc::Rc;

use disk_core::{DiskError, DiskIo, CACHE_UNIT_BYTES};

use super::*;

struct Harness {
    io: DiskIo,
    clock: MockClock,
    data: Rc<RefCell<Vec<u8>>>,
    reads: Rc<Cell<u64>>,
    writes: Rc<Cell<u64>>,
}

fn harness(sectors: u64) -> Harness {
    let clock = MockClock::new();
    let mut io = DiskIo::new(Box::new(clock.clone()));

    let mut backend = RamDiskBackend::new();
    let data = backend.add_disk("ram0", sectors);
    let reads = backend.reads();
    let writes = backend.writes();
    io.register(Box::new(backend));

    Harness {
        io,
        clock,
        data,
        reads,
        writes,
    }
}

fn fill_pattern(data: &Rc<RefCell<Vec<u8>>>) {
    for (i, byte) in data.borrow_mut().iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
}

#[test]
fn aligned_write_then_read_round_trips() {
    let mut h = harness(256);
    let mut disk = h.io.open("ram0").unwrap();

    let payload: Vec<u8> = (0..1024).map(|i| (i * 7 % 256) as u8).collect();
    h.io.write(&mut disk, 3, 0, &payload).unwrap();

    let mut buf = vec![0u8; 1024];
    h.io.read(&mut disk, 3, 0, &mut buf).unwrap();

    assert_eq!(buf, payload);
}

#[test]
fn unaligned_write_preserves_neighboring_bytes() {
    let mut h = harness(256);
    h.data.borrow_mut().fill(0xAA);
    let mut disk = h.io.open("ram0").unwrap();

    let payload: Vec<u8> = (0..700).map(|i| (i % 256) as u8).collect();
    h.io.write(&mut disk, 0, 100, &payload).unwrap();

    {
        let data = h.data.borrow();
        assert!(data[..100].iter().all(|&b| b == 0xAA));
        assert_eq!(&data[100..800], &payload[..]);
        assert!(data[800..1024].iter().all(|&b| b == 0xAA));
    }

    let mut buf = vec![0u8; 700];
    h.io.read(&mut disk, 0, 100, &mut buf).unwrap();
    assert_eq!(buf, payload);
}

#[test]
fn cached_read_returns_identical_bytes_without_backend_call() {
    let mut h = harness(256);
    fill_pattern(&h.data);
    let mut disk = h.io.open("ram0").unwrap();

    let mut cold = [0u8; 512];
    h.io.read(&mut disk, 5, 0, &mut cold).unwrap();
    assert_eq!(h.reads.get(), 1);

    let mut warm = [0u8; 512];
    h.io.read(&mut disk, 5, 0, &mut warm).unwrap();
    assert_eq!(h.reads.get(), 1);
    assert_eq!(warm, cold);

    // The cache really is serving these bytes: a change made behind its back
    // stays invisible until it is dropped.
    h.data.borrow_mut()[5 * 512..6 * 512].fill(0xEE);
    h.io.read(&mut disk, 5, 0, &mut warm).unwrap();
    assert_eq!(warm, cold);

    h.io.invalidate_all();
    h.io.read(&mut disk, 5, 0, &mut warm).unwrap();
    assert_eq!(warm, [0xEE; 512]);
}

#[test]
fn write_invalidates_cached_sectors() {
    let mut h = harness(256);
    fill_pattern(&h.data);
    let mut disk = h.io.open("ram0").unwrap();

    let mut before = [0u8; 512];
    h.io.read(&mut disk, 2, 0, &mut before).unwrap();

    h.io.write(&mut disk, 2, 0, &[0x77; 512]).unwrap();

    let mut after = [0u8; 512];
    h.io.read(&mut disk, 2, 0, &mut after).unwrap();
    assert_eq!(after, [0x77; 512]);
}

#[test]
fn out_of_range_performs_no_backend_call() {
    let mut h = harness(100);
    let mut disk = h.io.open("ram0").unwrap();

    let mut buf = [0u8; 512];
    assert_eq!(
        h.io.read(&mut disk, 100, 0, &mut buf).unwrap_err(),
        DiskError::OutOfDisk(String::from("ram0"))
    );
    assert_eq!(
        h.io.write(&mut disk, 99, 0, &[0u8; 1024]).unwrap_err(),
        DiskError::OutOfDisk(String::from("ram0"))
    );

    assert_eq!(h.reads.get(), 0);
    assert_eq!(h.writes.get(), 0);
}

#[test]
fn partition_open_translates_and_bounds_checks() {
    let mut h = harness(256);
    fill_pattern(&h.data);
    write_table_entry(&h.data, 1, 10, 20);
    h.io.set_partition_resolver(Box::new(SectorTableResolver));

    let mut disk = h.io.open("ram0,1").unwrap();
    assert_eq!(disk.name(), "ram0");
    assert_eq!(disk.size(), Some(20));

    let mut buf = [0u8; 512];
    h.io.read(&mut disk, 0, 0, &mut buf).unwrap();
    assert_eq!(&buf[..], &h.data.borrow()[10 * 512..11 * 512]);

    h.io.write(&mut disk, 1, 0, &[0x5A; 512]).unwrap();
    assert_eq!(&h.data.borrow()[11 * 512..12 * 512], &[0x5A; 512][..]);

    assert_eq!(
        h.io.read(&mut disk, 20, 0, &mut buf).unwrap_err(),
        DiskError::OutOfPartition
    );
}

#[test]
fn missing_partition_is_its_own_error() {
    let mut h = harness(256);
    write_table_entry(&h.data, 1, 10, 20);
    h.io.set_partition_resolver(Box::new(SectorTableResolver));

    assert_eq!(
        h.io.open("ram0,5").unwrap_err(),
        DiskError::UnknownPartition(String::from("ram0,5"))
    );
    assert_eq!(
        h.io.open("ram0,junk").unwrap_err(),
        DiskError::UnknownPartition(String::from("ram0,junk"))
    );
}

#[test]
fn unknown_device_error_names_the_disk() {
    let mut h = harness(64);

    assert_eq!(
        h.io.open("nope").unwrap_err(),
        DiskError::UnknownDevice(String::from("nope"))
    );
}

#[test]
fn escaped_separators_stay_in_the_device_name() {
    let clock = MockClock::new();
    let mut io = DiskIo::new(Box::new(clock.clone()));

    let mut backend = RamDiskBackend::new();
    backend.add_disk("dev\\,with\\,commas", 64);
    io.register(Box::new(backend));

    let disk = io.open("dev\\,with\\,commas").unwrap();
    assert_eq!(disk.name(), "dev\\,with\\,commas");
    assert!(disk.partition().is_none());

    assert!(matches!(
        io.open("dev").unwrap_err(),
        DiskError::UnknownDevice(_)
    ));
}

#[test]
fn newest_backend_wins_until_unregistered() {
    let clock = MockClock::new();
    let mut io = DiskIo::new(Box::new(clock.clone()));

    let mut first = RamDiskBackend::new();
    first.add_disk("dup", 64).borrow_mut().fill(0x11);
    let mut second = RamDiskBackend::new();
    second.add_disk("dup", 64).borrow_mut().fill(0x22);

    io.register(Box::new(first));
    let second_id = io.register(Box::new(second));

    let mut disk = io.open("dup").unwrap();
    let mut buf = [0u8; 512];
    io.read(&mut disk, 0, 0, &mut buf).unwrap();
    assert_eq!(buf, [0x22; 512]);

    io.unregister(second_id);

    let mut disk = io.open("dup").unwrap();
    io.read(&mut disk, 0, 0, &mut buf).unwrap();
    assert_eq!(buf, [0x11; 512]);
}

#[test]
fn probe_failure_other_than_unknown_aborts_open() {
    let clock = MockClock::new();
    let mut io = DiskIo::new(Box::new(clock.clone()));

    let mut backend = RamDiskBackend::new();
    backend.add_disk("bad", 64);
    io.register(Box::new(backend));
    io.register(Box::new(FailingProbeBackend::new("bad")));

    assert_eq!(
        io.open("bad").unwrap_err(),
        DiskError::IoFailure(String::from("bad"))
    );
}

#[test]
fn reopening_after_quiet_period_drops_the_cache() {
    let mut h = harness(256);
    fill_pattern(&h.data);

    let mut disk = h.io.open("ram0").unwrap();
    let mut cold = [0u8; 512];
    h.io.read(&mut disk, 0, 0, &mut cold).unwrap();
    h.io.close(disk);

    h.data.borrow_mut()[..512].fill(0xFF);
    h.clock.advance(2001);

    let mut disk = h.io.open("ram0").unwrap();
    let mut warm = [0u8; 512];
    h.io.read(&mut disk, 0, 0, &mut warm).unwrap();
    assert_eq!(warm, [0xFF; 512]);
}

#[test]
fn reopening_within_quiet_period_keeps_the_cache() {
    let mut h = harness(256);
    fill_pattern(&h.data);

    let mut disk = h.io.open("ram0").unwrap();
    let mut cold = [0u8; 512];
    h.io.read(&mut disk, 0, 0, &mut cold).unwrap();
    h.io.close(disk);

    h.data.borrow_mut()[..512].fill(0xFF);
    h.clock.advance(1500);

    let mut disk = h.io.open("ram0").unwrap();
    let mut warm = [0u8; 512];
    h.io.read(&mut disk, 0, 0, &mut warm).unwrap();
    assert_eq!(warm, cold);
}

#[test]
fn read_hook_sees_each_physical_sector_once() {
    let mut h = harness(256);
    fill_pattern(&h.data);
    let mut disk = h.io.open("ram0").unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    disk.set_read_hook(Box::new(move |sector, offset, len| {
        sink.borrow_mut().push((sector, offset, len));
    }));

    let mut buf = vec![0u8; 1500];
    h.io.read(&mut disk, 2, 10, &mut buf).unwrap();

    assert_eq!(
        events.borrow().as_slice(),
        &[(2, 10, 502), (3, 0, 512), (4, 0, 486)]
    );

    disk.clear_read_hook();
    h.io.read(&mut disk, 2, 10, &mut buf).unwrap();
    assert_eq!(events.borrow().len(), 3);
}

#[test]
fn reads_near_device_end_fall_back_uncached() {
    let mut h = harness(68);
    fill_pattern(&h.data);
    let mut disk = h.io.open("ram0").unwrap();

    let mut buf = [0u8; 512];
    h.io.read(&mut disk, 66, 0, &mut buf).unwrap();
    assert_eq!(&buf[..], &h.data.borrow()[66 * 512..67 * 512]);
    assert_eq!(h.reads.get(), 1);

    // Nothing was cached, so the same read hits the backend again.
    h.io.read(&mut disk, 66, 0, &mut buf).unwrap();
    assert_eq!(h.reads.get(), 2);
}

#[test]
fn small_read_caches_the_whole_unit() {
    let mut h = harness(256);
    fill_pattern(&h.data);
    let mut disk = h.io.open("ram0").unwrap();

    let mut buf = [0u8; 512];
    h.io.read(&mut disk, 0, 0, &mut buf).unwrap();
    assert_eq!(h.reads.get(), 1);

    // The far end of the same cache unit is already resident.
    h.io.read(&mut disk, 63, 0, &mut buf).unwrap();
    assert_eq!(h.reads.get(), 1);

    h.io.read(&mut disk, 64, 0, &mut buf).unwrap();
    assert_eq!(h.reads.get(), 2);

    let (hits, _) = h.io.cache_stats();
    assert!(hits >= 1);
}

#[test]
fn bulk_read_agglomerates_misses_into_one_call() {
    let mut h = harness(512);
    fill_pattern(&h.data);
    let mut disk = h.io.open("ram0").unwrap();

    // Warm the third unit only.
    let mut small = [0u8; 512];
    h.io.read(&mut disk, 128, 0, &mut small).unwrap();

    let before = h.reads.get();
    let mut buf = vec![0u8; 3 * CACHE_UNIT_BYTES];
    h.io.read(&mut disk, 0, 0, &mut buf).unwrap();

    // Two missing units in front of the hit, fetched by a single call.
    assert_eq!(h.reads.get() - before, 1);
    assert_eq!(&buf[..], &h.data.borrow()[..3 * CACHE_UNIT_BYTES]);
}

#[test]
fn backend_errors_surface_verbatim() {
    let clock = MockClock::new();
    let mut io = DiskIo::new(Box::new(clock.clone()));
    io.register(Box::new(BrokenDiskBackend::new("bad", 100)));

    let mut disk = io.open("bad").unwrap();

    let mut buf = [0u8; 512];
    assert_eq!(
        io.read(&mut disk, 0, 0, &mut buf).unwrap_err(),
        DiskError::IoFailure(String::from("bad"))
    );
    assert_eq!(
        io.write(&mut disk, 0, 0, &[0u8; 512]).unwrap_err(),
        DiskError::IoFailure(String::from("bad"))
    );
    // A partial write needs the read-modify-write step, which fails first.
    assert_eq!(
        io.write(&mut disk, 0, 100, &[0u8; 10]).unwrap_err(),
        DiskError::IoFailure(String::from("bad"))
    );
}

#[test]
fn large_logical_sectors_round_trip() {
    let clock = MockClock::new();
    let mut io = DiskIo::new(Box::new(clock.clone()));

    let mut backend = RamDiskBackend::new();
    // 16 sectors of 1 KiB each.
    let data = backend.add_disk_with_sector_size("big", 16, 10);
    fill_pattern(&data);
    io.register(Box::new(backend));

    let mut disk = io.open("big").unwrap();
    assert_eq!(disk.log_sector_size(), 10);
    assert_eq!(disk.size(), Some(32));

    // A half-sector write goes through read-modify-write of the whole
    // logical sector.
    let expected_tail: Vec<u8> = data.borrow()[512..1024].to_vec();
    io.write(&mut disk, 0, 0, &[0xBB; 512]).unwrap();
    {
        let data = data.borrow();
        assert!(data[..512].iter().all(|&b| b == 0xBB));
        assert_eq!(&data[512..1024], &expected_tail[..]);
    }

    // A whole logical sector takes the aligned path.
    io.write(&mut disk, 2, 0, &[0xCC; 1024]).unwrap();
    assert!(data.borrow()[1024..2048].iter().all(|&b| b == 0xCC));

    let mut buf = vec![0u8; 1024];
    io.read(&mut disk, 1, 0, &mut buf).unwrap();
    assert_eq!(&buf[..], &data.borrow()[512..1536]);
}
