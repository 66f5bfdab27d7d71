use mock_disk_driver::{write_table_entry, RamDiskBackend, SectorTableResolver, SystemClock};

use disk_core::DiskIo;

fn main() {
    env_logger::init();

    let mut io = DiskIo::new(Box::new(SystemClock::new()));

    let mut backend = RamDiskBackend::new();
    let data = backend.add_disk("ram0", 256);
    let reads = backend.reads();
    io.register(Box::new(backend));
    io.set_partition_resolver(Box::new(SectorTableResolver));

    // One partition covering sectors 10..200.
    write_table_entry(&data, 1, 10, 190);

    let mut disk = io.open("ram0,1").unwrap();

    println!(
        "opened {} ({} sectors in partition)",
        disk.name(),
        disk.size().unwrap()
    );

    let message = b"hello from the sector cache";
    io.write(&mut disk, 0, 0, message).unwrap();

    let mut buffer = vec![0u8; message.len()];
    io.read(&mut disk, 0, 0, &mut buffer).unwrap();
    io.read(&mut disk, 0, 0, &mut buffer).unwrap();

    println!("read back: {}", String::from_utf8(buffer).unwrap());

    let (hits, misses) = io.cache_stats();
    println!("cache: {hits} hits, {misses} misses, {} backend reads", reads.get());

    io.close(disk);
}
