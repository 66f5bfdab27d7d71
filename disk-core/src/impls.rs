#![cfg(feature = "std")]

use std::boxed::Box;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::string::String;
use std::time::Instant;

use crate::device::{DiskBackend, DiskDevice};
use crate::disk::MonotonicClock;
use crate::{DiskError, DiskResult, SECTOR_BITS};

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Loopback backend: claims any name that is a path to an existing regular
/// file and presents the file as a 512-byte-sector disk image.
pub struct FileDiskBackend {
    ids: HashMap<String, u64>,
    next_id: u64,
}

impl FileDiskBackend {
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next_id: 0,
        }
    }

    // Opening the same image twice must yield the same disk id, so that both
    // handles share cached sectors.
    fn id_for(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(String::from(name), id);
        id
    }
}

impl Default for FileDiskBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskBackend for FileDiskBackend {
    fn probe(&mut self, name: &str) -> DiskResult<Box<dyn DiskDevice>> {
        if !Path::new(name).is_file() {
            return Err(DiskError::UnknownDevice(String::from(name)));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(name)
            .map_err(|_| DiskError::IoFailure(String::from(name)))?;

        let bytes = file
            .metadata()
            .map_err(|_| DiskError::IoFailure(String::from(name)))?
            .len();

        Ok(Box::new(FileDiskDevice {
            name: String::from(name),
            id: self.id_for(name),
            total_sectors: bytes >> SECTOR_BITS,
            file,
        }))
    }
}

pub struct FileDiskDevice {
    name: String,
    id: u64,
    total_sectors: u64,
    file: File,
}

impl FileDiskDevice {
    fn seek_to(&mut self, sector: u64) -> DiskResult<()> {
        self.file
            .seek(SeekFrom::Start(sector << SECTOR_BITS))
            .map(|_| ())
            .map_err(|_| DiskError::IoFailure(self.name.clone()))
    }
}

impl DiskDevice for FileDiskDevice {
    fn disk_id(&self) -> u64 {
        self.id
    }

    fn total_sectors(&self) -> Option<u64> {
        Some(self.total_sectors)
    }

    fn read(&mut self, sector: u64, count: u64, buffer: &mut [u8]) -> DiskResult<()> {
        if sector + count > self.total_sectors {
            return Err(DiskError::IoFailure(self.name.clone()));
        }

        self.seek_to(sector)?;

        let len = (count << SECTOR_BITS) as usize;
        self.file
            .read_exact(&mut buffer[..len])
            .map_err(|_| DiskError::IoFailure(self.name.clone()))
    }

    fn write(&mut self, sector: u64, count: u64, buffer: &[u8]) -> DiskResult<()> {
        if sector + count > self.total_sectors {
            return Err(DiskError::IoFailure(self.name.clone()));
        }

        self.seek_to(sector)?;

        let len = (count << SECTOR_BITS) as usize;
        self.file
            .write_all(&buffer[..len])
            .map_err(|_| DiskError::IoFailure(self.name.clone()))
    }
}
