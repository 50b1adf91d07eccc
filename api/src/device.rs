//! A physical disk and a very simple device controller for it.
//!
//! The device and its contents are represented by a file on the host file
//! system, memory-mapped and wrapped in a [`Device`]. When opening a device
//! you either provide the path to a non-existing file, which is created and
//! zero-filled, or to an existing file, whose size is checked against the
//! expected geometry.
//!
//! The block-level interface here is more fine-grained than a real file
//! system needs at this level of abstraction, but it keeps the rest of the
//! crate from having to reason about raw byte offsets into the mapped file.
//! No locking is done on the backing file itself, so two processes must not
//! open the same path concurrently.

use super::error::ApiError;
use super::types::Block;
use memmap::MmapMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{
    fs::{remove_file, OpenOptions},
    path::{Path, PathBuf},
};

/// State of a disk backed by a memory-mapped file, along with basic read and
/// write operation counters (mirrored on real block devices, and used by the
/// cache layer above to report its hit rate and I/O savings).
#[derive(Debug)]
pub struct Device {
    /// Size of the blocks (sectors) this device reads and writes, in bytes.
    pub block_size: u64,
    /// Total number of blocks this device consists of.
    pub nblocks: u64,
    /// Path to the file backing this device.
    path: PathBuf,
    /// Memory-mapped contents of the above file.
    contents: MmapMut,
    reads: AtomicU64,
    writes: AtomicU64,
}

/// Whether a `Device` is being freshly created or loaded from an existing file.
#[derive(PartialEq, Eq, Copy, Clone)]
pub enum DiskState {
    /// Creating a new disk image.
    New,
    /// Loading an existing disk image.
    Load,
}

use self::DiskState::*;
impl DiskState {
    /// Convert a boolean (does the path exist?) into a `DiskState`.
    pub fn new(ex: bool) -> DiskState {
        match ex {
            true => Load,
            false => New,
        }
    }
}

impl Drop for Device {
    /// Flush pending writes before releasing the memory mapping, as long as
    /// the backing file hasn't already been removed.
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = self.contents.flush();
        }
    }
}

impl Device {
    fn create_device<P: AsRef<Path>>(
        path: P,
        block_size: u64,
        nblocks: u64,
        ds: DiskState,
    ) -> super::error::Result<Device> {
        let path_buf = path.as_ref().to_path_buf();
        let mmapf = mmap_path(path, block_size * nblocks, ds)?;
        Ok(Device {
            block_size,
            nblocks,
            path: path_buf,
            contents: mmapf,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Create a new, zero-filled device at `path` with the given geometry.
    /// Fails if `path` already exists.
    pub fn new<P: AsRef<Path>>(path: P, block_size: u64, nblocks: u64) -> super::error::Result<Device> {
        Device::create_device(path, block_size, nblocks, New)
    }

    /// Load an existing device at `path`, checking that its size matches
    /// `block_size * nblocks`. Fails if `path` does not exist.
    pub fn load<P: AsRef<Path>>(path: P, block_size: u64, nblocks: u64) -> super::error::Result<Device> {
        Device::create_device(path, block_size, nblocks, Load)
    }

    /// Drop this device and remove the file backing it.
    /// Panics if removing the file fails.
    pub fn destruct(self) {
        remove_file(&self.path).unwrap();
    }

    /// Size of this device in bytes.
    pub fn device_size(&self) -> u64 {
        self.block_size * self.nblocks
    }

    /// Path of the file backing this device.
    pub fn device_path(&self) -> &Path {
        &self.path
    }

    /// Total number of blocks read since this device was opened.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total number of blocks written since this device was opened.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn index_to_addr(&self, index: u64) -> u64 {
        self.block_size * index
    }

    fn read(&self, addr: u64, nb: u64) -> super::error::Result<Box<[u8]>> {
        if addr + nb > self.device_size() {
            return Err(ApiError::DeviceInput("read past the end of the device"));
        }
        let start = addr as usize;
        let end = (addr + nb) as usize;
        Ok(self.contents[start..end].into())
    }

    /// Read the block with index `index` from the device.
    /// Fails if the block index is out of range.
    pub fn read_block(&self, index: u64) -> super::error::Result<Block> {
        let addr = self.index_to_addr(index);
        let block_data = self.read(addr, self.block_size)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        log::trace!("device: read block {}", index);
        Ok(Block::new(index, block_data))
    }

    fn write(&mut self, addr: u64, b: &[u8]) -> super::error::Result<()> {
        if addr + b.len() as u64 > self.device_size() {
            return Err(ApiError::DeviceInput("write past the end of the device"));
        }
        let start = addr as usize;
        let end = (addr as usize) + b.len();
        self.contents[start..end].copy_from_slice(b);
        Ok(())
    }

    /// Write `b` to the device at its recorded block index.
    /// Fails if `b` is not exactly block-sized or its index is out of range.
    pub fn write_block(&mut self, b: &Block) -> super::error::Result<()> {
        if b.len() != self.block_size {
            return Err(ApiError::DeviceInput("trying to write a non-block-sized block"));
        }
        let addr = self.index_to_addr(b.block_no);
        self.write(addr, &b.contents_as_ref())?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        log::trace!("device: wrote block {}", b.block_no);
        Ok(())
    }
}

/// Open or create the file at `path`, depending on `ex`, and map it into memory.
fn mmap_path<P: AsRef<Path>>(path: P, dsize: u64, ex: DiskState) -> super::error::Result<MmapMut> {
    let exists = DiskState::new(path.as_ref().exists());
    if exists != ex {
        if ex == Load {
            return Err(ApiError::DeviceInput("tried to load a non-existing file path"));
        } else {
            return Err(ApiError::DeviceInput("tried to create a pre-existing file path"));
        }
    }

    let f = OpenOptions::new().read(true).write(true).create(true).open(path)?;

    if ex == Load {
        if f.metadata()?.len() != dsize {
            return Err(ApiError::DeviceInput("device size does not match provided size"));
        }
    } else {
        f.set_len(dsize)?;
    }

    let data = unsafe { memmap::MmapOptions::new().map_mut(&f)? };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::Device;
    use crate::types::Block;
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::{Path, PathBuf};

    static BLOCK_SIZE: u64 = 10;
    static NBBLOCKS: u64 = 10;

    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-device-".to_string() + name);
        path.push("img");

        if path.exists() {
            remove_file(&path).unwrap();
        }
        {
            let prefix = path.parent().unwrap();
            create_dir_all(prefix).unwrap();
        }
        path
    }

    fn disk_setup(path: &Path) -> Device {
        Device::new(path, BLOCK_SIZE, NBBLOCKS).unwrap()
    }

    fn disk_open(path: &Path) -> Device {
        Device::load(path, BLOCK_SIZE, NBBLOCKS).unwrap()
    }

    fn disk_destruct(dev: Device) {
        let path = dev.path.to_owned();
        dev.destruct();
        remove_dir(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn create_disk_test() {
        let path = disk_prep_path("create");
        let mut dev = disk_setup(&path);

        let i1 = 3;
        let i2 = 9;
        let zero_block = |i| Block::new_zero(i, 10);
        let br = dev.read_block(i1).unwrap();
        assert_eq!(br, zero_block(i1));
        let br = dev.read_block(i2).unwrap();
        assert_eq!(br, zero_block(i2));

        let ie = NBBLOCKS;
        assert!(dev.read_block(ie).is_err());
        assert!(dev.write_block(&zero_block(ie)).is_err());

        let sized_block = |s: u64| Block::new_zero(i1, s);
        assert!(dev.write_block(&sized_block(BLOCK_SIZE + 1)).is_err());
        assert!(dev.write_block(&sized_block(BLOCK_SIZE - 1)).is_err());

        let block_data = (0..10).collect();
        let bw = Block::new(i1, block_data);
        dev.write_block(&bw).unwrap();
        let br = dev.read_block(i1).unwrap();
        assert_eq!(br, bw);

        assert_eq!(dev.reads(), 3);
        assert_eq!(dev.writes(), 1);

        disk_destruct(dev);
        assert!(!path.exists());
    }

    #[test]
    fn load_existing_disk_test() {
        let path = disk_prep_path("load");
        let mut dev = disk_setup(&path);

        let i1 = 0;
        let i2 = 8;
        let block_data1 = (0..10).collect();
        let block_data2 = (0..10).rev().collect();
        let bw1 = Block::new(i1, block_data1);
        let bw2 = Block::new(i2, block_data2);
        dev.write_block(&bw1).unwrap();
        dev.write_block(&bw2).unwrap();

        drop(dev);

        let dev = disk_open(&path);
        let br1 = dev.read_block(i1).unwrap();
        let br2 = dev.read_block(i2).unwrap();
        assert_eq!(br1, bw1);
        assert_eq!(br2, bw2);

        disk_destruct(dev);
        assert!(!path.exists());
    }
}
