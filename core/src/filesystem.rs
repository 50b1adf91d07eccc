//! Top-level façade: the syscall-layer surface callers actually use, wiring
//! together the cache, allocator, inode layer, directory layer and path
//! resolver behind a single handle.

use crate::alloc::FreeMap;
use crate::cache::SectorCache;
use crate::directory;
use crate::error::{FsError, FsResult};
use crate::inode::{Inode, InodeLayer};
use crate::path;
use crate::{Sector, ROOT_SECTOR, SECTOR_SIZE};
use fs_api::device::Device;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A file handle returned by [`Filesystem::open`], tracking its own
/// read/write cursor independently of any other handle on the same inode.
pub struct File {
    inode: Inode,
    layer: Arc<InodeLayer>,
    position: Mutex<u64>,
}

impl File {
    /// Read up to `buf.len()` bytes from the current position, advancing it
    /// by the number of bytes actually read.
    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        let mut pos = self.position.lock().unwrap();
        let n = self.layer.read_at(self.inode.inumber(), buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Write `data` at the current position, advancing it by `data.len()`
    /// and growing the file if the write extends past its current length.
    pub fn write(&self, data: &[u8]) -> FsResult<usize> {
        let mut pos = self.position.lock().unwrap();
        let n = self.layer.write_at(self.inode.inumber(), data, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Move the cursor to an absolute byte offset.
    pub fn seek(&self, offset: u64) {
        *self.position.lock().unwrap() = offset;
    }

    /// Current cursor position.
    pub fn tell(&self) -> u64 {
        *self.position.lock().unwrap()
    }

    /// Current length of the underlying inode.
    pub fn length(&self) -> FsResult<u64> {
        Ok(self.layer.length(self.inode.inumber())?)
    }

    /// Inode sector backing this handle.
    pub fn inumber(&self) -> Sector {
        self.inode.inumber()
    }

    /// Close this handle, releasing its registry reference. If the inode
    /// was removed and this was the last open handle, its sectors are
    /// reclaimed now.
    pub fn close(self) -> FsResult<()> {
        self.layer.close(self.inode.inumber())?;
        Ok(())
    }
}

/// The filesystem as a whole: owns the device, the sector cache, the
/// free-sector allocator and the inode layer, and exposes directory and
/// file operations in terms of absolute paths.
pub struct Filesystem {
    cache: Arc<SectorCache>,
    alloc: Arc<FreeMap>,
    inodes: Arc<InodeLayer>,
}

impl Filesystem {
    /// Format a fresh filesystem of `total_sectors` sectors on a new device
    /// at `path`, creating and formatting the root directory.
    pub fn format<P: AsRef<Path>>(path: P, total_sectors: u64) -> FsResult<Filesystem> {
        let device = Device::new(path.as_ref(), SECTOR_SIZE, total_sectors)
            .map_err(crate::error::CacheError::from)
            .map_err(crate::error::InodeError::from)?;
        let cache = Arc::new(SectorCache::new(device));
        let alloc = Arc::new(FreeMap::create(cache.clone(), total_sectors).map_err(crate::error::InodeError::from)?);
        let inodes = InodeLayer::new(cache.clone(), alloc.clone());
        inodes.create(ROOT_SECTOR, true, 0, 0, 0)?;
        directory::format(&inodes, ROOT_SECTOR, 0)?;
        log::info!("filesystem: formatted fresh device at {:?} ({} sectors)", path.as_ref(), total_sectors);
        Ok(Filesystem { cache, alloc, inodes })
    }

    /// Mount an already-formatted filesystem from `path`.
    pub fn mount<P: AsRef<Path>>(path: P, total_sectors: u64) -> FsResult<Filesystem> {
        let device = Device::load(path.as_ref(), SECTOR_SIZE, total_sectors)
            .map_err(crate::error::CacheError::from)
            .map_err(crate::error::InodeError::from)?;
        let cache = Arc::new(SectorCache::new(device));
        let alloc = Arc::new(FreeMap::open(cache.clone(), total_sectors).map_err(crate::error::InodeError::from)?);
        let inodes = InodeLayer::new(cache.clone(), alloc.clone());
        log::info!("filesystem: mounted device at {:?}", path.as_ref());
        Ok(Filesystem { cache, alloc, inodes })
    }

    /// Flush every dirty cache slot back to the device.
    pub fn unmount(&self) -> FsResult<()> {
        self.cache.flush().map_err(crate::error::InodeError::from)?;
        Ok(())
    }

    fn resolve(&self, start: Sector, path: &str) -> FsResult<Sector> {
        Ok(crate::path::resolve_dir(&self.inodes, start, path)?)
    }

    /// Create a regular file at `path` (relative to `start`, the caller's
    /// current directory, or [`ROOT_SECTOR`] for an absolute path).
    pub fn create(&self, start: Sector, path: &str, is_dir: bool) -> FsResult<Sector> {
        let (dir_sector, name) = path::resolve_parent(&self.inodes, start, path)?;
        if directory::contains(&self.inodes, dir_sector, &name)? {
            return Err(FsError::Dir(crate::error::DirError::AlreadyExists(name)));
        }
        let new_sector = self.alloc.allocate(1).map_err(crate::error::InodeError::from)?[0];
        self.inodes.create(new_sector, is_dir, dir_sector, 0, 0)?;
        if is_dir {
            directory::format(&self.inodes, new_sector, dir_sector)?;
        }
        directory::add(&self.inodes, dir_sector, &name, new_sector)?;
        Ok(new_sector)
    }

    /// Open the file or directory inode at `path`.
    pub fn open(&self, start: Sector, path: &str) -> FsResult<File> {
        let (dir_sector, name) = path::resolve_parent(&self.inodes, start, path)?;
        let entry = directory::lookup(&self.inodes, dir_sector, &name)?;
        let inode = self.inodes.open(entry.sector)?;
        Ok(File {
            inode,
            layer: self.inodes.clone(),
            position: Mutex::new(0),
        })
    }

    /// Remove the directory entry at `path`. A directory may only be
    /// removed if it holds no entries beyond `.` and `..`. The underlying
    /// sectors are only reclaimed once every open handle on the inode has
    /// been closed.
    pub fn remove(&self, start: Sector, path: &str) -> FsResult<()> {
        let (dir_sector, name) = path::resolve_parent(&self.inodes, start, path)?;
        let entry = directory::lookup(&self.inodes, dir_sector, &name)?;
        if self.inodes.is_dir(entry.sector)? {
            if !directory::is_empty(&self.inodes, entry.sector)? {
                return Err(FsError::Dir(crate::error::DirError::NotEmpty));
            }
            if self.inodes.is_open(entry.sector) {
                return Err(FsError::Dir(crate::error::DirError::InUse));
            }
        }
        directory::remove(&self.inodes, dir_sector, &name)?;
        self.inodes.remove(entry.sector)?;
        Ok(())
    }

    /// List the entries of the directory at `path`.
    pub fn readdir(&self, start: Sector, path: &str) -> FsResult<Vec<directory::DirEntry>> {
        let dir_sector = self.resolve(start, path)?;
        Ok(directory::readdir(&self.inodes, dir_sector)?)
    }

    /// Whether `path` names a directory.
    pub fn is_dir(&self, start: Sector, path: &str) -> FsResult<bool> {
        let sector = self.lookup_sector(start, path)?;
        Ok(self.inodes.is_dir(sector)?)
    }

    /// Resolve `path` to a directory sector suitable as a future `start`
    /// (used to implement `chdir`).
    pub fn chdir(&self, start: Sector, path: &str) -> FsResult<Sector> {
        self.resolve(start, path)
    }

    fn lookup_sector(&self, start: Sector, path: &str) -> FsResult<Sector> {
        let (dir_sector, name) = path::resolve_parent(&self.inodes, start, path)?;
        Ok(directory::lookup(&self.inodes, dir_sector, &name)?.sector)
    }

    /// Temporarily deny writes to the inode at `path` (used while a binary
    /// backed by it is executing).
    pub fn deny_write(&self, start: Sector, path: &str) -> FsResult<()> {
        let sector = self.lookup_sector(start, path)?;
        self.inodes.deny_write(sector);
        Ok(())
    }

    /// Undo one [`Filesystem::deny_write`].
    pub fn allow_write(&self, start: Sector, path: &str) -> FsResult<()> {
        let sector = self.lookup_sector(start, path)?;
        self.inodes.allow_write(sector);
        Ok(())
    }

    /// `floor(100 * hits / (hits + misses))` over the sector cache's whole
    /// lifetime (or since the last [`Filesystem::reset_cache`]).
    pub fn hitrate(&self) -> u64 {
        self.cache.hitrate()
    }

    /// Flush and invalidate the sector cache, zeroing its hit/miss counters.
    pub fn reset_cache(&self) -> FsResult<()> {
        self.cache.reset().map_err(crate::error::InodeError::from)?;
        Ok(())
    }

    /// Sectors read from the backing device since mount.
    pub fn device_reads(&self) -> u64 {
        self.cache.fs_reads()
    }

    /// Sectors written to the backing device since mount.
    pub fn device_writes(&self) -> u64 {
        self.cache.fs_writes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, remove_dir_all};
    use std::path::PathBuf;

    fn disk_prep(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-fs-".to_string() + name);
        let _ = remove_dir_all(&path);
        create_dir_all(&path).unwrap();
        path.push("img");
        path
    }

    #[test]
    fn format_then_create_write_read() {
        let path = disk_prep("basic");
        let fs = Filesystem::format(&path, 128).unwrap();

        fs.create(ROOT_SECTOR, "/hello.txt", false).unwrap();
        let file = fs.open(ROOT_SECTOR, "/hello.txt").unwrap();
        file.write(b"hi there").unwrap();
        file.seek(0);
        let mut buf = [0u8; 8];
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hi there");
        file.close().unwrap();

        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn mkdir_chdir_readdir() {
        let path = disk_prep("mkdir");
        let fs = Filesystem::format(&path, 128).unwrap();

        fs.create(ROOT_SECTOR, "/sub", true).unwrap();
        let sub = fs.chdir(ROOT_SECTOR, "/sub").unwrap();
        fs.create(sub, "leaf.txt", false).unwrap();

        let entries = fs.readdir(ROOT_SECTOR, "/sub").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"."));
        assert!(names.contains(&".."));
        assert!(names.contains(&"leaf.txt"));

        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn remove_nonempty_directory_fails() {
        let path = disk_prep("nonempty");
        let fs = Filesystem::format(&path, 128).unwrap();

        fs.create(ROOT_SECTOR, "/sub", true).unwrap();
        fs.create(ROOT_SECTOR, "/sub/leaf.txt", false).unwrap();
        assert!(fs.remove(ROOT_SECTOR, "/sub").is_err());

        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn hitrate_increases_after_reset_and_reaccess() {
        let path = disk_prep("hitrate");
        let fs = Filesystem::format(&path, 128).unwrap();
        fs.create(ROOT_SECTOR, "/f", false).unwrap();

        fs.reset_cache().unwrap();
        let before = fs.hitrate();

        let file = fs.open(ROOT_SECTOR, "/f").unwrap();
        for _ in 0..20 {
            file.write(b"x").unwrap();
        }
        file.close().unwrap();

        assert!(fs.hitrate() >= before);

        remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
