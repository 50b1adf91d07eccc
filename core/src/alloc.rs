//! Free-sector allocator: a single-sector bitmap at [`crate::FREE_MAP_SECTOR`].
//!
//! One bit per sector, inspected through the `bit_field` crate's per-bit
//! accessors. A single sector (4096 bits) bounds this allocator to devices
//! of at most 4096 sectors (2 MiB); a multi-sector bitmap would lift that
//! bound but isn't needed at this scale, so devices larger than that are
//! rejected outright rather than silently truncated.

use crate::cache::SectorCache;
use crate::error::{AllocError, AllocResult};
use crate::{Sector, FREE_MAP_SECTOR, ROOT_SECTOR, SECTOR_SIZE};
use bit_field::BitField;
use std::sync::{Arc, Mutex};

const BITS_PER_SECTOR: u64 = SECTOR_SIZE * 8;

/// Hands out and reclaims individual data sectors.
///
/// Mutations are serialized by an internal mutex: callers never need to
/// coordinate allocation themselves.
pub struct FreeMap {
    cache: Arc<SectorCache>,
    total_sectors: u64,
    lock: Mutex<()>,
}

impl FreeMap {
    /// Format a fresh free map over a device of `total_sectors` sectors,
    /// reserving [`FREE_MAP_SECTOR`] and [`ROOT_SECTOR`] up front.
    pub fn create(cache: Arc<SectorCache>, total_sectors: u64) -> AllocResult<FreeMap> {
        if total_sectors > BITS_PER_SECTOR {
            return Err(AllocError::DeviceTooLarge(total_sectors));
        }
        let mut buf = [0u8; SECTOR_SIZE as usize];
        set_bit(&mut buf, FREE_MAP_SECTOR as u64, true);
        set_bit(&mut buf, ROOT_SECTOR as u64, true);
        cache.write(FREE_MAP_SECTOR, &buf)?;
        Ok(FreeMap {
            cache,
            total_sectors,
            lock: Mutex::new(()),
        })
    }

    /// Open a free map already formatted on `cache`.
    pub fn open(cache: Arc<SectorCache>, total_sectors: u64) -> AllocResult<FreeMap> {
        if total_sectors > BITS_PER_SECTOR {
            return Err(AllocError::DeviceTooLarge(total_sectors));
        }
        Ok(FreeMap {
            cache,
            total_sectors,
            lock: Mutex::new(()),
        })
    }

    /// Allocate `count` contiguous free sectors, marking them used.
    pub fn allocate(&self, count: u32) -> AllocResult<Vec<Sector>> {
        let _guard = self.lock.lock().unwrap();
        let mut buf = self.cache.read(FREE_MAP_SECTOR)?;

        let count = count as u64;
        let mut run_start: Option<u64> = None;
        let mut run_len: u64 = 0;
        for i in 0..self.total_sectors {
            if !get_bit(&buf, i) {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == count {
                    let start = run_start.unwrap();
                    for j in start..start + count {
                        set_bit(&mut buf, j, true);
                    }
                    self.cache.write(FREE_MAP_SECTOR, &buf)?;
                    log::debug!("alloc: reserved {} sector(s) starting at {}", count, start);
                    return Ok((start..start + count).map(|s| s as Sector).collect());
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        Err(AllocError::OutOfSpace(count as u32))
    }

    /// Mark `count` sectors starting at `sector` as free again.
    pub fn release(&self, sector: Sector, count: u32) -> AllocResult<()> {
        let _guard = self.lock.lock().unwrap();
        let mut buf = self.cache.read(FREE_MAP_SECTOR)?;
        for j in (sector as u64)..(sector as u64 + count as u64) {
            set_bit(&mut buf, j, false);
        }
        self.cache.write(FREE_MAP_SECTOR, &buf)?;
        log::debug!("alloc: released {} sector(s) starting at {}", count, sector);
        Ok(())
    }
}

fn get_bit(buf: &[u8; SECTOR_SIZE as usize], i: u64) -> bool {
    let byte = (i / 8) as usize;
    let bit = (i % 8) as usize;
    buf[byte].get_bit(bit)
}

fn set_bit(buf: &mut [u8; SECTOR_SIZE as usize], i: u64, value: bool) {
    let byte = (i / 8) as usize;
    let bit = (i % 8) as usize;
    buf[byte].set_bit(bit, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_api::device::Device;
    use std::fs::{create_dir_all, remove_dir_all};
    use std::path::PathBuf;

    fn disk_prep(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-alloc-".to_string() + name);
        let _ = remove_dir_all(&path);
        create_dir_all(&path).unwrap();
        path.push("img");
        path
    }

    #[test]
    fn reserves_sectors_zero_and_one() {
        let path = disk_prep("reserved");
        let dev = Device::new(&path, SECTOR_SIZE, 32).unwrap();
        let cache = Arc::new(SectorCache::new(dev));
        let map = FreeMap::create(cache, 32).unwrap();

        let got = map.allocate(1).unwrap();
        assert_eq!(got, vec![2]);

        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn allocate_and_release_round_trip() {
        let path = disk_prep("roundtrip");
        let dev = Device::new(&path, SECTOR_SIZE, 32).unwrap();
        let cache = Arc::new(SectorCache::new(dev));
        let map = FreeMap::create(cache, 32).unwrap();

        let a = map.allocate(3).unwrap();
        assert_eq!(a.len(), 3);
        map.release(a[0], 3).unwrap();

        let b = map.allocate(3).unwrap();
        assert_eq!(a, b);

        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn out_of_space_when_exhausted() {
        let path = disk_prep("exhausted");
        let dev = Device::new(&path, SECTOR_SIZE, 4).unwrap();
        let cache = Arc::new(SectorCache::new(dev));
        let map = FreeMap::create(cache, 4).unwrap();

        // sectors 0 and 1 reserved; 2 and 3 available.
        map.allocate(1).unwrap();
        map.allocate(1).unwrap();
        assert!(map.allocate(1).is_err());

        remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
