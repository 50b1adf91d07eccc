//! Sector buffer cache: the sole intermediary between the inode layer and
//! the block device.
//!
//! Sixty-four slots, each behind its own mutex, are allocated under a global
//! mutex that only ever orders *which* slot a sector lands in (finding an
//! empty slot or running the clock sweep); once a slot is chosen, subsequent
//! hits touch only that slot's own mutex, rather than the parallel
//! valid/dirty/reference bitmaps indexed by slot number that the system
//! this was modeled on uses. The reference bit here follows the classical
//! convention: set on access, cleared by the eviction sweep.

use crate::error::{CacheError, CacheResult};
use crate::{Sector, CACHE_SLOTS, SECTOR_SIZE};
use fs_api::device::Device;
use fs_api::types::Block;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

struct Slot {
    /// `None` when the slot is invalid (unused).
    sector: Option<Sector>,
    dirty: bool,
    /// Clock/second-chance reference bit: set on access, cleared by the sweep.
    referenced: bool,
    buf: [u8; SECTOR_SIZE as usize],
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            sector: None,
            dirty: false,
            referenced: false,
            buf: [0; SECTOR_SIZE as usize],
        }
    }
}

/// The sector cache. Owns the [`Device`] — every sector read or written by
/// the layers above flows through here.
pub struct SectorCache {
    device: Mutex<Device>,
    slots: Vec<Mutex<Slot>>,
    /// Orders slot-allocation decisions: finding an empty slot, or running
    /// the clock sweep. Never held while blocked on a single slot mutex, and
    /// never acquired while holding one.
    alloc_lock: Mutex<()>,
    last_evict: Mutex<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SectorCache {
    /// Wrap `device` in a fresh, empty cache of `CACHE_SLOTS` slots.
    pub fn new(device: Device) -> SectorCache {
        let mut slots = Vec::with_capacity(CACHE_SLOTS);
        for _ in 0..CACHE_SLOTS {
            slots.push(Mutex::new(Slot::empty()));
        }
        SectorCache {
            device: Mutex::new(device),
            slots,
            alloc_lock: Mutex::new(()),
            last_evict: Mutex::new(CACHE_SLOTS - 1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Read sector `sector` into a fresh B-byte buffer.
    pub fn read(&self, sector: Sector) -> CacheResult<[u8; SECTOR_SIZE as usize]> {
        if let Some(buf) = self.scan_hit(sector) {
            return Ok(buf);
        }

        let _alloc = self.alloc_lock.lock().unwrap();
        // Re-check: another thread may have loaded it while we waited.
        if let Some(buf) = self.scan_hit(sector) {
            return Ok(buf);
        }

        let idx = self.find_invalid_slot().unwrap_or_else(|| self.evict_one());
        let mut slot = self.slots[idx].lock().unwrap();
        if let Some(s) = slot.sector {
            if slot.dirty {
                self.write_back(s, &slot.buf)?;
            }
        }
        let block = self.device.lock().unwrap().read_block(sector as u64)?;
        slot.buf.copy_from_slice(block.contents_as_ref());
        slot.sector = Some(sector);
        slot.dirty = false;
        slot.referenced = false;
        self.misses.fetch_add(1, Ordering::Relaxed);
        log::trace!("cache: loaded sector {} into slot {}", sector, idx);
        Ok(slot.buf)
    }

    /// Overwrite sector `sector` with `data`, without reading the prior
    /// on-disk content first (a full-sector overwrite).
    pub fn write(&self, sector: Sector, data: &[u8; SECTOR_SIZE as usize]) -> CacheResult<()> {
        for slot_lock in &self.slots {
            let mut slot = slot_lock.lock().unwrap();
            if slot.sector == Some(sector) {
                slot.buf.copy_from_slice(data);
                slot.dirty = true;
                slot.referenced = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let _alloc = self.alloc_lock.lock().unwrap();
        for slot_lock in &self.slots {
            let mut slot = slot_lock.lock().unwrap();
            if slot.sector == Some(sector) {
                slot.buf.copy_from_slice(data);
                slot.dirty = true;
                slot.referenced = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let idx = self.find_invalid_slot().unwrap_or_else(|| self.evict_one());
        let mut slot = self.slots[idx].lock().unwrap();
        if let Some(s) = slot.sector {
            if slot.dirty {
                self.write_back(s, &slot.buf)?;
            }
        }
        slot.buf.copy_from_slice(data);
        slot.sector = Some(sector);
        slot.dirty = true;
        slot.referenced = false;
        self.misses.fetch_add(1, Ordering::Relaxed);
        log::trace!("cache: wrote sector {} into slot {}", sector, idx);
        Ok(())
    }

    /// Write every dirty, valid slot back to disk. Slots remain valid.
    pub fn flush(&self) -> CacheResult<()> {
        let _alloc = self.alloc_lock.lock().unwrap();
        for slot_lock in &self.slots {
            let mut slot = slot_lock.lock().unwrap();
            if let Some(s) = slot.sector {
                if slot.dirty {
                    self.write_back(s, &slot.buf)?;
                    slot.dirty = false;
                }
            }
        }
        Ok(())
    }

    /// Flush, then invalidate every slot and zero the hit/miss counters.
    pub fn reset(&self) -> CacheResult<()> {
        self.flush()?;
        let _alloc = self.alloc_lock.lock().unwrap();
        for slot_lock in &self.slots {
            let mut slot = slot_lock.lock().unwrap();
            *slot = Slot::empty();
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// `floor(100 * hits / (hits + misses))`, zero if there have been no accesses.
    pub fn hitrate(&self) -> u64 {
        let h = self.hits.load(Ordering::Relaxed);
        let m = self.misses.load(Ordering::Relaxed);
        if h + m == 0 {
            0
        } else {
            (100 * h) / (h + m)
        }
    }

    /// Number of sectors the backing device has read.
    pub fn fs_reads(&self) -> u64 {
        self.device.lock().unwrap().reads()
    }

    /// Number of sectors the backing device has written.
    pub fn fs_writes(&self) -> u64 {
        self.device.lock().unwrap().writes()
    }

    fn scan_hit(&self, sector: Sector) -> Option<[u8; SECTOR_SIZE as usize]> {
        for slot_lock in &self.slots {
            let mut slot = slot_lock.lock().unwrap();
            if slot.sector == Some(sector) {
                slot.referenced = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(slot.buf);
            }
        }
        None
    }

    fn find_invalid_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.lock().unwrap().sector.is_none())
    }

    /// Run the clock sweep and return the index of the slot chosen for
    /// eviction. Called with `alloc_lock` already held.
    fn evict_one(&self) -> usize {
        let mut cursor = *self.last_evict.lock().unwrap();
        loop {
            cursor = (cursor + 1) % self.slots.len();
            let mut slot = self.slots[cursor].lock().unwrap();
            if !slot.referenced {
                *self.last_evict.lock().unwrap() = cursor;
                return cursor;
            }
            slot.referenced = false;
        }
    }

    fn write_back(&self, sector: Sector, buf: &[u8; SECTOR_SIZE as usize]) -> CacheResult<()> {
        let block = Block::new(sector as u64, buf.to_vec().into_boxed_slice());
        self.device.lock().unwrap().write_block(&block)?;
        Ok(())
    }
}

impl Drop for SectorCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("cache: flush on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, remove_dir_all};
    use std::path::PathBuf;

    fn disk_prep(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-cache-".to_string() + name);
        let _ = remove_dir_all(&path);
        create_dir_all(&path).unwrap();
        path.push("img");
        path
    }

    #[test]
    fn hit_and_miss_counted() {
        let path = disk_prep("hitmiss");
        let dev = Device::new(&path, SECTOR_SIZE, 8).unwrap();
        let cache = SectorCache::new(dev);

        let data = [7u8; SECTOR_SIZE as usize];
        cache.write(3, &data).unwrap();
        assert_eq!(cache.read(3).unwrap(), data);
        assert_eq!(cache.hitrate(), 100);

        cache.flush().unwrap();
        assert_eq!(cache.fs_writes(), 1);

        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn eviction_reclaims_slots_beyond_capacity() {
        let path = disk_prep("evict");
        let dev = Device::new(&path, SECTOR_SIZE, (CACHE_SLOTS as u64) + 4).unwrap();
        let cache = SectorCache::new(dev);

        for s in 0..(CACHE_SLOTS as u32 + 4) {
            let mut data = [0u8; SECTOR_SIZE as usize];
            data[0] = s as u8;
            cache.write(s, &data).unwrap();
        }
        // Early sectors should have been evicted and are readable back from disk.
        let got = cache.read(0).unwrap();
        assert_eq!(got[0], 0);

        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn reset_clears_counters_and_validity() {
        let path = disk_prep("reset");
        let dev = Device::new(&path, SECTOR_SIZE, 4).unwrap();
        let cache = SectorCache::new(dev);

        cache.read(0).unwrap();
        cache.read(0).unwrap();
        assert!(cache.hitrate() > 0);

        cache.reset().unwrap();
        assert_eq!(cache.hitrate(), 0);

        remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
