//! Inode layer: block-map translation, resizing, and the process-wide
//! open-inode registry.
//!
//! Every inode is identified by the sector holding its on-disk
//! representation. Opens are deduplicated through [`InodeLayer`]'s registry so
//! that two callers opening the same sector share one set of deny-write and
//! refcount bookkeeping, the way the system this was modeled on keeps a
//! single in-memory `inode` per open sector regardless of how many file
//! descriptors reference it.

use crate::alloc::FreeMap;
use crate::cache::SectorCache;
use crate::error::{InodeError, InodeResult};
use crate::{Sector, DIRECT_POINTERS, POINTERS_PER_SECTOR, SECTOR_SIZE};
use fs_api::types::Block;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Magic value tagging a sector as holding a valid [`DiskInode`].
pub const MAGIC: u32 = 0x494e4f44; // "INOD"

/// The on-disk representation of an inode: one sector, block-mapped through
/// twelve direct pointers, one single-indirect pointer and one
/// double-indirect pointer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DiskInode {
    /// Direct data-sector pointers, covering the first
    /// `DIRECT_POINTERS * SECTOR_SIZE` bytes of the file.
    pub direct: [Sector; DIRECT_POINTERS],
    /// Pointer to a sector of `POINTERS_PER_SECTOR` further data pointers.
    pub indirect: Sector,
    /// Pointer to a sector of `POINTERS_PER_SECTOR` pointers, each itself
    /// pointing to a sector of `POINTERS_PER_SECTOR` data pointers.
    pub double_indirect: Sector,
    /// Whether this inode is a directory.
    pub is_dir: bool,
    /// Sector of the directory this inode was created in. Zero for the root.
    pub parent: Sector,
    /// Byte offset of this inode's own directory entry within `parent`.
    pub offset: u32,
    /// Current length, in bytes.
    pub length: u64,
    /// Tag confirming this sector holds a valid inode.
    pub magic: u32,
}

/// Total sectors directly addressable without any indirection.
const DIRECT_CAP: usize = DIRECT_POINTERS;
/// Total sectors addressable through direct + single-indirect pointers.
const INDIRECT_CAP: usize = DIRECT_CAP + POINTERS_PER_SECTOR;
/// Total sectors addressable through direct + single + double indirection.
pub const MAX_SECTORS: usize = INDIRECT_CAP + POINTERS_PER_SECTOR * POINTERS_PER_SECTOR;

fn sectors_for(length: u64) -> usize {
    ((length + SECTOR_SIZE - 1) / SECTOR_SIZE) as usize
}

fn read_disk_inode(cache: &SectorCache, sector: Sector) -> InodeResult<DiskInode> {
    let raw = cache.read(sector)?;
    let block = Block::new(sector as u64, Box::new(raw));
    let di: DiskInode = block.deserialize_from(0).map_err(crate::error::CacheError::from)?;
    if di.magic != MAGIC {
        return Err(InodeError::BadMagic(di.magic));
    }
    Ok(di)
}

fn write_disk_inode(cache: &SectorCache, sector: Sector, di: &DiskInode) -> InodeResult<()> {
    let mut block = Block::new_zero(sector as u64, SECTOR_SIZE);
    block.serialize_into(di, 0).map_err(crate::error::CacheError::from)?;
    let mut raw = [0u8; SECTOR_SIZE as usize];
    raw.copy_from_slice(block.contents_as_ref());
    cache.write(sector, &raw)?;
    Ok(())
}

fn read_pointer_block(cache: &SectorCache, sector: Sector) -> InodeResult<[Sector; POINTERS_PER_SECTOR]> {
    let raw = cache.read(sector)?;
    let mut out = [0 as Sector; POINTERS_PER_SECTOR];
    for (i, slot) in out.iter_mut().enumerate() {
        let b = &raw[i * 4..i * 4 + 4];
        *slot = Sector::from_le_bytes([b[0], b[1], b[2], b[3]]);
    }
    Ok(out)
}

fn write_pointer_block(cache: &SectorCache, sector: Sector, ptrs: &[Sector; POINTERS_PER_SECTOR]) -> InodeResult<()> {
    let mut raw = [0u8; SECTOR_SIZE as usize];
    for (i, ptr) in ptrs.iter().enumerate() {
        raw[i * 4..i * 4 + 4].copy_from_slice(&ptr.to_le_bytes());
    }
    cache.write(sector, &raw)?;
    Ok(())
}

fn zero_sector(cache: &SectorCache, sector: Sector) -> InodeResult<()> {
    cache.write(sector, &[0u8; SECTOR_SIZE as usize])?;
    Ok(())
}

#[derive(Default)]
struct InodeState {
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
}

/// Owns the sector cache and allocator shared by every open inode, plus the
/// dedup/refcount registry.
///
/// All methods take `&self`: concurrency is pushed down into the cache's
/// per-slot locks and the registry's own mutex, the same way the cache
/// itself never requires a caller to hold anything beyond a single slot
/// lock for a hit.
pub struct InodeLayer {
    cache: Arc<SectorCache>,
    alloc: Arc<FreeMap>,
    registry: Mutex<HashMap<Sector, InodeState>>,
}

impl InodeLayer {
    /// Wrap a cache and allocator in a fresh, empty open-inode registry.
    pub fn new(cache: Arc<SectorCache>, alloc: Arc<FreeMap>) -> Arc<InodeLayer> {
        Arc::new(InodeLayer {
            cache,
            alloc,
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Format a fresh inode at `sector`: always allocates and zero-fills
    /// `direct[0]` regardless of `length`, then grows to `length` if
    /// nonzero. The direct[0] pre-allocation happens here, not inside
    /// [`InodeLayer::resize`], which treats all twelve direct slots
    /// uniformly and would otherwise release slot 0 when shrinking a file
    /// to zero length.
    pub fn create(&self, sector: Sector, is_dir: bool, parent: Sector, offset: u32, length: u64) -> InodeResult<()> {
        let first = self.alloc.allocate(1)?[0];
        zero_sector(&self.cache, first)?;
        let mut direct = [0 as Sector; DIRECT_POINTERS];
        direct[0] = first;
        let di = DiskInode {
            direct,
            indirect: 0,
            double_indirect: 0,
            is_dir,
            parent,
            offset,
            length: 0,
            magic: MAGIC,
        };
        write_disk_inode(&self.cache, sector, &di)?;
        if length > 0 {
            self.resize(sector, length)?;
        }
        log::debug!("inode: created at sector {} (dir={}, length={})", sector, is_dir, length);
        Ok(())
    }

    /// Open `sector`, incrementing its refcount (registering it if this is
    /// the first open).
    pub fn open(&self, sector: Sector) -> InodeResult<Inode> {
        let mut reg = self.registry.lock().unwrap();
        reg.entry(sector).or_insert_with(InodeState::default).open_count += 1;
        drop(reg);
        Ok(Inode { sector })
    }

    /// Increment `sector`'s refcount without re-deriving the handle from scratch.
    pub fn reopen(&self, sector: Sector) -> Inode {
        let mut reg = self.registry.lock().unwrap();
        reg.entry(sector).or_insert_with(InodeState::default).open_count += 1;
        Inode { sector }
    }

    /// Drop one reference to `sector`. If the refcount reaches zero and the
    /// inode has been marked removed, release its entire block-map tree and
    /// its own sector back to the allocator.
    pub fn close(&self, sector: Sector) -> InodeResult<()> {
        let should_release = {
            let mut reg = self.registry.lock().unwrap();
            let state = reg.get_mut(&sector).ok_or(InodeError::Invalid("closing an inode that was never opened"))?;
            state.open_count = state.open_count.saturating_sub(1);
            let release = state.open_count == 0 && state.removed;
            if state.open_count == 0 {
                reg.remove(&sector);
            }
            release
        };
        if should_release {
            self.release_tree(sector)?;
        }
        Ok(())
    }

    /// Mark `sector` for deletion. If nobody currently has it open, its
    /// block-map tree is released immediately; otherwise it is released by
    /// whichever [`InodeLayer::close`] call brings the refcount to zero.
    pub fn remove(&self, sector: Sector) -> InodeResult<()> {
        let release_now = {
            let mut reg = self.registry.lock().unwrap();
            let state = reg.entry(sector).or_insert_with(InodeState::default);
            state.removed = true;
            state.open_count == 0
        };
        if release_now {
            self.release_tree(sector)?;
            self.registry.lock().unwrap().remove(&sector);
        }
        Ok(())
    }

    /// Whether `sector` is currently marked for deletion.
    pub fn is_removed(&self, sector: Sector) -> bool {
        self.registry.lock().unwrap().get(&sector).map(|s| s.removed).unwrap_or(false)
    }

    /// Whether any handle other than the caller's own still has `sector`
    /// open (`open_count > 1`).
    pub fn is_open(&self, sector: Sector) -> bool {
        self.registry.lock().unwrap().get(&sector).map(|s| s.open_count > 1).unwrap_or(false)
    }

    /// Increment the deny-write count: subsequent `write_at` calls on this
    /// inode return `Ok(0)` until [`InodeLayer::allow_write`] brings the
    /// count back to zero.
    pub fn deny_write(&self, sector: Sector) {
        let mut reg = self.registry.lock().unwrap();
        reg.entry(sector).or_insert_with(InodeState::default).deny_write_count += 1;
    }

    /// Decrement the deny-write count.
    pub fn allow_write(&self, sector: Sector) {
        if let Some(state) = self.registry.lock().unwrap().get_mut(&sector) {
            state.deny_write_count = state.deny_write_count.saturating_sub(1);
        }
    }

    fn write_denied(&self, sector: Sector) -> bool {
        self.registry.lock().unwrap().get(&sector).map(|s| s.deny_write_count > 0).unwrap_or(false)
    }

    /// Current length, in bytes.
    pub fn length(&self, sector: Sector) -> InodeResult<u64> {
        Ok(read_disk_inode(&self.cache, sector)?.length)
    }

    /// Whether `sector` holds a directory.
    pub fn is_dir(&self, sector: Sector) -> InodeResult<bool> {
        Ok(read_disk_inode(&self.cache, sector)?.is_dir)
    }

    /// The directory sector and entry offset this inode was created under.
    pub fn parent_link(&self, sector: Sector) -> InodeResult<(Sector, u32)> {
        let di = read_disk_inode(&self.cache, sector)?;
        Ok((di.parent, di.offset))
    }

    /// Translate a byte offset to the data sector that holds it, or `0` if
    /// that offset falls in an unmaterialized hole.
    fn byte_to_sector(&self, di: &DiskInode, offset: u64) -> InodeResult<Sector> {
        let s = (offset / SECTOR_SIZE) as usize;
        if s < DIRECT_CAP {
            return Ok(di.direct[s]);
        }
        if s < INDIRECT_CAP {
            if di.indirect == 0 {
                return Ok(0);
            }
            let ptrs = read_pointer_block(&self.cache, di.indirect)?;
            return Ok(ptrs[s - DIRECT_CAP]);
        }
        let s2 = s - INDIRECT_CAP;
        if di.double_indirect == 0 {
            return Ok(0);
        }
        let outer = read_pointer_block(&self.cache, di.double_indirect)?;
        let oi = s2 / POINTERS_PER_SECTOR;
        let ii = s2 % POINTERS_PER_SECTOR;
        if oi >= POINTERS_PER_SECTOR || outer[oi] == 0 {
            return Ok(0);
        }
        let inner = read_pointer_block(&self.cache, outer[oi])?;
        Ok(inner[ii])
    }

    /// Read up to `buf.len()` bytes starting at `offset`, stopping at the
    /// inode's current length. Holes (unmaterialized sectors within the
    /// requested range) read back as zero.
    pub fn read_at(&self, sector: Sector, buf: &mut [u8], offset: u64) -> InodeResult<usize> {
        let di = read_disk_inode(&self.cache, sector)?;
        if offset >= di.length {
            return Ok(0);
        }
        let to_read = buf.len().min((di.length - offset) as usize);
        let mut pos = 0usize;
        while pos < to_read {
            let cur = offset + pos as u64;
            let sect_off = (cur % SECTOR_SIZE) as usize;
            let chunk = (SECTOR_SIZE as usize - sect_off).min(to_read - pos);
            let psector = self.byte_to_sector(&di, cur)?;
            if psector == 0 {
                for b in &mut buf[pos..pos + chunk] {
                    *b = 0;
                }
            } else {
                let raw = self.cache.read(psector)?;
                buf[pos..pos + chunk].copy_from_slice(&raw[sect_off..sect_off + chunk]);
            }
            pos += chunk;
        }
        Ok(to_read)
    }

    /// Write `data` at `offset`, growing the inode (via [`InodeLayer::resize`])
    /// if the write extends past the current length. Returns `Ok(0)` without
    /// writing anything if the inode currently has `deny_write_count > 0`.
    pub fn write_at(&self, sector: Sector, data: &[u8], offset: u64) -> InodeResult<usize> {
        if self.write_denied(sector) {
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        let mut di = read_disk_inode(&self.cache, sector)?;
        if end > di.length {
            if self.resize(sector, end).is_err() {
                return Ok(0);
            }
            di = read_disk_inode(&self.cache, sector)?;
        }
        let mut pos = 0usize;
        while pos < data.len() {
            let cur = offset + pos as u64;
            let sect_off = (cur % SECTOR_SIZE) as usize;
            let chunk = (SECTOR_SIZE as usize - sect_off).min(data.len() - pos);
            let psector = self.byte_to_sector(&di, cur)?;
            if psector == 0 {
                break;
            }
            if sect_off == 0 && chunk == SECTOR_SIZE as usize {
                let mut raw = [0u8; SECTOR_SIZE as usize];
                raw.copy_from_slice(&data[pos..pos + chunk]);
                self.cache.write(psector, &raw)?;
            } else {
                let mut raw = self.cache.read(psector)?;
                raw[sect_off..sect_off + chunk].copy_from_slice(&data[pos..pos + chunk]);
                self.cache.write(psector, &raw)?;
            }
            pos += chunk;
        }
        Ok(pos)
    }

    /// Grow or shrink `sector` to `new_length` bytes, materializing or
    /// releasing direct, single-indirect and double-indirect sectors as
    /// needed. On allocator failure partway through, rolls back to the
    /// inode's prior length on a best-effort basis and reports the failure.
    pub fn resize(&self, sector: Sector, new_length: u64) -> InodeResult<()> {
        if new_length as usize > MAX_SECTORS * SECTOR_SIZE as usize {
            return Err(InodeError::Invalid("requested length exceeds the maximum file size"));
        }
        let mut di = read_disk_inode(&self.cache, sector)?;
        let old_length = di.length;
        match self.resize_apply(&mut di, new_length) {
            Ok(()) => {
                di.length = new_length;
                write_disk_inode(&self.cache, sector, &di)?;
                Ok(())
            }
            Err(e) => {
                log::warn!("inode: resize of sector {} to {} failed ({}), rolling back", sector, new_length, e);
                let _ = self.resize_apply(&mut di, old_length);
                write_disk_inode(&self.cache, sector, &di)?;
                Err(e)
            }
        }
    }

    fn resize_apply(&self, di: &mut DiskInode, new_length: u64) -> InodeResult<()> {
        let needed = sectors_for(new_length);

        for i in 0..DIRECT_POINTERS {
            self.resize_slot(&mut di.direct[i], needed > i)?;
        }

        let needs_indirect = needed > DIRECT_CAP;
        if needs_indirect && di.indirect == 0 {
            di.indirect = self.alloc.allocate(1)?[0];
            write_pointer_block(&self.cache, di.indirect, &[0; POINTERS_PER_SECTOR])?;
        }
        if di.indirect != 0 {
            let indirect_needed = needed.saturating_sub(DIRECT_CAP).min(POINTERS_PER_SECTOR);
            self.resize_pointer_block(di.indirect, indirect_needed)?;
        }
        if !needs_indirect && di.indirect != 0 {
            self.alloc.release(di.indirect, 1)?;
            di.indirect = 0;
        }

        let needs_double = needed > INDIRECT_CAP;
        if needs_double && di.double_indirect == 0 {
            di.double_indirect = self.alloc.allocate(1)?[0];
            write_pointer_block(&self.cache, di.double_indirect, &[0; POINTERS_PER_SECTOR])?;
        }
        if di.double_indirect != 0 {
            let double_needed = needed.saturating_sub(INDIRECT_CAP);
            let mut outer = read_pointer_block(&self.cache, di.double_indirect)?;
            for (oi, entry) in outer.iter_mut().enumerate() {
                let inner_needed = double_needed.saturating_sub(oi * POINTERS_PER_SECTOR).min(POINTERS_PER_SECTOR);
                if inner_needed > 0 && *entry == 0 {
                    *entry = self.alloc.allocate(1)?[0];
                    write_pointer_block(&self.cache, *entry, &[0; POINTERS_PER_SECTOR])?;
                }
                if *entry != 0 {
                    self.resize_pointer_block(*entry, inner_needed)?;
                }
                if inner_needed == 0 && *entry != 0 {
                    self.alloc.release(*entry, 1)?;
                    *entry = 0;
                }
            }
            write_pointer_block(&self.cache, di.double_indirect, &outer)?;
        }
        if !needs_double && di.double_indirect != 0 {
            self.alloc.release(di.double_indirect, 1)?;
            di.double_indirect = 0;
        }

        Ok(())
    }

    /// Allocate or release a single direct-pointer slot.
    fn resize_slot(&self, slot: &mut Sector, needed: bool) -> InodeResult<()> {
        if needed && *slot == 0 {
            let s = self.alloc.allocate(1)?[0];
            zero_sector(&self.cache, s)?;
            *slot = s;
        } else if !needed && *slot != 0 {
            self.alloc.release(*slot, 1)?;
            *slot = 0;
        }
        Ok(())
    }

    /// Materialize or release `needed` of the `POINTERS_PER_SECTOR` data
    /// pointers held in the pointer block at `block_sector`. Shared between
    /// the single-indirect level and each inner block of the
    /// double-indirect level, since both hold pointers directly to data
    /// sectors.
    fn resize_pointer_block(&self, block_sector: Sector, needed: usize) -> InodeResult<()> {
        let mut ptrs = read_pointer_block(&self.cache, block_sector)?;
        for (i, ptr) in ptrs.iter_mut().enumerate() {
            self.resize_slot(ptr, needed > i)?;
        }
        write_pointer_block(&self.cache, block_sector, &ptrs)?;
        Ok(())
    }

    /// Release every sector in `sector`'s block-map tree, then `sector`
    /// itself. Called once an inode is both removed and fully closed.
    fn release_tree(&self, sector: Sector) -> InodeResult<()> {
        let di = read_disk_inode(&self.cache, sector)?;
        for ptr in di.direct.iter() {
            if *ptr != 0 {
                self.alloc.release(*ptr, 1)?;
            }
        }
        if di.indirect != 0 {
            let ptrs = read_pointer_block(&self.cache, di.indirect)?;
            for ptr in ptrs.iter() {
                if *ptr != 0 {
                    self.alloc.release(*ptr, 1)?;
                }
            }
            self.alloc.release(di.indirect, 1)?;
        }
        if di.double_indirect != 0 {
            let outer = read_pointer_block(&self.cache, di.double_indirect)?;
            for entry in outer.iter() {
                if *entry != 0 {
                    let inner = read_pointer_block(&self.cache, *entry)?;
                    for ptr in inner.iter() {
                        if *ptr != 0 {
                            self.alloc.release(*ptr, 1)?;
                        }
                    }
                    self.alloc.release(*entry, 1)?;
                }
            }
            self.alloc.release(di.double_indirect, 1)?;
        }
        self.alloc.release(sector, 1)?;
        log::debug!("inode: released block-map tree and sector {}", sector);
        Ok(())
    }
}

/// A handle to an open inode. Cheap to clone the underlying sector number,
/// but each handle obtained through [`InodeLayer::open`] or
/// [`InodeLayer::reopen`] holds one registry reference that must be released
/// through [`Inode::close`].
pub struct Inode {
    sector: Sector,
}

impl Inode {
    /// The sector this handle refers to (its inumber).
    pub fn inumber(&self) -> Sector {
        self.sector
    }

    /// Whether this is the filesystem's root directory inode.
    pub fn is_root(&self) -> bool {
        self.sector == crate::ROOT_SECTOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::FreeMap;
    use crate::cache::SectorCache;
    use crate::SECTOR_SIZE;
    use fs_api::device::Device;
    use std::fs::{create_dir_all, remove_dir_all};
    use std::path::PathBuf;

    fn setup(name: &str, sectors: u64) -> (PathBuf, Arc<InodeLayer>, Arc<FreeMap>) {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("fs-images-inode-".to_string() + name);
        let _ = remove_dir_all(&path);
        create_dir_all(&path).unwrap();
        path.push("img");
        let dev = Device::new(&path, SECTOR_SIZE, sectors).unwrap();
        let cache = Arc::new(SectorCache::new(dev));
        let alloc = Arc::new(FreeMap::create(cache.clone(), sectors).unwrap());
        let layer = InodeLayer::new(cache, alloc.clone());
        (path, layer, alloc)
    }

    // Every test reserves its inode's own sector through the allocator
    // before creating it there, exactly as `Filesystem::create` does —
    // otherwise `InodeLayer::create`'s own internal allocation for
    // `direct[0]` could hand back the same sector number.
    fn fresh_sector(alloc: &FreeMap) -> Sector {
        alloc.allocate(1).unwrap()[0]
    }

    #[test]
    fn create_allocates_direct_zero_even_at_length_zero() {
        let (path, layer, alloc) = setup("create", 32);
        let s = fresh_sector(&alloc);
        layer.create(s, false, 1, 0, 0).unwrap();
        assert_eq!(layer.length(s).unwrap(), 0);
        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn write_then_read_round_trips() {
        let (path, layer, alloc) = setup("rw", 64);
        let s = fresh_sector(&alloc);
        layer.create(s, false, 1, 0, 0).unwrap();
        let data = b"hello filesystem".to_vec();
        let written = layer.write_at(s, &data, 100).unwrap();
        assert_eq!(written, data.len());
        assert_eq!(layer.length(s).unwrap(), 100 + data.len() as u64);

        let mut buf = vec![0u8; data.len()];
        let read = layer.read_at(s, &mut buf, 100).unwrap();
        assert_eq!(read, data.len());
        assert_eq!(buf, data);

        let mut hole = vec![0xffu8; 10];
        layer.read_at(s, &mut hole, 0).unwrap();
        assert_eq!(hole, vec![0u8; 10]);

        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn grow_across_indirect_boundary_then_shrink_back() {
        let (path, layer, alloc) = setup("boundary", 4096);
        let s = fresh_sector(&alloc);
        layer.create(s, false, 1, 0, 0).unwrap();

        let big = (DIRECT_POINTERS as u64 + 4) * SECTOR_SIZE;
        layer.resize(s, big).unwrap();
        assert_eq!(layer.length(s).unwrap(), big);

        layer.resize(s, 10).unwrap();
        assert_eq!(layer.length(s).unwrap(), 10);

        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn deny_write_blocks_writes_until_allowed() {
        let (path, layer, alloc) = setup("deny", 32);
        let s = fresh_sector(&alloc);
        layer.create(s, false, 1, 0, 0).unwrap();
        layer.deny_write(s);
        assert_eq!(layer.write_at(s, b"x", 0).unwrap(), 0);
        layer.allow_write(s);
        assert_eq!(layer.write_at(s, b"x", 0).unwrap(), 1);
        remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn removed_inode_released_only_after_last_close() {
        let (path, layer, alloc) = setup("removed", 32);
        let s = fresh_sector(&alloc);
        layer.create(s, false, 1, 0, 0).unwrap();
        let h1 = layer.open(s).unwrap();
        let _h2 = layer.reopen(s);
        layer.remove(s).unwrap();

        layer.close(h1.inumber()).unwrap();
        assert!(layer.length(s).is_ok());

        layer.close(s).unwrap();
        assert!(layer.length(s).is_err());

        remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
