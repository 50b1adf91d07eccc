//! Directory layer: fixed-size directory entries stored as plain file data
//! inside a directory's own inode, looked up linearly the way the system
//! this was modeled on scans its directory files entry by entry.

use crate::error::{DirError, DirResult};
use crate::inode::InodeLayer;
use crate::{Sector, INITIAL_DIR_ENTRIES, NAME_MAX};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One fixed-size directory entry: a name and the sector of the inode it
/// names. `in_use` distinguishes a live entry from a hole left by removal,
/// since entries are never compacted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct DiskEntry {
    inode_sector: Sector,
    name: [u8; NAME_MAX],
    name_len: u8,
    in_use: bool,
}

impl DiskEntry {
    fn empty() -> DiskEntry {
        DiskEntry {
            inode_sector: 0,
            name: [0; NAME_MAX],
            name_len: 0,
            in_use: false,
        }
    }

    fn named(name: &str, sector: Sector) -> DirResult<DiskEntry> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > NAME_MAX {
            return Err(DirError::InvalidName(name.to_string()));
        }
        let mut buf = [0u8; NAME_MAX];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(DiskEntry {
            inode_sector: sector,
            name: buf,
            name_len: bytes.len() as u8,
            in_use: true,
        })
    }

    fn name(&self) -> &str {
        std::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }
}

lazy_static::lazy_static! {
    static ref ENTRY_SIZE: u64 = bincode::serialize(&DiskEntry::empty()).unwrap().len() as u64;
}

/// One resolved directory entry, returned by [`readdir`] and [`lookup`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Sector of the inode this entry names.
    pub sector: Sector,
}

fn read_entry(inodes: &InodeLayer, dir_sector: Sector, index: u64) -> DirResult<Option<DiskEntry>> {
    let offset = index * *ENTRY_SIZE;
    let mut buf = vec![0u8; *ENTRY_SIZE as usize];
    let n = inodes.read_at(dir_sector, &mut buf, offset)?;
    if n < *ENTRY_SIZE as usize {
        return Ok(None);
    }
    let entry: DiskEntry = bincode::deserialize(&buf).map_err(|_| DirError::InvalidName(String::new()))?;
    Ok(Some(entry))
}

fn write_entry(inodes: &InodeLayer, dir_sector: Sector, index: u64, entry: &DiskEntry) -> DirResult<()> {
    let offset = index * *ENTRY_SIZE;
    let bytes = bincode::serialize(entry).map_err(|_| DirError::InvalidName(String::new()))?;
    inodes.write_at(dir_sector, &bytes, offset)?;
    Ok(())
}

fn entry_count(inodes: &InodeLayer, dir_sector: Sector) -> DirResult<u64> {
    Ok(inodes.length(dir_sector)? / *ENTRY_SIZE)
}

/// Format a fresh, empty directory at `sector` (already created as an
/// inode), seeding it with `.` and `..`. The root is its own parent, so
/// both entries point back at `sector` there regardless of `parent`.
pub fn format(inodes: &Arc<InodeLayer>, sector: Sector, parent: Sector) -> DirResult<()> {
    let initial_len = INITIAL_DIR_ENTRIES as u64 * *ENTRY_SIZE;
    inodes.resize(sector, initial_len)?;
    for i in 0..INITIAL_DIR_ENTRIES as u64 {
        write_entry(inodes, sector, i, &DiskEntry::empty())?;
    }
    let dotdot = if sector == crate::ROOT_SECTOR { sector } else { parent };
    write_entry(inodes, sector, 0, &DiskEntry::named(".", sector)?)?;
    write_entry(inodes, sector, 1, &DiskEntry::named("..", dotdot)?)?;
    Ok(())
}

/// Look up `name` in the directory at `dir_sector`.
pub fn lookup(inodes: &InodeLayer, dir_sector: Sector, name: &str) -> DirResult<DirEntry> {
    let count = entry_count(inodes, dir_sector)?;
    for i in 0..count {
        if let Some(e) = read_entry(inodes, dir_sector, i)? {
            if e.in_use && e.name() == name {
                return Ok(DirEntry {
                    name: name.to_string(),
                    sector: e.inode_sector,
                });
            }
        }
    }
    Err(DirError::NotFound(name.to_string()))
}

/// Whether `name` already has an entry in `dir_sector`.
pub fn contains(inodes: &InodeLayer, dir_sector: Sector, name: &str) -> DirResult<bool> {
    match lookup(inodes, dir_sector, name) {
        Ok(_) => Ok(true),
        Err(DirError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Add an entry named `name` pointing at `sector` to the directory at
/// `dir_sector`, reusing the first free slot or growing the directory by
/// one entry if none is free.
pub fn add(inodes: &Arc<InodeLayer>, dir_sector: Sector, name: &str, sector: Sector) -> DirResult<()> {
    if contains(inodes, dir_sector, name)? {
        return Err(DirError::AlreadyExists(name.to_string()));
    }
    let entry = DiskEntry::named(name, sector)?;
    let count = entry_count(inodes, dir_sector)?;
    for i in 0..count {
        if let Some(e) = read_entry(inodes, dir_sector, i)? {
            if !e.in_use {
                write_entry(inodes, dir_sector, i, &entry)?;
                return Ok(());
            }
        }
    }
    write_entry(inodes, dir_sector, count, &entry)?;
    Ok(())
}

/// Remove the entry named `name` from the directory at `dir_sector`.
/// Marks the slot free without compacting the rest of the directory.
pub fn remove(inodes: &InodeLayer, dir_sector: Sector, name: &str) -> DirResult<Sector> {
    let count = entry_count(inodes, dir_sector)?;
    for i in 0..count {
        if let Some(e) = read_entry(inodes, dir_sector, i)? {
            if e.in_use && e.name() == name {
                write_entry(inodes, dir_sector, i, &DiskEntry::empty())?;
                return Ok(e.inode_sector);
            }
        }
    }
    Err(DirError::NotFound(name.to_string()))
}

/// List every live entry in the directory at `dir_sector`, in on-disk slot
/// order (not sorted, not compacted).
pub fn readdir(inodes: &InodeLayer, dir_sector: Sector) -> DirResult<Vec<DirEntry>> {
    let count = entry_count(inodes, dir_sector)?;
    let mut out = Vec::new();
    for i in 0..count {
        if let Some(e) = read_entry(inodes, dir_sector, i)? {
            if e.in_use {
                out.push(DirEntry {
                    name: e.name().to_string(),
                    sector: e.inode_sector,
                });
            }
        }
    }
    Ok(out)
}

/// Whether the directory at `dir_sector` holds nothing but `.` and `..`.
pub fn is_empty(inodes: &InodeLayer, dir_sector: Sector) -> DirResult<bool> {
    let entries = readdir(inodes, dir_sector)?;
    Ok(entries.iter().all(|e| e.name == "." || e.name == ".."))
}
