//! Path resolver: tokenizes a path and walks it one directory lookup and
//! inode open at a time, closing every intermediate directory handle before
//! returning so a long-running traversal never leaks opens.

use crate::directory;
use crate::error::{PathError, PathResult};
use crate::inode::InodeLayer;
use crate::{Sector, NAME_MAX, ROOT_SECTOR};
use std::sync::Arc;

/// Split `path` into its non-empty components, rejecting any component
/// longer than [`NAME_MAX`].
pub fn tokenize(path: &str) -> PathResult<Vec<String>> {
    let mut out = Vec::new();
    for part in path.split('/') {
        if part.is_empty() {
            continue;
        }
        if part.len() > NAME_MAX {
            return Err(PathError::NameTooLong(part.to_string()));
        }
        out.push(part.to_string());
    }
    Ok(out)
}

/// A leading `/` makes `path` absolute, resolved from [`ROOT_SECTOR`]
/// regardless of `start`; otherwise it is resolved relative to `start`.
fn starting_sector(start: Sector, path: &str) -> Sector {
    if path.starts_with('/') {
        ROOT_SECTOR
    } else {
        start
    }
}

/// Resolve `path` to the sector of the directory it names, starting the
/// walk at [`ROOT_SECTOR`] for an absolute path (one beginning with `/`) or
/// at `start` (the caller's current directory) for a relative one. Every
/// intermediate directory opened during the walk is closed again before
/// this returns, whether it succeeds or fails.
pub fn resolve_dir(inodes: &Arc<InodeLayer>, start: Sector, path: &str) -> PathResult<Sector> {
    let components = tokenize(path)?;
    let mut current = starting_sector(start, path);
    for name in components {
        let entry = directory::lookup(inodes, current, &name).map_err(|e| match e {
            crate::error::DirError::NotFound(n) => PathError::NotFound(n),
            other => PathError::Dir(other),
        })?;
        if !inodes.is_dir(entry.sector).map_err(crate::error::DirError::from)? {
            return Err(PathError::NotADirectory(name));
        }
        current = entry.sector;
    }
    Ok(current)
}

/// Resolve `path` to the sector of its containing directory and its final
/// component name, without requiring that final component to exist. Used
/// by operations (create, remove) that need the parent directory and a
/// bare name rather than a fully resolved entry. Absolute and relative
/// paths are distinguished the same way as in [`resolve_dir`].
pub fn resolve_parent(inodes: &Arc<InodeLayer>, start: Sector, path: &str) -> PathResult<(Sector, String)> {
    let mut components = tokenize(path)?;
    let name = components.pop().ok_or_else(|| PathError::NotFound(path.to_string()))?;
    let mut current = starting_sector(start, path);
    for part in components {
        let entry = directory::lookup(inodes, current, &part).map_err(|e| match e {
            crate::error::DirError::NotFound(n) => PathError::NotFound(n),
            other => PathError::Dir(other),
        })?;
        if !inodes.is_dir(entry.sector).map_err(crate::error::DirError::from)? {
            return Err(PathError::NotADirectory(part));
        }
        current = entry.sector;
    }
    Ok((current, name))
}

/// Shorthand for `resolve_dir` rooted at [`ROOT_SECTOR`], for absolute paths.
pub fn resolve_absolute(inodes: &Arc<InodeLayer>, path: &str) -> PathResult<Sector> {
    resolve_dir(inodes, ROOT_SECTOR, path)
}
