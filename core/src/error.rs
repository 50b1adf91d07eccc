//! Layered error types, one per component, each wrapping the layer below it
//! with `#[from]` so `?` composes all the way up to [`FsError`].

use fs_api::error::ApiError;
use thiserror::Error;

/// Errors from the sector cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Error from the underlying device or (de)serialization layer.
    #[error("error in the device layer")]
    Device(#[from] ApiError),
    /// Invalid argument to a cache method.
    #[error("invalid cache input: {0}")]
    Invalid(&'static str),
}

/// Errors from the free-sector allocator.
#[derive(Error, Debug)]
pub enum AllocError {
    /// Error in the sector cache backing the free map.
    #[error("error in the sector cache")]
    Cache(#[from] CacheError),
    /// No free sectors remain (or no run of the requested length).
    #[error("out of space: could not allocate {0} sector(s)")]
    OutOfSpace(u32),
    /// The device is too large for a single-sector free-map bitmap.
    #[error("device has {0} sectors, more than the free map can track")]
    DeviceTooLarge(u64),
}

/// Errors from the inode layer.
#[derive(Error, Debug)]
pub enum InodeError {
    /// Error in the sector cache.
    #[error("error in the sector cache")]
    Cache(#[from] CacheError),
    /// Error in the free-sector allocator.
    #[error("error in the free-sector allocator")]
    Alloc(#[from] AllocError),
    /// The sector does not contain a validly tagged inode.
    #[error("sector {0} does not contain a valid inode")]
    BadMagic(u32),
    /// Write attempted while `deny_write_count > 0`.
    #[error("write denied: inode is currently executing")]
    WriteDenied,
    /// Invalid argument to an inode-layer method.
    #[error("invalid inode input: {0}")]
    Invalid(&'static str),
}

/// Errors from the directory layer.
#[derive(Error, Debug)]
pub enum DirError {
    /// Error in the inode layer.
    #[error("error in the inode layer")]
    Inode(#[from] InodeError),
    /// A path component was empty or longer than `NAME_MAX`.
    #[error("invalid directory entry name: {0}")]
    InvalidName(String),
    /// `dir_add` found an existing entry with the same name.
    #[error("entry already exists: {0}")]
    AlreadyExists(String),
    /// `dir_lookup` found no matching entry.
    #[error("no such entry: {0}")]
    NotFound(String),
    /// Attempted to treat a non-directory inode as a directory.
    #[error("not a directory")]
    NotADirectory,
    /// Attempted to remove a directory with entries beyond `.` and `..`.
    #[error("directory not empty")]
    NotEmpty,
    /// Attempted to remove a directory that is still open elsewhere.
    #[error("directory is still in use")]
    InUse,
}

/// Errors from the path resolver.
#[derive(Error, Debug)]
pub enum PathError {
    /// Error in the directory layer.
    #[error("error in the directory layer")]
    Dir(#[from] DirError),
    /// A path component exceeded `NAME_MAX` characters.
    #[error("path component too long: {0}")]
    NameTooLong(String),
    /// A path component does not exist.
    #[error("no such file or directory: {0}")]
    NotFound(String),
    /// A non-final path component is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),
}

/// Top-level error type returned by [`crate::Filesystem`].
#[derive(Error, Debug)]
pub enum FsError {
    /// Error resolving a path.
    #[error("error resolving path")]
    Path(#[from] PathError),
    /// Error from the inode layer, reached directly (not via a path), e.g.
    /// through an already-open file handle.
    #[error("error in the inode layer")]
    Inode(#[from] InodeError),
    /// Error in the directory layer, reached directly through an open handle.
    #[error("error in the directory layer")]
    Dir(#[from] DirError),
    /// Invalid argument at the façade level.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Result alias used by the sector cache.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
/// Result alias used by the free-sector allocator.
pub type AllocResult<T> = std::result::Result<T, AllocError>;
/// Result alias used by the inode layer.
pub type InodeResult<T> = std::result::Result<T, InodeError>;
/// Result alias used by the directory layer.
pub type DirResult<T> = std::result::Result<T, DirError>;
/// Result alias used by the path resolver.
pub type PathResult<T> = std::result::Result<T, PathError>;
/// Result alias used by [`crate::Filesystem`].
pub type FsResult<T> = std::result::Result<T, FsError>;
