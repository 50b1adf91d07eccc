//! Error type shared by the device and serialization layers.
//!
//! The `#[from]` conversions let callers in `fs-core` propagate these errors
//! with `?` once wrapped in their own, layered error enums (see
//! `fs_core::error`).

use std::io;
use thiserror::Error;

/// Error type returned by the `device` and `types` modules.
#[derive(Error, Debug)]
pub enum ApiError {
    /// I/O failure while reading or writing the backing file.
    #[error("I/O error in the device layer")]
    Io(#[from] io::Error),
    /// Failure (de)serializing a fixed-size on-disk record.
    #[error("serialization error")]
    Serialize(#[from] bincode::Error),
    /// Invalid argument passed to a `Device` method.
    #[error("invalid device input: {0}")]
    DeviceInput(&'static str),
    /// Invalid argument passed to a `Buffer`/`Block` method.
    #[error("invalid block input: {0}")]
    BlockInput(&'static str),
    /// Catch-all for errors that don't need to be matched on individually.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ApiError>;
