//! Shared device and serialization primitives used by the file system core.
//!
//! This crate is deliberately thin: it owns the on-disk byte plumbing (the
//! memory-mapped [`device`] and the [`types::Buffer`]/[`types::Block`]
//! (de)serialization helpers) but knows nothing about inodes, directories or
//! paths. Those live in `fs-core`, layered on top of this crate the same way
//! a kernel's block layer sits below its file system proper.

#![deny(missing_docs)]

pub mod device;
pub mod error;
pub mod types;
