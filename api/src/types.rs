//! Generic byte-buffer and on-disk-block types.
//!
//! These are intentionally agnostic to file system semantics: `Buffer` is a
//! fixed-size heap allocation with read/write and (de)serialization helpers,
//! and `Block` pairs a `Buffer` with the sector index it was read from or
//! will be written to. Everything that knows what an inode or a directory
//! entry *is* lives in `fs-core`, layered on top of these two types.

use super::error::{ApiError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::io::prelude::*;
use std::io::{Cursor, SeekFrom};

/// A heap-allocated, fixed-size buffer of bytes.
///
/// Used both as the backing storage of a [`Block`] and as scratch space for
/// reading and writing sub-ranges of a block.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Buffer {
    contents: Box<[u8]>,
}

impl Buffer {
    /// Create a new buffer wrapping `data`.
    pub fn new(data: Box<[u8]>) -> Buffer {
        Buffer { contents: data }
    }

    /// Create an all-zero buffer of length `len`.
    pub fn new_zero(len: u64) -> Buffer {
        Buffer {
            contents: vec![0; len as usize].into_boxed_slice(),
        }
    }

    /// Length of this buffer, in bytes.
    pub fn len(&self) -> u64 {
        self.contents.len() as u64
    }

    /// Whether this buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Borrow the contents of this buffer.
    pub fn contents_as_ref(&self) -> &[u8] {
        &self.contents
    }

    /// Read `data.len()` bytes starting at `offset` into `data`.
    pub fn read_data(&self, data: &mut [u8], offset: u64) -> Result<()> {
        if offset + data.len() as u64 > self.len() {
            return Err(ApiError::BlockInput("trying to read beyond the bounds of the block"));
        }
        let mut c = Cursor::new(&self.contents);
        c.seek(SeekFrom::Start(offset))?;
        c.read_exact(data).map_err(|e| e.into())
    }

    /// Write all of `data` starting at `offset`.
    pub fn write_data(&mut self, data: &[u8], offset: u64) -> Result<()> {
        if offset + data.len() as u64 > self.len() {
            return Err(ApiError::BlockInput("trying to write beyond the bounds of the block"));
        }
        let mut c = Cursor::new(&mut self.contents[..]);
        c.seek(SeekFrom::Start(offset))?;
        c.write_all(data).map_err(|e| e.into())
    }

    /// Deserialize a `S` starting at byte `offset`.
    pub fn deserialize_from<S>(&self, offset: u64) -> Result<S>
    where
        S: DeserializeOwned,
    {
        let mut c = Cursor::new(&self.contents);
        c.seek(SeekFrom::Start(offset))?;
        Ok(bincode::deserialize_from(c)?)
    }

    /// Serialize `stru` into this buffer starting at byte `offset`.
    /// Goes through `write_data` so bounds errors are reported consistently.
    pub fn serialize_into<S>(&mut self, stru: &S, offset: u64) -> Result<()>
    where
        S: Serialize,
    {
        let stru_bin = bincode::serialize(stru)?;
        self.write_data(&stru_bin, offset)
    }
}

/// A block of data read from, or to be written to, a fixed sector on a [`Device`](crate::device::Device).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Block {
    /// Index of this block (sector) on the device.
    pub block_no: u64,
    buf: Buffer,
}

impl Block {
    /// Create a new block for sector `block_no`, with contents `data`.
    pub fn new(block_no: u64, data: Box<[u8]>) -> Block {
        Block {
            block_no,
            buf: Buffer::new(data),
        }
    }

    /// Create an all-zero block for sector `block_no`, of length `len`.
    pub fn new_zero(block_no: u64, len: u64) -> Block {
        Block {
            block_no,
            buf: Buffer::new_zero(len),
        }
    }

    /// Length of this block's contents, in bytes.
    pub fn len(&self) -> u64 {
        self.buf.len()
    }

    /// Whether this block is empty (zero-length).
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow the contents of this block.
    pub fn contents_as_ref(&self) -> &[u8] {
        self.buf.contents_as_ref()
    }

    /// Read `data.len()` bytes starting at `offset` into `data`.
    pub fn read_data(&self, data: &mut [u8], offset: u64) -> Result<()> {
        self.buf.read_data(data, offset)
    }

    /// Write all of `data` starting at `offset`.
    pub fn write_data(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.buf.write_data(data, offset)
    }

    /// Deserialize a `S` starting at byte `offset`.
    pub fn deserialize_from<S>(&self, offset: u64) -> Result<S>
    where
        S: DeserializeOwned,
    {
        self.buf.deserialize_from(offset)
    }

    /// Serialize `stru` into this block starting at byte `offset`.
    pub fn serialize_into<S>(&mut self, stru: &S, offset: u64) -> Result<()>
    where
        S: Serialize,
    {
        self.buf.serialize_into(stru, offset)
    }
}

#[cfg(test)]
mod block_tests {
    use super::Block;
    use serde::{Deserialize, Serialize};

    static BLOCK_SIZE: u64 = 1000;

    #[test]
    fn raw_rw_test() {
        let n1 = 12;
        let mut b1 = Block::new_zero(n1, BLOCK_SIZE);
        assert_eq!(b1.contents_as_ref(), vec![0; BLOCK_SIZE as usize]);

        let raw_data = vec![5; 5];
        b1.write_data(&raw_data, 10).unwrap();
        let mut raw_data = raw_data;
        b1.read_data(&mut raw_data, 8).unwrap();
        assert_eq!(raw_data, vec!(0, 0, 5, 5, 5));

        let mut emp = vec![];
        assert!(b1.write_data(&emp, BLOCK_SIZE).is_ok());
        assert!(b1.write_data(&emp, BLOCK_SIZE + 1).is_err());
        assert!(b1.read_data(&mut emp, BLOCK_SIZE + 1).is_err());
        let mut one = vec![1];
        assert!(b1.write_data(&one, BLOCK_SIZE).is_err());
        assert!(b1.read_data(&mut one, BLOCK_SIZE).is_err());
        let mut two = vec![1, 2];
        assert!(b1.write_data(&two, BLOCK_SIZE - 1).is_err());
        assert!(b1.read_data(&mut two, BLOCK_SIZE - 1).is_err());
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
    struct Point(u64, u64);

    #[test]
    fn serialization_test() {
        let p1 = Point(0, 0);
        let p2 = Point(1000, 1000);

        let n1 = 12;
        let mut b1 = Block::new(n1, vec![1; BLOCK_SIZE as usize].into_boxed_slice());
        let point_size = bincode::serialize(&p1).unwrap().len() as u64;
        b1.serialize_into(&p1, 0).unwrap();
        b1.serialize_into(&p2, point_size).unwrap();
        assert_eq!(b1.deserialize_from::<Point>(0).unwrap(), p1);
        assert_eq!(b1.deserialize_from::<Point>(point_size).unwrap(), p2);

        let mut b1 = Block::new_zero(n1, BLOCK_SIZE);
        assert!(b1.deserialize_from::<Point>(BLOCK_SIZE + 1 - point_size).is_err());
        assert!(b1.serialize_into(&p2, BLOCK_SIZE + 1 - point_size).is_err());
        assert_eq!(b1.contents_as_ref(), vec![0; BLOCK_SIZE as usize]);
    }
}
