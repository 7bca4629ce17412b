//! Fork descriptors and the mapping of fork byte ranges onto allocation
//! blocks through the eight inline extents.

use alloc::format;
use alloc::string::String;
use binrw::BinReaderExt;
use binrw::io::Cursor;
use core::cmp::Ordering;
use tracing::trace;

use crate::btree::{BTree, Key, Record};
use crate::bytes::ReadBeExt;
use crate::device::{BlockDevice, read_bytes};
use crate::internal::{CatalogNodeId, ExtentRecord, ForkData};
use crate::node::RecordLocation;
use crate::unicode::NameOrder;
use crate::{Error, Result};

/// In-memory fork descriptor: logical size plus the inline extents covering
/// the head of the fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fork {
    logical_size: u64,
    total_blocks: u32,
    extents: ExtentRecord,
}

/// Where a fork byte lands on disk, and how many bytes from there on are
/// contiguous (capped at the requested length).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub physical_block: u64,
    pub offset_in_block: u64,
    pub length: u64,
}

impl Mapping {
    pub fn byte_offset(&self, block_size: u32) -> u64 {
        self.physical_block * u64::from(block_size) + self.offset_in_block
    }
}

impl Fork {
    pub fn new(logical_size: u64, total_blocks: u32, extents: ExtentRecord) -> Self {
        Self {
            logical_size,
            total_blocks,
            extents,
        }
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    pub fn extents(&self) -> &ExtentRecord {
        &self.extents
    }

    /// Blocks reachable without the extents overflow file.
    pub fn inline_blocks(&self) -> u64 {
        self.extents.iter().map(|e| u64::from(e.block_count)).sum()
    }

    /// True when part of the fork's logical size is only described by the
    /// extents overflow file.
    pub fn needs_overflow(&self, block_size: u32) -> bool {
        self.inline_blocks() * u64::from(block_size) < self.logical_size
    }

    pub fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.logical_size => Ok(()),
            _ => Err(Error::OutOfRange {
                offset,
                length,
                size: self.logical_size,
            }),
        }
    }

    pub fn map(&self, block_size: u32, offset: u64, length: u64) -> Result<Mapping> {
        self.check_range(offset, length)?;
        if block_size == 0 {
            return Err(Error::Corrupt(String::from("zero allocation block size")));
        }
        let block_size = u64::from(block_size);
        let fork_block = offset / block_size;

        let mut blocks_before = 0u64;
        for extent in &self.extents {
            let count = u64::from(extent.block_count);
            if blocks_before + count > fork_block {
                let contiguous = (blocks_before + count) * block_size - offset;
                return Ok(Mapping {
                    physical_block: u64::from(extent.start_block) + (fork_block - blocks_before),
                    offset_in_block: offset % block_size,
                    length: length.min(contiguous),
                });
            }
            blocks_before += count;
        }
        Err(Error::ExtentNotFound(fork_block))
    }
}

impl From<&ForkData> for Fork {
    fn from(data: &ForkData) -> Self {
        Fork::new(data.logical_size, data.total_blocks, data.extents)
    }
}

/// Reads fork bytes `[offset, offset + buf.len())`, one contiguous run per
/// extent touched. The whole range is checked before any I/O is issued.
pub fn read_fork<D: BlockDevice + ?Sized>(
    device: &D,
    fork: &Fork,
    block_size: u32,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    fork.check_range(offset, buf.len() as u64)?;
    let mut done = 0usize;
    while done < buf.len() {
        let position = offset + done as u64;
        let mapping = fork.map(block_size, position, (buf.len() - done) as u64)?;
        let run = mapping.length as usize;
        trace!(
            position,
            block = mapping.physical_block,
            run,
            "fork run"
        );
        read_bytes(device, mapping.byte_offset(block_size), &mut buf[done..done + run])?;
        done += run;
    }
    Ok(())
}

pub const EXTENT_KEY_LENGTH: u16 = 10;
pub const DATA_FORK: u8 = 0x00;
pub const RESOURCE_FORK: u8 = 0xff;

/// Key of the extents overflow B-tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExtentKey {
    pub fork_type: u8,
    pub file_id: CatalogNodeId,
    pub start_block: u32,
}

impl ExtentKey {
    pub fn new(file_id: CatalogNodeId, fork_type: u8, start_block: u32) -> Self {
        ExtentKey {
            fork_type,
            file_id,
            start_block,
        }
    }
}

impl Key for ExtentKey {
    fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let key_length = data.read_u16_be_at(0)?;
        if key_length < EXTENT_KEY_LENGTH {
            return Err(Error::Corrupt(format!(
                "extent key length {key_length} is shorter than {EXTENT_KEY_LENGTH}"
            )));
        }
        let key = ExtentKey {
            fork_type: data.read_u8_at(2)?,
            file_id: data.read_u32_be_at(4)?,
            start_block: data.read_u32_be_at(8)?,
        };
        Ok((key, 2 + usize::from(key_length)))
    }

    fn compare(&self, other: &Self, _order: NameOrder) -> Ordering {
        self.file_id
            .cmp(&other.file_id)
            .then(self.fork_type.cmp(&other.fork_type))
            .then(self.start_block.cmp(&other.start_block))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentOverflowRecord {
    pub key: ExtentKey,
    pub extents: ExtentRecord,
    pub location: RecordLocation,
}

impl Record<ExtentKey> for ExtentOverflowRecord {
    fn decode(key: ExtentKey, data: &[u8], location: RecordLocation) -> Result<Self> {
        let mut cursor = Cursor::new(data.bytes_at(0, 64)?);
        let extents: ExtentRecord = cursor.read_be()?;
        Ok(ExtentOverflowRecord {
            key,
            extents,
            location,
        })
    }

    fn key(&self) -> &ExtentKey {
        &self.key
    }

    fn location(&self) -> RecordLocation {
        self.location
    }
}

pub type ExtentsTree<D> = BTree<D, ExtentKey, ExtentOverflowRecord>;
