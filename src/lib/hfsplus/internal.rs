use binrw::{BinRead, BinWrite};
use bitflags::bitflags;

use crate::{Error, Result};
use alloc::format;

pub type CatalogNodeId = u32;

pub const ROOT_PARENT_ID: CatalogNodeId = 1;
pub const ROOT_FOLDER_ID: CatalogNodeId = 2;
pub const EXTENTS_FILE_ID: CatalogNodeId = 3;
pub const CATALOG_FILE_ID: CatalogNodeId = 4;
pub const FIRST_USER_CATALOG_NODE_ID: CatalogNodeId = 16;

pub const HFSP_SIGNATURE: u16 = 0x482b;
pub const HFSX_SIGNATURE: u16 = 0x4858;
pub const HFSP_VERSION: u16 = 4;
pub const HFSX_VERSION: u16 = 5;

pub const VOLUME_HEADER_OFFSET: u64 = 1024;
pub const VOLUME_HEADER_SIZE: usize = 512;

/// Seconds between 1904-01-01 (HFS epoch) and 1970-01-01 (Unix epoch).
pub const HFS_EPOCH_OFFSET: i64 = 2_082_844_800;

pub const S_ISUID: u16 = 0o0004000;
pub const S_ISGID: u16 = 0o0002000;
pub const S_ISTXT: u16 = 0o0001000;

pub const S_IFMT: u16 = 0o0170000;
pub const S_IFIFO: u16 = 0o0010000;
pub const S_IFCHR: u16 = 0o0020000;
pub const S_IFDIR: u16 = 0o0040000;
pub const S_IFBLK: u16 = 0o0060000;
pub const S_IFREG: u16 = 0o0100000;
pub const S_IFLNK: u16 = 0o0120000;
pub const S_IFSOCK: u16 = 0o0140000;
pub const S_IFWHT: u16 = 0o0160000;

pub const INLINE_EXTENT_COUNT: usize = 8;

#[derive(BinRead, BinWrite, Debug, Copy, Clone, Default, PartialEq, Eq)]
#[brw(big)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

pub type ExtentRecord = [ExtentDescriptor; INLINE_EXTENT_COUNT];

/// 80-byte fork descriptor as stored in the volume header and file records.
#[derive(BinRead, BinWrite, Debug, Copy, Clone, Default, PartialEq, Eq)]
#[brw(big)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: ExtentRecord,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeAttributes: u32 {
        const HARDWARE_LOCK = 1 << 7;
        const UNMOUNTED = 1 << 8;
        const SPARED_BLOCKS = 1 << 9;
        const NO_CACHE_REQUIRED = 1 << 10;
        const BOOT_VOLUME_INCONSISTENT = 1 << 11;
        const CATALOG_NODE_IDS_REUSED = 1 << 12;
        const JOURNALED = 1 << 13;
        const SOFTWARE_LOCK = 1 << 15;
    }
}

#[derive(BinRead, BinWrite, Debug, Clone, Default, PartialEq, Eq)]
#[brw(big)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encodings_bitmap: u64,
    pub finder_info: [u32; 8],
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    pub fn volume_attributes(&self) -> VolumeAttributes {
        VolumeAttributes::from_bits_retain(self.attributes)
    }

    pub fn is_hfsx(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }

    /// Checks signature, version and allocation block geometry.
    pub fn validate(&self) -> Result<()> {
        let expected_version = match self.signature {
            HFSP_SIGNATURE => HFSP_VERSION,
            HFSX_SIGNATURE => HFSX_VERSION,
            other => return Err(Error::BadSignature(other)),
        };
        if self.version != expected_version {
            return Err(Error::UnsupportedVersion {
                signature: self.signature,
                version: self.version,
            });
        }
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(Error::Corrupt(format!(
                "allocation block size {} is not a power of two of at least 512",
                self.block_size
            )));
        }
        Ok(())
    }
}

pub const NODE_DESCRIPTOR_SIZE: usize = 14;

#[derive(BinRead, BinWrite, Debug, Copy, Clone, Default, PartialEq, Eq)]
#[brw(big)]
pub struct NodeDescriptor {
    pub f_link: u32,
    pub b_link: u32,
    pub kind: i8,
    pub height: u8,
    pub num_records: u16,
    pub reserved: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i8)]
pub enum NodeKind {
    Leaf = -1,
    Index = 0,
    Header = 1,
    Map = 2,
}

impl TryFrom<i8> for NodeKind {
    type Error = Error;

    fn try_from(kind: i8) -> Result<Self> {
        match kind {
            -1 => Ok(NodeKind::Leaf),
            0 => Ok(NodeKind::Index),
            1 => Ok(NodeKind::Header),
            2 => Ok(NodeKind::Map),
            other => Err(Error::Corrupt(format!("unknown node kind {other}"))),
        }
    }
}

pub const HEADER_REC_SIZE: usize = 106;
pub const HEADER_USER_DATA_SIZE: usize = 128;

pub const KEY_COMPARE_CASE_FOLDING: u8 = 0xcf;
pub const KEY_COMPARE_BINARY: u8 = 0xbc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TreeAttributes: u32 {
        const BAD_CLOSE = 0x0000_0001;
        const BIG_KEYS = 0x0000_0002;
        const VARIABLE_INDEX_KEYS = 0x0000_0004;
    }
}

#[derive(BinRead, BinWrite, Debug, Clone, Default, PartialEq, Eq)]
#[brw(big)]
pub struct HeaderRec {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub reserved1: u16,
    pub clump_size: u32,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: u32,
    pub reserved3: [u32; 16],
}

impl HeaderRec {
    pub fn tree_attributes(&self) -> TreeAttributes {
        TreeAttributes::from_bits_retain(self.attributes)
    }
}

/// Seconds relative to the Unix epoch, decoded from a 32-bit HFS date.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn from_hfs(raw: u32) -> Self {
        Timestamp(i64::from(raw) - HFS_EPOCH_OFFSET)
    }

    /// Inverse of [`Timestamp::from_hfs`]; saturates outside the 32-bit range.
    pub fn to_hfs(self) -> u32 {
        (self.0 + HFS_EPOCH_OFFSET).clamp(0, i64::from(u32::MAX)) as u32
    }

    pub fn unix_seconds(self) -> i64 {
        self.0
    }
}
