//! Read-only decoding of HFS Plus volumes.
//!
//! The crate maps fork byte ranges onto device blocks, loads B-tree nodes out
//! of the extents and catalog special files, and resolves catalog keys into
//! folder, file and thread records. It is `no_std` + `alloc`; hosted builds
//! additionally get [`StdDevice`] for reading images through `std::io`.

#![no_std]

#[cfg(not(target_os = "none"))]
extern crate std;

extern crate alloc;

use alloc::format;
use alloc::string::String;
use thiserror::Error;

pub mod btree;
pub mod bytes;
pub mod catalog;
pub mod device;
pub mod extents;
pub mod internal;
pub mod node;
pub mod unicode;
pub mod volume;

pub use crate::btree::{BTree, IndexPointer, Key, NodeSearch, Record, RecordCursor, Records};
pub use crate::catalog::{
    BsdInfo, CatalogBody, CatalogFile, CatalogFolder, CatalogKey, CatalogRecord, CatalogThread,
    CatalogTree, Children, Special,
};
#[cfg(not(target_os = "none"))]
pub use crate::device::StdDevice;
pub use crate::device::{BlockDevice, MemoryDevice, VolumeOptions};
pub use crate::extents::{ExtentKey, ExtentOverflowRecord, ExtentsTree, Fork, Mapping};
pub use crate::internal::*;
pub use crate::node::{KeyLayout, Node, NodeEntry, RecordLocation};
pub use crate::unicode::{HfsName, NameOrder};
pub use crate::volume::{Volume, VolumeStats};

#[derive(Debug, Error)]
pub enum Error {
    /// The block device failed to deliver the requested sectors.
    #[error("block read failed at sector {sector}: {reason}")]
    Io { sector: u64, reason: String },

    /// Header or record geometry disagrees with the sizes it declares.
    #[error("corrupt on-disk structure: {0}")]
    Corrupt(String),

    #[error("byte range {offset}+{length} lies outside a fork of {size} bytes")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    /// The fork block is past the eight inline extents; the extents overflow
    /// file is not consulted.
    #[error("fork block {0} is not covered by the inline extents")]
    ExtentNotFound(u64),

    #[error("invalid b-tree: {0}")]
    InvalidTree(String),

    #[error("unknown catalog record type {0:#06x}")]
    UnknownRecordType(i16),

    #[error("found a {found} record where a {expected} record was expected")]
    InvalidRecordType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("name of {0} code units exceeds the 255 unit limit")]
    NameTooLong(usize),

    #[error("no sibling node left to step into")]
    EndOfTree,

    #[error("bad volume signature {0:#06x}")]
    BadSignature(u16),

    #[error("unsupported version {version} for volume signature {signature:#06x}")]
    UnsupportedVersion { signature: u16, version: u16 },

    #[error("key not found")]
    KeyNotFound,
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        Error::Corrupt(format!("{e}"))
    }
}
