//! In-memory view of a single B-tree node.
//!
//! A node is a fixed-size page: a 14-byte descriptor, records packed after it,
//! and a table of big-endian record offsets growing backwards from the last
//! byte. The table has one entry per record plus a final entry marking the
//! start of free space.

use alloc::format;
use alloc::vec::Vec;
use binrw::BinReaderExt;
use binrw::io::Cursor;

use crate::btree::{IndexPointer, Key, Record};
use crate::bytes::ReadBeExt;
use crate::internal::{
    HEADER_REC_SIZE, HEADER_USER_DATA_SIZE, HeaderRec, NODE_DESCRIPTOR_SIZE, NodeDescriptor,
    NodeKind, TreeAttributes,
};
use crate::{Error, Result};

/// How index-node keys are laid out, taken from the tree header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    pub variable_index_keys: bool,
    pub max_key_length: u16,
}

impl KeyLayout {
    pub fn from_header(header: &HeaderRec) -> Self {
        KeyLayout {
            variable_index_keys: header
                .tree_attributes()
                .contains(TreeAttributes::VARIABLE_INDEX_KEYS),
            max_key_length: header.max_key_length,
        }
    }
}

/// Position of a record: byte offset of its node inside the tree file and
/// the record's slot in that node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RecordLocation {
    pub node_offset: u64,
    pub index: u16,
}

/// A decoded record, picked by the kind of node it lives in.
#[derive(Debug)]
pub enum NodeEntry<'a, K, R> {
    Pointer(IndexPointer<K>),
    Leaf(R),
    /// Header and map node records carry no key.
    Raw(&'a [u8]),
}

#[derive(Debug, Clone)]
pub struct Node {
    offset: u64,
    descriptor: NodeDescriptor,
    kind: NodeKind,
    buf: Vec<u8>,
    offsets: Vec<u16>,
}

impl Node {
    /// Parses the descriptor and offset table of a node read from byte
    /// `offset` of its tree file. Every table entry is validated here, so
    /// record accessors never index outside `buf`.
    pub fn parse(offset: u64, buf: Vec<u8>) -> Result<Self> {
        let descriptor: NodeDescriptor = Cursor::new(buf.as_slice()).read_be()?;
        let kind = NodeKind::try_from(descriptor.kind)?;

        let entries = usize::from(descriptor.num_records) + 1;
        let table_start = buf
            .len()
            .checked_sub(entries * 2)
            .filter(|&start| start >= NODE_DESCRIPTOR_SIZE)
            .ok_or_else(|| {
                Error::Corrupt(format!(
                    "node at {offset:#x} declares {} records, too many for {} bytes",
                    descriptor.num_records,
                    buf.len()
                ))
            })?;

        let mut offsets = Vec::with_capacity(entries);
        let mut previous = NODE_DESCRIPTOR_SIZE;
        for i in 0..entries {
            let record_offset = buf.read_u16_be_at(buf.len() - 2 * (i + 1))?;
            let position = usize::from(record_offset);
            if position < previous || position > table_start {
                return Err(Error::Corrupt(format!(
                    "node at {offset:#x}: record offset {i} is {record_offset:#x}"
                )));
            }
            previous = position;
            offsets.push(record_offset);
        }

        Ok(Node {
            offset,
            descriptor,
            kind,
            buf,
            offsets,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn height(&self) -> u8 {
        self.descriptor.height
    }

    pub fn num_records(&self) -> u16 {
        self.descriptor.num_records
    }

    pub fn forward_link(&self) -> u32 {
        self.descriptor.f_link
    }

    pub fn backward_link(&self) -> u32 {
        self.descriptor.b_link
    }

    /// Record start offsets followed by the free-space offset.
    pub fn record_offsets(&self) -> &[u16] {
        &self.offsets
    }

    pub fn record_bytes(&self, index: u16) -> Result<&[u8]> {
        let i = usize::from(index);
        if i >= usize::from(self.num_records()) {
            return Err(Error::Corrupt(format!(
                "record {index} requested from a node of {} records",
                self.num_records()
            )));
        }
        let start = usize::from(self.offsets[i]);
        let end = usize::from(self.offsets[i + 1]);
        Ok(&self.buf[start..end])
    }

    pub fn location(&self, index: u16) -> RecordLocation {
        RecordLocation {
            node_offset: self.offset,
            index,
        }
    }

    pub fn key<K: Key>(&self, index: u16) -> Result<K> {
        let (key, _) = K::decode(self.record_bytes(index)?)?;
        Ok(key)
    }

    pub fn index_pointer<K: Key>(&self, index: u16, layout: &KeyLayout) -> Result<IndexPointer<K>> {
        self.expect_kind(NodeKind::Index)?;
        let record = self.record_bytes(index)?;
        let (key, used) = K::decode(record)?;
        let pointer_at = if layout.variable_index_keys {
            align_even(used)
        } else {
            2 + usize::from(layout.max_key_length)
        };
        let child = record.read_u32_be_at(pointer_at)?;
        Ok(IndexPointer { key, child })
    }

    pub fn leaf_record<K: Key, R: Record<K>>(&self, index: u16) -> Result<R> {
        self.expect_kind(NodeKind::Leaf)?;
        let record = self.record_bytes(index)?;
        let (key, used) = K::decode(record)?;
        let data = record.get(align_even(used)..).ok_or_else(|| {
            Error::Corrupt(format!(
                "key of {used} bytes overruns a {}-byte record",
                record.len()
            ))
        })?;
        R::decode(key, data, self.location(index))
    }

    /// Decodes record `index` with the reader matching this node's kind.
    pub fn entry<K: Key, R: Record<K>>(
        &self,
        index: u16,
        layout: &KeyLayout,
    ) -> Result<NodeEntry<'_, K, R>> {
        match self.kind {
            NodeKind::Index => Ok(NodeEntry::Pointer(self.index_pointer(index, layout)?)),
            NodeKind::Leaf => Ok(NodeEntry::Leaf(self.leaf_record(index)?)),
            NodeKind::Header | NodeKind::Map => Ok(NodeEntry::Raw(self.record_bytes(index)?)),
        }
    }

    pub fn header_record(&self) -> Result<HeaderRec> {
        self.expect_kind(NodeKind::Header)?;
        let raw = self.record_bytes(0)?;
        if raw.len() < HEADER_REC_SIZE {
            return Err(Error::Corrupt(format!(
                "header record is {} bytes, expected {HEADER_REC_SIZE}",
                raw.len()
            )));
        }
        Ok(Cursor::new(raw).read_be()?)
    }

    /// The 128-byte user data record of a header node.
    pub fn user_data(&self) -> Result<&[u8]> {
        self.expect_kind(NodeKind::Header)?;
        let raw = self.record_bytes(1)?;
        raw.get(..HEADER_USER_DATA_SIZE)
            .ok_or_else(|| Error::Corrupt(format!("user data record is {} bytes", raw.len())))
    }

    /// Node allocation bitmap held by a header node (record 2) or a map
    /// node (record 0).
    pub fn map_record(&self) -> Result<&[u8]> {
        match self.kind {
            NodeKind::Header => self.record_bytes(2),
            NodeKind::Map => self.record_bytes(0),
            other => Err(Error::InvalidTree(format!(
                "{other:?} node at {:#x} holds no map record",
                self.offset
            ))),
        }
    }

    fn expect_kind(&self, kind: NodeKind) -> Result<()> {
        if self.kind != kind {
            return Err(Error::InvalidTree(format!(
                "expected a {kind:?} node at {:#x}, found {:?}",
                self.offset, self.kind
            )));
        }
        Ok(())
    }
}

fn align_even(n: usize) -> usize {
    (n + 1) & !1
}
