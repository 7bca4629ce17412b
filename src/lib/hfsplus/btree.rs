//! Generic read-only B-tree over a special file's fork.
//!
//! Trees are opened from their header node and searched top-down. Every
//! node load is a fresh read through the extent mapper; nothing is cached.

use alloc::format;
use alloc::string::String;
use alloc::vec;
use binrw::BinReaderExt;
use binrw::io::Cursor;
use core::cmp::Ordering;
use core::fmt;
use core::marker::PhantomData;
use tracing::{debug, trace, warn};

use crate::device::BlockDevice;
use crate::extents::{Fork, read_fork};
use crate::internal::{HEADER_REC_SIZE, HeaderRec, NODE_DESCRIPTOR_SIZE, NodeDescriptor, NodeKind};
use crate::node::{KeyLayout, Node, RecordLocation};
use crate::unicode::NameOrder;
use crate::{Error, Result};

pub trait Key: Clone + fmt::Debug + Sized {
    /// Decodes a key from the start of a record, returning it with the number
    /// of bytes it occupies including its length prefix.
    fn decode(data: &[u8]) -> Result<(Self, usize)>;

    fn compare(&self, other: &Self, order: NameOrder) -> Ordering;
}

pub trait Record<K: Key>: Sized {
    /// Decodes the payload that follows `key` in a leaf record.
    fn decode(key: K, data: &[u8], location: RecordLocation) -> Result<Self>;

    fn key(&self) -> &K;

    fn location(&self) -> RecordLocation;
}

/// Index node record: the smallest key of a child subtree and the child's
/// node number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPointer<K> {
    pub key: K,
    pub child: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NodeSearch {
    pub index: u16,
    /// False when `index` is the floor of the target, or record 0 because
    /// the target sorts before every key in the node.
    pub exact: bool,
}

/// Binary search for the greatest key not exceeding `target`.
pub fn search_node<K: Key>(node: &Node, target: &K, order: NameOrder) -> Result<NodeSearch> {
    let count = node.num_records();
    if count == 0 {
        return Err(Error::Corrupt(format!(
            "searched node at {:#x} has no records",
            node.offset()
        )));
    }

    let (mut low, mut high) = (0u16, count);
    while low < high {
        let mid = low + (high - low) / 2;
        match node.key::<K>(mid)?.compare(target, order) {
            Ordering::Equal => {
                return Ok(NodeSearch {
                    index: mid,
                    exact: true,
                });
            }
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
        }
    }
    Ok(NodeSearch {
        index: low.saturating_sub(1),
        exact: false,
    })
}

pub struct BTree<D, K, R> {
    device: D,
    fork: Fork,
    block_size: u32,
    header: HeaderRec,
    node_shift: u32,
    layout: KeyLayout,
    order: NameOrder,
    _records: PhantomData<fn() -> (K, R)>,
}

impl<D: BlockDevice, K: Key, R: Record<K>> BTree<D, K, R> {
    /// Opens the tree stored in `fork`, whose allocation blocks are
    /// `block_size` bytes.
    pub fn open(device: D, fork: Fork, block_size: u32) -> Result<Self> {
        let mut probe = [0u8; NODE_DESCRIPTOR_SIZE + HEADER_REC_SIZE];
        read_fork(&device, &fork, block_size, 0, &mut probe)?;

        let mut cursor = Cursor::new(&probe[..]);
        let descriptor: NodeDescriptor = cursor.read_be()?;
        if NodeKind::try_from(descriptor.kind)? != NodeKind::Header {
            return Err(Error::InvalidTree(format!(
                "node 0 has kind {}, not a header node",
                descriptor.kind
            )));
        }
        let header: HeaderRec = cursor.read_be()?;

        let node_size = header.node_size;
        if node_size < 512 || !node_size.is_power_of_two() {
            return Err(Error::Corrupt(format!("b-tree node size {node_size}")));
        }
        if u64::from(node_size) > fork.logical_size() {
            return Err(Error::Corrupt(format!(
                "b-tree node size {node_size} exceeds its {}-byte file",
                fork.logical_size()
            )));
        }
        if u64::from(header.total_nodes) << node_size.trailing_zeros() > fork.logical_size() {
            warn!(
                total_nodes = header.total_nodes,
                logical_size = fork.logical_size(),
                "b-tree claims more nodes than its file holds"
            );
        }

        let tree = BTree {
            layout: KeyLayout::from_header(&header),
            order: NameOrder::from_compare_type(header.key_compare_type),
            node_shift: node_size.trailing_zeros(),
            device,
            fork,
            block_size,
            header,
            _records: PhantomData,
        };
        // the full header node must parse too
        tree.load_node(0)?;

        debug!(
            depth = tree.header.tree_depth,
            root = tree.header.root_node,
            node_size,
            leaf_records = tree.header.leaf_records,
            order = ?tree.order,
            "opened b-tree"
        );
        Ok(tree)
    }

    pub fn header(&self) -> &HeaderRec {
        &self.header
    }

    pub fn node_size(&self) -> u16 {
        self.header.node_size
    }

    pub fn node_count(&self) -> u32 {
        self.header.total_nodes
    }

    pub fn height(&self) -> u16 {
        self.header.tree_depth
    }

    pub fn root_node(&self) -> u32 {
        self.header.root_node
    }

    pub fn first_leaf(&self) -> u32 {
        self.header.first_leaf_node
    }

    pub fn last_leaf(&self) -> u32 {
        self.header.last_leaf_node
    }

    pub fn leaf_records(&self) -> u32 {
        self.header.leaf_records
    }

    pub fn fork(&self) -> &Fork {
        &self.fork
    }

    pub fn name_order(&self) -> NameOrder {
        self.order
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn load_node(&self, index: u32) -> Result<Node> {
        self.load_node_at(u64::from(index) << self.node_shift)
    }

    /// Loads the node starting `offset` bytes into the tree file.
    pub fn load_node_at(&self, offset: u64) -> Result<Node> {
        let node_size = u64::from(self.header.node_size);
        if offset % node_size != 0 {
            return Err(Error::Corrupt(format!(
                "node offset {offset:#x} is not a multiple of {node_size}"
            )));
        }
        let mut buf = vec![0u8; node_size as usize];
        read_fork(&self.device, &self.fork, self.block_size, offset, &mut buf)?;
        trace!(node = offset >> self.node_shift, offset, "load node");
        Node::parse(offset, buf)
    }

    pub fn search_node(&self, node: &Node, target: &K) -> Result<NodeSearch> {
        search_node(node, target, self.order)
    }

    /// Descends from the root to the leaf holding the floor of `target`.
    pub fn locate(&self, target: &K) -> Result<(Node, NodeSearch)> {
        if self.header.tree_depth == 0 {
            return Err(Error::KeyNotFound);
        }
        let mut index = self.header.root_node;
        let mut height = self.header.tree_depth;
        loop {
            let node = self.load_node(index)?;
            if u16::from(node.height()) != height {
                return Err(Error::InvalidTree(format!(
                    "node {index} has height {}, expected {height}",
                    node.height()
                )));
            }
            let search = self.search_node(&node, target)?;
            match (height, node.kind()) {
                (1, NodeKind::Leaf) => return Ok((node, search)),
                (h, NodeKind::Index) if h > 1 => {
                    let pointer = node.index_pointer::<K>(search.index, &self.layout)?;
                    trace!(node = index, child = pointer.child, key = ?pointer.key, "descend");
                    index = pointer.child;
                    height -= 1;
                }
                (h, kind) => {
                    return Err(Error::InvalidTree(format!(
                        "{kind:?} node {index} at height {h}"
                    )));
                }
            }
        }
    }

    /// The record whose key is the floor of `target`.
    pub fn find(&self, target: &K) -> Result<R> {
        let (node, search) = self.locate(target)?;
        node.leaf_record(search.index)
    }

    pub fn find_exact(&self, target: &K) -> Result<R> {
        let (node, search) = self.locate(target)?;
        if !search.exact {
            return Err(Error::KeyNotFound);
        }
        node.leaf_record(search.index)
    }

    /// A cursor positioned at the floor of `target`.
    pub fn cursor(&self, target: &K) -> Result<RecordCursor<'_, D, K, R>> {
        let (node, search) = self.locate(target)?;
        Ok(RecordCursor {
            tree: self,
            node,
            index: search.index,
        })
    }

    pub fn first_leaf_cursor(&self) -> Result<RecordCursor<'_, D, K, R>> {
        if self.header.first_leaf_node == 0 {
            return Err(Error::KeyNotFound);
        }
        self.cursor_in(self.load_node(self.header.first_leaf_node)?, 0)
    }

    pub fn cursor_at(&self, location: RecordLocation) -> Result<RecordCursor<'_, D, K, R>> {
        self.cursor_in(self.load_node_at(location.node_offset)?, location.index)
    }

    /// Every leaf record, in key order.
    pub fn records(&self) -> Result<Records<'_, D, K, R>> {
        Ok(Records {
            cursor: Some(self.first_leaf_cursor()?),
            started: false,
            whole_tree: true,
            yielded: 0,
        })
    }

    fn cursor_in(&self, node: Node, index: u16) -> Result<RecordCursor<'_, D, K, R>> {
        if node.kind() != NodeKind::Leaf {
            return Err(Error::InvalidTree(format!(
                "cursor placed in a {:?} node at {:#x}",
                node.kind(),
                node.offset()
            )));
        }
        if index >= node.num_records() {
            return Err(Error::Corrupt(format!(
                "record {index} of a {}-record leaf",
                node.num_records()
            )));
        }
        Ok(RecordCursor {
            tree: self,
            node,
            index,
        })
    }
}

/// A position in the leaf level, holding the leaf node it points into.
pub struct RecordCursor<'t, D, K, R> {
    tree: &'t BTree<D, K, R>,
    node: Node,
    index: u16,
}

impl<'t, D: BlockDevice, K: Key, R: Record<K>> RecordCursor<'t, D, K, R> {
    pub fn location(&self) -> RecordLocation {
        self.node.location(self.index)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn key(&self) -> Result<K> {
        self.node.key(self.index)
    }

    pub fn record(&self) -> Result<R> {
        self.node.leaf_record(self.index)
    }

    /// Moves `steps` records forward (or backward when negative), following
    /// sibling links across leaves. On error the cursor stays where it was.
    pub fn advance(&mut self, steps: i64) -> Result<()> {
        let mut position = i64::from(self.index) + steps;
        let mut replacement: Option<Node> = None;
        let mut hops = 0u32;

        loop {
            let node = replacement.as_ref().unwrap_or(&self.node);
            let count = i64::from(node.num_records());
            if (0..count).contains(&position) {
                break;
            }
            let backward = position < 0;
            let link = if backward {
                node.backward_link()
            } else {
                node.forward_link()
            };
            if link == 0 {
                return Err(Error::EndOfTree);
            }
            hops += 1;
            if hops > self.tree.node_count() {
                return Err(Error::Corrupt(String::from("leaf sibling chain loops")));
            }

            let next = self.tree.load_node(link)?;
            if next.kind() != NodeKind::Leaf {
                return Err(Error::InvalidTree(format!(
                    "sibling link {link} leads to a {:?} node",
                    next.kind()
                )));
            }
            if backward {
                position += i64::from(next.num_records());
            } else {
                position -= count;
            }
            replacement = Some(next);
        }

        if let Some(node) = replacement {
            self.node = node;
        }
        self.index = position as u16;
        Ok(())
    }

    pub fn into_records(self) -> Records<'t, D, K, R> {
        Records {
            cursor: Some(self),
            started: false,
            whole_tree: false,
            yielded: 0,
        }
    }
}

/// Forward iteration over leaf records. A record that fails to decode is
/// reported and skipped over; a failed sibling step ends the iteration.
pub struct Records<'t, D, K, R> {
    cursor: Option<RecordCursor<'t, D, K, R>>,
    started: bool,
    whole_tree: bool,
    yielded: u32,
}

impl<D, K, R> Records<'_, D, K, R> {
    /// True when the walk began at the first leaf, so its length can be
    /// checked against the header's leaf record count.
    pub fn is_whole_tree(&self) -> bool {
        self.whole_tree
    }
}

impl<D: BlockDevice, K: Key, R: Record<K>> Iterator for Records<'_, D, K, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor.as_mut()?;
        if self.started {
            match cursor.advance(1) {
                Ok(()) => {}
                Err(Error::EndOfTree) => {
                    let expected = cursor.tree.leaf_records();
                    if self.whole_tree && self.yielded != expected {
                        warn!(
                            seen = self.yielded,
                            expected, "leaf walk ended away from the header's record count"
                        );
                    }
                    self.cursor = None;
                    return None;
                }
                Err(e) => {
                    self.cursor = None;
                    return Some(Err(e));
                }
            }
        }
        self.started = true;
        self.yielded += 1;
        Some(cursor.record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extents::ExtentKey;
    use alloc::vec::Vec;
    use binrw::BinWrite;
    use proptest::prelude::*;

    fn leaf_of(keys: &[u32]) -> Node {
        let size = 4096usize;
        let mut buf = vec![0u8; size];
        let descriptor = NodeDescriptor {
            kind: NodeKind::Leaf as i8,
            height: 1,
            num_records: keys.len() as u16,
            ..Default::default()
        };
        let mut cursor = Cursor::new(Vec::new());
        descriptor.write(&mut cursor).unwrap();
        buf[..NODE_DESCRIPTOR_SIZE].copy_from_slice(&cursor.into_inner());

        let mut at = NODE_DESCRIPTOR_SIZE;
        for (i, &start_block) in keys.iter().enumerate() {
            let mut record = Vec::new();
            record.extend_from_slice(&10u16.to_be_bytes());
            record.extend_from_slice(&[0, 0]);
            record.extend_from_slice(&20u32.to_be_bytes());
            record.extend_from_slice(&start_block.to_be_bytes());
            buf[at..at + record.len()].copy_from_slice(&record);
            buf[size - 2 * (i + 1)..size - 2 * i].copy_from_slice(&(at as u16).to_be_bytes());
            at += record.len();
        }
        let n = keys.len();
        buf[size - 2 * (n + 1)..size - 2 * n].copy_from_slice(&(at as u16).to_be_bytes());
        Node::parse(0, buf).unwrap()
    }

    fn target(start_block: u32) -> ExtentKey {
        ExtentKey::new(20, 0, start_block)
    }

    #[test]
    fn exact_and_floor_hits() {
        let node = leaf_of(&[10, 20, 30, 40]);
        let order = NameOrder::CaseFolding;
        assert_eq!(
            search_node(&node, &target(30), order).unwrap(),
            NodeSearch {
                index: 2,
                exact: true
            }
        );
        assert_eq!(
            search_node(&node, &target(35), order).unwrap(),
            NodeSearch {
                index: 2,
                exact: false
            }
        );
        assert_eq!(
            search_node(&node, &target(99), order).unwrap(),
            NodeSearch {
                index: 3,
                exact: false
            }
        );
    }

    #[test]
    fn target_below_every_key_falls_back_to_first_record() {
        let node = leaf_of(&[10, 20]);
        assert_eq!(
            search_node(&node, &target(1), NameOrder::CaseFolding).unwrap(),
            NodeSearch {
                index: 0,
                exact: false
            }
        );
    }

    #[test]
    fn empty_node_cannot_be_searched() {
        let node = leaf_of(&[]);
        assert!(matches!(
            search_node(&node, &target(1), NameOrder::CaseFolding),
            Err(Error::Corrupt(_))
        ));
    }

    proptest! {
        #[test]
        fn search_returns_the_floor(
            keys in proptest::collection::btree_set(1u32..10_000, 1..200),
            probe in 0u32..10_100,
        ) {
            let keys: Vec<u32> = keys.into_iter().collect();
            let node = leaf_of(&keys);
            let found = search_node(&node, &target(probe), NameOrder::CaseFolding).unwrap();

            let expected = match keys.iter().rposition(|&k| k <= probe) {
                Some(i) => NodeSearch { index: i as u16, exact: keys[i] == probe },
                None => NodeSearch { index: 0, exact: false },
            };
            prop_assert_eq!(found, expected);
        }
    }
}
