//! Synthesizes HFS Plus images: B-tree files laid out node by node, placed
//! into a volume through arbitrary extents.

#![allow(dead_code)]

use binrw::io::Cursor;
use binrw::{BinWrite, Endian};
use hfsplus_ro::catalog::{FILE_RECORD, FILE_THREAD_RECORD, FOLDER_RECORD, FOLDER_THREAD_RECORD};
use hfsplus_ro::{
    CatalogKey, ExtentDescriptor, ExtentRecord, ForkData, HFSP_SIGNATURE, HFSP_VERSION,
    HFSX_SIGNATURE, HFSX_VERSION, HEADER_USER_DATA_SIZE, HeaderRec, HfsName, KEY_COMPARE_BINARY,
    KEY_COMPARE_CASE_FOLDING, Key, NODE_DESCRIPTOR_SIZE, NameOrder, NodeDescriptor, NodeKind,
    ROOT_FOLDER_ID, ROOT_PARENT_ID, TreeAttributes, VOLUME_HEADER_OFFSET, VolumeHeader,
};

pub const BLOCK_SIZE: u32 = 4096;
pub const EXTENTS_START_BLOCK: u32 = 20;

pub fn to_bytes<T: for<'a> BinWrite<Args<'a> = ()>>(value: &T) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    value.write_options(&mut cursor, Endian::Big, ()).unwrap();
    cursor.into_inner()
}

pub fn name(s: &str) -> HfsName {
    HfsName::from_utf8(s).unwrap()
}

/// Packs records into one node, offset table at the tail.
pub fn node(
    kind: NodeKind,
    height: u8,
    f_link: u32,
    b_link: u32,
    records: &[Vec<u8>],
    node_size: usize,
) -> Vec<u8> {
    let mut buf = vec![0u8; node_size];
    let descriptor = NodeDescriptor {
        f_link,
        b_link,
        kind: kind as i8,
        height,
        num_records: records.len() as u16,
        reserved: 0,
    };
    buf[..NODE_DESCRIPTOR_SIZE].copy_from_slice(&to_bytes(&descriptor));

    let mut at = NODE_DESCRIPTOR_SIZE;
    let mut offsets = Vec::with_capacity(records.len() + 1);
    for record in records {
        offsets.push(at as u16);
        buf[at..at + record.len()].copy_from_slice(record);
        at += record.len();
    }
    offsets.push(at as u16);
    let table = node_size - 2 * offsets.len();
    assert!(at <= table, "{} records overflow a {node_size}-byte node", records.len());
    for (i, offset) in offsets.iter().enumerate() {
        let slot = node_size - 2 * (i + 1);
        buf[slot..slot + 2].copy_from_slice(&offset.to_be_bytes());
    }
    buf
}

#[derive(Debug, Clone)]
pub struct TreeSpec {
    pub node_size: usize,
    /// Records per leaf and pointers per index node.
    pub per_node: usize,
    pub max_key_length: u16,
    pub variable_index_keys: bool,
    pub key_compare_type: u8,
}

impl TreeSpec {
    pub fn catalog(node_size: usize, per_node: usize) -> Self {
        TreeSpec {
            node_size,
            per_node,
            max_key_length: 516,
            variable_index_keys: true,
            key_compare_type: KEY_COMPARE_CASE_FOLDING,
        }
    }

    pub fn extents(node_size: usize, per_node: usize) -> Self {
        TreeSpec {
            node_size,
            per_node,
            max_key_length: 10,
            variable_index_keys: false,
            key_compare_type: 0,
        }
    }
}

/// A B-tree file: node 0 is the header node, leaves follow, then each index
/// level up to the root.
#[derive(Debug, Clone)]
pub struct Tree {
    pub bytes: Vec<u8>,
    pub header: HeaderRec,
    pub node_size: usize,
}

impl Tree {
    pub fn node_mut(&mut self, index: u32) -> &mut [u8] {
        let start = index as usize * self.node_size;
        &mut self.bytes[start..start + self.node_size]
    }
}

/// Builds a tree from `(key bytes, payload)` pairs already in key order.
pub fn build_tree(records: &[(Vec<u8>, Vec<u8>)], spec: &TreeSpec) -> Tree {
    let mut nodes: Vec<Vec<u8>> = vec![Vec::new()];
    let mut depth = 0u16;
    let mut root = 0u32;
    let (mut first_leaf, mut last_leaf) = (0u32, 0u32);

    if !records.is_empty() {
        let leaves: Vec<_> = records.chunks(spec.per_node).collect();
        first_leaf = 1;
        last_leaf = leaves.len() as u32;
        let mut level = Vec::new();
        for (i, chunk) in leaves.iter().enumerate() {
            let number = 1 + i as u32;
            let f_link = if i + 1 < leaves.len() { number + 1 } else { 0 };
            let b_link = if i > 0 { number - 1 } else { 0 };
            let raw: Vec<Vec<u8>> = chunk
                .iter()
                .map(|(key, payload)| [key.as_slice(), payload.as_slice()].concat())
                .collect();
            nodes.push(node(NodeKind::Leaf, 1, f_link, b_link, &raw, spec.node_size));
            level.push((chunk[0].0.clone(), number));
        }
        depth = 1;

        while level.len() > 1 {
            depth += 1;
            let first = nodes.len() as u32;
            let groups: Vec<_> = level.chunks(spec.per_node).map(<[_]>::to_vec).collect();
            let mut next = Vec::new();
            for (j, group) in groups.iter().enumerate() {
                let number = first + j as u32;
                let f_link = if j + 1 < groups.len() { number + 1 } else { 0 };
                let b_link = if j > 0 { number - 1 } else { 0 };
                let raw: Vec<Vec<u8>> = group
                    .iter()
                    .map(|(key, child)| index_record(key, *child, spec))
                    .collect();
                nodes.push(node(
                    NodeKind::Index,
                    depth as u8,
                    f_link,
                    b_link,
                    &raw,
                    spec.node_size,
                ));
                next.push((group[0].0.clone(), number));
            }
            level = next;
        }
        root = level[0].1;
    }

    let mut attributes = TreeAttributes::BIG_KEYS;
    if spec.variable_index_keys {
        attributes |= TreeAttributes::VARIABLE_INDEX_KEYS;
    }
    let header = HeaderRec {
        tree_depth: depth,
        root_node: root,
        leaf_records: records.len() as u32,
        first_leaf_node: first_leaf,
        last_leaf_node: last_leaf,
        node_size: spec.node_size as u16,
        max_key_length: spec.max_key_length,
        total_nodes: nodes.len() as u32,
        free_nodes: 0,
        clump_size: spec.node_size as u32,
        key_compare_type: spec.key_compare_type,
        attributes: attributes.bits(),
        ..Default::default()
    };

    let header_bytes = to_bytes(&header);
    let map_len = spec.node_size - NODE_DESCRIPTOR_SIZE - header_bytes.len() - HEADER_USER_DATA_SIZE - 8;
    let mut map = vec![0u8; map_len];
    for n in 0..nodes.len() {
        map[n / 8] |= 0x80 >> (n % 8);
    }
    nodes[0] = node(
        NodeKind::Header,
        0,
        0,
        0,
        &[header_bytes, vec![0u8; HEADER_USER_DATA_SIZE], map],
        spec.node_size,
    );

    Tree {
        bytes: nodes.concat(),
        header,
        node_size: spec.node_size,
    }
}

fn index_record(key: &[u8], child: u32, spec: &TreeSpec) -> Vec<u8> {
    let mut raw = key.to_vec();
    if !spec.variable_index_keys {
        raw[..2].copy_from_slice(&spec.max_key_length.to_be_bytes());
        raw.resize(2 + spec.max_key_length as usize, 0);
    } else if raw.len() % 2 == 1 {
        raw.push(0);
    }
    raw.extend_from_slice(&child.to_be_bytes());
    raw
}

pub fn folder_payload(folder_id: u32, valence: u32) -> Vec<u8> {
    let mut raw = vec![0u8; 88];
    raw[0..2].copy_from_slice(&FOLDER_RECORD.to_be_bytes());
    raw[4..8].copy_from_slice(&valence.to_be_bytes());
    raw[8..12].copy_from_slice(&folder_id.to_be_bytes());
    // created 2024-01-01T00:00:00Z
    raw[12..16].copy_from_slice(&(1_704_067_200u32 + 2_082_844_800).to_be_bytes());
    raw[42..44].copy_from_slice(&0o040755u16.to_be_bytes());
    raw
}

pub fn file_payload() -> Vec<u8> {
    let mut raw = vec![0u8; 248];
    raw[0..2].copy_from_slice(&FILE_RECORD.to_be_bytes());
    raw
}

pub fn thread_payload(record_type: i16, parent: u32, name: &HfsName) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&record_type.to_be_bytes());
    raw.extend_from_slice(&[0, 0]);
    raw.extend_from_slice(&parent.to_be_bytes());
    name.encode_into(&mut raw);
    raw
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub cnid: u32,
    pub parent: u32,
    pub name: HfsName,
    pub folder: bool,
}

/// Catalog contents, turned into sorted folder, file and thread records.
#[derive(Debug, Clone)]
pub struct CatalogBuilder {
    pub order: NameOrder,
    pub entries: Vec<Entry>,
    next_id: u32,
}

impl CatalogBuilder {
    pub fn new(order: NameOrder) -> Self {
        CatalogBuilder {
            order,
            entries: vec![Entry {
                cnid: ROOT_FOLDER_ID,
                parent: ROOT_PARENT_ID,
                name: name("Macintosh HD"),
                folder: true,
            }],
            next_id: 16,
        }
    }

    pub fn folder(&mut self, parent: u32, folder_name: &str) -> u32 {
        self.add(parent, folder_name, true)
    }

    pub fn file(&mut self, parent: u32, file_name: &str) -> u32 {
        self.add(parent, file_name, false)
    }

    fn add(&mut self, parent: u32, entry_name: &str, folder: bool) -> u32 {
        let cnid = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry {
            cnid,
            parent,
            name: name(entry_name),
            folder,
        });
        cnid
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn valence(&self, cnid: u32) -> u32 {
        self.entries.iter().filter(|e| e.parent == cnid).count() as u32
    }

    /// Every catalog record in key order.
    pub fn records(&self) -> Vec<(CatalogKey, Vec<u8>)> {
        let mut records = Vec::new();
        for entry in &self.entries {
            let (payload, thread_type) = if entry.folder {
                (folder_payload(entry.cnid, self.valence(entry.cnid)), FOLDER_THREAD_RECORD)
            } else {
                (file_payload(), FILE_THREAD_RECORD)
            };
            records.push((CatalogKey::new(entry.parent, entry.name.clone()), payload));
            records.push((
                CatalogKey::thread(entry.cnid),
                thread_payload(thread_type, entry.parent, &entry.name),
            ));
        }
        records.sort_by(|a, b| a.0.compare(&b.0, self.order));
        records
    }

    pub fn build(&self, node_size: usize, per_node: usize) -> Tree {
        let mut spec = TreeSpec::catalog(node_size, per_node);
        if self.order == NameOrder::Binary {
            spec.key_compare_type = KEY_COMPARE_BINARY;
        }
        let raw: Vec<_> = self
            .records()
            .into_iter()
            .map(|(key, payload)| (key.encode(), payload))
            .collect();
        build_tree(&raw, &spec)
    }
}

pub fn extent_key(file_id: u32, fork_type: u8, start_block: u32) -> Vec<u8> {
    let mut raw = Vec::with_capacity(12);
    raw.extend_from_slice(&10u16.to_be_bytes());
    raw.extend_from_slice(&[fork_type, 0]);
    raw.extend_from_slice(&file_id.to_be_bytes());
    raw.extend_from_slice(&start_block.to_be_bytes());
    raw
}

pub fn extent_record(runs: &[(u32, u32)]) -> ExtentRecord {
    let mut record = ExtentRecord::default();
    for (slot, &(start_block, block_count)) in record.iter_mut().zip(runs) {
        *slot = ExtentDescriptor {
            start_block,
            block_count,
        };
    }
    record
}

pub fn empty_extents_tree() -> Tree {
    build_tree(&[], &TreeSpec::extents(4096, 8))
}

pub struct VolumeSpec<'a> {
    pub catalog: &'a Tree,
    pub catalog_extents: Vec<(u32, u32)>,
    pub extents: &'a Tree,
    pub hfsx: bool,
    pub file_count: u32,
    pub folder_count: u32,
    pub next_catalog_id: u32,
}

impl<'a> VolumeSpec<'a> {
    pub fn new(catalog: &'a Tree, extents: &'a Tree) -> Self {
        VolumeSpec {
            catalog,
            catalog_extents: vec![(100, 10)],
            extents,
            hfsx: false,
            file_count: 0,
            folder_count: 0,
            next_catalog_id: 16,
        }
    }
}

/// Copies `bytes` into `image` through `extents`, returning the fork
/// descriptor that describes them.
fn place(image: &mut Vec<u8>, bytes: &[u8], extents: &[(u32, u32)]) -> ForkData {
    let block = BLOCK_SIZE as usize;
    let mut done = 0;
    for &(start, count) in extents {
        if done >= bytes.len() {
            break;
        }
        let take = (count as usize * block).min(bytes.len() - done);
        let at = start as usize * block;
        if image.len() < at + count as usize * block {
            image.resize(at + count as usize * block, 0);
        }
        image[at..at + take].copy_from_slice(&bytes[done..done + take]);
        done += take;
    }
    assert_eq!(done, bytes.len(), "extents too small for the fork");

    ForkData {
        logical_size: bytes.len() as u64,
        clump_size: BLOCK_SIZE,
        total_blocks: extents.iter().map(|e| e.1).sum(),
        extents: extent_record(extents),
    }
}

pub fn build_volume(spec: &VolumeSpec) -> Vec<u8> {
    let mut image = vec![0u8; EXTENTS_START_BLOCK as usize * BLOCK_SIZE as usize];

    let extents_blocks = spec.extents.bytes.len().div_ceil(BLOCK_SIZE as usize) as u32;
    let extents_file = place(
        &mut image,
        &spec.extents.bytes,
        &[(EXTENTS_START_BLOCK, extents_blocks)],
    );
    let catalog_file = place(&mut image, &spec.catalog.bytes, &spec.catalog_extents);

    let (signature, version) = if spec.hfsx {
        (HFSX_SIGNATURE, HFSX_VERSION)
    } else {
        (HFSP_SIGNATURE, HFSP_VERSION)
    };
    let total_blocks = (image.len() / BLOCK_SIZE as usize) as u32;
    let header = VolumeHeader {
        signature,
        version,
        last_mounted_version: u32::from_be_bytes(*b"10.0"),
        file_count: spec.file_count,
        folder_count: spec.folder_count,
        block_size: BLOCK_SIZE,
        total_blocks,
        free_blocks: total_blocks / 2,
        next_catalog_id: spec.next_catalog_id,
        extents_file,
        catalog_file,
        ..Default::default()
    };
    let raw = to_bytes(&header);
    let at = VOLUME_HEADER_OFFSET as usize;
    image[at..at + raw.len()].copy_from_slice(&raw);
    image
}

/// A small case-folding volume: `/Documents` holding three files, plus
/// `/Applications` holding one folder.
pub struct Fixture {
    pub catalog: CatalogBuilder,
    pub documents: u32,
    pub applications: u32,
    pub image: Vec<u8>,
}

pub fn fixture() -> Fixture {
    let mut catalog = CatalogBuilder::new(NameOrder::CaseFolding);
    let documents = catalog.folder(ROOT_FOLDER_ID, "Documents");
    let applications = catalog.folder(ROOT_FOLDER_ID, "Applications");
    catalog.file(documents, "report.pdf");
    catalog.file(documents, "Notes.txt");
    catalog.file(documents, "budget.xlsx");
    catalog.folder(applications, "Utilities");

    let tree = catalog.build(4096, 16);
    let extents = empty_extents_tree();
    let mut spec = VolumeSpec::new(&tree, &extents);
    spec.file_count = 3;
    spec.folder_count = 3;
    spec.next_catalog_id = catalog.next_id();
    let image = build_volume(&spec);

    Fixture {
        catalog,
        documents,
        applications,
        image,
    }
}
