//! Catalog file records and lookups.
//!
//! Catalog records are keyed by (parent CNID, name). Thread records, keyed by
//! (CNID, empty name), invert that mapping, so finding an object by CNID is a
//! two-step search: the thread first, then the record it names.

use alloc::format;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cmp::Ordering;
use tracing::{debug, trace};

use crate::btree::{BTree, Key, Record, RecordCursor};
use crate::bytes::ReadBeExt;
use crate::device::BlockDevice;
use crate::internal::{CatalogNodeId, ROOT_FOLDER_ID, S_IFBLK, S_IFCHR, S_IFMT, Timestamp};
use crate::node::RecordLocation;
use crate::unicode::{HfsName, NameOrder};
use crate::{Error, Result};

pub const FOLDER_RECORD: i16 = 0x0001;
pub const FILE_RECORD: i16 = 0x0002;
pub const FOLDER_THREAD_RECORD: i16 = 0x0003;
pub const FILE_THREAD_RECORD: i16 = 0x0004;

/// Key length field plus parent ID and name length.
const MIN_KEY_LENGTH: u16 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_id: CatalogNodeId,
    pub name: HfsName,
}

impl CatalogKey {
    pub fn new(parent_id: CatalogNodeId, name: HfsName) -> Self {
        CatalogKey { parent_id, name }
    }

    /// Key of the thread record of `cnid`.
    pub fn thread(cnid: CatalogNodeId) -> Self {
        CatalogKey::new(cnid, HfsName::new())
    }

    /// On-disk form, including the key length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let key_length = MIN_KEY_LENGTH as usize + self.name.len() * 2;
        let mut out = Vec::with_capacity(2 + key_length);
        out.extend_from_slice(&(key_length as u16).to_be_bytes());
        out.extend_from_slice(&self.parent_id.to_be_bytes());
        self.name.encode_into(&mut out);
        out
    }
}

impl Key for CatalogKey {
    fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let key_length = data.read_u16_be_at(0)?;
        if key_length < MIN_KEY_LENGTH {
            return Err(Error::Corrupt(format!("catalog key length {key_length}")));
        }
        let parent_id = data.read_u32_be_at(2)?;
        let (name, name_bytes) = HfsName::decode(data, 6)?;
        if 4 + name_bytes > usize::from(key_length) {
            return Err(Error::Corrupt(format!(
                "{}-unit name overflows a catalog key of {key_length} bytes",
                name.len()
            )));
        }
        Ok((CatalogKey { parent_id, name }, 2 + usize::from(key_length)))
    }

    fn compare(&self, other: &Self, order: NameOrder) -> Ordering {
        self.parent_id
            .cmp(&other.parent_id)
            .then_with(|| self.name.compare(&other.name, order))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CatalogFlags: u16 {
        const FILE_LOCKED = 0x0001;
        const THREAD_EXISTS = 0x0002;
        const HAS_ATTRIBUTES = 0x0004;
        const HAS_SECURITY = 0x0008;
        const HAS_FOLDER_COUNT = 0x0010;
        const HAS_LINK_CHAIN = 0x0020;
        const HAS_CHILD_LINK = 0x0040;
        const HAS_DATE_ADDED = 0x0080;
    }
}

/// How the last permission word is used, decided by the file type bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Special {
    LinkCount(u32),
    Device(u32),
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    pub special: u32,
}

impl BsdInfo {
    fn decode(data: &[u8], at: usize) -> Result<Self> {
        Ok(BsdInfo {
            owner_id: data.read_u32_be_at(at)?,
            group_id: data.read_u32_be_at(at + 4)?,
            admin_flags: data.read_u8_at(at + 8)?,
            owner_flags: data.read_u8_at(at + 9)?,
            file_mode: data.read_u16_be_at(at + 10)?,
            special: data.read_u32_be_at(at + 12)?,
        })
    }

    pub fn special(&self) -> Special {
        match self.file_mode & S_IFMT {
            S_IFCHR | S_IFBLK => Special::Device(self.special),
            _ => Special::LinkCount(self.special),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFolder {
    pub flags: CatalogFlags,
    pub valence: u32,
    pub folder_id: CatalogNodeId,
    pub create_date: Timestamp,
    pub content_mod_date: Timestamp,
    pub attribute_mod_date: Timestamp,
    pub access_date: Timestamp,
    pub backup_date: Timestamp,
    pub bsd: BsdInfo,
    pub text_encoding: u32,
}

const FOLDER_RECORD_SIZE: usize = 88;

impl CatalogFolder {
    fn decode(data: &[u8]) -> Result<Self> {
        data.bytes_at(0, FOLDER_RECORD_SIZE)?;
        let date = |at: usize| data.read_u32_be_at(at).map(Timestamp::from_hfs);
        Ok(CatalogFolder {
            flags: CatalogFlags::from_bits_retain(data.read_u16_be_at(2)?),
            valence: data.read_u32_be_at(4)?,
            folder_id: data.read_u32_be_at(8)?,
            create_date: date(12)?,
            content_mod_date: date(16)?,
            attribute_mod_date: date(20)?,
            access_date: date(24)?,
            backup_date: date(28)?,
            bsd: BsdInfo::decode(data, 32)?,
            text_encoding: data.read_u32_be_at(80)?,
        })
    }
}

/// File records are recognised but their contents are not decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogThread {
    pub parent_id: CatalogNodeId,
    pub name: HfsName,
}

impl CatalogThread {
    fn decode(data: &[u8]) -> Result<Self> {
        let parent_id = data.read_u32_be_at(4)?;
        let (name, _) = HfsName::decode(data, 8)?;
        Ok(CatalogThread { parent_id, name })
    }

    /// Key of the record this thread points at.
    pub fn target_key(&self) -> CatalogKey {
        CatalogKey::new(self.parent_id, self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogBody {
    Folder(CatalogFolder),
    File(CatalogFile),
    FolderThread(CatalogThread),
    FileThread(CatalogThread),
}

impl CatalogBody {
    pub fn decode(data: &[u8]) -> Result<Self> {
        match data.read_i16_be_at(0)? {
            FOLDER_RECORD => Ok(CatalogBody::Folder(CatalogFolder::decode(data)?)),
            FILE_RECORD => Ok(CatalogBody::File(CatalogFile)),
            FOLDER_THREAD_RECORD => Ok(CatalogBody::FolderThread(CatalogThread::decode(data)?)),
            FILE_THREAD_RECORD => Ok(CatalogBody::FileThread(CatalogThread::decode(data)?)),
            other => Err(Error::UnknownRecordType(other)),
        }
    }

    pub fn record_type(&self) -> i16 {
        match self {
            CatalogBody::Folder(_) => FOLDER_RECORD,
            CatalogBody::File(_) => FILE_RECORD,
            CatalogBody::FolderThread(_) => FOLDER_THREAD_RECORD,
            CatalogBody::FileThread(_) => FILE_THREAD_RECORD,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            CatalogBody::Folder(_) => "folder",
            CatalogBody::File(_) => "file",
            CatalogBody::FolderThread(_) => "folder thread",
            CatalogBody::FileThread(_) => "file thread",
        }
    }

    pub fn as_thread(&self) -> Option<&CatalogThread> {
        match self {
            CatalogBody::FolderThread(t) | CatalogBody::FileThread(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_folder(&self) -> Option<&CatalogFolder> {
        match self {
            CatalogBody::Folder(f) => Some(f),
            _ => None,
        }
    }
}

/// A leaf record detached from its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRecord {
    pub key: CatalogKey,
    pub body: CatalogBody,
    pub location: RecordLocation,
}

impl Record<CatalogKey> for CatalogRecord {
    fn decode(key: CatalogKey, data: &[u8], location: RecordLocation) -> Result<Self> {
        let body = CatalogBody::decode(data)?;
        Ok(CatalogRecord {
            key,
            body,
            location,
        })
    }

    fn key(&self) -> &CatalogKey {
        &self.key
    }

    fn location(&self) -> RecordLocation {
        self.location
    }
}

pub type CatalogTree<D> = BTree<D, CatalogKey, CatalogRecord>;

fn wrong_kind(expected: &'static str, record: &CatalogRecord) -> Error {
    Error::InvalidRecordType {
        expected,
        found: record.body.kind_name(),
    }
}

impl<D: BlockDevice> BTree<D, CatalogKey, CatalogRecord> {
    fn same_key(&self, a: &CatalogKey, b: &CatalogKey) -> bool {
        a.compare(b, self.name_order()) == Ordering::Equal
    }

    /// Phase one of a CNID lookup: the floor of `(cnid, "")` must be that
    /// CNID's thread record.
    fn thread_record(&self, cnid: CatalogNodeId) -> Result<CatalogRecord> {
        let key = CatalogKey::thread(cnid);
        let record = self.find(&key)?;
        if record.body.as_thread().is_none() {
            return Err(wrong_kind("thread", &record));
        }
        if !self.same_key(&record.key, &key) {
            return Err(Error::KeyNotFound);
        }
        Ok(record)
    }

    pub fn thread_of(&self, cnid: CatalogNodeId) -> Result<CatalogThread> {
        let record = self.thread_record(cnid)?;
        match record.body {
            CatalogBody::FolderThread(thread) | CatalogBody::FileThread(thread) => Ok(thread),
            _ => Err(wrong_kind("thread", &record)),
        }
    }

    /// Resolves `cnid` to its folder or file record through its thread.
    pub fn lookup_by_cnid(&self, cnid: CatalogNodeId) -> Result<CatalogRecord> {
        let thread_record = self.thread_record(cnid)?;
        let (thread, wants_folder) = match &thread_record.body {
            CatalogBody::FolderThread(t) => (t, true),
            CatalogBody::FileThread(t) => (t, false),
            _ => return Err(wrong_kind("thread", &thread_record)),
        };
        trace!(cnid, parent = thread.parent_id, name = %thread.name, "thread");

        let key = thread.target_key();
        let target = self.find(&key)?;
        match (&target.body, wants_folder) {
            (CatalogBody::Folder(_), true) | (CatalogBody::File(_), false) => {}
            (_, true) => return Err(wrong_kind("folder", &target)),
            (_, false) => return Err(wrong_kind("file", &target)),
        }
        if !self.same_key(&target.key, &key) {
            return Err(Error::KeyNotFound);
        }
        Ok(target)
    }

    /// Exact (parent, name) lookup.
    pub fn lookup_name(&self, parent_id: CatalogNodeId, name: &HfsName) -> Result<CatalogRecord> {
        self.find_exact(&CatalogKey::new(parent_id, name.clone()))
    }

    /// Children of a folder record, in key order.
    pub fn iterate_children(&self, folder: &CatalogRecord) -> Result<Children<'_, D>> {
        let Some(folder) = folder.body.as_folder() else {
            return Err(wrong_kind("folder", folder));
        };
        self.children_of(folder.folder_id)
    }

    pub fn children_of(&self, cnid: CatalogNodeId) -> Result<Children<'_, D>> {
        Ok(Children {
            cursor: Some(self.cursor(&CatalogKey::thread(cnid))?),
            parent_id: cnid,
            started: false,
        })
    }

    pub fn list_dir(&self, cnid: CatalogNodeId) -> Result<Vec<CatalogRecord>> {
        self.children_of(cnid)?.collect()
    }

    /// Resolves a `/`-separated path from the root folder. Components are
    /// matched as given, without Unicode normalization.
    pub fn lookup_path(&self, path: &str) -> Result<CatalogRecord> {
        let mut current = self.lookup_by_cnid(ROOT_FOLDER_ID)?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let Some(folder) = current.body.as_folder() else {
                return Err(wrong_kind("folder", &current));
            };
            let name = HfsName::from_utf8(component)?;
            current = self.lookup_name(folder.folder_id, &name)?;
        }
        debug!(path, location = ?current.location, "resolved path");
        Ok(current)
    }
}

/// Lazy walk over the records whose parent is a given folder. It starts at
/// the folder's thread record and stops at the first key with a larger
/// parent ID.
pub struct Children<'t, D> {
    cursor: Option<RecordCursor<'t, D, CatalogKey, CatalogRecord>>,
    parent_id: CatalogNodeId,
    started: bool,
}

impl<D: BlockDevice> Iterator for Children<'_, D> {
    type Item = Result<CatalogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cursor = self.cursor.as_mut()?;
            if self.started {
                match cursor.advance(1) {
                    Ok(()) => {}
                    Err(Error::EndOfTree) => {
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

            let key = match cursor.key() {
                Ok(key) => key,
                Err(e) => {
                    self.cursor = None;
                    return Some(Err(e));
                }
            };
            match key.parent_id.cmp(&self.parent_id) {
                Ordering::Less => continue,
                Ordering::Equal if key.name.is_empty() => continue,
                Ordering::Equal => return Some(cursor.record()),
                Ordering::Greater => {
                    self.cursor = None;
                    return None;
                }
            }
        }
    }
}
