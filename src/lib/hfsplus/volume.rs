use alloc::sync::Arc;
use alloc::vec::Vec;
use binrw::BinReaderExt;
use binrw::io::Cursor;
use tracing::{debug, warn};

use crate::catalog::{CatalogRecord, CatalogTree};
use crate::device::{BlockDevice, read_bytes};
use crate::extents::{ExtentsTree, Fork};
use crate::internal::{CatalogNodeId, VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE, VolumeHeader};
use crate::Result;

/// Reads and validates the volume header at byte 1024.
pub fn read_volume_header<D: BlockDevice + ?Sized>(device: &D) -> Result<VolumeHeader> {
    let mut raw = [0u8; VOLUME_HEADER_SIZE];
    read_bytes(device, VOLUME_HEADER_OFFSET, &mut raw)?;
    let header: VolumeHeader = Cursor::new(&raw[..]).read_be()?;
    header.validate()?;
    Ok(header)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VolumeStats {
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub next_catalog_id: CatalogNodeId,
}

/// An opened HFS Plus or HFSX volume with its extents and catalog trees.
pub struct Volume<D> {
    device: Arc<D>,
    header: VolumeHeader,
    extents: ExtentsTree<Arc<D>>,
    catalog: CatalogTree<Arc<D>>,
}

impl<D: BlockDevice> Volume<D> {
    pub fn open(device: D) -> Result<Self> {
        let device = Arc::new(device);
        let header = read_volume_header(&*device)?;
        let block_size = header.block_size;

        let extents_fork = special_fork("extents", Fork::from(&header.extents_file), block_size);
        let catalog_fork = special_fork("catalog", Fork::from(&header.catalog_file), block_size);
        let extents = ExtentsTree::open(device.clone(), extents_fork, block_size)?;
        let catalog = CatalogTree::open(device.clone(), catalog_fork, block_size)?;

        debug!(
            hfsx = header.is_hfsx(),
            block_size,
            total_blocks = header.total_blocks,
            files = header.file_count,
            folders = header.folder_count,
            "opened volume"
        );
        Ok(Volume {
            device,
            header,
            extents,
            catalog,
        })
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn extents(&self) -> &ExtentsTree<Arc<D>> {
        &self.extents
    }

    pub fn catalog(&self) -> &CatalogTree<Arc<D>> {
        &self.catalog
    }

    pub fn stats(&self) -> VolumeStats {
        VolumeStats {
            block_size: self.header.block_size,
            total_blocks: self.header.total_blocks,
            free_blocks: self.header.free_blocks,
            file_count: self.header.file_count,
            folder_count: self.header.folder_count,
            next_catalog_id: self.header.next_catalog_id,
        }
    }

    pub fn lookup_by_cnid(&self, cnid: CatalogNodeId) -> Result<CatalogRecord> {
        self.catalog.lookup_by_cnid(cnid)
    }

    pub fn lookup_path(&self, path: &str) -> Result<CatalogRecord> {
        self.catalog.lookup_path(path)
    }

    pub fn list_dir(&self, cnid: CatalogNodeId) -> Result<Vec<CatalogRecord>> {
        self.catalog.list_dir(cnid)
    }
}

fn special_fork(name: &str, fork: Fork, block_size: u32) -> Fork {
    if fork.needs_overflow(block_size) {
        warn!(
            file = name,
            logical_size = fork.logical_size(),
            inline_blocks = fork.inline_blocks(),
            "special file extends past its inline extents"
        );
    }
    fork
}
