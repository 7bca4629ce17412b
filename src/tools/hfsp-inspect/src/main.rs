use clap::{Parser, Subcommand, ValueEnum};
use hfsplus_ro::{
    BTree, BlockDevice, CatalogBody, CatalogRecord, HeaderRec, Key, NodeEntry, NodeKind, Record,
    StdDevice, Volume, VolumeOptions,
};
use std::fmt::Debug;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum InspectError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("HFS+ error: {0}")]
    Hfs(#[from] hfsplus_ro::Error),
}

#[derive(Parser, Debug)]
#[command(about = "Inspect HFS Plus volume images")]
struct Args {
    /// Raw disk or partition image
    #[arg(long)]
    image: PathBuf,

    /// Byte offset of the HFS Plus partition inside the image
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Sector size used for reads
    #[arg(long, default_value_t = 512)]
    sector_size: u32,

    /// Raise log verbosity (repeatable); RUST_LOG overrides it
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Volume header, statistics and tree geometry
    Info,
    /// Resolve a catalog node ID through its thread record
    Lookup { cnid: u32 },
    /// Resolve a path from the root folder
    Stat { path: String },
    /// List a folder by path
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Dump one node of a B-tree
    Node {
        #[arg(value_enum)]
        tree: TreeName,
        index: u32,
    },
    /// Print every leaf record of a B-tree in key order
    Walk {
        #[arg(value_enum)]
        tree: TreeName,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TreeName {
    Catalog,
    Extents,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn describe(record: &CatalogRecord) -> String {
    let name = record.key.name.to_string_lossy();
    match &record.body {
        CatalogBody::Folder(folder) => format!(
            "folder {:>8}  {:>6o}  {:>5} items  {name}",
            folder.folder_id, folder.bsd.file_mode, folder.valence
        ),
        CatalogBody::File(_) => format!("file   {:>8}  {:>6}  {:>11}  {name}", "-", "-", ""),
        CatalogBody::FolderThread(t) | CatalogBody::FileThread(t) => format!(
            "{} -> parent {} \"{}\"",
            record.body.kind_name(),
            t.parent_id,
            t.name
        ),
    }
}

fn tree_summary(name: &str, header: &HeaderRec) -> String {
    format!(
        "{name:<8}    depth {} root {} leaf records {} node size {} nodes {} free of {}",
        header.tree_depth,
        header.root_node,
        header.leaf_records,
        header.node_size,
        header.free_nodes,
        header.total_nodes
    )
}

fn print_record(record: &CatalogRecord) {
    println!(
        "key:      parent {} \"{}\"",
        record.key.parent_id, record.key.name
    );
    println!(
        "location: node offset {:#x}, record {}",
        record.location.node_offset, record.location.index
    );
    match &record.body {
        CatalogBody::Folder(folder) => {
            println!("type:     folder {}", folder.folder_id);
            println!("valence:  {}", folder.valence);
            println!("flags:    {:?}", folder.flags);
            println!(
                "owner:    {}:{} mode {:o} ({:?})",
                folder.bsd.owner_id,
                folder.bsd.group_id,
                folder.bsd.file_mode,
                folder.bsd.special()
            );
            println!("created:  {} (unix)", folder.create_date.unix_seconds());
            println!("modified: {} (unix)", folder.content_mod_date.unix_seconds());
            println!("accessed: {} (unix)", folder.access_date.unix_seconds());
        }
        other => println!("type:     {}", other.kind_name()),
    }
}

fn dump_node<D, K, R>(tree: &BTree<D, K, R>, index: u32) -> Result<(), InspectError>
where
    D: BlockDevice,
    K: Key,
    R: Record<K> + Debug,
{
    let node = tree.load_node(index)?;
    println!(
        "node {index}: {:?} height {} records {} next {} prev {}",
        node.kind(),
        node.height(),
        node.num_records(),
        node.forward_link(),
        node.backward_link()
    );
    if node.kind() == NodeKind::Header {
        println!("{:#?}", node.header_record()?);
        let used: u32 = node.map_record()?.iter().map(|b| b.count_ones()).sum();
        println!("map: {used} nodes in use");
        return Ok(());
    }
    for i in 0..node.num_records() {
        match node.entry::<K, R>(i, tree.layout()) {
            Ok(NodeEntry::Pointer(pointer)) => {
                println!("  [{i}] {:?} -> node {}", pointer.key, pointer.child)
            }
            Ok(NodeEntry::Leaf(record)) => println!("  [{i}] {record:?}"),
            Ok(NodeEntry::Raw(bytes)) => println!("  [{i}] {} bytes", bytes.len()),
            Err(e) => println!("  [{i}] error: {e}"),
        }
    }
    Ok(())
}

fn walk<D, K, R>(tree: &BTree<D, K, R>) -> Result<(), InspectError>
where
    D: BlockDevice,
    K: Key,
    R: Record<K> + Debug,
{
    for record in tree.records()? {
        match record {
            Ok(record) => println!("{record:?}"),
            Err(e) => println!("error: {e}"),
        }
    }
    Ok(())
}

fn main() -> Result<(), InspectError> {
    let args = Args::parse();
    init_logging(args.verbose);

    let file = File::open(&args.image)?;
    let device = StdDevice::with_options(
        file,
        VolumeOptions {
            partition_offset: args.offset,
            sector_size: args.sector_size,
        },
    );
    let volume = Volume::open(device)?;
    info!(image = %args.image.display(), offset = args.offset, "volume opened");

    match args.command {
        Command::Info => {
            let header = volume.header();
            let stats = volume.stats();
            println!(
                "signature:  {} version {}",
                if header.is_hfsx() { "HX" } else { "H+" },
                header.version
            );
            println!("attributes: {:?}", header.volume_attributes());
            println!("block size: {}", stats.block_size);
            println!(
                "blocks:     {} total, {} free",
                stats.total_blocks, stats.free_blocks
            );
            println!(
                "objects:    {} files, {} folders, next id {}",
                stats.file_count, stats.folder_count, stats.next_catalog_id
            );
            for (name, header, fork) in [
                ("catalog", volume.catalog().header(), volume.catalog().fork()),
                ("extents", volume.extents().header(), volume.extents().fork()),
            ] {
                println!("{}", tree_summary(name, header));
                let runs: Vec<String> = fork
                    .extents()
                    .iter()
                    .filter(|e| e.block_count != 0)
                    .map(|e| format!("{}+{}", e.start_block, e.block_count))
                    .collect();
                println!(
                    "            {} bytes in {} blocks: {}",
                    fork.logical_size(),
                    fork.total_blocks(),
                    runs.join(", ")
                );
            }
        }
        Command::Lookup { cnid } => print_record(&volume.lookup_by_cnid(cnid)?),
        Command::Stat { path } => print_record(&volume.lookup_path(&path)?),
        Command::Ls { path } => {
            let folder = volume.lookup_path(&path)?;
            for child in volume.catalog().iterate_children(&folder)? {
                match child {
                    Ok(record) => println!("{}", describe(&record)),
                    Err(e) => println!("error: {e}"),
                }
            }
        }
        Command::Node { tree, index } => match tree {
            TreeName::Catalog => dump_node(volume.catalog(), index)?,
            TreeName::Extents => dump_node(volume.extents(), index)?,
        },
        Command::Walk { tree } => match tree {
            TreeName::Catalog => walk(volume.catalog())?,
            TreeName::Extents => walk(volume.extents())?,
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_summary_reads_free_then_total() {
        let header = HeaderRec {
            tree_depth: 2,
            root_node: 3,
            leaf_records: 40,
            node_size: 4096,
            total_nodes: 5,
            free_nodes: 1,
            ..Default::default()
        };
        assert_eq!(
            tree_summary("catalog", &header),
            "catalog     depth 2 root 3 leaf records 40 node size 4096 nodes 1 free of 5"
        );
    }
}
