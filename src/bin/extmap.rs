//! Command-line front end for extmap volume images.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use extmap::primitives::io::{FileIo, StdFileIo};
use extmap::storage::extent::node::{Entries, Node};
use extmap::storage::extent::{
    BlockMap, Extent, ExtentStatsSnapshot, ExtentTree, FiemapExtent, MapMode, MapRequest,
    VerifyReport,
};
use extmap::storage::volume::{FileSummary, VolumeInfo};
use extmap::{Config, InodeNo, Volume};

#[derive(Parser, Debug)]
#[command(
    name = "extmap",
    version,
    about = "Inspect and modify extent trees inside an extmap volume image",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, env = "EXTMAP_CONFIG", help = "Path to a TOML config file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create a new volume image")]
    Format(FormatCmd),

    #[command(about = "Show superblock, allocator and file table")]
    Info {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },

    #[command(about = "Allocate an inode with an empty extent tree")]
    Create {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },

    #[command(about = "Map logical blocks, allocating according to --mode")]
    Map(MapCmd),

    #[command(about = "Preallocate unwritten blocks")]
    Fallocate {
        #[command(flatten)]
        target: RangeArgs,

        #[arg(long, help = "Do not grow the file size")]
        keep_size: bool,
    },

    #[command(about = "Mark an unwritten range as written")]
    Convert {
        #[command(flatten)]
        target: RangeArgs,
    },

    #[command(about = "Unmap a range without changing the size")]
    Punch {
        #[command(flatten)]
        target: RangeArgs,
    },

    #[command(about = "Drop every block from FIRST on")]
    Truncate {
        #[command(flatten)]
        file: FileArgs,

        #[arg(value_name = "FIRST")]
        first: u32,
    },

    #[command(about = "List every extent of a file")]
    Extents {
        #[command(flatten)]
        file: FileArgs,
    },

    #[command(about = "Report mappings with FIEMAP-style flags")]
    Fiemap {
        #[command(flatten)]
        file: FileArgs,

        #[arg(long, default_value_t = 0)]
        start: u32,

        #[arg(long, default_value_t = u32::MAX)]
        len: u32,
    },

    #[command(about = "Hex dump and decode a tree node")]
    DumpNode(DumpNodeCmd),

    #[command(about = "Check every tree of the volume")]
    Verify {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },

    #[command(about = "Per-file tree shape and volume counters")]
    Stats {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },
}

#[derive(Args, Debug)]
struct FormatCmd {
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    #[arg(long, help = "Block size in bytes")]
    block_size: Option<u32>,

    #[arg(long, help = "Number of blocks")]
    blocks: Option<u64>,

    #[arg(long, help = "Inode table slots")]
    inodes: Option<u32>,

    #[arg(long, help = "Blocks per allocation cluster")]
    cluster_ratio: Option<u32>,

    #[arg(long, help = "Disable tree block checksums")]
    no_checksums: bool,
}

#[derive(Args, Debug)]
struct FileArgs {
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    #[arg(value_name = "INO")]
    ino: u64,
}

#[derive(Args, Debug)]
struct RangeArgs {
    #[command(flatten)]
    file: FileArgs,

    #[arg(value_name = "START")]
    start: u32,

    #[arg(value_name = "LEN")]
    len: u32,
}

#[derive(Args, Debug)]
struct MapCmd {
    #[command(flatten)]
    target: RangeArgs,

    #[arg(long, value_enum, default_value_t = MapModeArg::Lookup)]
    mode: MapModeArg,

    #[arg(long, help = "Split unwritten extents ahead of direct I/O")]
    pre_io: bool,
}

#[derive(Args, Debug)]
struct DumpNodeCmd {
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    #[arg(long, conflicts_with = "root", help = "Physical block holding the node")]
    block: Option<u64>,

    #[arg(long, value_name = "INO", help = "Dump the inline root of an inode")]
    root: Option<u64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum MapModeArg {
    Lookup,
    Create,
    CreateUnwritten,
    Convert,
}

impl From<MapModeArg> for MapMode {
    fn from(mode: MapModeArg) -> Self {
        match mode {
            MapModeArg::Lookup => MapMode::LookupOnly,
            MapModeArg::Create => MapMode::Create,
            MapModeArg::CreateUnwritten => MapMode::CreateUninitialized,
            MapModeArg::Convert => MapMode::ConvertToWritten,
        }
    }
}

#[derive(Serialize)]
struct NodeDump {
    source: String,
    hex: Vec<String>,
    node: Option<Node>,
    error: Option<String>,
}

#[derive(Serialize)]
struct FileStats {
    #[serde(flatten)]
    file: FileSummary,
    tree: VerifyReport,
}

#[derive(Serialize)]
struct StatsReport {
    files: Vec<FileStats>,
    extent_stats: ExtentStatsSnapshot,
    info: VolumeInfo,
}

#[derive(Serialize)]
struct VerifyOutcome {
    ino: u64,
    report: Option<VerifyReport>,
    error: Option<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.log_filter);

    match cli.command {
        Command::Format(cmd) => {
            let mut config = config;
            apply_format_overrides(&mut config, &cmd);
            let volume = Volume::format(open_image(&cmd.image)?, &config)?;
            let info = volume.info()?;
            emit(&cli.format, &info, || print_info_text(&info))?;
        }
        Command::Info { image } => {
            let volume = open_volume(&image, &config)?;
            let info = volume.info()?;
            emit(&cli.format, &info, || print_info_text(&info))?;
        }
        Command::Create { image } => {
            let volume = open_volume(&image, &config)?;
            let tree = volume.create_file()?;
            volume.commit()?;
            let ino = tree.ino().0;
            emit(&cli.format, &ino, || println!("{ino}"))?;
        }
        Command::Map(cmd) => {
            let req = MapRequest {
                logical: cmd.target.start,
                len: cmd.target.len,
                mode: cmd.mode.into(),
                pre_io: cmd.pre_io,
            };
            let map = with_file(&config, &cmd.target.file, |tree| Ok(tree.map_range(req)?))?;
            emit(&cli.format, &map, || print_map_text(&map))?;
        }
        Command::Fallocate { target, keep_size } => {
            let allocated = with_file(&config, &target.file, |tree| {
                Ok(tree.fallocate(target.start, target.len, keep_size)?)
            })?;
            emit(&cli.format, &allocated, || {
                println!("allocated {allocated} blocks")
            })?;
        }
        Command::Convert { target } => {
            with_file(&config, &target.file, |tree| {
                Ok(tree.convert_unwritten(target.start, target.len)?)
            })?;
        }
        Command::Punch { target } => {
            with_file(&config, &target.file, |tree| {
                Ok(tree.punch_hole(target.start, target.len)?)
            })?;
        }
        Command::Truncate { file, first } => {
            with_file(&config, &file, |tree| Ok(tree.truncate(first)?))?;
        }
        Command::Extents { file } => {
            let volume = open_volume(&file.image, &config)?;
            let extents = volume.open_file(InodeNo(file.ino))?.extents()?;
            emit(&cli.format, &extents, || print_extents_text(&extents))?;
        }
        Command::Fiemap { file, start, len } => {
            let volume = open_volume(&file.image, &config)?;
            let items = volume.open_file(InodeNo(file.ino))?.fiemap(start, len)?;
            emit(&cli.format, &items, || print_fiemap_text(&items))?;
        }
        Command::DumpNode(cmd) => {
            let volume = open_volume(&cmd.image, &config)?;
            let dump = dump_node(&volume, &cmd)?;
            emit(&cli.format, &dump, || print_dump_text(&dump))?;
        }
        Command::Verify { image } => {
            let volume = open_volume(&image, &config)?;
            let outcomes = verify_all(&volume)?;
            emit(&cli.format, &outcomes, || print_verify_text(&outcomes))?;
            if outcomes.iter().any(|o| o.error.is_some()) {
                std::process::exit(2);
            }
        }
        Command::Stats { image } => {
            let volume = open_volume(&image, &config)?;
            let mut files = Vec::new();
            for file in volume.files()? {
                let tree = volume.open_file(InodeNo(file.ino))?.verify()?;
                files.push(FileStats { file, tree });
            }
            let report = StatsReport {
                files,
                extent_stats: volume.stats().snapshot(),
                info: volume.info()?,
            };
            volume.stats().emit_tracing();
            emit(&cli.format, &report, || print_stats_text(&report))?;
        }
    }

    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn apply_format_overrides(config: &mut Config, cmd: &FormatCmd) {
    let volume = &mut config.volume;
    if let Some(block_size) = cmd.block_size {
        volume.block_size = block_size;
    }
    if let Some(blocks) = cmd.blocks {
        volume.block_count = blocks;
    }
    if let Some(inodes) = cmd.inodes {
        volume.inode_count = inodes;
    }
    if let Some(ratio) = cmd.cluster_ratio {
        volume.cluster_ratio = ratio;
    }
    if cmd.no_checksums {
        volume.checksums = false;
    }
}

fn open_image(path: &Path) -> Result<Arc<dyn FileIo>, Box<dyn Error>> {
    Ok(Arc::new(StdFileIo::open(path)?))
}

fn open_volume(path: &Path, config: &Config) -> Result<Volume, Box<dyn Error>> {
    if !path.exists() {
        return Err(format!("image {} does not exist", path.display()).into());
    }
    Ok(Volume::open(open_image(path)?, config)?)
}

/// Opens the file, runs `op`, then persists the root and commits.
fn with_file<T, F>(config: &Config, file: &FileArgs, op: F) -> Result<T, Box<dyn Error>>
where
    F: FnOnce(&mut ExtentTree) -> Result<T, Box<dyn Error>>,
{
    let volume = open_volume(&file.image, config)?;
    let mut tree = volume.open_file(InodeNo(file.ino))?;
    let out = op(&mut tree)?;
    volume.store_file(&tree)?;
    volume.commit()?;
    Ok(out)
}

fn dump_node(volume: &Volume, cmd: &DumpNodeCmd) -> Result<NodeDump, Box<dyn Error>> {
    let (source, raw, block) = match (cmd.block, cmd.root) {
        (Some(block), _) => (format!("block {block}"), volume.read_block(block)?, Some(block)),
        (None, Some(ino)) => {
            let tree = volume.open_file(InodeNo(ino))?;
            (format!("inode {ino} root"), tree.root_bytes().to_vec(), None)
        }
        (None, None) => return Err("pass --block or --root".into()),
    };
    let (node, error) = match Node::parse(&raw, block) {
        Ok(node) => (Some(node), None),
        Err(err) => (None, Some(err.to_string())),
    };
    Ok(NodeDump {
        source,
        hex: raw.chunks(16).map(hex::encode).collect(),
        node,
        error,
    })
}

fn verify_all(volume: &Volume) -> Result<Vec<VerifyOutcome>, Box<dyn Error>> {
    let mut outcomes = Vec::new();
    for file in volume.files()? {
        let result = volume
            .open_file(InodeNo(file.ino))
            .map_err(|err| err.to_string())
            .and_then(|tree| tree.verify().map_err(|err| err.to_string()));
        outcomes.push(match result {
            Ok(report) => VerifyOutcome {
                ino: file.ino,
                report: Some(report),
                error: None,
            },
            Err(error) => VerifyOutcome {
                ino: file.ino,
                report: None,
                error: Some(error),
            },
        });
    }
    Ok(outcomes)
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_info_text(info: &VolumeInfo) {
    let sb = &info.superblock;
    println!(
        "Volume: block_size={} blocks={} first_data_block={} cluster_ratio={} checksums={}",
        sb.block_size, sb.block_count, sb.first_data_block, sb.cluster_ratio, sb.checksums
    );
    println!(
        "Allocator: free_clusters={} total_clusters={} reserved={}",
        info.alloc.free_clusters, info.alloc.total_clusters, info.alloc.reserved_clusters
    );
    println!("Files: {} of {} inodes", info.files.len(), sb.inode_count);
    for file in &info.files {
        println!(
            "  ino={} generation={} size_blocks={} depth={}",
            file.ino, file.generation, file.size_blocks, file.depth
        );
    }
}

fn print_map_text(map: &BlockMap) {
    if map.is_hole() {
        println!("{}+{}: hole", map.logical, map.len);
        return;
    }
    let mut flags = Vec::new();
    if map.flags.new {
        flags.push("new");
    }
    if map.flags.mapped {
        flags.push("mapped");
    }
    if map.flags.unwritten {
        flags.push("unwritten");
    }
    println!(
        "{}+{} -> {} [{}]",
        map.logical,
        map.len,
        map.physical,
        flags.join(",")
    );
}

fn print_extents_text(extents: &[Extent]) {
    for ext in extents {
        println!(
            "{:>10} {:>6} {:>12}{}",
            ext.logical,
            ext.len,
            ext.physical,
            if ext.unwritten { " unwritten" } else { "" }
        );
    }
}

fn print_fiemap_text(items: &[FiemapExtent]) {
    for item in items {
        let mut flags = Vec::new();
        if item.flags.unwritten {
            flags.push("unwritten");
        }
        if item.flags.delalloc {
            flags.push("delalloc");
        }
        if item.flags.last {
            flags.push("last");
        }
        println!(
            "{:>10} {:>6} {:>12} {}",
            item.logical,
            item.len,
            item.physical,
            flags.join(",")
        );
    }
}

fn print_dump_text(dump: &NodeDump) {
    println!("{}:", dump.source);
    for (i, line) in dump.hex.iter().enumerate() {
        println!("  {:04x}: {line}", i * 16);
    }
    match (&dump.node, &dump.error) {
        (Some(node), _) => {
            println!(
                "header: entries={} max={} depth={} generation={}",
                node.len(),
                node.max,
                node.depth,
                node.generation
            );
            match &node.entries {
                Entries::Leaf(extents) => print_extents_text(extents),
                Entries::Index(indexes) => {
                    for idx in indexes {
                        println!("{:>10} -> {}", idx.logical, idx.child);
                    }
                }
            }
        }
        (None, Some(error)) => println!("not a node: {error}"),
        (None, None) => {}
    }
}

fn print_verify_text(outcomes: &[VerifyOutcome]) {
    for outcome in outcomes {
        match (&outcome.report, &outcome.error) {
            (Some(r), _) => println!(
                "ino {}: ok depth={} extents={} mapped={} unwritten={} metadata={}",
                outcome.ino,
                r.depth,
                r.extents,
                r.mapped_blocks,
                r.unwritten_blocks,
                r.metadata_blocks
            ),
            (None, Some(error)) => println!("ino {}: FAILED {error}", outcome.ino),
            (None, None) => {}
        }
    }
}

fn print_stats_text(report: &StatsReport) {
    for file in &report.files {
        println!(
            "ino {}: depth={} index_nodes={} leaf_nodes={} extents={} mapped={}",
            file.file.ino,
            file.tree.depth,
            file.tree.index_nodes,
            file.tree.leaf_nodes,
            file.tree.extents,
            file.tree.mapped_blocks
        );
    }
    let alloc = &report.info.alloc;
    println!(
        "Allocator: free_clusters={} total_clusters={}",
        alloc.free_clusters, alloc.total_clusters
    );
    let cache = &report.info.cache;
    println!(
        "Cache: hits={} misses={} reads={} writes={} evictions={}",
        cache.hits, cache.misses, cache.reads, cache.writes, cache.evictions
    );
}
