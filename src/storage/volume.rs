#![forbid(unsafe_code)]

//! Volume image: a superblock in block 0, an inode table of inline extent
//! roots, then data and tree blocks managed by the cluster allocator.

use std::ops::Range;
use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::primitives::alloc::{AllocSnapshot, FreeSpaceAllocator};
use crate::primitives::io::FileIo;
use crate::primitives::journal::{CommitSummary, MemJournal};
use crate::primitives::pager::{BlockCache, BufferCache, CacheStatsSnapshot};
use crate::storage::extent::node::{Geometry, Node, ROOT_LEN};
use crate::storage::extent::{ExtentStats, ExtentTree, ExtentTreeOptions, StatusTree, TreeEnv};
use crate::types::{ExtentError, InodeNo, Pblk};

const SB_MAGIC: u32 = 0x4558_544D;
const FORMAT_VERSION: u16 = 1;
const FLAG_CHECKSUMS: u16 = 1;

const SB_MAGIC_FIELD: Range<usize> = 0..4;
const SB_VERSION: Range<usize> = 4..6;
const SB_FLAGS: Range<usize> = 6..8;
const SB_BLOCK_SIZE: Range<usize> = 8..12;
const SB_CLUSTER_RATIO: Range<usize> = 12..16;
const SB_BLOCK_COUNT: Range<usize> = 16..24;
const SB_FIRST_DATA_BLOCK: Range<usize> = 24..32;
const SB_INODE_COUNT: Range<usize> = 32..36;
const SB_RESERVED: Range<usize> = 36..40;
const SB_RESERVED_CLUSTERS: Range<usize> = 40..48;
const SB_SALT: Range<usize> = 48..56;
const SB_CRC: Range<usize> = 56..60;
const SB_LEN: usize = 60;

const INO_FLAGS: Range<usize> = 0..4;
const INO_GENERATION: Range<usize> = 4..8;
const INO_SIZE: Range<usize> = 8..16;
const INO_ROOT: Range<usize> = 16..16 + ROOT_LEN;
const INO_CRC: Range<usize> = 92..96;
/// Bytes of one inode record.
pub const INODE_LEN: usize = 96;
const INODE_IN_USE: u32 = 1;

const MIN_VOLUME_BLOCK_SIZE: u32 = 128;
const MAX_VOLUME_BLOCK_SIZE: u32 = 64 * 1024;

/// Geometry chosen when formatting a volume.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeOptions {
    /// Bytes per block.
    pub block_size: u32,
    /// Blocks in the image.
    pub block_count: u64,
    /// Blocks per allocation cluster.
    pub cluster_ratio: u32,
    /// Inode slots in the inode table.
    pub inode_count: u32,
    /// Clusters only `nofail` allocations may use.
    pub reserved_clusters: u64,
    /// Checksum tree blocks.
    pub checksums: bool,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            block_count: 16 * 1024,
            cluster_ratio: 1,
            inode_count: 64,
            reserved_clusters: 0,
            checksums: true,
        }
    }
}

/// Decoded block 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Superblock {
    /// On-disk format version.
    pub version: u16,
    /// Bytes per block.
    pub block_size: u32,
    /// Blocks in the image.
    pub block_count: u64,
    /// First block after the inode table.
    pub first_data_block: u64,
    /// Blocks per allocation cluster.
    pub cluster_ratio: u32,
    /// Inode slots.
    pub inode_count: u32,
    /// Clusters held back for `nofail` allocations.
    pub reserved_clusters: u64,
    /// Whether tree blocks carry checksums.
    pub checksums: bool,
    /// Random salt seeding node checksums.
    pub salt: u64,
}

impl Superblock {
    fn from_options(opts: &VolumeOptions, salt: u64) -> Result<Self, VolumeError> {
        if !opts.block_size.is_power_of_two()
            || !(MIN_VOLUME_BLOCK_SIZE..=MAX_VOLUME_BLOCK_SIZE).contains(&opts.block_size)
        {
            return Err(VolumeError::Geometry(
                "block size must be a power of two between 128 and 65536",
            ));
        }
        if opts.cluster_ratio == 0 || !opts.cluster_ratio.is_power_of_two() {
            return Err(VolumeError::Geometry("cluster ratio must be a power of two"));
        }
        if opts.inode_count == 0 {
            return Err(VolumeError::Geometry("volume needs at least one inode"));
        }
        let per_block = opts.block_size as u64 / INODE_LEN as u64;
        let table_blocks = u64::from(opts.inode_count).div_ceil(per_block);
        let first_data_block = 1 + table_blocks;
        if opts.block_count < first_data_block + 2 * u64::from(opts.cluster_ratio) {
            return Err(VolumeError::Geometry("block count leaves no data blocks"));
        }
        let sb = Self {
            version: FORMAT_VERSION,
            block_size: opts.block_size,
            block_count: opts.block_count,
            first_data_block,
            cluster_ratio: opts.cluster_ratio,
            inode_count: opts.inode_count,
            reserved_clusters: opts.reserved_clusters,
            checksums: opts.checksums,
            salt,
        };
        sb.geometry().validate()?;
        Ok(sb)
    }

    /// Geometry handed to every tree.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.block_size as usize,
            first_data_block: self.first_data_block,
            block_count: self.block_count,
            checksums: self.checksums,
        }
    }

    fn inodes_per_block(&self) -> u64 {
        self.block_size as u64 / INODE_LEN as u64
    }

    fn inode_offset(&self, ino: InodeNo) -> Result<u64, VolumeError> {
        if ino.0 == 0 || ino.0 > u64::from(self.inode_count) {
            return Err(VolumeError::InodeNotFound(ino));
        }
        let slot = ino.0 - 1;
        let block = 1 + slot / self.inodes_per_block();
        let within = (slot % self.inodes_per_block()) * INODE_LEN as u64;
        Ok(block * u64::from(self.block_size) + within)
    }

    fn encode(&self) -> [u8; SB_LEN] {
        let mut buf = [0u8; SB_LEN];
        buf[SB_MAGIC_FIELD].copy_from_slice(&SB_MAGIC.to_le_bytes());
        buf[SB_VERSION].copy_from_slice(&self.version.to_le_bytes());
        let flags = if self.checksums { FLAG_CHECKSUMS } else { 0 };
        buf[SB_FLAGS].copy_from_slice(&flags.to_le_bytes());
        buf[SB_BLOCK_SIZE].copy_from_slice(&self.block_size.to_le_bytes());
        buf[SB_CLUSTER_RATIO].copy_from_slice(&self.cluster_ratio.to_le_bytes());
        buf[SB_BLOCK_COUNT].copy_from_slice(&self.block_count.to_le_bytes());
        buf[SB_FIRST_DATA_BLOCK].copy_from_slice(&self.first_data_block.to_le_bytes());
        buf[SB_INODE_COUNT].copy_from_slice(&self.inode_count.to_le_bytes());
        buf[SB_RESERVED].fill(0);
        buf[SB_RESERVED_CLUSTERS].copy_from_slice(&self.reserved_clusters.to_le_bytes());
        buf[SB_SALT].copy_from_slice(&self.salt.to_le_bytes());
        let crc = crc32fast::hash(&buf[..SB_CRC.start]);
        buf[SB_CRC].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; SB_LEN]) -> Result<Self, VolumeError> {
        let magic = read_u32(buf, SB_MAGIC_FIELD);
        if magic != SB_MAGIC {
            return Err(VolumeError::BadMagic(magic));
        }
        if read_u32(buf, SB_CRC) != crc32fast::hash(&buf[..SB_CRC.start]) {
            return Err(VolumeError::SuperblockChecksum);
        }
        let version = read_u16(buf, SB_VERSION);
        if version != FORMAT_VERSION {
            return Err(VolumeError::UnsupportedVersion(version));
        }
        let decoded = Self {
            version,
            block_size: read_u32(buf, SB_BLOCK_SIZE),
            block_count: read_u64(buf, SB_BLOCK_COUNT),
            first_data_block: read_u64(buf, SB_FIRST_DATA_BLOCK),
            cluster_ratio: read_u32(buf, SB_CLUSTER_RATIO),
            inode_count: read_u32(buf, SB_INODE_COUNT),
            reserved_clusters: read_u64(buf, SB_RESERVED_CLUSTERS),
            checksums: read_u16(buf, SB_FLAGS) & FLAG_CHECKSUMS != 0,
            salt: read_u64(buf, SB_SALT),
        };
        // Re-derive the layout so a consistent but bogus superblock is caught.
        let expected = Self::from_options(
            &VolumeOptions {
                block_size: decoded.block_size,
                block_count: decoded.block_count,
                cluster_ratio: decoded.cluster_ratio,
                inode_count: decoded.inode_count,
                reserved_clusters: decoded.reserved_clusters,
                checksums: decoded.checksums,
            },
            decoded.salt,
        )?;
        if expected != decoded {
            return Err(VolumeError::Geometry("inode table size disagrees with superblock"));
        }
        Ok(decoded)
    }
}

fn read_u16(buf: &[u8], range: Range<usize>) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[range]);
    u16::from_le_bytes(raw)
}

fn read_u32(buf: &[u8], range: Range<usize>) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[range]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], range: Range<usize>) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[range]);
    u64::from_le_bytes(raw)
}

/// One in-use inode table slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeRecord {
    /// Inode number (1-based slot index).
    pub ino: InodeNo,
    /// Generation, part of the checksum seed.
    pub generation: u32,
    /// File size in blocks.
    pub size_blocks: u64,
    /// Inline extent root.
    pub root: [u8; ROOT_LEN],
}

impl InodeRecord {
    fn encode(&self) -> [u8; INODE_LEN] {
        let mut buf = [0u8; INODE_LEN];
        buf[INO_FLAGS].copy_from_slice(&INODE_IN_USE.to_le_bytes());
        buf[INO_GENERATION].copy_from_slice(&self.generation.to_le_bytes());
        buf[INO_SIZE].copy_from_slice(&self.size_blocks.to_le_bytes());
        buf[INO_ROOT].copy_from_slice(&self.root);
        let crc = crc32fast::hash(&buf[..INO_CRC.start]);
        buf[INO_CRC].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(ino: InodeNo, buf: &[u8; INODE_LEN]) -> Result<Option<Self>, VolumeError> {
        if read_u32(buf, INO_FLAGS) & INODE_IN_USE == 0 {
            return Ok(None);
        }
        if read_u32(buf, INO_CRC) != crc32fast::hash(&buf[..INO_CRC.start]) {
            return Err(VolumeError::InodeChecksum(ino));
        }
        let mut root = [0u8; ROOT_LEN];
        root.copy_from_slice(&buf[INO_ROOT]);
        Ok(Some(Self {
            ino,
            generation: read_u32(buf, INO_GENERATION),
            size_blocks: read_u64(buf, INO_SIZE),
            root,
        }))
    }
}

/// Listing entry for one file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    /// Inode number.
    pub ino: u64,
    /// Inode generation.
    pub generation: u32,
    /// Size in blocks.
    pub size_blocks: u64,
    /// Depth of the extent tree.
    pub depth: u16,
}

/// Volume-wide report for `info`.
#[derive(Clone, Debug, Serialize)]
pub struct VolumeInfo {
    /// Decoded superblock.
    pub superblock: Superblock,
    /// Allocator counters.
    pub alloc: AllocSnapshot,
    /// Block cache counters.
    pub cache: CacheStatsSnapshot,
    /// In-use inodes.
    pub files: Vec<FileSummary>,
}

/// Failures specific to the image format.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// Engine or device failure.
    #[error(transparent)]
    Extent(#[from] ExtentError),
    /// Block 0 is not an extmap superblock.
    #[error("bad superblock magic {0:#010x}")]
    BadMagic(u32),
    /// Superblock CRC mismatch.
    #[error("superblock checksum mismatch")]
    SuperblockChecksum,
    /// Format version this build cannot read.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    /// Geometry the format cannot describe.
    #[error("invalid volume geometry: {0}")]
    Geometry(&'static str),
    /// Image file shorter than its superblock claims.
    #[error("image holds {actual} bytes but the superblock needs {expected}")]
    ShortImage {
        /// Bytes present.
        actual: u64,
        /// Bytes required.
        expected: u64,
    },
    /// Inode record CRC mismatch.
    #[error("inode {0} checksum mismatch")]
    InodeChecksum(InodeNo),
    /// Inode slot is free or out of range.
    #[error("inode {0} is not in use")]
    InodeNotFound(InodeNo),
    /// Every inode slot is taken.
    #[error("no free inode left")]
    NoFreeInode,
}

/// An open volume image and the collaborators its trees share.
pub struct Volume {
    io: Arc<dyn FileIo>,
    sb: Superblock,
    cache: Arc<BlockCache>,
    alloc: Arc<FreeSpaceAllocator>,
    journal: Arc<MemJournal>,
    status: Arc<StatusTree>,
    stats: Arc<ExtentStats>,
    tree_options: ExtentTreeOptions,
}

impl Volume {
    /// Writes a fresh superblock and an empty inode table, then opens the
    /// volume.
    pub fn format(io: Arc<dyn FileIo>, config: &Config) -> Result<Self, VolumeError> {
        let sb = Superblock::from_options(&config.volume, OsRng.next_u64())?;
        let bs = u64::from(sb.block_size);
        io.truncate(sb.block_count * bs)?;
        io.write_zeroes(0, sb.first_data_block * bs)?;
        io.write_at(0, &sb.encode())?;
        io.sync_all()?;
        tracing::info!(
            target: "extmap::volume",
            block_size = sb.block_size,
            blocks = sb.block_count,
            inodes = sb.inode_count,
            cluster_ratio = sb.cluster_ratio,
            "formatted volume"
        );
        Self::open(io, config)
    }

    /// Opens an image and rebuilds the allocator by walking every tree.
    pub fn open(io: Arc<dyn FileIo>, config: &Config) -> Result<Self, VolumeError> {
        let mut raw = [0u8; SB_LEN];
        io.read_at(0, &mut raw)?;
        let sb = Superblock::decode(&raw)?;
        let expected = sb.block_count * u64::from(sb.block_size);
        let actual = io.len()?;
        if actual < expected {
            return Err(VolumeError::ShortImage { actual, expected });
        }
        let cache = Arc::new(BlockCache::new(
            io.clone(),
            sb.block_size as usize,
            &config.cache,
        ));
        let alloc = Arc::new(FreeSpaceAllocator::new(
            sb.first_data_block,
            sb.block_count,
            sb.cluster_ratio,
            sb.reserved_clusters,
        )?);
        let journal = Arc::new(MemJournal::with_cache(config.journal.clone(), cache.clone()));
        let volume = Self {
            io,
            sb,
            cache,
            alloc,
            journal,
            status: Arc::new(StatusTree::default()),
            stats: Arc::new(ExtentStats::default()),
            tree_options: config.tree.clone(),
        };
        volume.rebuild_allocator()?;
        Ok(volume)
    }

    fn rebuild_allocator(&self) -> Result<(), VolumeError> {
        let mut files = 0usize;
        for record in self.records()? {
            let tree = self.tree_for(&record)?;
            for (start, len) in tree.block_runs()? {
                self.alloc.mark_used(start, len)?;
            }
            files += 1;
        }
        tracing::debug!(
            target: "extmap::volume",
            files,
            free_clusters = self.alloc.free_clusters(),
            "rebuilt allocator"
        );
        Ok(())
    }

    fn records(&self) -> Result<Vec<InodeRecord>, VolumeError> {
        let mut out = Vec::new();
        for n in 1..=u64::from(self.sb.inode_count) {
            if let Some(record) = self.read_record(InodeNo(n))? {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn read_record(&self, ino: InodeNo) -> Result<Option<InodeRecord>, VolumeError> {
        let offset = self.sb.inode_offset(ino)?;
        let mut raw = [0u8; INODE_LEN];
        self.io.read_at(offset, &mut raw)?;
        InodeRecord::decode(ino, &raw)
    }

    fn write_record(&self, ino: InodeNo, raw: &[u8; INODE_LEN]) -> Result<(), VolumeError> {
        let offset = self.sb.inode_offset(ino)?;
        self.io.write_at(offset, raw)?;
        Ok(())
    }

    fn tree_for(&self, record: &InodeRecord) -> Result<ExtentTree, VolumeError> {
        Ok(ExtentTree::open(
            record.ino,
            record.generation,
            &record.root,
            record.size_blocks,
            self.env(),
            self.tree_options.clone(),
        )?)
    }

    /// Decoded superblock.
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Collaborators for a tree of this volume.
    pub fn env(&self) -> TreeEnv {
        TreeEnv {
            cache: self.cache.clone(),
            alloc: self.alloc.clone(),
            journal: self.journal.clone(),
            status: self.status.clone(),
            observer: Some(self.stats.clone()),
            geometry: self.sb.geometry(),
            salt: self.sb.salt,
        }
    }

    /// Claims a free inode and gives it an empty tree.
    pub fn create_file(&self) -> Result<ExtentTree, VolumeError> {
        for n in 1..=u64::from(self.sb.inode_count) {
            let ino = InodeNo(n);
            if self.read_record(ino)?.is_some() {
                continue;
            }
            let tree = ExtentTree::create(
                ino,
                OsRng.next_u32(),
                self.env(),
                self.tree_options.clone(),
            )?;
            self.store_file(&tree)?;
            tracing::debug!(target: "extmap::volume", ino = n, "created file");
            return Ok(tree);
        }
        Err(VolumeError::NoFreeInode)
    }

    /// Opens the tree of an in-use inode.
    pub fn open_file(&self, ino: InodeNo) -> Result<ExtentTree, VolumeError> {
        let record = self
            .read_record(ino)?
            .ok_or(VolumeError::InodeNotFound(ino))?;
        self.tree_for(&record)
    }

    /// Persists the tree's inline root and size into its inode slot.
    pub fn store_file(&self, tree: &ExtentTree) -> Result<(), VolumeError> {
        let record = InodeRecord {
            ino: tree.ino(),
            generation: tree.generation(),
            size_blocks: tree.size_blocks(),
            root: *tree.root_bytes(),
        };
        self.write_record(tree.ino(), &record.encode())
    }

    /// Frees every block of `ino` and releases its slot.
    pub fn remove_file(&self, ino: InodeNo) -> Result<(), VolumeError> {
        let mut tree = self.open_file(ino)?;
        tree.truncate(0)?;
        self.write_record(ino, &[0u8; INODE_LEN])?;
        self.status.clear(ino);
        tracing::debug!(target: "extmap::volume", ino = ino.0, "removed file");
        Ok(())
    }

    /// Every in-use inode.
    pub fn files(&self) -> Result<Vec<FileSummary>, VolumeError> {
        self.records()?
            .into_iter()
            .map(|record| -> Result<FileSummary, VolumeError> {
                let depth = Node::parse(&record.root, None)?.depth;
                Ok(FileSummary {
                    ino: record.ino.0,
                    generation: record.generation,
                    size_blocks: record.size_blocks,
                    depth,
                })
            })
            .collect()
    }

    /// Commits the running transaction, writes dirty blocks back and syncs.
    pub fn commit(&self) -> Result<CommitSummary, VolumeError> {
        let summary = self.journal.commit()?;
        self.io.sync_all()?;
        Ok(summary)
    }

    /// Raw contents of `block`, through the cache.
    pub fn read_block(&self, block: Pblk) -> Result<Vec<u8>, VolumeError> {
        if block >= self.sb.block_count {
            return Err(VolumeError::Geometry("block past the end of the volume"));
        }
        let buf = self.cache.get_buffer(block)?;
        self.cache.read_buffer(&buf)?;
        let data = buf.read().to_vec();
        Ok(data)
    }

    /// Volume-wide counters and file list.
    pub fn info(&self) -> Result<VolumeInfo, VolumeError> {
        Ok(VolumeInfo {
            superblock: self.sb.clone(),
            alloc: self.alloc.snapshot(),
            cache: self.cache.stats(),
            files: self.files()?,
        })
    }

    /// Structural counters of every tree opened on this volume.
    pub fn stats(&self) -> &Arc<ExtentStats> {
        &self.stats
    }

    /// Shared status cache.
    pub fn status(&self) -> &Arc<StatusTree> {
        &self.status
    }

    /// Shared allocator.
    pub fn allocator(&self) -> &Arc<FreeSpaceAllocator> {
        &self.alloc
    }

    /// Shared journal.
    pub fn journal(&self) -> &Arc<MemJournal> {
        &self.journal
    }
}
