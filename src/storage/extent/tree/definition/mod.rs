use std::sync::Arc;

use super::super::node::{
    set_checksum, Geometry, Node, NodeCheck, NodeRole, MAX_DEPTH, ROOT_LEN,
};
use super::super::stats::{ExtentEvent, ExtentObserver};
use super::super::status::ExtentStatusCache;
use crate::primitives::alloc::{BlockAllocator, FreeFlags};
use crate::primitives::journal::Journal;
use crate::primitives::pager::{BufferCache, BufferHandle};
use crate::types::checksum::file_seed;
use crate::types::{CorruptionKind, ExtentError, InodeNo, Pblk, Result};

mod api;
mod credits;
mod internal;
mod leaf;
mod map;
mod path;
mod query;
mod remove;
mod split;
mod types;
mod verify;

pub use path::{ExtentPath, PathFrame};
pub use types::{
    BlockMap, ExtentTreeOptions, FiemapExtent, FiemapFlags, MapFlags, MapMode, MapRequest,
};
pub use verify::VerifyReport;

/// Collaborators shared by every tree of a volume.
#[derive(Clone)]
pub struct TreeEnv {
    /// Block buffer cache.
    pub cache: Arc<dyn BufferCache>,
    /// Cluster allocator.
    pub alloc: Arc<dyn BlockAllocator>,
    /// Transaction bookkeeping.
    pub journal: Arc<dyn Journal>,
    /// Delayed ranges and cached holes.
    pub status: Arc<dyn ExtentStatusCache>,
    /// Optional statistics sink.
    pub observer: Option<Arc<dyn ExtentObserver>>,
    /// Device bounds and checksum switch.
    pub geometry: Geometry,
    /// Volume salt seeding node checksums.
    pub salt: u64,
}

/// Running estimate used by `metadata_amount`.
#[derive(Clone, Copy, Debug, Default)]
struct DelallocEstimate {
    last_lblk: Option<u32>,
    len: u32,
}

/// Extent tree of one file.
///
/// The root lives inline in `root` (the inode's 60-byte extent area); every
/// other node is read through the buffer cache. Mutators take `&mut self`;
/// callers serialise them per file. Read-only operations take `&self` and
/// may run concurrently with each other.
pub struct ExtentTree {
    ino: InodeNo,
    generation: u32,
    root: [u8; ROOT_LEN],
    size_blocks: u64,
    seed: Option<u32>,
    pending_conversion: bool,
    da_estimate: DelallocEstimate,
    env: TreeEnv,
    options: ExtentTreeOptions,
}

impl ExtentTree {
    fn with_root(
        ino: InodeNo,
        generation: u32,
        root: [u8; ROOT_LEN],
        size_blocks: u64,
        env: TreeEnv,
        options: ExtentTreeOptions,
    ) -> Result<Self> {
        env.geometry.validate()?;
        if env.cache.block_size() != env.geometry.block_size {
            return Err(ExtentError::Invalid("cache block size differs from geometry"));
        }
        let seed = env
            .geometry
            .checksums
            .then(|| file_seed(env.salt, ino, generation));
        Ok(Self {
            ino,
            generation,
            root,
            size_blocks,
            seed,
            pending_conversion: false,
            da_estimate: DelallocEstimate::default(),
            env,
            options,
        })
    }

    /// Creates a fresh, empty tree for `ino`.
    pub fn create(
        ino: InodeNo,
        generation: u32,
        env: TreeEnv,
        options: ExtentTreeOptions,
    ) -> Result<Self> {
        let mut tree = Self::with_root(ino, generation, [0u8; ROOT_LEN], 0, env, options)?;
        tree.tree_init()?;
        Ok(tree)
    }

    /// Opens an existing tree from the inode's inline root bytes.
    pub fn open(
        ino: InodeNo,
        generation: u32,
        root: &[u8; ROOT_LEN],
        size_blocks: u64,
        env: TreeEnv,
        options: ExtentTreeOptions,
    ) -> Result<Self> {
        let tree = Self::with_root(ino, generation, *root, size_blocks, env, options)?;
        tree.validated_root()?;
        Ok(tree)
    }

    /// Resets the inline root to an empty depth-0 leaf. Blocks the old
    /// tree referenced are not freed.
    pub fn tree_init(&mut self) -> Result<()> {
        let root = Node::empty_leaf(self.root_capacity());
        root.encode_into(&mut self.root)?;
        self.pending_conversion = false;
        self.env.journal.mark_inode_dirty(self.ino)?;
        tracing::debug!(target: "extmap::extent", ino = self.ino.0, "initialised extent root");
        Ok(())
    }

    /// Inode owning the tree.
    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    /// Inode generation (part of the checksum seed).
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Inline root bytes, as persisted in the inode.
    pub fn root_bytes(&self) -> &[u8; ROOT_LEN] {
        &self.root
    }

    /// Current depth (0 when the root is a leaf).
    pub fn depth(&self) -> u16 {
        u16::from_le_bytes([self.root[6], self.root[7]])
    }

    /// File size in blocks, used to keep zero-fill inside the file.
    pub fn size_blocks(&self) -> u64 {
        self.size_blocks
    }

    /// Updates the file size in blocks.
    pub fn set_size_blocks(&mut self, blocks: u64) {
        self.size_blocks = blocks;
    }

    /// True while a pre-I/O split is waiting for its conversion.
    pub fn has_pending_conversion(&self) -> bool {
        self.pending_conversion
    }

    /// Collaborators this tree runs on.
    pub fn env(&self) -> &TreeEnv {
        &self.env
    }

    /// Tree options.
    pub fn options(&self) -> &ExtentTreeOptions {
        &self.options
    }

    pub(super) fn root_capacity(&self) -> u16 {
        self.env.geometry.capacity(NodeRole::Root)
    }

    pub(super) fn block_capacity(&self) -> u16 {
        self.env.geometry.capacity(NodeRole::Block)
    }

    pub(super) fn cluster_ratio(&self) -> u32 {
        self.env.alloc.cluster_ratio().max(1)
    }

    pub(super) fn record(&self, event: ExtentEvent) {
        if let Some(observer) = &self.env.observer {
            observer.record(event);
        }
    }

    /// Decodes the inline root without re-validating it.
    pub(super) fn root_node(&self) -> Result<Node> {
        let node = Node::parse(&self.root, None)?;
        if node.depth > MAX_DEPTH {
            return Err(ExtentError::corrupt(CorruptionKind::DepthTooLarge, None));
        }
        Ok(node)
    }

    /// Decodes and fully validates the inline root.
    pub(super) fn validated_root(&self) -> Result<Node> {
        let depth = self.depth();
        if depth > MAX_DEPTH {
            return Err(ExtentError::corrupt(CorruptionKind::DepthTooLarge, None));
        }
        Node::parse_and_validate(
            &self.root,
            &NodeCheck {
                role: NodeRole::Root,
                depth,
                geometry: &self.env.geometry,
                seed: None,
                block: None,
            },
        )
    }

    /// Reads the node in `block`, validating it unless the buffer already passed.
    pub(super) fn read_node(&self, block: Pblk, depth: u16) -> Result<(Node, BufferHandle)> {
        let buf = self.env.cache.get_buffer(block)?;
        self.env.cache.read_buffer(&buf)?;
        let verified = buf.is_verified();
        let node = {
            let data = buf.read();
            if verified {
                Node::parse(&data, Some(block))?
            } else {
                Node::parse_and_validate(
                    &data,
                    &NodeCheck {
                        role: NodeRole::Block,
                        depth,
                        geometry: &self.env.geometry,
                        seed: self.seed,
                        block: Some(block),
                    },
                )?
            }
        };
        if node.depth != depth {
            return Err(ExtentError::corrupt(CorruptionKind::UnexpectedDepth, Some(block)));
        }
        if !verified {
            buf.set_verified();
        }
        Ok((node, buf))
    }

    fn encode_block(&self, buf: &BufferHandle, node: &Node) -> Result<()> {
        let mut data = buf.write();
        node.encode_into(&mut data)?;
        if let Some(seed) = self.seed {
            set_checksum(&mut data, seed)?;
        }
        Ok(())
    }

    /// Write access for the node at `level`; the inline root needs none.
    pub(super) fn get_access(&self, path: &ExtentPath, level: usize) -> Result<()> {
        match &path.frame(level)?.buffer {
            Some(buf) => self.env.journal.get_write_access(buf),
            None => Ok(()),
        }
    }

    /// Encodes the frame at `level` back into its buffer (or the inline
    /// root), sets the checksum and hands it to the journal.
    pub(super) fn dirty(&mut self, path: &ExtentPath, level: usize) -> Result<()> {
        let frame = path.frame(level)?;
        match &frame.buffer {
            Some(buf) => {
                self.encode_block(buf, &frame.node)?;
                self.env.journal.mark_dirty(buf)
            }
            None => {
                frame.node.encode_into(&mut self.root)?;
                self.env.journal.mark_inode_dirty(self.ino)
            }
        }
    }

    /// Writes `node` into the freshly allocated `block`.
    pub(super) fn write_new_node(&self, block: Pblk, node: &Node) -> Result<()> {
        let buf = self.env.cache.get_buffer(block)?;
        self.env.journal.get_write_access(&buf)?;
        buf.write().fill(0);
        self.encode_block(&buf, node)?;
        buf.set_uptodate();
        self.env.journal.mark_dirty(&buf)
    }

    /// Rewrites the inline root from `node`.
    pub(super) fn store_root(&mut self, node: &Node) -> Result<()> {
        node.encode_into(&mut self.root)?;
        self.env.journal.mark_inode_dirty(self.ino)
    }

    /// Returns a node block to the allocator and drops its cached copy.
    pub(super) fn free_node_block(&self, block: Pblk) -> Result<()> {
        self.env.cache.forget(block);
        self.env.alloc.free_blocks(
            block,
            1,
            FreeFlags {
                metadata: true,
                ..FreeFlags::default()
            },
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::ops::Range;
    use std::sync::Arc;

    use super::{ExtentTree, ExtentTreeOptions, TreeEnv};
    use crate::primitives::alloc::FreeSpaceAllocator;
    use crate::primitives::io::MemFileIo;
    use crate::primitives::journal::{JournalOptions, MemJournal};
    use crate::primitives::pager::{BlockCache, CacheOptions};
    use crate::storage::extent::node::{Extent, Geometry};
    use crate::storage::extent::stats::ExtentStats;
    use crate::storage::extent::status::StatusTree;
    use crate::types::{InodeNo, Pblk};

    pub(crate) struct Harness {
        pub tree: ExtentTree,
        pub alloc: Arc<FreeSpaceAllocator>,
        pub journal: Arc<MemJournal>,
        pub status: Arc<StatusTree>,
        pub stats: Arc<ExtentStats>,
        pub cache: Arc<BlockCache>,
        /// Blocks claimed up front for test extents.
        pub data: Range<Pblk>,
    }

    impl Harness {
        /// Inserts `ext`, claiming its blocks first unless they lie in the
        /// reserved data region.
        pub fn insert(&mut self, ext: Extent) {
            let reserved = self.data.start <= ext.physical && ext.physical_end() <= self.data.end;
            if !reserved {
                self.alloc.mark_used(ext.physical, u64::from(ext.len)).unwrap();
            }
            self.tree.insert_extent(ext).unwrap();
        }
    }

    /// Like [`harness`], with `data` claimed before any tree block is
    /// allocated, so node blocks never land on test extents.
    pub(crate) fn harness_reserving(
        block_size: usize,
        block_count: u64,
        ratio: u32,
        data: Range<Pblk>,
    ) -> Harness {
        let mut h = harness(block_size, block_count, ratio);
        h.alloc.mark_used(data.start, data.end - data.start).unwrap();
        h.data = data;
        h
    }

    pub(crate) fn harness(block_size: usize, block_count: u64, ratio: u32) -> Harness {
        harness_with(block_size, block_count, ratio, 0, ExtentTreeOptions::default())
    }

    pub(crate) fn harness_with(
        block_size: usize,
        block_count: u64,
        ratio: u32,
        reserved: u64,
        options: ExtentTreeOptions,
    ) -> Harness {
        let io = Arc::new(MemFileIo::with_len(block_size * block_count as usize));
        let cache = Arc::new(BlockCache::new(io, block_size, &CacheOptions::default()));
        let alloc = Arc::new(FreeSpaceAllocator::new(1, block_count, ratio, reserved).unwrap());
        let journal = Arc::new(MemJournal::new(JournalOptions::default()));
        let status = Arc::new(StatusTree::default());
        let stats = Arc::new(ExtentStats::default());
        let env = TreeEnv {
            cache: cache.clone(),
            alloc: alloc.clone(),
            journal: journal.clone(),
            status: status.clone(),
            observer: Some(stats.clone()),
            geometry: Geometry {
                block_size,
                first_data_block: 1,
                block_count,
                checksums: true,
            },
            salt: 0x5eed,
        };
        let tree = ExtentTree::create(InodeNo(12), 1, env, options).unwrap();
        Harness {
            tree,
            alloc,
            journal,
            status,
            stats,
            cache,
            data: 0..0,
        }
    }
}
