#![forbid(unsafe_code)]

//! Shared identifiers, error taxonomy and checksum helpers.

use std::fmt;
use std::io;

/// Checksum helpers for extent tree nodes.
pub mod checksum;

/// Logical block number inside a file.
pub type Lblk = u32;

/// Physical block number on the backing device (48 bits on disk).
pub type Pblk = u64;

/// Largest logical block number plus one; also used as the "no block" marker.
pub const EXT_MAX_BLOCKS: Lblk = u32::MAX;

/// Largest encodable physical block number.
pub const MAX_PHYSICAL_BLOCK: Pblk = (1u64 << 48) - 1;

/// Inode number owning an extent tree.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct InodeNo(pub u64);

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The specific structural invariant a corrupted node violated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CorruptionKind {
    /// Node shorter than a header.
    #[error("truncated node")]
    Truncated,
    /// Magic tag mismatch.
    #[error("invalid magic")]
    BadMagic,
    /// Header depth disagrees with the node's position.
    #[error("unexpected eh_depth")]
    UnexpectedDepth,
    /// Capacity is zero.
    #[error("invalid eh_max")]
    InvalidMax,
    /// Capacity exceeds what the node's role allows.
    #[error("too large eh_max")]
    MaxTooLarge,
    /// Entry count exceeds capacity.
    #[error("invalid eh_entries")]
    InvalidEntries,
    /// An entry is malformed, out of order or overlapping.
    #[error("invalid extent entries")]
    InvalidExtentEntries,
    /// Trailer checksum does not match the node contents.
    #[error("extent tree checksum mismatch")]
    ChecksumMismatch,
    /// Tree depth above the supported maximum.
    #[error("too large eh_depth")]
    DepthTooLarge,
    /// Leaf below the root has no entries where one is required.
    #[error("bad extent address")]
    EmptyLeaf,
    /// Index node without entries on a lookup path.
    #[error("empty index node")]
    EmptyIndex,
    /// New index key equals the key under the cursor.
    #[error("index key collision")]
    IndexCollision,
    /// Insert into a node that has no free slot.
    #[error("node is full")]
    NodeFull,
    /// Split requested on a node that is not full.
    #[error("split of non-full node")]
    SplitNotFull,
    /// A cursor was required but the frame had none.
    #[error("path cursor missing")]
    MissingCursor,
    /// Leaf-role operation applied to an index node or vice versa.
    #[error("node role mismatch")]
    RoleMismatch,
    /// Neighbour search found an extent overlapping the target.
    #[error("neighbour extent overlaps target block")]
    NeighbourOverlap,
    /// Extent with the same start already present.
    #[error("duplicate extent start")]
    DuplicateExtent,
    /// Removal boundary fell inside an extent.
    #[error("can not handle truncate")]
    UnalignedRemoval,
    /// Path depth changed under a relocated cursor.
    #[error("path depth changed")]
    PathDepthChanged,
    /// Index key does not match the first key of its child.
    #[error("index key does not match child")]
    IndexKeyMismatch,
    /// A block is referenced more than once.
    #[error("block referenced twice")]
    DuplicateBlock,
}

/// Errors produced by the extent engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ExtentError {
    /// Underlying device failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// On-disk structure is inconsistent.
    #[error("extent tree corruption: {kind}{}", .block.map(|b| format!(" (block {b})")).unwrap_or_default())]
    Corruption {
        /// The violated invariant.
        kind: CorruptionKind,
        /// The offending block, when the node is not the inline root.
        block: Option<Pblk>,
    },
    /// The allocator has no free space left.
    #[error("no space left on device")]
    NoSpace,
    /// The journal needs the caller to restart the operation.
    #[error("transaction restart required")]
    Retry,
    /// Caller supplied an invalid argument or violated a protocol.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Requested object does not exist.
    #[error("not found")]
    NotFound,
}

impl ExtentError {
    /// Builds a corruption error for `kind`, optionally naming the node block.
    pub fn corrupt(kind: CorruptionKind, block: Option<Pblk>) -> Self {
        ExtentError::Corruption { kind, block }
    }

    /// Returns true for the journal restart signal.
    pub fn is_retry(&self) -> bool {
        matches!(self, ExtentError::Retry)
    }

    /// Returns the corruption kind if this is a corruption error.
    pub fn corruption_kind(&self) -> Option<CorruptionKind> {
        match self {
            ExtentError::Corruption { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExtentError>;
