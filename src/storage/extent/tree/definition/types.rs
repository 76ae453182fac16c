use serde::{Deserialize, Serialize};

use crate::types::{Lblk, Pblk};

/// What `map_range` may do when the range is not already written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapMode {
    /// Report the mapping only.
    LookupOnly,
    /// Allocate if needed and return initialized blocks.
    Create,
    /// Allocate if needed and leave new blocks unwritten.
    CreateUninitialized,
    /// Flip an unwritten range to written after its data landed.
    ConvertToWritten,
}

/// One `map_range` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapRequest {
    /// First logical block.
    pub logical: Lblk,
    /// Blocks wanted.
    pub len: u32,
    /// Allocation behaviour.
    pub mode: MapMode,
    /// Caller is about to write through the range and converts afterwards.
    pub pre_io: bool,
}

impl MapRequest {
    fn with_mode(logical: Lblk, len: u32, mode: MapMode) -> Self {
        Self {
            logical,
            len,
            mode,
            pre_io: false,
        }
    }

    /// Lookup without allocation.
    pub fn lookup(logical: Lblk, len: u32) -> Self {
        Self::with_mode(logical, len, MapMode::LookupOnly)
    }

    /// Allocate written blocks.
    pub fn create(logical: Lblk, len: u32) -> Self {
        Self::with_mode(logical, len, MapMode::Create)
    }

    /// Allocate unwritten blocks.
    pub fn create_uninitialized(logical: Lblk, len: u32) -> Self {
        Self::with_mode(logical, len, MapMode::CreateUninitialized)
    }

    /// Convert unwritten blocks after I/O completion.
    pub fn convert(logical: Lblk, len: u32) -> Self {
        Self::with_mode(logical, len, MapMode::ConvertToWritten)
    }

    /// Marks the request as issued ahead of direct I/O.
    pub fn pre_io(mut self) -> Self {
        self.pre_io = true;
        self
    }
}

/// State bits of a mapping result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MapFlags {
    /// Blocks were allocated or changed state by this call.
    pub new: bool,
    /// Blocks are mapped and may be used for I/O.
    pub mapped: bool,
    /// Blocks are allocated but hold no valid data.
    pub unwritten: bool,
    /// Physical block came from a cluster already owned by a neighbour.
    pub from_cluster: bool,
}

/// Result of `map_range`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BlockMap {
    /// First logical block (equal to the request's).
    pub logical: Lblk,
    /// Blocks covered by this result; for holes, the gap length.
    pub len: u32,
    /// First physical block, zero for holes.
    pub physical: Pblk,
    /// State bits.
    pub flags: MapFlags,
    /// Range must be converted once the in-flight write finishes.
    pub needs_conversion: bool,
}

impl BlockMap {
    pub(crate) fn hole(logical: Lblk, len: u32) -> Self {
        Self {
            logical,
            len,
            physical: 0,
            flags: MapFlags::default(),
            needs_conversion: false,
        }
    }

    /// True if nothing backs the range.
    pub fn is_hole(&self) -> bool {
        !self.flags.mapped && !self.flags.unwritten
    }
}

/// Knobs for one tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtentTreeOptions {
    /// Unwritten extents up to this size (KiB) are zero-filled rather than split.
    pub max_zeroout_kb: u32,
    /// Record hole lookups in the status cache.
    pub cache_holes: bool,
    /// Consecutive internal restarts before `Retry` reaches the caller.
    pub max_restarts: u32,
}

impl Default for ExtentTreeOptions {
    fn default() -> Self {
        Self {
            max_zeroout_kb: 32,
            cache_holes: true,
            max_restarts: 16,
        }
    }
}

/// Flags on an enumerated extent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FiemapFlags {
    /// Last extent of the file.
    pub last: bool,
    /// Allocated but unwritten.
    pub unwritten: bool,
    /// Pending delayed allocation, no physical block yet.
    pub delalloc: bool,
}

/// One enumerated mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FiemapExtent {
    /// First logical block.
    pub logical: Lblk,
    /// First physical block (zero for delayed ranges).
    pub physical: Pblk,
    /// Blocks covered.
    pub len: u32,
    /// State bits.
    pub flags: FiemapFlags,
}

/// Behaviour of an extent split.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SplitFlags {
    /// First half stays unwritten.
    pub mark_uninit1: bool,
    /// Second half stays unwritten.
    pub mark_uninit2: bool,
    /// Zero-fill instead of failing when the split runs out of space.
    pub may_zeroout: bool,
    /// First half holds valid data.
    pub data_valid1: bool,
    /// Second half holds valid data.
    pub data_valid2: bool,
}

/// Behaviour of leaf insertion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct InsertFlags {
    /// Do not coalesce; a conversion follows.
    pub pre_io: bool,
    /// Metadata allocation may use the reserved pool.
    pub nofail: bool,
}
