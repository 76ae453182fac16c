#![forbid(unsafe_code)]

//! ext4-style extent tree: a per-file B+ tree mapping logical blocks to
//! runs of physical blocks.

/// On-disk node format.
pub mod node;
mod stats;
mod status;
mod tree;

pub use node::{Entries, Extent, Geometry, IndexEntry, Node, NodeRole, MAX_EXTENT_LEN};
pub use stats::{ExtentEvent, ExtentObserver, ExtentStats, ExtentStatsSnapshot};
pub use status::{DelayedRange, ExtentStatusCache, StatusTree};
pub use tree::{
    BlockMap, ExtentPath, ExtentTree, ExtentTreeOptions, FiemapExtent, FiemapFlags, MapFlags,
    MapMode, MapRequest, PathFrame, TreeEnv, VerifyReport,
};
