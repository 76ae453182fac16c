//! ext4-style extent mapping engine: per-file extent B+ trees over a
//! block device image, with the allocator, journal and cache they run on.

#![warn(missing_docs)]

pub mod config;
pub mod primitives;
pub mod storage;
pub mod types;

pub use config::{Config, ConfigError};
pub use storage::extent::{
    BlockMap, Extent, ExtentTree, ExtentTreeOptions, MapMode, MapRequest, VerifyReport,
};
pub use storage::{Volume, VolumeError, VolumeOptions};
pub use types::{ExtentError, InodeNo, Lblk, Pblk, Result};
