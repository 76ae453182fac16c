//! On-disk structures: the per-file extent tree and the volume image that
//! hosts a table of them.

/// Extent tree engine.
pub mod extent;

/// Volume image format.
pub mod volume;

pub use volume::{Volume, VolumeError, VolumeOptions};
