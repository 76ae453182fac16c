//! Collaborators the extent engine runs on.
//!
//! Each module defines the contract the engine consumes (a trait) next to
//! the implementation the crate ships for it.

/// Cluster allocation.
pub mod alloc;

/// Positioned device I/O.
pub mod io;

/// Transaction bookkeeping.
pub mod journal;

/// Block buffer cache.
///
/// Pins buffers for the lifetime of a handle and writes dirty blocks back
/// on flush or eviction.
pub mod pager;
