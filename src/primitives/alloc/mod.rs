#![forbid(unsafe_code)]

//! Cluster allocator consumed by the extent engine.

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{CorruptionKind, ExtentError, InodeNo, Lblk, Pblk, Result};

/// Request for data blocks, expressed in clusters.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocRequest {
    /// Preferred first block (cluster aligned by the caller).
    pub goal: Pblk,
    /// Logical block the allocation will map (cluster aligned).
    pub logical: Lblk,
    /// Clusters wanted.
    pub clusters: u32,
    /// Closest mapped block to the left, as (logical, physical).
    pub left: Option<(Lblk, Pblk)>,
    /// Closest mapped block to the right, as (logical, physical).
    pub right: Option<(Lblk, Pblk)>,
    /// May dip into the reserved pool.
    pub nofail: bool,
}

/// Modifiers for [`BlockAllocator::free_blocks`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FreeFlags {
    /// Block held tree metadata.
    pub metadata: bool,
    /// Keep the cluster holding `start` if `start` is not cluster aligned.
    pub nofree_first_cluster: bool,
    /// Keep the cluster holding the last block if the range ends mid-cluster.
    pub nofree_last_cluster: bool,
}

/// Allocator contract consumed by the extent engine.
pub trait BlockAllocator: Send + Sync {
    /// Blocks per allocation cluster (1 disables clustering).
    fn cluster_ratio(&self) -> u32;
    /// Fallback placement hint for a file with no mapped neighbours.
    fn inode_goal(&self, ino: InodeNo) -> Pblk;
    /// Allocates one block for a tree node near `goal`.
    fn new_metadata_block(&self, goal: Pblk, nofail: bool) -> Result<Pblk>;
    /// Allocates up to `req.clusters` contiguous clusters. Returns the first
    /// block and the number of clusters granted.
    fn new_data_blocks(&self, req: &AllocRequest) -> Result<(Pblk, u32)>;
    /// Releases `count` blocks starting at `start`, rounded to clusters.
    fn free_blocks(&self, start: Pblk, count: u32, flags: FreeFlags) -> Result<()>;
}

/// Run of free clusters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FreeRun {
    /// First free cluster.
    pub start: u64,
    /// Number of clusters.
    pub len: u64,
}

impl FreeRun {
    fn end(&self) -> u64 {
        self.start + self.len
    }

    fn coalesce_with(&mut self, other: &FreeRun) -> bool {
        if self.end() == other.start {
            self.len += other.len;
            true
        } else {
            false
        }
    }
}

/// Allocator counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct AllocSnapshot {
    /// Clusters currently free.
    pub free_clusters: u64,
    /// Clusters managed in total.
    pub total_clusters: u64,
    /// Clusters held back for `nofail` requests.
    pub reserved_clusters: u64,
    /// Metadata blocks handed out.
    pub metadata_allocs: u64,
    /// Data allocation calls served.
    pub data_allocs: u64,
    /// Clusters returned.
    pub clusters_freed: u64,
}

struct FreeState {
    runs: Vec<FreeRun>,
    free: u64,
    metadata_allocs: u64,
    data_allocs: u64,
    clusters_freed: u64,
}

/// Sorted free-run allocator over a contiguous block range.
pub struct FreeSpaceAllocator {
    first_cluster: u64,
    end_cluster: u64,
    ratio: u32,
    reserved: u64,
    group_clusters: u64,
    state: Mutex<FreeState>,
}

impl FreeSpaceAllocator {
    /// Manages blocks `[first_data_block, block_count)` in clusters of
    /// `cluster_ratio` blocks, holding `reserved_clusters` back for `nofail`.
    pub fn new(
        first_data_block: Pblk,
        block_count: Pblk,
        cluster_ratio: u32,
        reserved_clusters: u64,
    ) -> Result<Self> {
        if cluster_ratio == 0 || !cluster_ratio.is_power_of_two() {
            return Err(ExtentError::Invalid("cluster ratio must be a power of two"));
        }
        let ratio = u64::from(cluster_ratio);
        let first_cluster = first_data_block.div_ceil(ratio);
        let end_cluster = block_count / ratio;
        if end_cluster <= first_cluster {
            return Err(ExtentError::Invalid("device too small for cluster ratio"));
        }
        let total = end_cluster - first_cluster;
        Ok(Self {
            first_cluster,
            end_cluster,
            ratio: cluster_ratio,
            reserved: reserved_clusters.min(total),
            group_clusters: (total / 8).max(1),
            state: Mutex::new(FreeState {
                runs: vec![FreeRun {
                    start: first_cluster,
                    len: total,
                }],
                free: total,
                metadata_allocs: 0,
                data_allocs: 0,
                clusters_freed: 0,
            }),
        })
    }

    fn ratio(&self) -> u64 {
        u64::from(self.ratio)
    }

    /// Free clusters remaining.
    pub fn free_clusters(&self) -> u64 {
        self.state.lock().free
    }

    /// Total clusters managed.
    pub fn total_clusters(&self) -> u64 {
        self.end_cluster - self.first_cluster
    }

    /// Copy of the free-run list.
    pub fn free_runs(&self) -> Vec<FreeRun> {
        self.state.lock().runs.clone()
    }

    /// Counter snapshot.
    pub fn snapshot(&self) -> AllocSnapshot {
        let state = self.state.lock();
        AllocSnapshot {
            free_clusters: state.free,
            total_clusters: self.total_clusters(),
            reserved_clusters: self.reserved,
            metadata_allocs: state.metadata_allocs,
            data_allocs: state.data_allocs,
            clusters_freed: state.clusters_freed,
        }
    }

    /// Marks blocks as in use while rebuilding state from existing trees.
    pub fn mark_used(&self, start: Pblk, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let first = start / self.ratio();
        let last = (start + count - 1) / self.ratio();
        let mut state = self.state.lock();
        for cluster in first..=last {
            if !Self::take_cluster(&mut state, cluster) {
                // Clusters shared by neighbouring extents are marked once.
                if !(self.ratio > 1 && (cluster == first || cluster == last)) {
                    return Err(ExtentError::corrupt(
                        CorruptionKind::DuplicateBlock,
                        Some(cluster * self.ratio()),
                    ));
                }
            }
        }
        Ok(())
    }

    fn take_cluster(state: &mut FreeState, cluster: u64) -> bool {
        let idx = state.runs.partition_point(|run| run.end() <= cluster);
        let Some(run) = state.runs.get(idx).copied() else {
            return false;
        };
        if cluster < run.start {
            return false;
        }
        Self::take(state, idx, cluster, 1);
        true
    }

    fn take(state: &mut FreeState, idx: usize, start: u64, len: u64) {
        let run = state.runs[idx];
        let head = FreeRun {
            start: run.start,
            len: start - run.start,
        };
        let tail = FreeRun {
            start: start + len,
            len: run.end() - (start + len),
        };
        state.runs.remove(idx);
        let mut at = idx;
        if head.len > 0 {
            state.runs.insert(at, head);
            at += 1;
        }
        if tail.len > 0 {
            state.runs.insert(at, tail);
        }
        state.free -= len;
    }

    fn allocate(&self, goal: Pblk, wanted: u64, nofail: bool) -> Result<(u64, u64)> {
        let mut state = self.state.lock();
        let available = if nofail {
            state.free
        } else {
            state.free.saturating_sub(self.reserved)
        };
        if available == 0 || state.runs.is_empty() {
            return Err(ExtentError::NoSpace);
        }
        let wanted = wanted.min(available).max(1);
        let goal = (goal / self.ratio()).clamp(self.first_cluster, self.end_cluster - 1);
        let idx = state.runs.partition_point(|run| run.end() <= goal);
        let (idx, start) = match state.runs.get(idx) {
            Some(run) if run.start <= goal => (idx, goal),
            Some(run) => (idx, run.start),
            None => (0, state.runs[0].start),
        };
        let len = wanted.min(state.runs[idx].end() - start);
        Self::take(&mut state, idx, start, len);
        Ok((start, len))
    }

    fn release(&self, first: u64, last: u64) -> Result<()> {
        if first > last {
            return Ok(());
        }
        if first < self.first_cluster || last >= self.end_cluster {
            return Err(ExtentError::Invalid("freeing blocks outside the device"));
        }
        let mut state = self.state.lock();
        let run = FreeRun {
            start: first,
            len: last - first + 1,
        };
        let idx = state.runs.partition_point(|r| r.end() <= run.start);
        if let Some(next) = state.runs.get(idx) {
            if next.start < run.end() {
                tracing::warn!(
                    target: "extmap::alloc",
                    cluster = first,
                    "double free detected"
                );
                return Err(ExtentError::corrupt(
                    CorruptionKind::DuplicateBlock,
                    Some(first * self.ratio()),
                ));
            }
        }
        state.runs.insert(idx, run);
        if idx + 1 < state.runs.len() {
            let next = state.runs[idx + 1];
            if state.runs[idx].coalesce_with(&next) {
                state.runs.remove(idx + 1);
            }
        }
        if idx > 0 {
            let cur = state.runs[idx];
            if state.runs[idx - 1].coalesce_with(&cur) {
                state.runs.remove(idx);
            }
        }
        state.free += run.len;
        state.clusters_freed += run.len;
        Ok(())
    }
}

impl BlockAllocator for FreeSpaceAllocator {
    fn cluster_ratio(&self) -> u32 {
        self.ratio
    }

    fn inode_goal(&self, ino: InodeNo) -> Pblk {
        let groups = ((self.end_cluster - self.first_cluster) / self.group_clusters).max(1);
        let group = ino.0 % groups;
        (self.first_cluster + group * self.group_clusters) * self.ratio()
    }

    fn new_metadata_block(&self, goal: Pblk, nofail: bool) -> Result<Pblk> {
        let (cluster, _) = self.allocate(goal, 1, nofail)?;
        self.state.lock().metadata_allocs += 1;
        tracing::trace!(target: "extmap::alloc", block = cluster * self.ratio(), "metadata block");
        Ok(cluster * self.ratio())
    }

    fn new_data_blocks(&self, req: &AllocRequest) -> Result<(Pblk, u32)> {
        if req.clusters == 0 {
            return Err(ExtentError::Invalid("zero-length allocation"));
        }
        let (cluster, len) = self.allocate(req.goal, u64::from(req.clusters), req.nofail)?;
        self.state.lock().data_allocs += 1;
        tracing::trace!(
            target: "extmap::alloc",
            goal = req.goal,
            block = cluster * self.ratio(),
            clusters = len,
            "data blocks"
        );
        Ok((cluster * self.ratio(), len as u32))
    }

    fn free_blocks(&self, start: Pblk, count: u32, flags: FreeFlags) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let ratio = self.ratio();
        let end = start + u64::from(count);
        let mut first = start / ratio;
        let mut last = (end - 1) / ratio;
        if flags.nofree_first_cluster && start % ratio != 0 {
            if first == last {
                return Ok(());
            }
            first += 1;
        }
        if flags.nofree_last_cluster && end % ratio != 0 {
            if last == first {
                return Ok(());
            }
            last -= 1;
        }
        tracing::trace!(
            target: "extmap::alloc",
            start,
            count,
            metadata = flags.metadata,
            "free blocks"
        );
        self.release(first, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_from_goal_and_coalesces_on_free() -> Result<()> {
        let alloc = FreeSpaceAllocator::new(1, 100, 1, 0)?;
        let (start, len) = alloc.new_data_blocks(&AllocRequest {
            goal: 10,
            clusters: 5,
            ..AllocRequest::default()
        })?;
        assert_eq!((start, len), (10, 5));
        assert_eq!(alloc.free_clusters(), 94);
        alloc.free_blocks(10, 5, FreeFlags::default())?;
        assert_eq!(alloc.free_runs(), vec![FreeRun { start: 1, len: 99 }]);
        Ok(())
    }

    #[test]
    fn double_free_is_rejected() -> Result<()> {
        let alloc = FreeSpaceAllocator::new(1, 64, 1, 0)?;
        let block = alloc.new_metadata_block(20, false)?;
        alloc.free_blocks(block, 1, FreeFlags::default())?;
        let err = alloc.free_blocks(block, 1, FreeFlags::default()).unwrap_err();
        assert_eq!(err.corruption_kind(), Some(CorruptionKind::DuplicateBlock));
        Ok(())
    }

    #[test]
    fn reserved_pool_only_for_nofail() -> Result<()> {
        let alloc = FreeSpaceAllocator::new(0, 8, 1, 2)?;
        let (_, granted) = alloc.new_data_blocks(&AllocRequest {
            clusters: 8,
            ..AllocRequest::default()
        })?;
        assert_eq!(granted, 6);
        assert!(matches!(
            alloc.new_metadata_block(0, false),
            Err(ExtentError::NoSpace)
        ));
        alloc.new_metadata_block(0, true)?;
        Ok(())
    }

    #[test]
    fn cluster_rounding_honours_nofree_flags() -> Result<()> {
        let alloc = FreeSpaceAllocator::new(0, 64, 4, 0)?;
        let (start, granted) = alloc.new_data_blocks(&AllocRequest {
            goal: 16,
            clusters: 3,
            ..AllocRequest::default()
        })?;
        assert_eq!((start, granted), (16, 3));
        // Blocks 18..26 span clusters 4, 5 and 6; keep both partial ends.
        alloc.free_blocks(
            18,
            8,
            FreeFlags {
                nofree_first_cluster: true,
                nofree_last_cluster: true,
                ..FreeFlags::default()
            },
        )?;
        assert_eq!(alloc.free_clusters(), 16 - 3 + 1);
        alloc.free_blocks(16, 2, FreeFlags::default())?;
        alloc.free_blocks(24, 3, FreeFlags::default())?;
        assert_eq!(alloc.free_clusters(), 16);
        Ok(())
    }

    #[test]
    fn wraps_to_first_run_when_goal_is_past_free_space() -> Result<()> {
        let alloc = FreeSpaceAllocator::new(0, 16, 1, 0)?;
        alloc.mark_used(8, 8)?;
        let block = alloc.new_metadata_block(12, false)?;
        assert_eq!(block, 0);
        Ok(())
    }
}
