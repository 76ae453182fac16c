use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Structural events reported by the extent engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentEvent {
    /// A mapping lookup finished; `hit` is false for holes.
    Lookup {
        /// Whether an extent covered the block.
        hit: bool,
    },
    /// A hole lookup was answered from the status cache.
    HoleCacheHit,
    /// A new extent was inserted.
    Insert,
    /// Nodes were split; `levels` counts new blocks.
    Split {
        /// New blocks wired in.
        levels: u16,
    },
    /// The tree gained a level.
    Grow {
        /// Depth after growing.
        depth: u16,
    },
    /// Two extents were coalesced.
    Merge,
    /// A single child leaf was folded back into the root.
    MergeUp,
    /// An extent was split in two.
    ExtentSplit,
    /// Blocks were zero-filled instead of splitting.
    Zeroout {
        /// Blocks written.
        blocks: u32,
    },
    /// Blocks were released while removing a range.
    Removed {
        /// Length of the extent the blocks came from.
        len: u16,
    },
    /// A removal walk restarted after a journal restart.
    Restart,
}

/// Injectable sink for [`ExtentEvent`]s.
pub trait ExtentObserver: Send + Sync {
    /// Records one event.
    fn record(&self, event: ExtentEvent);
}

/// Snapshot of extent statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct ExtentStatsSnapshot {
    /// Lookups that found a covering extent
    pub lookups_hit: u64,
    /// Lookups that found a hole
    pub lookups_hole: u64,
    /// Holes answered from the status cache
    pub hole_cache_hits: u64,
    /// Extents inserted
    pub inserts: u64,
    /// Split operations
    pub splits: u64,
    /// Blocks allocated by splits
    pub split_blocks: u64,
    /// Depth increases
    pub grows: u64,
    /// Deepest tree observed
    pub max_depth: u64,
    /// Extent coalesces
    pub merges: u64,
    /// Root collapses
    pub merge_ups: u64,
    /// Extents split in two
    pub extent_splits: u64,
    /// Zero-out fallbacks
    pub zeroouts: u64,
    /// Blocks zero-filled
    pub zeroed_blocks: u64,
    /// Extents touched by removal
    pub removed_extents: u64,
    /// Sum of removed extent lengths
    pub removed_len_total: u64,
    /// Shortest removed extent
    pub removed_len_min: u64,
    /// Longest removed extent
    pub removed_len_max: u64,
    /// Journal restarts absorbed internally
    pub restarts: u64,
}

/// Thread-safe counters implementing [`ExtentObserver`].
pub struct ExtentStats {
    lookups_hit: AtomicU64,
    lookups_hole: AtomicU64,
    hole_cache_hits: AtomicU64,
    inserts: AtomicU64,
    splits: AtomicU64,
    split_blocks: AtomicU64,
    grows: AtomicU64,
    max_depth: AtomicU64,
    merges: AtomicU64,
    merge_ups: AtomicU64,
    extent_splits: AtomicU64,
    zeroouts: AtomicU64,
    zeroed_blocks: AtomicU64,
    removed_extents: AtomicU64,
    removed_len_total: AtomicU64,
    removed_len_min: AtomicU64,
    removed_len_max: AtomicU64,
    restarts: AtomicU64,
}

impl Default for ExtentStats {
    fn default() -> Self {
        Self {
            lookups_hit: AtomicU64::new(0),
            lookups_hole: AtomicU64::new(0),
            hole_cache_hits: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            splits: AtomicU64::new(0),
            split_blocks: AtomicU64::new(0),
            grows: AtomicU64::new(0),
            max_depth: AtomicU64::new(0),
            merges: AtomicU64::new(0),
            merge_ups: AtomicU64::new(0),
            extent_splits: AtomicU64::new(0),
            zeroouts: AtomicU64::new(0),
            zeroed_blocks: AtomicU64::new(0),
            removed_extents: AtomicU64::new(0),
            removed_len_total: AtomicU64::new(0),
            removed_len_min: AtomicU64::new(u64::MAX),
            removed_len_max: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(AtomicOrdering::Relaxed)
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, AtomicOrdering::Relaxed);
}

impl ExtentStats {
    /// Returns the number of splits performed.
    pub fn splits(&self) -> u64 {
        load(&self.splits)
    }

    /// Returns the number of depth increases.
    pub fn grows(&self) -> u64 {
        load(&self.grows)
    }

    /// Returns the number of extent coalesces.
    pub fn merges(&self) -> u64 {
        load(&self.merges)
    }

    /// Returns the number of root collapses.
    pub fn merge_ups(&self) -> u64 {
        load(&self.merge_ups)
    }

    /// Returns the number of zero-out fallbacks.
    pub fn zeroouts(&self) -> u64 {
        load(&self.zeroouts)
    }

    /// Returns the number of absorbed journal restarts.
    pub fn restarts(&self) -> u64 {
        load(&self.restarts)
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> ExtentStatsSnapshot {
        let removed = load(&self.removed_extents);
        ExtentStatsSnapshot {
            lookups_hit: load(&self.lookups_hit),
            lookups_hole: load(&self.lookups_hole),
            hole_cache_hits: load(&self.hole_cache_hits),
            inserts: load(&self.inserts),
            splits: load(&self.splits),
            split_blocks: load(&self.split_blocks),
            grows: load(&self.grows),
            max_depth: load(&self.max_depth),
            merges: load(&self.merges),
            merge_ups: load(&self.merge_ups),
            extent_splits: load(&self.extent_splits),
            zeroouts: load(&self.zeroouts),
            zeroed_blocks: load(&self.zeroed_blocks),
            removed_extents: removed,
            removed_len_total: load(&self.removed_len_total),
            removed_len_min: if removed == 0 {
                0
            } else {
                load(&self.removed_len_min)
            },
            removed_len_max: load(&self.removed_len_max),
            restarts: load(&self.restarts),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let s = self.snapshot();
        let avg = if s.removed_extents == 0 {
            0
        } else {
            s.removed_len_total / s.removed_extents
        };
        tracing::info!(
            target: "extmap::extent::stats",
            lookups_hit = s.lookups_hit,
            lookups_hole = s.lookups_hole,
            hole_cache_hits = s.hole_cache_hits,
            inserts = s.inserts,
            splits = s.splits,
            grows = s.grows,
            max_depth = s.max_depth,
            merges = s.merges,
            merge_ups = s.merge_ups,
            zeroouts = s.zeroouts,
            removed_extents = s.removed_extents,
            removed_len_min = s.removed_len_min,
            removed_len_avg = avg,
            removed_len_max = s.removed_len_max,
            restarts = s.restarts,
            "extent stats snapshot"
        );
    }
}

impl ExtentObserver for ExtentStats {
    fn record(&self, event: ExtentEvent) {
        match event {
            ExtentEvent::Lookup { hit: true } => bump(&self.lookups_hit, 1),
            ExtentEvent::Lookup { hit: false } => bump(&self.lookups_hole, 1),
            ExtentEvent::HoleCacheHit => bump(&self.hole_cache_hits, 1),
            ExtentEvent::Insert => bump(&self.inserts, 1),
            ExtentEvent::Split { levels } => {
                bump(&self.splits, 1);
                bump(&self.split_blocks, u64::from(levels));
            }
            ExtentEvent::Grow { depth } => {
                bump(&self.grows, 1);
                self.max_depth
                    .fetch_max(u64::from(depth), AtomicOrdering::Relaxed);
            }
            ExtentEvent::Merge => bump(&self.merges, 1),
            ExtentEvent::MergeUp => bump(&self.merge_ups, 1),
            ExtentEvent::ExtentSplit => bump(&self.extent_splits, 1),
            ExtentEvent::Zeroout { blocks } => {
                bump(&self.zeroouts, 1);
                bump(&self.zeroed_blocks, u64::from(blocks));
            }
            ExtentEvent::Removed { len } => {
                let len = u64::from(len);
                bump(&self.removed_extents, 1);
                bump(&self.removed_len_total, len);
                self.removed_len_min.fetch_min(len, AtomicOrdering::Relaxed);
                self.removed_len_max.fetch_max(len, AtomicOrdering::Relaxed);
            }
            ExtentEvent::Restart => bump(&self.restarts, 1),
        }
    }
}
