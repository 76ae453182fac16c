use std::ops::ControlFlow;

use super::super::super::node::{Entries, Extent};
use super::path::ExtentPath;
use super::types::{FiemapExtent, FiemapFlags};
use super::ExtentTree;
use crate::types::{CorruptionKind, ExtentError, Lblk, Pblk, Result, EXT_MAX_BLOCKS};

impl ExtentPath {
    /// First logical block mapped after the cursor, at any level.
    pub(crate) fn next_allocated_block(&self) -> Option<Lblk> {
        for frame in self.frames.iter().rev() {
            let Some(cursor) = frame.cursor else {
                continue;
            };
            if let Some(key) = frame.node.key_at(cursor + 1) {
                return Some(key);
            }
        }
        None
    }

    /// First key of the leaf after this one.
    pub(crate) fn next_leaf_block(&self) -> Option<Lblk> {
        let depth = self.depth();
        for frame in self.frames[..depth].iter().rev() {
            let Some(cursor) = frame.cursor else {
                continue;
            };
            if let Some(key) = frame.node.key_at(cursor + 1) {
                return Some(key);
            }
        }
        None
    }

    /// True if every interior cursor points at its node's first entry.
    fn leftmost_interior(&self) -> bool {
        self.frames[..self.depth()]
            .iter()
            .all(|f| f.cursor == Some(0))
    }
}

impl ExtentTree {
    /// Last allocated block left of the unmapped `lblk`, as (logical, physical).
    pub(super) fn search_left(&self, path: &ExtentPath, lblk: Lblk) -> Result<Option<(Lblk, Pblk)>> {
        let leaf = path.leaf();
        let Some(ex) = path.extent() else {
            if path.depth() > 0 {
                return Err(ExtentError::corrupt(CorruptionKind::EmptyLeaf, leaf.block()));
            }
            return Ok(None);
        };
        if lblk < ex.logical {
            if leaf.cursor != Some(0) || !path.leftmost_interior() {
                return Err(ExtentError::corrupt(
                    CorruptionKind::NeighbourOverlap,
                    leaf.block(),
                ));
            }
            return Ok(None);
        }
        if u64::from(lblk) < ex.end() {
            return Err(ExtentError::corrupt(
                CorruptionKind::NeighbourOverlap,
                leaf.block(),
            ));
        }
        Ok(Some((ex.last(), ex.physical_end() - 1)))
    }

    /// First extent right of the unmapped `lblk`, possibly in a later leaf.
    pub(super) fn search_right(&self, path: &ExtentPath, lblk: Lblk) -> Result<Option<Extent>> {
        let leaf = path.leaf();
        let Some(ex) = path.extent() else {
            if path.depth() > 0 {
                return Err(ExtentError::corrupt(CorruptionKind::EmptyLeaf, leaf.block()));
            }
            return Ok(None);
        };
        if lblk < ex.logical {
            if leaf.cursor != Some(0) || !path.leftmost_interior() {
                return Err(ExtentError::corrupt(
                    CorruptionKind::NeighbourOverlap,
                    leaf.block(),
                ));
            }
            return Ok(Some(ex));
        }
        if u64::from(lblk) < ex.end() {
            return Err(ExtentError::corrupt(
                CorruptionKind::NeighbourOverlap,
                leaf.block(),
            ));
        }
        let cursor = leaf.cursor_or_corrupt()?;
        if let Some(next) = leaf.extents()?.get(cursor + 1) {
            return Ok(Some(*next));
        }

        // Climb to the first level with a right sibling, then take the
        // leftmost leaf under it.
        let mut level = path.depth();
        let child = loop {
            if level == 0 {
                return Ok(None);
            }
            level -= 1;
            let frame = path.frame(level)?;
            let cursor = frame.cursor_or_corrupt()?;
            if let Some(next) = frame.indexes()?.get(cursor + 1) {
                break next.child;
            }
        };
        let mut depth = path.frame(level)?.node.depth - 1;
        let mut block = child;
        loop {
            let (node, _buf) = self.read_node(block, depth)?;
            match node.entries {
                Entries::Index(indexes) => {
                    let first = indexes
                        .first()
                        .ok_or(ExtentError::corrupt(CorruptionKind::EmptyIndex, Some(block)))?;
                    block = first.child;
                    depth -= 1;
                }
                Entries::Leaf(extents) => {
                    return extents
                        .first()
                        .copied()
                        .map(Some)
                        .ok_or(ExtentError::corrupt(CorruptionKind::EmptyLeaf, Some(block)));
                }
            }
        }
    }

    /// Physical block a new allocation for `lblk` should start near.
    pub(super) fn find_goal(&self, path: &ExtentPath, lblk: Lblk) -> Pblk {
        if let Some(ex) = path.extent() {
            return if lblk > ex.logical {
                ex.physical + u64::from(lblk - ex.logical)
            } else {
                ex.physical.saturating_sub(u64::from(ex.logical - lblk))
            };
        }
        if let Some(block) = path.leaf().block() {
            return block;
        }
        self.env.alloc.inode_goal(self.ino)
    }

    /// End (exclusive) of the hole containing `lblk`; caches the hole.
    pub(super) fn put_gap_in_cache(&self, path: &ExtentPath, lblk: Lblk) -> u64 {
        let (start, end) = match path.extent() {
            None => (u64::from(lblk), u64::from(EXT_MAX_BLOCKS)),
            Some(ex) if lblk < ex.logical => (u64::from(lblk), u64::from(ex.logical)),
            Some(ex) => {
                let next = path
                    .next_allocated_block()
                    .map_or(u64::from(EXT_MAX_BLOCKS), u64::from);
                (ex.end(), next)
            }
        };
        if end <= start {
            return u64::from(lblk) + 1;
        }
        let whole = start == 0 && end == u64::from(EXT_MAX_BLOCKS);
        let delayed = self
            .env
            .status
            .find_delayed(self.ino, start as Lblk)
            .is_some_and(|d| u64::from(d.start) < end);
        if self.options.cache_holes && !whole && !delayed {
            let len = u32::try_from(end - start).unwrap_or(u32::MAX);
            self.env.status.insert_hole(self.ino, start as Lblk, len);
            tracing::trace!(
                target: "extmap::extent::query",
                ino = self.ino.0,
                start,
                len,
                "cached hole"
            );
        }
        end
    }

    /// Physical block for `lblk` inside a cluster `ex` already owns.
    ///
    /// Returns the block and the number of blocks usable from it, or `None`
    /// when `lblk` shares no cluster with `ex`.
    pub(super) fn implied_cluster(
        &self,
        path: &ExtentPath,
        lblk: Lblk,
        len: u32,
        ex: &Extent,
    ) -> Option<(Pblk, u32)> {
        let ratio = self.cluster_ratio();
        let c_offset = lblk & (ratio - 1);
        let ex_cluster_start = ex.logical / ratio;
        let ex_cluster_end = ex.last() / ratio;
        let rr_cluster = lblk / ratio;
        if rr_cluster != ex_cluster_start && rr_cluster != ex_cluster_end {
            return None;
        }
        let mut ee_start = ex.physical;
        if rr_cluster == ex_cluster_end {
            ee_start += u64::from(ex.len) - 1;
        }
        let physical = (ee_start & !(u64::from(ratio) - 1)) + u64::from(c_offset);
        let mut len = len.min(ratio - c_offset);
        if lblk < ex.logical {
            len = len.min(ex.logical - lblk);
        }
        if lblk > ex.logical {
            let next = path.next_allocated_block().unwrap_or(EXT_MAX_BLOCKS);
            len = len.min(next.saturating_sub(lblk));
        }
        (len > 0).then_some((physical, len))
    }

    /// Calls `f` for every mapped or delayed range intersecting
    /// `[start, start + len)`, in logical order. Covering extents are
    /// reported whole.
    pub fn for_each_mapping<F>(&self, start: Lblk, len: u32, mut f: F) -> Result<()>
    where
        F: FnMut(FiemapExtent) -> ControlFlow<()>,
    {
        let max = u64::from(EXT_MAX_BLOCKS);
        let last = (u64::from(start) + u64::from(len)).min(max);
        let mut block = u64::from(start);
        while block < last {
            let lblk = block as Lblk;
            let path = self.locate(lblk)?;
            let ex = path.extent();
            let next = path.next_allocated_block().map_or(max, u64::from);
            drop(path);

            let mut flags = FiemapFlags::default();
            let (seg_start, mut seg_end, physical, mut exists) = match ex {
                Some(ex) if ex.contains(lblk) => {
                    flags.unwritten = ex.unwritten;
                    (u64::from(ex.logical), ex.end(), ex.physical, true)
                }
                Some(ex) if u64::from(ex.logical) > block => {
                    (block, u64::from(ex.logical).min(last), 0, false)
                }
                Some(_) => (block, last.min(next), 0, false),
                None => (block, last, 0, false),
            };
            if seg_end <= seg_start {
                return Err(ExtentError::corrupt(CorruptionKind::InvalidExtentEntries, None));
            }

            if !exists {
                if let Some(d) = self.env.status.find_delayed(self.ino, lblk) {
                    if u64::from(d.start) <= block {
                        seg_end = seg_end.min(d.end());
                        exists = true;
                        flags.delalloc = true;
                    } else if u64::from(d.start) < seg_end {
                        seg_end = u64::from(d.start);
                    }
                }
            }

            let next_delayed = if seg_end >= max {
                max
            } else {
                self.env
                    .status
                    .find_delayed(self.ino, seg_end as Lblk)
                    .map_or(max, |d| u64::from(d.start).max(seg_end))
            };
            let next_mapped = if flags.delalloc { next.max(seg_end) } else { next };
            if next_mapped == max && next_delayed == max {
                flags.last = true;
            }

            if exists {
                let item = FiemapExtent {
                    logical: seg_start as Lblk,
                    physical,
                    len: (seg_end - seg_start) as u32,
                    flags,
                };
                if f(item).is_break() {
                    break;
                }
            }
            block = seg_end;
        }
        Ok(())
    }

    /// Collects [`ExtentTree::for_each_mapping`] into a vector.
    pub fn fiemap(&self, start: Lblk, len: u32) -> Result<Vec<FiemapExtent>> {
        let mut out = Vec::new();
        self.for_each_mapping(start, len, |item| {
            out.push(item);
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use super::super::testing::harness;
    use super::*;
    use crate::primitives::alloc::BlockAllocator;
    use crate::storage::extent::status::ExtentStatusCache;

    #[test]
    fn empty_tree_has_no_neighbours() {
        let h = harness(128, 4096, 1);
        let path = h.tree.locate(50).unwrap();
        assert_eq!(h.tree.search_left(&path, 50).unwrap(), None);
        assert_eq!(h.tree.search_right(&path, 50).unwrap(), None);
        assert_eq!(path.next_allocated_block(), None);
        assert_eq!(h.tree.find_goal(&path, 50), h.alloc.inode_goal(h.tree.ino()));
    }

    #[test]
    fn neighbours_and_goal_follow_the_closest_extent() {
        let mut h = harness(128, 4096, 1);
        h.tree.insert_extent(Extent::new(10, 5, 500)).unwrap();
        h.tree.insert_extent(Extent::new(40, 5, 900)).unwrap();
        let path = h.tree.locate(20).unwrap();
        assert_eq!(h.tree.search_left(&path, 20).unwrap(), Some((14, 504)));
        let right = h.tree.search_right(&path, 20).unwrap().unwrap();
        assert_eq!(right.logical, 40);
        assert_eq!(h.tree.find_goal(&path, 20), 510);
        assert_eq!(path.next_allocated_block(), Some(40));

        let path = h.tree.locate(2).unwrap();
        assert_eq!(h.tree.search_left(&path, 2).unwrap(), None);
        assert_eq!(h.tree.search_right(&path, 2).unwrap().unwrap().logical, 10);
        assert_eq!(h.tree.find_goal(&path, 2), 492);
    }

    #[test]
    fn search_right_crosses_into_the_next_leaf() {
        let mut h = harness(128, 8192, 1);
        for i in 0..40u32 {
            h.tree
                .insert_extent(Extent::new(i * 10, 2, 1000 + u64::from(i) * 10))
                .unwrap();
        }
        assert!(h.tree.depth() >= 1);
        let mut crossed = false;
        for i in 0..39u32 {
            let gap = i * 10 + 5;
            let path = h.tree.locate(gap).unwrap();
            let right = h.tree.search_right(&path, gap).unwrap().unwrap();
            assert_eq!(right.logical, (i + 1) * 10);
            if path.leaf().node().extents().unwrap().last().map(|e| e.logical) == Some(i * 10) {
                crossed = true;
            }
        }
        assert!(crossed);
        let path = h.tree.locate(395).unwrap();
        assert_eq!(h.tree.search_right(&path, 395).unwrap(), None);
    }

    #[test]
    fn gap_is_cached_between_extents() {
        let mut h = harness(128, 4096, 1);
        h.tree.insert_extent(Extent::new(10, 5, 500)).unwrap();
        h.tree.insert_extent(Extent::new(40, 5, 900)).unwrap();
        let path = h.tree.locate(20).unwrap();
        assert_eq!(h.tree.put_gap_in_cache(&path, 20), 40);
        assert_eq!(h.status.cached_hole(h.tree.ino(), 30), Some((15, 25)));
    }

    #[test]
    fn gap_overlapping_delayed_range_is_not_cached() {
        let mut h = harness(128, 4096, 1);
        h.tree.insert_extent(Extent::new(10, 5, 500)).unwrap();
        h.status.add_delayed(h.tree.ino(), 100, 4);
        let path = h.tree.locate(20).unwrap();
        assert_eq!(h.tree.put_gap_in_cache(&path, 20), u64::from(EXT_MAX_BLOCKS));
        assert_eq!(h.status.hole_count(h.tree.ino()), 0);
    }

    #[test]
    fn implied_cluster_reuses_neighbour_cluster() {
        let mut h = harness(128, 4096, 4);
        h.tree.insert_extent(Extent::new(8, 2, 400)).unwrap();
        let path = h.tree.locate(10).unwrap();
        let ex = path.extent().unwrap();
        assert_eq!(h.tree.implied_cluster(&path, 10, 8, &ex), Some((402, 2)));
        assert_eq!(h.tree.implied_cluster(&path, 13, 8, &ex), None);
    }

    #[test]
    fn fiemap_reports_flags_and_delayed_ranges() {
        let mut h = harness(128, 4096, 1);
        h.tree.insert_extent(Extent::new(0, 4, 300)).unwrap();
        h.tree.insert_extent(Extent::new_unwritten(10, 4, 320)).unwrap();
        h.status.add_delayed(h.tree.ino(), 20, 3);
        let all = h.tree.fiemap(0, 100).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].physical, 300);
        assert!(!all[0].flags.last);
        assert!(all[1].flags.unwritten);
        assert_eq!((all[2].logical, all[2].len), (20, 3));
        assert!(all[2].flags.delalloc);
        assert!(all[2].flags.last);

        let mut seen = 0;
        h.tree
            .for_each_mapping(0, 100, |_| {
                seen += 1;
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(seen, 1);
    }
}
