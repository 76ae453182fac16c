//! Whole-file operations built on the mapping and removal primitives.

use super::super::super::node::{Extent, MAX_EXTENT_LEN};
use super::super::super::stats::ExtentEvent;
use super::types::{InsertFlags, MapRequest, SplitFlags};
use super::ExtentTree;
use crate::types::{CorruptionKind, ExtentError, Lblk, Result, EXT_MAX_BLOCKS};

impl ExtentTree {
    /// Inserts a caller-built extent. Its logical range must be unmapped and
    /// its blocks already owned by the caller.
    pub fn insert_extent(&mut self, ext: Extent) -> Result<()> {
        if ext.len == 0 || ext.len > MAX_EXTENT_LEN {
            return Err(ExtentError::Invalid("extent length out of range"));
        }
        if ext.end() > u64::from(EXT_MAX_BLOCKS) {
            return Err(ExtentError::Invalid("extent runs past the last logical block"));
        }
        let geometry = &self.env.geometry;
        if ext.physical < geometry.first_data_block || ext.physical_end() > geometry.block_count {
            return Err(ExtentError::Invalid("extent blocks outside the device"));
        }
        self.env
            .journal
            .extend_transaction(self.credits_for_single_extent(None))?;

        let mut path = self.locate(ext.logical)?;
        if let Some(cur) = path.extent() {
            let next = if ext.logical < cur.logical {
                Some(cur.logical)
            } else {
                path.next_allocated_block()
            };
            let overlaps_next = next.is_some_and(|n| ext.end() > u64::from(n));
            if cur.contains(ext.logical) || overlaps_next {
                return Err(ExtentError::Invalid("extent overlaps a mapped range"));
            }
        } else if path.depth() > 0 {
            return Err(ExtentError::corrupt(
                CorruptionKind::EmptyLeaf,
                path.leaf().block(),
            ));
        }
        self.insert_extent_path(&mut path, &ext, InsertFlags::default())?;
        self.env
            .status
            .invalidate(self.ino, ext.logical, u64::from(ext.len));
        Ok(())
    }

    /// Splits the extent covering `lblk` so that a new extent starts there.
    /// Both halves keep their state. Splitting at an extent's first block is
    /// a no-op.
    pub fn split_extent_at(&mut self, lblk: Lblk) -> Result<()> {
        let mut path = self.locate(lblk)?;
        let ex = path
            .extent()
            .filter(|ex| ex.contains(lblk))
            .ok_or(ExtentError::NotFound)?;
        if ex.logical == lblk {
            return Ok(());
        }
        self.env
            .journal
            .extend_transaction(self.credits_for_single_extent(Some(&path)))?;
        self.split_in_path(
            &mut path,
            lblk,
            SplitFlags {
                mark_uninit1: ex.unwritten,
                mark_uninit2: ex.unwritten,
                ..SplitFlags::default()
            },
            InsertFlags {
                pre_io: true,
                nofail: false,
            },
        )
    }

    /// Preallocates unwritten blocks for `[start, start + len)`. Returns the
    /// number of blocks newly allocated. The size grows to cover the range
    /// unless `keep_size` is set.
    pub fn fallocate(&mut self, start: Lblk, len: u32, keep_size: bool) -> Result<u64> {
        let end = (u64::from(start) + u64::from(len)).min(u64::from(EXT_MAX_BLOCKS));
        let mut lblk = u64::from(start);
        let mut allocated = 0u64;
        let mut restarts = 0;
        while lblk < end {
            let want = (end - lblk).min(u64::from(u32::MAX)) as u32;
            let map = match self.map_range(MapRequest::create_uninitialized(lblk as Lblk, want)) {
                Ok(map) => {
                    restarts = 0;
                    map
                }
                Err(ExtentError::Retry) if restarts < self.options.max_restarts => {
                    restarts += 1;
                    self.record(ExtentEvent::Restart);
                    continue;
                }
                Err(err) => return Err(err),
            };
            if map.len == 0 {
                return Err(ExtentError::Invalid("mapping made no progress"));
            }
            if map.flags.new {
                allocated += u64::from(map.len);
            }
            lblk += u64::from(map.len);
        }
        if !keep_size && end > self.size_blocks {
            self.size_blocks = end;
        }
        tracing::debug!(
            target: "extmap::extent",
            ino = self.ino.0,
            start,
            len,
            allocated,
            restarts,
            "fallocate"
        );
        Ok(allocated)
    }

    /// Marks every unwritten block in `[start, start + len)` as written.
    pub fn convert_unwritten(&mut self, start: Lblk, len: u32) -> Result<()> {
        let end = (u64::from(start) + u64::from(len)).min(u64::from(EXT_MAX_BLOCKS));
        let mut lblk = u64::from(start);
        let mut restarts = 0;
        while lblk < end {
            let want = (end - lblk).min(u64::from(u32::MAX)) as u32;
            let map = match self.map_range(MapRequest::convert(lblk as Lblk, want)) {
                Ok(map) => {
                    restarts = 0;
                    map
                }
                Err(ExtentError::Retry) if restarts < self.options.max_restarts => {
                    restarts += 1;
                    self.record(ExtentEvent::Restart);
                    continue;
                }
                Err(err) => return Err(err),
            };
            if map.len == 0 {
                return Err(ExtentError::Invalid("mapping made no progress"));
            }
            lblk += u64::from(map.len);
        }
        self.pending_conversion = false;
        Ok(())
    }

    /// Drops every block from `first_removed` on and shrinks the size.
    pub fn truncate(&mut self, first_removed: Lblk) -> Result<()> {
        if first_removed < EXT_MAX_BLOCKS {
            self.remove_range(first_removed, EXT_MAX_BLOCKS - 1)?;
        }
        self.size_blocks = self.size_blocks.min(u64::from(first_removed));
        Ok(())
    }

    /// Unmaps `[start, start + len)` without changing the size.
    pub fn punch_hole(&mut self, start: Lblk, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let last = (u64::from(start) + u64::from(len) - 1).min(u64::from(EXT_MAX_BLOCKS - 1));
        self.remove_range(start, last as Lblk)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::harness;
    use super::*;

    #[test]
    fn insert_rejects_overlap_and_bad_lengths() {
        let mut h = harness(128, 4096, 1);
        h.insert(Extent::new(10, 10, 700));
        for bad in [
            Extent::new(15, 2, 900),
            Extent::new(5, 6, 900),
            Extent::new(0, 0, 900),
            Extent::new(40, 2, 0),
        ] {
            assert!(matches!(
                h.tree.insert_extent(bad),
                Err(ExtentError::Invalid(_))
            ));
        }
        h.tree.insert_extent(Extent::new(5, 5, 900)).unwrap();
    }

    #[test]
    fn inserted_extent_resolves_every_block() {
        let mut h = harness(128, 4096, 1);
        h.insert(Extent::new(100, 50, 3000));
        for lblk in 100..150 {
            let (physical, _) = h.tree.lookup(lblk).unwrap().unwrap();
            assert_eq!(physical, 3000 + u64::from(lblk - 100));
        }
    }

    #[test]
    fn public_split_keeps_mapping() {
        let mut h = harness(128, 4096, 1);
        h.insert(Extent::new(0, 20, 500));
        h.tree.split_extent_at(7).unwrap();
        assert_eq!(
            h.tree.extents().unwrap(),
            vec![Extent::new(0, 7, 500), Extent::new(7, 13, 507)]
        );
        h.tree.split_extent_at(7).unwrap();
        assert_eq!(h.tree.extents().unwrap().len(), 2);
        assert!(matches!(
            h.tree.split_extent_at(40),
            Err(ExtentError::NotFound)
        ));
    }

    #[test]
    fn fallocate_then_convert() {
        let mut h = harness(128, 4096, 1);
        let got = h.tree.fallocate(0, 64, false).unwrap();
        assert_eq!(got, 64);
        assert_eq!(h.tree.size_blocks(), 64);
        assert!(h.tree.extents().unwrap().iter().all(|e| e.unwritten));
        assert_eq!(h.tree.fallocate(0, 64, false).unwrap(), 0);

        h.tree.convert_unwritten(0, 64).unwrap();
        assert!(h.tree.extents().unwrap().iter().all(|e| !e.unwritten));
        assert!(!h.tree.has_pending_conversion());
    }

    #[test]
    fn fallocate_keep_size_leaves_size_alone() {
        let mut h = harness(128, 4096, 1);
        h.tree.fallocate(10, 5, true).unwrap();
        assert_eq!(h.tree.size_blocks(), 0);
    }

    #[test]
    fn truncate_and_punch() {
        let mut h = harness(128, 4096, 1);
        h.tree.fallocate(0, 100, false).unwrap();
        h.tree.punch_hole(10, 10).unwrap();
        assert_eq!(h.tree.size_blocks(), 100);
        assert!(h.tree.lookup(15).unwrap().is_none());
        h.tree.truncate(50).unwrap();
        assert_eq!(h.tree.size_blocks(), 50);
        assert!(h.tree.lookup(50).unwrap().is_none());
        assert!(h.tree.lookup(49).unwrap().is_some());
        h.tree.punch_hole(0, 0).unwrap();
    }

    #[test]
    fn truncate_at_last_block_removes_it() {
        let mut h = harness(128, 4096, 1);
        let last = EXT_MAX_BLOCKS - 1;
        h.insert(Extent::new(last, 1, 700));
        h.insert(Extent::new(last - 10, 2, 710));
        h.tree.set_size_blocks(u64::from(EXT_MAX_BLOCKS));
        let free = h.alloc.free_clusters();

        h.tree.truncate(last).unwrap();
        assert!(h.tree.lookup(last).unwrap().is_none());
        assert_eq!(
            h.tree.extents().unwrap(),
            vec![Extent::new(last - 10, 2, 710)]
        );
        assert_eq!(h.tree.size_blocks(), u64::from(last));
        assert_eq!(h.alloc.free_clusters(), free + 1);
    }
}
