//! Logical-to-physical mapping with optional allocation.

use super::super::super::node::{Extent, MAX_EXTENT_LEN};
use super::super::super::stats::ExtentEvent;
use super::path::ExtentPath;
use super::types::{BlockMap, InsertFlags, MapFlags, MapMode, MapRequest};
use super::ExtentTree;
use crate::primitives::alloc::{AllocRequest, FreeFlags};
use crate::types::{CorruptionKind, ExtentError, Lblk, Pblk, Result, EXT_MAX_BLOCKS};

impl ExtentTree {
    /// Maps `req.len` blocks starting at `req.logical`.
    ///
    /// The result covers a prefix of the request; callers re-issue for the
    /// remainder. Holes report the distance to the next mapped block. In the
    /// mutating modes a `Retry` error means the transaction restarted before
    /// anything changed.
    pub fn map_range(&mut self, req: MapRequest) -> Result<BlockMap> {
        if req.len == 0 {
            return Err(ExtentError::Invalid("zero-length mapping"));
        }
        if req.logical >= EXT_MAX_BLOCKS {
            return Err(ExtentError::Invalid("logical block out of range"));
        }
        let lblk = req.logical;
        let len = req.len.min(EXT_MAX_BLOCKS - lblk);

        if req.mode == MapMode::LookupOnly {
            if let Some((start, hole)) = self.env.status.cached_hole(self.ino, lblk) {
                let end = u64::from(start) + u64::from(hole);
                self.record(ExtentEvent::HoleCacheHit);
                let n = (end - u64::from(lblk)).min(u64::from(len)) as u32;
                return Ok(BlockMap::hole(lblk, n));
            }
        } else {
            let credits = self.credits_for_single_extent(None);
            self.env.journal.extend_transaction(credits)?;
        }

        let mut path = self.locate(lblk)?;
        if path.depth() > 0 && path.extent().is_none() {
            return Err(ExtentError::corrupt(
                CorruptionKind::EmptyLeaf,
                path.leaf().block(),
            ));
        }

        if let Some(ex) = path.extent().filter(|ex| ex.contains(lblk)) {
            self.record(ExtentEvent::Lookup { hit: true });
            let physical = ex.physical_at(lblk);
            let remaining = (ex.end() - u64::from(lblk)) as u32;
            tracing::trace!(
                target: "extmap::extent::map",
                ino = self.ino.0,
                lblk,
                extent = ex.logical,
                physical,
                unwritten = ex.unwritten,
                "covering extent"
            );
            if !ex.unwritten {
                return Ok(BlockMap {
                    logical: lblk,
                    len: remaining.min(len),
                    physical,
                    flags: MapFlags {
                        mapped: true,
                        ..MapFlags::default()
                    },
                    needs_conversion: false,
                });
            }
            return self.handle_unwritten(&mut path, req, len, physical, remaining);
        }

        self.record(ExtentEvent::Lookup { hit: false });
        if matches!(req.mode, MapMode::LookupOnly | MapMode::ConvertToWritten) {
            let end = self.put_gap_in_cache(&path, lblk);
            let n = (end - u64::from(lblk)).min(u64::from(len)) as u32;
            return Ok(BlockMap::hole(lblk, n.max(1)));
        }
        self.allocate_range(&mut path, req, len)
    }

    /// Serves a request landing inside an unwritten extent.
    fn handle_unwritten(
        &mut self,
        path: &mut ExtentPath,
        req: MapRequest,
        len: u32,
        physical: Pblk,
        remaining: u32,
    ) -> Result<BlockMap> {
        let lblk = req.logical;
        let mut map = BlockMap {
            logical: lblk,
            len: remaining.min(len),
            physical,
            flags: MapFlags::default(),
            needs_conversion: false,
        };
        match req.mode {
            MapMode::Create | MapMode::CreateUninitialized if req.pre_io => {
                let isolated = self.split_unwritten(path, lblk, len, false)?;
                self.pending_conversion = true;
                map.len = isolated.min(len);
                map.flags.new = true;
                map.flags.mapped = true;
                map.flags.unwritten = true;
                map.needs_conversion = true;
            }
            MapMode::ConvertToWritten => {
                self.convert_endio(path, lblk, len)?;
                map.flags.mapped = true;
            }
            MapMode::CreateUninitialized => {
                map.flags.mapped = true;
                map.flags.unwritten = true;
            }
            MapMode::LookupOnly => {
                map.flags.unwritten = true;
            }
            MapMode::Create => {
                let initialized = self.convert_to_initialized(path, lblk, len)?;
                map.len = initialized.min(len);
                map.flags.new = true;
                map.flags.mapped = true;
            }
        }
        tracing::debug!(
            target: "extmap::extent::map",
            ino = self.ino.0,
            lblk,
            len = map.len,
            mode = ?req.mode,
            pre_io = req.pre_io,
            "served unwritten range"
        );
        Ok(map)
    }

    /// Allocates and inserts a new extent for the hole at `req.logical`.
    fn allocate_range(&mut self, path: &mut ExtentPath, req: MapRequest, len: u32) -> Result<BlockMap> {
        let lblk = req.logical;
        let ratio = self.cluster_ratio();
        let cluster_offset = lblk & (ratio - 1);

        let mut implied = None;
        if cluster_offset != 0 {
            if let Some(ex) = path.extent() {
                implied = self.implied_cluster(path, lblk, len, &ex);
            }
        }
        let (left, right) = if implied.is_some() {
            (None, None)
        } else {
            (self.search_left(path, lblk)?, self.search_right(path, lblk)?)
        };
        if implied.is_none() && ratio > 1 {
            if let Some(next) = right {
                implied = self.implied_cluster(path, lblk, len, &next);
            }
        }

        let unwritten = req.mode == MapMode::CreateUninitialized;
        let (physical, alloc_len, from_cluster) = match implied {
            Some((physical, n)) => (physical, n, true),
            None => {
                let mut newex = Extent {
                    logical: lblk,
                    len: len.min(u32::from(MAX_EXTENT_LEN)) as u16,
                    physical: 0,
                    unwritten,
                };
                self.check_overlap(path, &mut newex);
                if newex.len == 0 {
                    return Err(ExtentError::corrupt(
                        CorruptionKind::NeighbourOverlap,
                        path.leaf().block(),
                    ));
                }
                let allocated = u32::from(newex.len);
                let offset = u64::from(cluster_offset);
                let goal = self.find_goal(path, lblk).saturating_sub(offset);
                let request = AllocRequest {
                    goal,
                    logical: lblk - cluster_offset,
                    clusters: (cluster_offset + allocated).div_ceil(ratio),
                    left,
                    right: right.map(|r| (r.logical, r.physical)),
                    nofail: false,
                };
                let (start, granted) = self.env.alloc.new_data_blocks(&request)?;
                let granted_blocks = u64::from(granted) * u64::from(ratio) - offset;
                let n = granted_blocks.min(u64::from(allocated)) as u32;
                (start + offset, n, false)
            }
        };

        let newex = Extent {
            logical: lblk,
            len: alloc_len as u16,
            physical,
            unwritten,
        };
        let flags = InsertFlags {
            pre_io: req.pre_io,
            nofail: false,
        };
        if let Err(err) = self.insert_extent_path(path, &newex, flags) {
            if !from_cluster {
                self.release_data(&newex);
            }
            return Err(err);
        }
        self.env
            .status
            .invalidate(self.ino, lblk, u64::from(alloc_len));

        let needs_conversion = unwritten && req.pre_io;
        if needs_conversion {
            self.pending_conversion = true;
        }
        tracing::debug!(
            target: "extmap::extent::map",
            ino = self.ino.0,
            lblk,
            physical,
            len = alloc_len,
            unwritten,
            from_cluster,
            "allocated extent"
        );
        Ok(BlockMap {
            logical: lblk,
            len: alloc_len.min(len),
            physical,
            flags: MapFlags {
                new: true,
                mapped: true,
                unwritten,
                from_cluster,
            },
            needs_conversion,
        })
    }

    fn release_data(&self, ext: &Extent) {
        if let Err(err) = self
            .env
            .alloc
            .free_blocks(ext.physical, u32::from(ext.len), FreeFlags::default())
        {
            tracing::warn!(
                target: "extmap::extent::map",
                ino = self.ino.0,
                physical = ext.physical,
                len = ext.len,
                error = %err,
                "could not release blocks of a failed insert"
            );
        }
    }

    /// Read-only lookup of a single block. Never allocates and never
    /// touches the hole cache.
    pub fn lookup(&self, lblk: Lblk) -> Result<Option<(Pblk, Extent)>> {
        let path = self.locate(lblk)?;
        Ok(path
            .extent()
            .filter(|ex| ex.contains(lblk))
            .map(|ex| (ex.physical_at(lblk), ex)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{harness, harness_with};
    use super::super::ExtentTreeOptions;
    use super::*;
    use crate::storage::extent::status::ExtentStatusCache;

    #[test]
    fn create_then_lookup_returns_same_blocks() {
        let mut h = harness(128, 4096, 1);
        let created = h.tree.map_range(MapRequest::create(0, 10)).unwrap();
        assert!(created.flags.new && created.flags.mapped);
        assert_eq!(created.len, 10);
        assert_eq!(
            h.tree.extents().unwrap(),
            vec![Extent::new(0, 10, created.physical)]
        );

        let found = h.tree.map_range(MapRequest::lookup(0, 10)).unwrap();
        assert_eq!(found.physical, created.physical);
        assert_eq!(found.len, 10);
        assert!(found.flags.mapped && !found.flags.new);
    }

    #[test]
    fn lookup_inside_extent_clips_to_its_end() {
        let mut h = harness(128, 4096, 1);
        h.insert(Extent::new(10, 10, 700));
        let found = h.tree.map_range(MapRequest::lookup(15, 100)).unwrap();
        assert_eq!((found.physical, found.len), (705, 5));
    }

    #[test]
    fn hole_reports_gap_and_is_cached() {
        let mut h = harness(128, 4096, 1);
        h.insert(Extent::new(0, 4, 700));
        h.insert(Extent::new(20, 4, 800));
        let hole = h.tree.map_range(MapRequest::lookup(6, 100)).unwrap();
        assert!(hole.is_hole());
        assert_eq!(hole.len, 14);
        let again = h.tree.map_range(MapRequest::lookup(8, 5)).unwrap();
        assert_eq!(again.len, 5);
        assert_eq!(h.stats.snapshot().hole_cache_hits, 1);
        assert!(h.status.cached_hole(h.tree.ino(), 10).is_some());
    }

    #[test]
    fn hole_cache_can_be_disabled() {
        let options = ExtentTreeOptions {
            cache_holes: false,
            ..ExtentTreeOptions::default()
        };
        let mut h = harness_with(128, 4096, 1, 0, options);
        h.insert(Extent::new(20, 4, 800));
        h.tree.map_range(MapRequest::lookup(6, 1)).unwrap();
        assert_eq!(h.status.hole_count(h.tree.ino()), 0);
    }

    #[test]
    fn allocation_invalidates_cached_hole() {
        let mut h = harness(128, 4096, 1);
        h.insert(Extent::new(20, 4, 800));
        h.tree.map_range(MapRequest::lookup(0, 1)).unwrap();
        assert!(h.status.cached_hole(h.tree.ino(), 5).is_some());
        h.tree.map_range(MapRequest::create(5, 2)).unwrap();
        assert!(h.status.cached_hole(h.tree.ino(), 5).is_none());
        let lookup = h.tree.map_range(MapRequest::lookup(5, 2)).unwrap();
        assert!(lookup.flags.mapped);
    }

    #[test]
    fn allocation_stops_before_next_extent() {
        let mut h = harness(128, 4096, 1);
        h.insert(Extent::new(20, 5, 2000));
        let map = h.tree.map_range(MapRequest::create(10, 100)).unwrap();
        assert_eq!(map.len, 10);
        h.tree.verify().unwrap();
    }

    #[test]
    fn allocation_is_clamped_to_longest_extent() {
        let mut h = harness(128, 70_000, 1);
        let map = h.tree.map_range(MapRequest::create(0, 40_000)).unwrap();
        assert_eq!(map.len, u32::from(MAX_EXTENT_LEN));
    }

    #[test]
    fn consecutive_allocations_merge() {
        let mut h = harness(128, 4096, 1);
        let a = h.tree.map_range(MapRequest::create(0, 8)).unwrap();
        let b = h.tree.map_range(MapRequest::create(8, 8)).unwrap();
        assert_eq!(b.physical, a.physical + 8);
        assert_eq!(h.tree.extents().unwrap(), vec![Extent::new(0, 16, a.physical)]);
    }

    #[test]
    fn unwritten_lookup_is_not_mapped() {
        let mut h = harness(128, 4096, 1);
        h.tree
            .map_range(MapRequest::create_uninitialized(0, 8))
            .unwrap();
        let found = h.tree.map_range(MapRequest::lookup(2, 8)).unwrap();
        assert!(found.flags.unwritten && !found.flags.mapped);
        assert_eq!(found.len, 6);
        let again = h
            .tree
            .map_range(MapRequest::create_uninitialized(2, 8))
            .unwrap();
        assert!(again.flags.unwritten && again.flags.mapped && !again.flags.new);
    }

    #[test]
    fn pre_io_then_convert_isolates_written_range() {
        let mut h = harness(128, 4096, 1);
        h.insert(Extent::new_unwritten(0, 100, 1000));
        let map = h
            .tree
            .map_range(MapRequest::create_uninitialized(40, 20).pre_io())
            .unwrap();
        assert!(map.needs_conversion);
        assert_eq!((map.physical, map.len), (1040, 20));
        assert!(h.tree.has_pending_conversion());

        let done = h.tree.map_range(MapRequest::convert(40, 20)).unwrap();
        assert!(done.flags.mapped && !done.flags.unwritten);
        assert_eq!(
            h.tree.extents().unwrap(),
            vec![
                Extent::new_unwritten(0, 40, 1000),
                Extent::new(40, 20, 1040),
                Extent::new_unwritten(60, 40, 1060),
            ]
        );
    }

    #[test]
    fn buffered_write_into_unwritten_initializes_range() {
        let options = ExtentTreeOptions {
            max_zeroout_kb: 0,
            ..ExtentTreeOptions::default()
        };
        let mut h = harness_with(128, 4096, 1, 0, options);
        h.insert(Extent::new_unwritten(0, 100, 1000));
        let map = h.tree.map_range(MapRequest::create(0, 10)).unwrap();
        assert!(map.flags.new && map.flags.mapped);
        assert_eq!((map.physical, map.len), (1000, 10));
        assert_eq!(
            h.tree.extents().unwrap(),
            vec![Extent::new(0, 10, 1000), Extent::new_unwritten(10, 90, 1010)]
        );
    }

    #[test]
    fn convert_over_hole_reports_hole() {
        let mut h = harness(128, 4096, 1);
        let map = h.tree.map_range(MapRequest::convert(0, 4)).unwrap();
        assert!(map.is_hole());
        assert!(h.tree.extents().unwrap().is_empty());
    }

    #[test]
    fn clustered_allocation_reuses_owned_cluster() {
        let mut h = harness(128, 4096, 4);
        let first = h.tree.map_range(MapRequest::create(0, 2)).unwrap();
        assert_eq!(first.physical % 4, 0);
        let free = h.alloc.free_clusters();
        let second = h.tree.map_range(MapRequest::create(2, 2)).unwrap();
        assert!(second.flags.from_cluster);
        assert_eq!(second.physical, first.physical + 2);
        assert_eq!(h.alloc.free_clusters(), free);
        assert_eq!(
            h.tree.extents().unwrap(),
            vec![Extent::new(0, 4, first.physical)]
        );
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let mut h = harness(128, 4096, 1);
        assert!(matches!(
            h.tree.map_range(MapRequest::create(0, 0)),
            Err(ExtentError::Invalid(_))
        ));
        assert!(matches!(
            h.tree.map_range(MapRequest::lookup(EXT_MAX_BLOCKS, 1)),
            Err(ExtentError::Invalid(_))
        ));
    }

    #[test]
    fn read_only_lookup_resolves_blocks() {
        let mut h = harness(128, 4096, 1);
        h.insert(Extent::new(10, 10, 700));
        assert_eq!(h.tree.lookup(12).unwrap().map(|(p, _)| p), Some(702));
        assert!(h.tree.lookup(20).unwrap().is_none());
    }
}
