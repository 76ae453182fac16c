//! Range removal: punch and truncate.

use smallvec::{smallvec, SmallVec};

use super::super::super::node::{Extent, Node};
use super::super::super::stats::ExtentEvent;
use super::path::{ExtentPath, PathFrame};
use super::types::{InsertFlags, SplitFlags};
use super::ExtentTree;
use crate::primitives::alloc::FreeFlags;
use crate::types::{CorruptionKind, ExtentError, Lblk, Result, EXT_MAX_BLOCKS};

/// Cluster at the edge of the removed range whose fate is not settled yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum PartialCluster {
    #[default]
    Initial,
    /// Free it unless an extent further left still uses it.
    ToFree { cluster: u64 },
    /// A kept extent uses it; never free.
    NoFree { cluster: u64 },
}

impl PartialCluster {
    fn cluster(&self) -> Option<u64> {
        match *self {
            PartialCluster::Initial => None,
            PartialCluster::ToFree { cluster } | PartialCluster::NoFree { cluster } => Some(cluster),
        }
    }
}

/// Progress of the right-to-left walk at one index level.
#[derive(Clone, Copy, Debug)]
enum Visit {
    /// Not entered yet; start from the last entry.
    Fresh,
    /// Back from the child under the cursor. Holds the entry count seen
    /// when descending; `None` continues left unconditionally.
    Returned(Option<usize>),
}

impl ExtentTree {
    /// Unmaps `[start, end]` (inclusive) and frees the blocks behind it.
    ///
    /// Journal restarts are absorbed up to `max_restarts` times; each pass
    /// resumes from the current tree state. Removing an already unmapped
    /// range is a no-op.
    pub fn remove_range(&mut self, start: Lblk, end: Lblk) -> Result<()> {
        if start > end {
            return Err(ExtentError::Invalid("removal range ends before it starts"));
        }
        self.env
            .status
            .invalidate(self.ino, start, u64::from(end - start) + 1);
        let mut partial = PartialCluster::Initial;
        let mut restarts = 0;
        loop {
            match self.remove_space_once(start, end, &mut partial) {
                Err(ExtentError::Retry) if restarts < self.options.max_restarts => {
                    restarts += 1;
                    self.record(ExtentEvent::Restart);
                    tracing::debug!(
                        target: "extmap::extent::remove",
                        ino = self.ino.0,
                        start,
                        end,
                        restarts,
                        "restarting removal"
                    );
                }
                Err(err) => return Err(err),
                Ok(()) => break,
            }
        }
        tracing::debug!(
            target: "extmap::extent::remove",
            ino = self.ino.0,
            start,
            end,
            depth = self.depth(),
            "removed range"
        );
        Ok(())
    }

    fn remove_space_once(&mut self, start: Lblk, end: Lblk, partial: &mut PartialCluster) -> Result<()> {
        let root_depth = self.root_node()?.depth;
        self.env
            .journal
            .extend_transaction(u32::from(root_depth) + 1)?;

        let located = if end < EXT_MAX_BLOCKS - 1 {
            self.locate_removal_end(end, partial)?
        } else {
            None
        };
        let (mut path, mut visits, mut level): (ExtentPath, SmallVec<[Visit; 4]>, usize) =
            match located {
                Some(path) => {
                    let depth = path.depth();
                    (path, smallvec![Visit::Returned(None); depth + 1], depth)
                }
                None => (
                    ExtentPath::root_only(self.validated_root()?),
                    smallvec![Visit::Fresh],
                    0,
                ),
            };
        let depth = usize::from(path.frames[0].node.depth);

        loop {
            if level == depth {
                self.rm_leaf(&mut path, start, end, partial)?;
            } else {
                let frame = path.frame(level)?;
                let entries = frame.node.len();
                let next = match visits[level] {
                    Visit::Fresh => entries.checked_sub(1),
                    Visit::Returned(seen) => frame
                        .cursor
                        .and_then(|c| c.checked_sub(1))
                        .filter(|_| seen != Some(entries)),
                };
                if let Some(idx) = next {
                    let child = frame
                        .indexes()?
                        .get(idx)
                        .map(|e| e.child)
                        .ok_or(ExtentError::corrupt(CorruptionKind::MissingCursor, frame.block()))?;
                    path.frame_mut(level)?.cursor = Some(idx);
                    visits[level] = Visit::Returned(Some(entries));
                    let (node, buffer) = self.read_node(child, (depth - level - 1) as u16)?;
                    path.frames.push(PathFrame {
                        node,
                        buffer: Some(buffer),
                        cursor: None,
                    });
                    visits.push(Visit::Fresh);
                    level += 1;
                    continue;
                }
                if entries == 0 && level > 0 {
                    self.rm_idx(&mut path, level)?;
                }
            }
            if level == 0 {
                break;
            }
            path.frames.pop();
            visits.pop();
            level -= 1;
        }

        if let PartialCluster::ToFree { cluster } = *partial {
            self.free_cluster(cluster)?;
            *partial = PartialCluster::Initial;
        }
        if path.frames[0].node.is_empty() {
            path.frames[0].node = Node::empty_leaf(self.root_capacity());
            path.frames[0].cursor = None;
            self.dirty(&path, 0)?;
        }
        Ok(())
    }

    /// Locates `end`, splitting the extent that straddles it so removal
    /// stops on an extent boundary. Returns `None` for an empty tree.
    fn locate_removal_end(&mut self, end: Lblk, partial: &mut PartialCluster) -> Result<Option<ExtentPath>> {
        let mut path = self.locate(end)?;
        let Some(ex) = path.extent() else {
            if path.depth() > 0 {
                return Err(ExtentError::corrupt(
                    CorruptionKind::EmptyLeaf,
                    path.leaf().block(),
                ));
            }
            return Ok(None);
        };
        let ratio = u64::from(self.cluster_ratio());
        if end >= ex.logical && end < ex.last() {
            if ratio > 1 {
                *partial = PartialCluster::NoFree {
                    cluster: ex.physical_at(end + 1) / ratio,
                };
            }
            let keep_state = SplitFlags {
                mark_uninit1: ex.unwritten,
                mark_uninit2: ex.unwritten,
                ..SplitFlags::default()
            };
            self.split_in_path(
                &mut path,
                end + 1,
                keep_state,
                InsertFlags {
                    pre_io: true,
                    nofail: true,
                },
            )?;
            path = self.locate(end)?;
        } else if ratio > 1
            && end >= ex.last()
            && *partial == PartialCluster::Initial
            && ex.end() < u64::from(EXT_MAX_BLOCKS)
        {
            if let Some(right) = self.search_right(&path, ex.end() as Lblk)? {
                *partial = PartialCluster::NoFree {
                    cluster: right.physical / ratio,
                };
            }
        }
        Ok(Some(path))
    }

    /// Removes the parts of `[start, end]` held by the leaf at the end of
    /// `path`, walking its extents right to left.
    fn rm_leaf(
        &mut self,
        path: &mut ExtentPath,
        start: Lblk,
        end: Lblk,
        partial: &mut PartialCluster,
    ) -> Result<()> {
        let depth = path.depth();
        let ratio = u64::from(self.cluster_ratio());
        let group_blocks = (self.env.geometry.block_size * 8) as u32;
        let block = path.leaf().block();
        let mut pos = path
            .leaf()
            .cursor
            .or_else(|| path.leaf().node.len().checked_sub(1));
        let mut correct_index = false;

        while let Some(i) = pos {
            let ex = path
                .leaf()
                .extents()?
                .get(i)
                .copied()
                .ok_or(ExtentError::corrupt(CorruptionKind::MissingCursor, block))?;
            if ex.end() <= u64::from(start) {
                break;
            }
            path.leaf_mut().cursor = Some(i);
            if end < ex.logical {
                if ratio > 1 {
                    *partial = PartialCluster::NoFree {
                        cluster: ex.physical / ratio,
                    };
                }
                pos = i.checked_sub(1);
                continue;
            }
            if end < ex.last() {
                tracing::warn!(
                    target: "extmap::extent::remove",
                    ino = self.ino.0,
                    start,
                    end,
                    extent = ex.logical,
                    len = ex.len,
                    "removal ends inside an extent"
                );
                return Err(ExtentError::corrupt(CorruptionKind::UnalignedRemoval, block));
            }
            let from = ex.logical.max(start);
            let keep = (from - ex.logical) as u16;

            let mut credits = 7 + 2 * (u32::from(ex.len) / group_blocks);
            if i == 0 {
                correct_index = true;
                credits += depth as u32 + 1;
            }
            self.env.journal.extend_transaction(credits)?;
            self.get_access(path, depth)?;
            self.remove_blocks(&ex, partial, from, ex.last())?;

            let extents = path.leaf_mut().extents_mut()?;
            if keep == 0 {
                extents.remove(i);
            } else {
                extents[i].len = keep;
            }
            self.dirty(path, depth)?;
            tracing::trace!(
                target: "extmap::extent::remove",
                ino = self.ino.0,
                extent = ex.logical,
                from,
                kept = keep,
                "trimmed extent"
            );
            self.record(ExtentEvent::Removed { len: ex.len });
            pos = i.checked_sub(1);
        }

        let leaf = path.leaf_mut();
        leaf.cursor = if leaf.node.is_empty() {
            None
        } else {
            Some(pos.unwrap_or(0))
        };
        if correct_index && !path.leaf().node.is_empty() {
            path.leaf_mut().cursor = Some(0);
            self.correct_indexes(path)?;
        }

        // Settle a pending cluster against the first extent left of the range.
        if let PartialCluster::ToFree { cluster } = *partial {
            if let Some(i) = pos {
                let left = path.leaf().extents()?[i];
                if cluster != (left.physical_end() - 1) / ratio {
                    self.free_cluster(cluster)?;
                }
                *partial = PartialCluster::Initial;
            }
        }

        if path.leaf().node.is_empty() && path.leaf().block().is_some() {
            self.rm_idx(path, depth)?;
        }
        Ok(())
    }

    /// Frees the tail `[from, to]` of `ex`, keeping clusters that other
    /// extents may still use.
    fn remove_blocks(&self, ex: &Extent, partial: &mut PartialCluster, from: Lblk, to: Lblk) -> Result<()> {
        if from < ex.logical || to != ex.last() {
            return Err(ExtentError::corrupt(CorruptionKind::UnalignedRemoval, None));
        }
        let ratio = u64::from(self.cluster_ratio());
        let mask = ratio - 1;
        let last_pblk = ex.physical_end() - 1;

        if let Some(cluster) = partial.cluster() {
            if cluster != last_pblk / ratio {
                if let PartialCluster::ToFree { cluster } = *partial {
                    self.free_cluster(cluster)?;
                }
                *partial = PartialCluster::Initial;
            }
        }

        let num = ex.end() - u64::from(from);
        let pblk = ex.physical_end() - num;

        // The extent ends mid-cluster but owns the cluster's first block.
        let to = u64::from(to);
        if to & mask != mask
            && to & !mask >= u64::from(from)
            && !matches!(partial, PartialCluster::NoFree { .. })
        {
            self.free_cluster(last_pblk / ratio)?;
            *partial = PartialCluster::Initial;
        }

        self.env.alloc.free_blocks(
            pblk,
            num as u32,
            FreeFlags {
                metadata: false,
                nofree_first_cluster: true,
                nofree_last_cluster: true,
            },
        )?;

        if partial.cluster().is_some_and(|c| c != pblk / ratio) {
            *partial = PartialCluster::Initial;
        }
        if u64::from(from) & mask != 0 && num == u64::from(ex.len) {
            if *partial == PartialCluster::Initial {
                *partial = PartialCluster::ToFree {
                    cluster: pblk / ratio,
                };
            }
        } else {
            *partial = PartialCluster::Initial;
        }
        Ok(())
    }

    fn free_cluster(&self, cluster: u64) -> Result<()> {
        let ratio = self.cluster_ratio();
        tracing::trace!(
            target: "extmap::extent::remove",
            ino = self.ino.0,
            cluster,
            "freeing partial cluster"
        );
        self.env
            .alloc
            .free_blocks(cluster * u64::from(ratio), ratio, FreeFlags::default())
    }
}
