use super::super::super::node::{Extent, Node, MAX_EXTENT_LEN};
use super::super::super::stats::ExtentEvent;
use super::path::ExtentPath;
use super::types::InsertFlags;
use super::ExtentTree;
use crate::types::{CorruptionKind, ExtentError, Result, EXT_MAX_BLOCKS};

/// True if `right` continues `left` logically and physically, in the same
/// state, without exceeding the longest extent.
pub(crate) fn can_merge(left: &Extent, right: &Extent) -> bool {
    left.unwritten == right.unwritten
        && left.end() == u64::from(right.logical)
        && left.physical_end() == right.physical
        && u32::from(left.len) + u32::from(right.len) <= u32::from(MAX_EXTENT_LEN)
}

impl ExtentTree {
    /// Folds the extents following `at` into it while they stay mergeable.
    fn merge_right(&self, path: &mut ExtentPath, at: usize) -> Result<bool> {
        let extents = path.leaf_mut().extents_mut()?;
        let mut merged = false;
        while at + 1 < extents.len() && can_merge(&extents[at], &extents[at + 1]) {
            let next = extents.remove(at + 1);
            extents[at].len += next.len;
            merged = true;
            self.record(ExtentEvent::Merge);
        }
        Ok(merged)
    }

    /// Coalesces the extent at `idx` with its neighbours, then tries to
    /// fold a lone leaf back into the root. The caller already holds write
    /// access to the leaf and dirties it afterwards.
    pub(super) fn try_merge(&mut self, path: &mut ExtentPath, idx: usize) -> Result<()> {
        let merged_left = idx > 0 && self.merge_right(path, idx - 1)?;
        if merged_left {
            path.leaf_mut().cursor = Some(idx - 1);
        } else {
            self.merge_right(path, idx)?;
        }
        let leaf = path.leaf_mut();
        let len = leaf.node.len();
        if let Some(cursor) = leaf.cursor {
            if cursor >= len {
                leaf.cursor = len.checked_sub(1);
            }
        }
        self.try_merge_up(path)
    }

    /// Copies a depth-1 tree's only leaf into the root when it fits.
    pub(super) fn try_merge_up(&mut self, path: &mut ExtentPath) -> Result<()> {
        if path.depth() != 1 || path.frames[0].node.len() != 1 {
            return Ok(());
        }
        let root_max = self.root_capacity();
        if path.frames[1].node.len() > usize::from(root_max) {
            return Ok(());
        }
        if let Err(err) = self.env.journal.extend_transaction(2) {
            tracing::debug!(
                target: "extmap::extent::leaf",
                ino = self.ino.0,
                error = %err,
                "no credits to fold leaf into root"
            );
            // A restarted transaction drops write access to the path.
            for level in 0..path.frames.len() {
                self.get_access(path, level)?;
            }
            return Ok(());
        }
        let Some(leaf) = path.frames.pop() else {
            return Ok(());
        };
        let block = leaf
            .block()
            .ok_or(ExtentError::corrupt(CorruptionKind::PathDepthChanged, None))?;
        let root = &mut path.frames[0];
        root.node = Node {
            max: root_max,
            depth: 0,
            generation: leaf.node.generation,
            entries: leaf.node.entries,
        };
        root.cursor = leaf.cursor;
        drop(leaf.buffer);
        let node = root.node.clone();
        self.store_root(&node)?;
        self.free_node_block(block)?;
        tracing::debug!(
            target: "extmap::extent::leaf",
            ino = self.ino.0,
            block,
            "folded leaf into root"
        );
        self.record(ExtentEvent::MergeUp);
        Ok(())
    }

    /// Trims `newext` so it ends before the next mapped cluster. Returns
    /// true if the length changed.
    pub(super) fn check_overlap(&self, path: &ExtentPath, newext: &mut Extent) -> bool {
        let Some(ex) = path.extent() else {
            return false;
        };
        let mask = !(self.cluster_ratio() - 1);
        let b1 = u64::from(newext.logical);
        let mut len1 = u64::from(newext.len);
        let mut b2 = u64::from(ex.logical & mask);
        if b2 < b1 {
            let Some(next) = path.next_allocated_block() else {
                return false;
            };
            b2 = u64::from(next & mask);
        }
        let mut trimmed = false;
        if b1 + len1 > u64::from(EXT_MAX_BLOCKS) {
            len1 = u64::from(EXT_MAX_BLOCKS) - b1;
            newext.len = len1 as u16;
            trimmed = true;
        }
        if b1 + len1 > b2 {
            newext.len = b2.saturating_sub(b1) as u16;
            trimmed = true;
        }
        trimmed
    }

    /// Inserts `newext` into the leaf `path` points at, making room if the
    /// leaf is full. On return `path` addresses the leaf holding it.
    pub(super) fn insert_extent_path(
        &mut self,
        path: &mut ExtentPath,
        newext: &Extent,
        flags: InsertFlags,
    ) -> Result<()> {
        if newext.len == 0 {
            return Err(ExtentError::Invalid("zero-length extent"));
        }
        let depth = path.depth();

        if !flags.pre_io {
            if let Some(at) = self.merge_neighbour(path, newext)? {
                return self.finish_insert(path, at, flags);
            }
        }

        if !path.leaf().node.has_free_slot() {
            let last = path.leaf().node.key_at(path.leaf().node.len() - 1);
            let next = match last {
                Some(last) if newext.logical > last => path.next_leaf_block(),
                _ => None,
            };
            let mut moved = false;
            if let Some(next) = next {
                let npath = self.locate(next)?;
                if npath.depth() != depth {
                    return Err(ExtentError::corrupt(CorruptionKind::PathDepthChanged, None));
                }
                if npath.leaf().node.has_free_slot() {
                    *path = npath;
                    moved = true;
                }
            }
            if !moved {
                self.create_new_leaf(path, newext, flags)?;
            }
        }

        let depth = path.depth();
        self.get_access(path, depth)?;
        let leaf = path.leaf_mut();
        let block = leaf.block();
        let pos = match leaf.cursor {
            None => 0,
            Some(cursor) => {
                let near = leaf.extents()?[cursor];
                if newext.logical == near.logical {
                    return Err(ExtentError::corrupt(CorruptionKind::DuplicateExtent, block));
                }
                if newext.logical > near.logical {
                    cursor + 1
                } else {
                    cursor
                }
            }
        };
        leaf.extents_mut()?.insert(pos, *newext);
        leaf.cursor = Some(pos);
        tracing::trace!(
            target: "extmap::extent::leaf",
            ino = self.ino.0,
            logical = newext.logical,
            len = newext.len,
            physical = newext.physical,
            pos,
            "inserted extent"
        );
        self.record(ExtentEvent::Insert);
        self.finish_insert(path, pos, flags)
    }

    /// Extends the cursor extent (or the one beside it) with `newext` if
    /// they are contiguous. Returns the index of the grown extent.
    fn merge_neighbour(&mut self, path: &mut ExtentPath, newext: &Extent) -> Result<Option<usize>> {
        let leaf = path.leaf();
        let Some(mut at) = leaf.cursor else {
            return Ok(None);
        };
        let extents = leaf.extents()?;
        let ex = extents[at];
        if at + 1 < extents.len() && ex.end() < u64::from(newext.logical) {
            at += 1;
        } else if at > 0 && newext.end() < u64::from(ex.logical) {
            at -= 1;
        }
        let ex = extents[at];
        let grown = if can_merge(&ex, newext) {
            Extent {
                len: ex.len + newext.len,
                ..ex
            }
        } else if can_merge(newext, &ex) {
            Extent {
                logical: newext.logical,
                len: ex.len + newext.len,
                physical: newext.physical,
                unwritten: ex.unwritten,
            }
        } else {
            return Ok(None);
        };
        let depth = path.depth();
        self.get_access(path, depth)?;
        let leaf = path.leaf_mut();
        leaf.extents_mut()?[at] = grown;
        leaf.cursor = Some(at);
        tracing::trace!(
            target: "extmap::extent::leaf",
            ino = self.ino.0,
            logical = grown.logical,
            len = grown.len,
            "grew neighbour extent"
        );
        self.record(ExtentEvent::Merge);
        Ok(Some(at))
    }

    fn finish_insert(&mut self, path: &mut ExtentPath, at: usize, flags: InsertFlags) -> Result<()> {
        if !flags.pre_io {
            self.try_merge(path, at)?;
        }
        self.correct_indexes(path)?;
        let depth = path.depth();
        self.dirty(path, depth)
    }
}
