use smallvec::SmallVec;

use super::super::super::node::{Entries, Extent, IndexEntry, Node, MAX_DEPTH};
use super::super::super::stats::ExtentEvent;
use super::path::ExtentPath;
use super::types::InsertFlags;
use super::ExtentTree;
use crate::types::{CorruptionKind, ExtentError, Lblk, Pblk, Result};

/// Next structural step when a full leaf needs room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Growth {
    /// Split below the level that still has a free index slot.
    Split { at: usize },
    /// Every level is full: push the root down one level.
    Grow,
}

impl ExtentTree {
    /// Adds `(logical, child)` to the index node at `level`, beside its cursor.
    pub(super) fn insert_index(
        &mut self,
        path: &mut ExtentPath,
        level: usize,
        logical: Lblk,
        child: Pblk,
    ) -> Result<()> {
        self.get_access(path, level)?;
        let frame = path.frame_mut(level)?;
        let block = frame.block();
        let cursor = frame.cursor_or_corrupt()?;
        let full = !frame.node.has_free_slot();
        let indexes = frame.indexes_mut()?;
        let current = indexes
            .get(cursor)
            .map(|e| e.logical)
            .ok_or(ExtentError::corrupt(CorruptionKind::MissingCursor, block))?;
        if logical == current {
            return Err(ExtentError::corrupt(CorruptionKind::IndexCollision, block));
        }
        if full {
            return Err(ExtentError::corrupt(CorruptionKind::NodeFull, block));
        }
        let pos = if logical > current { cursor + 1 } else { cursor };
        indexes.insert(pos, IndexEntry { logical, child });
        tracing::trace!(
            target: "extmap::extent::internal",
            level,
            logical,
            child,
            pos,
            "inserted index"
        );
        self.dirty(path, level)
    }

    fn new_meta_block(&self, path: &ExtentPath, newext: &Extent, flags: InsertFlags) -> Result<Pblk> {
        let goal = self.find_goal(path, newext.logical);
        self.env.alloc.new_metadata_block(goal, flags.nofail)
    }

    /// Splits every node from the leaf up to (excluding) `at`, moving the
    /// entries right of the cursors into fresh blocks, and links the new
    /// subtree into the index node at `at`.
    pub(super) fn split(
        &mut self,
        path: &mut ExtentPath,
        newext: &Extent,
        at: usize,
        flags: InsertFlags,
    ) -> Result<()> {
        let depth = path.depth();
        if at >= depth {
            return Err(ExtentError::Invalid("split level must be above the leaf"));
        }
        let leaf = path.leaf();
        let leaf_block = leaf.block();
        if leaf.node.has_free_slot() {
            return Err(ExtentError::corrupt(CorruptionKind::SplitNotFull, leaf_block));
        }
        let leaf_cursor = leaf.cursor_or_corrupt()?;
        let border = leaf
            .node
            .key_at(leaf_cursor + 1)
            .unwrap_or(newext.logical);

        let mut blocks: SmallVec<[Pblk; 4]> = SmallVec::new();
        for _ in at..depth {
            match self.new_meta_block(path, newext, flags) {
                Ok(block) => blocks.push(block),
                Err(err) => {
                    self.release_blocks(&blocks);
                    return Err(err);
                }
            }
        }
        let levels = blocks.len() as u16;
        match self.link_split(path, &blocks, border, at) {
            Ok(()) => {
                tracing::debug!(
                    target: "extmap::extent::internal",
                    ino = self.ino.0,
                    at,
                    border,
                    levels,
                    "split"
                );
                self.record(ExtentEvent::Split { levels });
                Ok(())
            }
            Err(err) => {
                self.release_blocks(&blocks);
                Err(err)
            }
        }
    }

    fn release_blocks(&self, blocks: &[Pblk]) {
        for &block in blocks {
            if let Err(err) = self.free_node_block(block) {
                tracing::warn!(
                    target: "extmap::extent::internal",
                    block,
                    error = %err,
                    "failed to release split block"
                );
            }
        }
    }

    fn link_split(
        &mut self,
        path: &mut ExtentPath,
        blocks: &[Pblk],
        border: Lblk,
        at: usize,
    ) -> Result<()> {
        let depth = path.depth();
        let capacity = self.block_capacity();
        let mut pending: SmallVec<[Pblk; 4]> = SmallVec::from_slice(blocks);

        // New leaf: everything right of the leaf cursor.
        let mut newblock = pending
            .pop()
            .ok_or(ExtentError::Invalid("split without blocks"))?;
        let moved: Vec<Extent> = {
            let leaf = path.leaf();
            let cursor = leaf.cursor_or_corrupt()?;
            leaf.extents()?[cursor + 1..].to_vec()
        };
        let count = moved.len();
        let node = Node {
            max: capacity,
            depth: 0,
            generation: 0,
            entries: Entries::Leaf(moved),
        };
        self.write_new_node(newblock, &node)?;
        if count > 0 {
            self.get_access(path, depth)?;
            let leaf = path.leaf_mut();
            let keep = leaf.extents()?.len() - count;
            leaf.extents_mut()?.truncate(keep);
            self.dirty(path, depth)?;
        }

        // New index nodes for the levels between the leaf and `at`.
        for level in (at + 1..depth).rev() {
            let child = newblock;
            newblock = pending
                .pop()
                .ok_or(ExtentError::Invalid("split without blocks"))?;
            let frame = path.frame(level)?;
            if frame.node.has_free_slot() {
                return Err(ExtentError::corrupt(CorruptionKind::SplitNotFull, frame.block()));
            }
            let cursor = frame.cursor_or_corrupt()?;
            let mut entries = Vec::with_capacity(usize::from(capacity));
            entries.push(IndexEntry {
                logical: border,
                child,
            });
            entries.extend_from_slice(&frame.indexes()?[cursor + 1..]);
            let count = entries.len() - 1;
            let node = Node {
                max: capacity,
                depth: (depth - level) as u16,
                generation: 0,
                entries: Entries::Index(entries),
            };
            self.write_new_node(newblock, &node)?;
            if count > 0 {
                self.get_access(path, level)?;
                let frame = path.frame_mut(level)?;
                let keep = frame.indexes()?.len() - count;
                frame.indexes_mut()?.truncate(keep);
                self.dirty(path, level)?;
            }
        }

        self.insert_index(path, at, border, newblock)
    }

    /// Moves the root's entries into a new block and turns the root into a
    /// single-entry index one level higher.
    pub(super) fn grow(&mut self, path: &ExtentPath, newext: &Extent, flags: InsertFlags) -> Result<()> {
        let root = self.root_node()?;
        if root.depth >= MAX_DEPTH {
            return Err(ExtentError::corrupt(CorruptionKind::DepthTooLarge, None));
        }
        let block = self.new_meta_block(path, newext, flags)?;
        let first = root.first_key().unwrap_or(0);
        let child = Node {
            max: self.block_capacity(),
            depth: root.depth,
            generation: root.generation,
            entries: root.entries,
        };
        if let Err(err) = self.write_new_node(block, &child) {
            self.release_blocks(&[block]);
            return Err(err);
        }
        let new_root = Node {
            max: self.root_capacity(),
            depth: root.depth + 1,
            generation: root.generation,
            entries: Entries::Index(vec![IndexEntry {
                logical: first,
                child: block,
            }]),
        };
        self.store_root(&new_root)?;
        tracing::debug!(
            target: "extmap::extent::internal",
            ino = self.ino.0,
            depth = new_root.depth,
            block,
            "grew tree"
        );
        self.record(ExtentEvent::Grow {
            depth: new_root.depth,
        });
        Ok(())
    }

    fn next_growth(path: &ExtentPath) -> Growth {
        (0..path.depth())
            .rev()
            .find(|&level| path.frames[level].node.has_free_slot())
            .map_or(Growth::Grow, |at| Growth::Split { at })
    }

    /// Makes room for `newext` when its leaf is full, then re-locates
    /// `path` on it.
    pub(super) fn create_new_leaf(
        &mut self,
        path: &mut ExtentPath,
        newext: &Extent,
        flags: InsertFlags,
    ) -> Result<()> {
        // A grow can leave a full leaf under a fresh level; the split that
        // follows always has room.
        for _ in 0..2 {
            match Self::next_growth(path) {
                Growth::Split { at } => {
                    self.split(path, newext, at, flags)?;
                    *path = self.locate(newext.logical)?;
                    return Ok(());
                }
                Growth::Grow => {
                    self.grow(path, newext, flags)?;
                    *path = self.locate(newext.logical)?;
                    if path.leaf().node.has_free_slot() {
                        return Ok(());
                    }
                }
            }
        }
        Err(ExtentError::corrupt(CorruptionKind::NodeFull, path.leaf().block()))
    }

    /// Propagates a changed first key of the leaf into its ancestors.
    pub(super) fn correct_indexes(&mut self, path: &mut ExtentPath) -> Result<()> {
        let depth = path.depth();
        if depth == 0 {
            return Ok(());
        }
        let leaf = path.leaf();
        if leaf.cursor_or_corrupt()? != 0 {
            return Ok(());
        }
        let border = leaf
            .node
            .key_at(0)
            .ok_or(ExtentError::corrupt(CorruptionKind::EmptyLeaf, leaf.block()))?;
        let mut level = depth - 1;
        loop {
            self.get_access(path, level)?;
            let frame = path.frame_mut(level)?;
            let cursor = frame.cursor_or_corrupt()?;
            if let Some(entry) = frame.indexes_mut()?.get_mut(cursor) {
                entry.logical = border;
            }
            self.dirty(path, level)?;
            if level == 0 || cursor != 0 {
                break;
            }
            level -= 1;
        }
        Ok(())
    }

    /// Unlinks the empty child at `level` from its parent, frees its block
    /// and fixes the keys above.
    pub(super) fn rm_idx(&mut self, path: &mut ExtentPath, level: usize) -> Result<()> {
        let parent = level
            .checked_sub(1)
            .ok_or(ExtentError::Invalid("the root has no parent index"))?;
        let frame = path.frame(parent)?;
        if frame.node.is_empty() {
            return Err(ExtentError::corrupt(CorruptionKind::EmptyIndex, frame.block()));
        }
        let cursor = frame.cursor_or_corrupt()?;
        let child = frame
            .indexes()?
            .get(cursor)
            .map(|e| e.child)
            .ok_or(ExtentError::corrupt(CorruptionKind::MissingCursor, frame.block()))?;
        self.get_access(path, parent)?;
        path.frame_mut(parent)?.indexes_mut()?.remove(cursor);
        self.dirty(path, parent)?;
        tracing::trace!(
            target: "extmap::extent::internal",
            ino = self.ino.0,
            block = child,
            "freed empty node"
        );
        self.free_node_block(child)?;

        let mut level = parent;
        while level > 0 {
            let frame = path.frame(level)?;
            if frame.cursor != Some(0) {
                break;
            }
            let Some(key) = frame.node.key_at(0) else {
                break;
            };
            level -= 1;
            self.get_access(path, level)?;
            let frame = path.frame_mut(level)?;
            let cursor = frame.cursor_or_corrupt()?;
            if let Some(entry) = frame.indexes_mut()?.get_mut(cursor) {
                entry.logical = key;
            }
            self.dirty(path, level)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{harness, harness_reserving};
    use super::*;

    #[test]
    fn fifth_extent_grows_the_root() {
        let mut h = harness(128, 4096, 1);
        for i in 0..5u32 {
            h.insert(Extent::new(i * 10, 1, 2000 + u64::from(i) * 10));
        }
        assert_eq!(h.tree.depth(), 1);
        assert_eq!(h.stats.grows(), 1);
        let root = h.tree.root_node().unwrap();
        assert_eq!(root.indexes().unwrap().len(), 1);
        assert_eq!(root.indexes().unwrap()[0].logical, 0);
        let path = h.tree.locate(40).unwrap();
        assert_eq!(path.leaf().node().len(), 5);
        assert_eq!(path.leaf().node().max, 9);
    }

    #[test]
    fn full_leaf_splits_at_cursor_and_links_border() {
        let mut h = harness(128, 4096, 1);
        for i in 0..9u32 {
            h.insert(Extent::new(i * 10, 1, 2000 + u64::from(i) * 10));
        }
        assert_eq!(h.stats.splits(), 0);
        h.insert(Extent::new(45, 1, 3000));
        assert_eq!(h.stats.splits(), 1);
        let root = h.tree.root_node().unwrap();
        let keys: Vec<Lblk> = root.indexes().unwrap().iter().map(|e| e.logical).collect();
        assert_eq!(keys, vec![0, 50]);
        let left = h.tree.locate(45).unwrap();
        assert_eq!(left.leaf().node().len(), 6);
        let right = h.tree.locate(50).unwrap();
        assert_eq!(right.leaf().node().first_key(), Some(50));
        h.tree.verify().unwrap();
    }

    #[test]
    fn split_rejects_leaf_with_room() {
        let mut h = harness(128, 4096, 1);
        for i in 0..5u32 {
            h.insert(Extent::new(i * 10, 1, 2000 + u64::from(i) * 10));
        }
        let mut path = h.tree.locate(0).unwrap();
        let err = h
            .tree
            .split(&mut path, &Extent::new(100, 1, 9), 0, InsertFlags::default())
            .unwrap_err();
        assert_eq!(err.corruption_kind(), Some(CorruptionKind::SplitNotFull));
    }

    #[test]
    fn index_collision_is_reported() {
        let mut h = harness(128, 4096, 1);
        for i in 0..5u32 {
            h.insert(Extent::new(i * 10, 1, 2000 + u64::from(i) * 10));
        }
        let mut path = h.tree.locate(0).unwrap();
        let err = h.tree.insert_index(&mut path, 0, 0, 77).unwrap_err();
        assert_eq!(err.corruption_kind(), Some(CorruptionKind::IndexCollision));
    }

    #[test]
    fn failed_split_allocation_releases_blocks() {
        // Blocks 1..8 are all the tree may use for nodes.
        let mut h = harness_reserving(128, 128, 1, 8..128);
        let data_blocks = h.data.end - h.data.start;
        let mut logical = 0u32;
        let mut phys = h.data.start;
        let err = loop {
            let before = h.tree.extents().unwrap();
            match h.tree.insert_extent(Extent::new(logical, 1, phys)) {
                Ok(()) => {
                    logical += 2;
                    phys += 1;
                }
                Err(err) => {
                    assert_eq!(h.tree.extents().unwrap(), before);
                    let report = h.tree.verify().unwrap();
                    assert_eq!(
                        h.alloc.free_clusters() + report.metadata_blocks + data_blocks,
                        h.alloc.total_clusters()
                    );
                    break err;
                }
            }
        };
        assert!(matches!(err, ExtentError::NoSpace));
        assert!(phys < h.data.end);
        assert!(h.tree.depth() >= 2);
    }
}
