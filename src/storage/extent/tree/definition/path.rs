use smallvec::SmallVec;

use super::super::super::node::{Entries, Extent, IndexEntry, Node};
use super::ExtentTree;
use crate::primitives::pager::BufferHandle;
use crate::types::{CorruptionKind, ExtentError, Lblk, Pblk, Result};

/// One level of a root-to-leaf path.
#[derive(Debug)]
pub struct PathFrame {
    pub(crate) node: Node,
    pub(crate) buffer: Option<BufferHandle>,
    pub(crate) cursor: Option<usize>,
}

impl PathFrame {
    /// Decoded node at this level.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Selected entry, `None` for an empty leaf.
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Block holding the node, `None` for the inline root.
    pub fn block(&self) -> Option<Pblk> {
        self.buffer.as_ref().map(|b| b.block())
    }

    fn corrupt(&self, kind: CorruptionKind) -> ExtentError {
        ExtentError::corrupt(kind, self.block())
    }

    pub(crate) fn cursor_or_corrupt(&self) -> Result<usize> {
        self.cursor
            .ok_or_else(|| self.corrupt(CorruptionKind::MissingCursor))
    }

    pub(crate) fn extents(&self) -> Result<&[Extent]> {
        self.node
            .extents()
            .map_err(|_| self.corrupt(CorruptionKind::RoleMismatch))
    }

    pub(crate) fn extents_mut(&mut self) -> Result<&mut Vec<Extent>> {
        let block = self.block();
        self.node
            .extents_mut()
            .map_err(|_| ExtentError::corrupt(CorruptionKind::RoleMismatch, block))
    }

    pub(crate) fn indexes(&self) -> Result<&[IndexEntry]> {
        self.node
            .indexes()
            .map_err(|_| self.corrupt(CorruptionKind::RoleMismatch))
    }

    pub(crate) fn indexes_mut(&mut self) -> Result<&mut Vec<IndexEntry>> {
        let block = self.block();
        self.node
            .indexes_mut()
            .map_err(|_| ExtentError::corrupt(CorruptionKind::RoleMismatch, block))
    }
}

/// Root-to-leaf trail for one logical block.
///
/// Frame 0 is the inline root, the last frame is the leaf. Buffers of the
/// non-root frames stay pinned until the path is dropped.
#[derive(Debug)]
pub struct ExtentPath {
    pub(crate) frames: SmallVec<[PathFrame; 4]>,
}

impl ExtentPath {
    pub(crate) fn root_only(node: Node) -> Self {
        let mut frames = SmallVec::new();
        frames.push(PathFrame {
            node,
            buffer: None,
            cursor: None,
        });
        Self { frames }
    }

    /// Tree depth seen by this path.
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    /// All frames, root first.
    pub fn frames(&self) -> &[PathFrame] {
        &self.frames
    }

    /// Leaf frame.
    pub fn leaf(&self) -> &PathFrame {
        &self.frames[self.frames.len() - 1]
    }

    pub(crate) fn leaf_mut(&mut self) -> &mut PathFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    pub(crate) fn frame(&self, level: usize) -> Result<&PathFrame> {
        self.frames
            .get(level)
            .ok_or(ExtentError::corrupt(CorruptionKind::PathDepthChanged, None))
    }

    pub(crate) fn frame_mut(&mut self, level: usize) -> Result<&mut PathFrame> {
        self.frames
            .get_mut(level)
            .ok_or(ExtentError::corrupt(CorruptionKind::PathDepthChanged, None))
    }

    /// Extent under the leaf cursor.
    pub fn extent(&self) -> Option<Extent> {
        let leaf = self.leaf();
        let cursor = leaf.cursor?;
        leaf.node.extents().ok()?.get(cursor).copied()
    }

    /// Blocks pinned by this path.
    pub fn pinned_blocks(&self) -> Vec<Pblk> {
        self.frames.iter().filter_map(|f| f.block()).collect()
    }
}

/// Rightmost extent starting at or before `lblk`; the first one if none does.
pub(crate) fn search_extents(extents: &[Extent], lblk: Lblk) -> Option<usize> {
    if extents.is_empty() {
        return None;
    }
    Some(extents.partition_point(|e| e.logical <= lblk).saturating_sub(1))
}

/// Same rule for index entries.
pub(crate) fn search_indexes(indexes: &[IndexEntry], lblk: Lblk) -> Option<usize> {
    if indexes.is_empty() {
        return None;
    }
    Some(indexes.partition_point(|e| e.logical <= lblk).saturating_sub(1))
}

impl ExtentTree {
    /// Walks from the root to the leaf responsible for `lblk`.
    pub fn locate(&self, lblk: Lblk) -> Result<ExtentPath> {
        let mut node = self.root_node()?;
        let mut buffer: Option<BufferHandle> = None;
        let mut frames: SmallVec<[PathFrame; 4]> = SmallVec::new();
        loop {
            let depth = node.depth;
            let block = buffer.as_ref().map(|b| b.block());
            let (cursor, child) = match &node.entries {
                Entries::Leaf(extents) => (search_extents(extents, lblk), None),
                Entries::Index(indexes) => {
                    let at = search_indexes(indexes, lblk)
                        .ok_or(ExtentError::corrupt(CorruptionKind::EmptyIndex, block))?;
                    (Some(at), Some(indexes[at].child))
                }
            };
            frames.push(PathFrame {
                node,
                buffer: buffer.take(),
                cursor,
            });
            let Some(child) = child else {
                break;
            };
            tracing::trace!(
                target: "extmap::extent::path",
                lblk,
                depth,
                child,
                "descending"
            );
            let (next, handle) = self.read_node(child, depth - 1)?;
            node = next;
            buffer = Some(handle);
        }
        Ok(ExtentPath { frames })
    }
}
