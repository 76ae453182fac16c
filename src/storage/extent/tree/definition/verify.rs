use serde::Serialize;

use super::super::super::node::{Entries, Extent, Node};
use super::ExtentTree;
use crate::types::{CorruptionKind, ExtentError, Pblk, Result};

/// Summary produced by [`ExtentTree::verify`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Depth of the root.
    pub depth: u16,
    /// Interior nodes, the root included.
    pub index_nodes: u64,
    /// Leaf nodes, the root included when it is a leaf.
    pub leaf_nodes: u64,
    /// Leaf entries.
    pub extents: u64,
    /// Blocks covered by extents.
    pub mapped_blocks: u64,
    /// Of which are unwritten.
    pub unwritten_blocks: u64,
    /// Tree blocks outside the inline root.
    pub metadata_blocks: u64,
}

#[derive(Default)]
struct Walk {
    report: VerifyReport,
    extents: Vec<Extent>,
    owned: Vec<(Pblk, u64)>,
    last_end: Option<u64>,
}

impl Walk {
    fn leaf(&mut self, extents: &[Extent], lo: u64, hi: u64, block: Option<Pblk>) -> Result<()> {
        self.report.leaf_nodes += 1;
        for ext in extents {
            let logical = u64::from(ext.logical);
            if logical < lo || ext.end() > hi {
                return Err(ExtentError::corrupt(CorruptionKind::IndexKeyMismatch, block));
            }
            if self.last_end.is_some_and(|end| logical < end) {
                return Err(ExtentError::corrupt(
                    CorruptionKind::InvalidExtentEntries,
                    block,
                ));
            }
            self.last_end = Some(ext.end());
            self.report.extents += 1;
            self.report.mapped_blocks += u64::from(ext.len);
            if ext.unwritten {
                self.report.unwritten_blocks += u64::from(ext.len);
            }
            self.owned.push((ext.physical, u64::from(ext.len)));
            self.extents.push(*ext);
        }
        Ok(())
    }
}

impl ExtentTree {
    /// Checks every node and the invariants spanning nodes: index keys
    /// equal their child's first key, extents stay inside their parent's
    /// key range and in global order, and no block is owned twice.
    pub fn verify(&self) -> Result<VerifyReport> {
        let walk = self.walk_all()?;
        let mut owned = walk.owned;
        owned.sort_unstable();
        for pair in owned.windows(2) {
            let (start, len) = pair[0];
            if pair[1].0 < start + len {
                return Err(ExtentError::corrupt(
                    CorruptionKind::DuplicateBlock,
                    Some(pair[1].0),
                ));
            }
        }
        tracing::debug!(
            target: "extmap::extent::verify",
            ino = self.ino.0,
            depth = walk.report.depth,
            extents = walk.report.extents,
            metadata = walk.report.metadata_blocks,
            "tree verified"
        );
        Ok(walk.report)
    }

    /// Every leaf extent in logical order.
    pub fn extents(&self) -> Result<Vec<Extent>> {
        Ok(self.walk_all()?.extents)
    }

    /// Physical runs the tree owns, data and node blocks alike, as
    /// `(start, len)`.
    pub fn block_runs(&self) -> Result<Vec<(Pblk, u64)>> {
        Ok(self.walk_all()?.owned)
    }

    fn walk_all(&self) -> Result<Walk> {
        let root = self.validated_root()?;
        let mut walk = Walk::default();
        walk.report.depth = root.depth;
        self.walk_node(&root, None, 0, u64::from(u32::MAX) + 1, &mut walk)?;
        Ok(walk)
    }

    fn walk_node(
        &self,
        node: &Node,
        block: Option<Pblk>,
        lo: u64,
        hi: u64,
        walk: &mut Walk,
    ) -> Result<()> {
        if block.is_some() && node.is_empty() {
            let kind = if node.is_leaf() {
                CorruptionKind::EmptyLeaf
            } else {
                CorruptionKind::EmptyIndex
            };
            return Err(ExtentError::corrupt(kind, block));
        }
        let indexes = match &node.entries {
            Entries::Leaf(extents) => return walk.leaf(extents, lo, hi, block),
            Entries::Index(indexes) => indexes,
        };
        walk.report.index_nodes += 1;
        for (i, idx) in indexes.iter().enumerate() {
            let key = u64::from(idx.logical);
            let next = indexes
                .get(i + 1)
                .map_or(hi, |n| u64::from(n.logical));
            if key < lo || key >= next {
                return Err(ExtentError::corrupt(CorruptionKind::IndexKeyMismatch, block));
            }
            let (child, _) = self.read_node(idx.child, node.depth - 1)?;
            if child.first_key() != Some(idx.logical) {
                return Err(ExtentError::corrupt(
                    CorruptionKind::IndexKeyMismatch,
                    Some(idx.child),
                ));
            }
            walk.report.metadata_blocks += 1;
            walk.owned.push((idx.child, 1));
            self.walk_node(&child, Some(idx.child), key, next, walk)?;
        }
        Ok(())
    }
}
