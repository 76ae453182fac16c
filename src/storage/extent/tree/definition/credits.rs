//! Journal credit estimates and the delayed-allocation metadata reservation.

use super::path::ExtentPath;
use super::ExtentTree;
use crate::types::Lblk;

/// Superblock plus the inode holding the root.
const META_TRANS_BLOCKS: u32 = 2;

/// Bytes of one group descriptor.
const GROUP_DESC_LEN: u64 = 32;

impl ExtentTree {
    /// Index and leaf blocks touched when one range is inserted. `chunk`
    /// means the blocks fit one extent; otherwise the tree may split at
    /// every level more than once.
    pub fn index_trans_blocks(&self, chunk: bool) -> u32 {
        let depth = u32::from(self.depth());
        if chunk {
            depth * 2
        } else {
            depth * 3
        }
    }

    /// Worst-case credits for inserting one physically contiguous chunk.
    pub fn chunk_trans_blocks(&self) -> u32 {
        self.meta_trans_blocks(1)
    }

    /// Credits needed to insert a single extent. With a path whose leaf
    /// still has a free slot only the bitmap and descriptor change.
    pub fn credits_for_single_extent(&self, path: Option<&ExtentPath>) -> u32 {
        if let Some(path) = path {
            if path.leaf().node().has_free_slot() {
                return 2 + META_TRANS_BLOCKS;
            }
        }
        self.chunk_trans_blocks()
    }

    fn meta_trans_blocks(&self, extents: u32) -> u32 {
        let geometry = &self.env.geometry;
        let per_group = geometry.block_size as u64 * 8;
        let data_blocks = geometry.block_count - geometry.first_data_block;
        let groups_total = data_blocks.div_ceil(per_group).max(1);
        let desc_blocks = groups_total.div_ceil(geometry.block_size as u64 / GROUP_DESC_LEN);

        let index = self.index_trans_blocks(true);
        let groups = u64::from(index + extents).min(groups_total);
        let gdp = groups.min(desc_blocks);
        index + groups as u32 + gdp as u32 + META_TRANS_BLOCKS
    }

    /// Index blocks to reserve for one more delayed block at `lblk`.
    ///
    /// A block continuing the previous reservation shares its index blocks
    /// and only pays when a fan-out boundary is crossed; any other block
    /// reserves a fresh path.
    pub fn metadata_amount(&mut self, lblk: Lblk) -> u32 {
        let idxs = u32::from(self.block_capacity()).max(1);
        let est = &mut self.da_estimate;
        if est.len > 0 && est.last_lblk.and_then(|l| l.checked_add(1)) == Some(lblk) {
            let mut num = 0;
            if est.len % idxs == 0 {
                num += 1;
            }
            if est.len % idxs.saturating_mul(idxs) == 0 {
                num += 1;
            }
            if est.len % idxs.saturating_mul(idxs).saturating_mul(idxs) == 0 {
                num += 1;
                est.len = 0;
            } else {
                est.len += 1;
            }
            est.last_lblk = Some(lblk);
            return num;
        }
        est.len = 1;
        est.last_lblk = Some(lblk);
        u32::from(self.depth()) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::super::super::super::node::Extent;
    use super::super::testing::harness;

    #[test]
    fn credits_grow_with_depth() {
        let mut h = harness(128, 4096, 1);
        let shallow = h.tree.chunk_trans_blocks();
        assert_eq!(h.tree.index_trans_blocks(true), 0);
        for i in 0..8u32 {
            h.insert(Extent::new(i * 10, 2, 1000 + u64::from(i) * 4));
        }
        assert_eq!(h.tree.depth(), 1);
        assert_eq!(h.tree.index_trans_blocks(true), 2);
        assert_eq!(h.tree.index_trans_blocks(false), 3);
        assert!(h.tree.chunk_trans_blocks() > shallow);
    }

    #[test]
    fn leaf_with_room_needs_few_credits() {
        let mut h = harness(128, 4096, 1);
        h.insert(Extent::new(0, 2, 100));
        let path = h.tree.locate(0).unwrap();
        assert_eq!(h.tree.credits_for_single_extent(Some(&path)), 4);
        for i in 1..4u32 {
            h.insert(Extent::new(i * 10, 2, 100 + u64::from(i) * 4));
        }
        let path = h.tree.locate(0).unwrap();
        assert_eq!(
            h.tree.credits_for_single_extent(Some(&path)),
            h.tree.chunk_trans_blocks()
        );
    }

    #[test]
    fn contiguous_delayed_blocks_share_index_blocks() {
        let mut h = harness(128, 4096, 1);
        // Fresh reservation pays for a whole path.
        assert_eq!(h.tree.metadata_amount(100), 1);
        // Capacity 9: the next block crosses no boundary until len hits 9.
        let mut total = 0;
        for lblk in 101..109 {
            total += h.tree.metadata_amount(lblk);
        }
        assert_eq!(total, 0);
        assert_eq!(h.tree.metadata_amount(109), 1);
        assert_eq!(h.tree.metadata_amount(500), 1);
    }
}
