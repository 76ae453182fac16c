//! On-disk extent node format.
//!
//! Every node is a 12-byte header followed by a packed array of 12-byte
//! entries. Leaves hold [`Extent`]s, interior nodes hold [`IndexEntry`]s.
//! The root lives inline in the inode (60 bytes, four entries); all other
//! nodes fill one block and carry a CRC32 trailer right after the last
//! entry slot.

use std::ops::Range;

use serde::Serialize;

use crate::types::checksum::node_crc32;
use crate::types::{CorruptionKind, ExtentError, Lblk, Pblk, Result, MAX_PHYSICAL_BLOCK};

/// Header magic.
pub const EXTENT_MAGIC: u16 = 0xF30A;
/// Header length in bytes.
pub const HEADER_LEN: usize = 12;
/// Entry length in bytes, for both leaf and index entries.
pub const ENTRY_LEN: usize = 12;
/// Checksum trailer length.
pub const TAIL_LEN: usize = 4;
/// Bytes reserved for the inline root in the inode.
pub const ROOT_LEN: usize = 60;
/// Raw length values above this mark an unwritten extent.
pub const INIT_MAX_LEN: u32 = 1 << 15;
/// Longest extent the engine creates, written or unwritten.
pub const MAX_EXTENT_LEN: u16 = (1 << 15) - 1;
/// Deepest tree the engine builds or accepts.
pub const MAX_DEPTH: u16 = 5;

mod header {
    use std::ops::Range;

    pub const MAGIC: Range<usize> = 0..2;
    pub const ENTRIES: Range<usize> = 2..4;
    pub const MAX: Range<usize> = 4..6;
    pub const DEPTH: Range<usize> = 6..8;
    pub const GENERATION: Range<usize> = 8..12;
}

mod leaf_entry {
    use std::ops::Range;

    pub const BLOCK: Range<usize> = 0..4;
    pub const LEN: Range<usize> = 4..6;
    pub const START_HI: Range<usize> = 6..8;
    pub const START_LO: Range<usize> = 8..12;
}

mod index_entry {
    use std::ops::Range;

    pub const BLOCK: Range<usize> = 0..4;
    pub const LEAF_LO: Range<usize> = 4..8;
    pub const LEAF_HI: Range<usize> = 8..10;
    pub const UNUSED: Range<usize> = 10..12;
}

fn get_u16(src: &[u8], range: Range<usize>) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&src[range]);
    u16::from_le_bytes(bytes)
}

fn get_u32(src: &[u8], range: Range<usize>) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&src[range]);
    u32::from_le_bytes(bytes)
}

fn put_u16(dst: &mut [u8], range: Range<usize>, value: u16) {
    dst[range].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(dst: &mut [u8], range: Range<usize>, value: u32) {
    dst[range].copy_from_slice(&value.to_le_bytes());
}

fn shift(range: Range<usize>, by: usize) -> Range<usize> {
    range.start + by..range.end + by
}

/// Contiguous run of logical blocks mapped to contiguous physical blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Extent {
    /// First logical block.
    pub logical: Lblk,
    /// Number of blocks.
    pub len: u16,
    /// First physical block.
    pub physical: Pblk,
    /// Allocated but not yet holding valid data.
    pub unwritten: bool,
}

impl Extent {
    /// Initialized extent.
    pub fn new(logical: Lblk, len: u16, physical: Pblk) -> Self {
        Self {
            logical,
            len,
            physical,
            unwritten: false,
        }
    }

    /// Unwritten (preallocated) extent.
    pub fn new_unwritten(logical: Lblk, len: u16, physical: Pblk) -> Self {
        Self {
            unwritten: true,
            ..Self::new(logical, len, physical)
        }
    }

    /// One past the last logical block, widened so it cannot overflow.
    pub fn end(&self) -> u64 {
        u64::from(self.logical) + u64::from(self.len)
    }

    /// Last logical block.
    pub fn last(&self) -> Lblk {
        (self.end().saturating_sub(1)) as Lblk
    }

    /// One past the last physical block.
    pub fn physical_end(&self) -> Pblk {
        self.physical + u64::from(self.len)
    }

    /// True if `lblk` falls inside the extent.
    pub fn contains(&self, lblk: Lblk) -> bool {
        lblk >= self.logical && u64::from(lblk) < self.end()
    }

    /// Physical block backing `lblk`. Only meaningful when `contains(lblk)`.
    pub fn physical_at(&self, lblk: Lblk) -> Pblk {
        self.physical + u64::from(lblk - self.logical)
    }

    /// Length field as stored on disk.
    pub fn raw_len(&self) -> u16 {
        if self.unwritten {
            self.len + INIT_MAX_LEN as u16
        } else {
            self.len
        }
    }

    fn from_raw(logical: Lblk, raw_len: u16, physical: Pblk) -> Self {
        if u32::from(raw_len) > INIT_MAX_LEN {
            Self::new_unwritten(logical, raw_len - INIT_MAX_LEN as u16, physical)
        } else {
            Self::new(logical, raw_len, physical)
        }
    }
}

/// Interior entry pointing at a child node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    /// Lowest logical block covered by the child.
    pub logical: Lblk,
    /// Block holding the child node.
    pub child: Pblk,
}

/// Homogeneous entry array of one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "entries", rename_all = "snake_case")]
pub enum Entries {
    /// Leaf entries.
    Leaf(Vec<Extent>),
    /// Interior entries.
    Index(Vec<IndexEntry>),
}

/// Where a node lives, which fixes its capacity and checksum handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// Inline root inside the inode.
    Root,
    /// Node occupying a whole block.
    Block,
}

/// Device geometry the codec validates against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Geometry {
    /// Bytes per block.
    pub block_size: usize,
    /// First block usable for data or metadata.
    pub first_data_block: Pblk,
    /// Blocks on the device.
    pub block_count: Pblk,
    /// Whether block nodes carry checksums.
    pub checksums: bool,
}

impl Geometry {
    /// Rejects geometries the format cannot describe.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || self.block_size < 64 {
            return Err(ExtentError::Invalid(
                "block size must be a power of two of at least 64 bytes",
            ));
        }
        if self.block_count <= self.first_data_block || self.block_count > MAX_PHYSICAL_BLOCK {
            return Err(ExtentError::Invalid("block count out of range"));
        }
        Ok(())
    }

    /// Entry capacity of a node in `role`.
    pub fn capacity(&self, role: NodeRole) -> u16 {
        match role {
            NodeRole::Root => ((ROOT_LEN - HEADER_LEN) / ENTRY_LEN) as u16,
            NodeRole::Block => ((self.block_size - HEADER_LEN - TAIL_LEN) / ENTRY_LEN) as u16,
        }
    }

    fn extent_in_bounds(&self, ext: &Extent) -> bool {
        ext.physical >= self.first_data_block
            && ext.physical_end() <= self.block_count
            && ext.end() <= u64::from(u32::MAX) + 1
    }

    fn block_in_bounds(&self, block: Pblk) -> bool {
        block >= self.first_data_block && block < self.block_count
    }
}

/// Decoded node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Entry capacity.
    pub max: u16,
    /// Distance from the leaf level.
    pub depth: u16,
    /// Reserved generation word, carried through unchanged.
    pub generation: u32,
    /// Entries in key order.
    pub entries: Entries,
}

/// Validation context for [`Node::parse_and_validate`].
#[derive(Clone, Copy, Debug)]
pub struct NodeCheck<'a> {
    /// Root or block.
    pub role: NodeRole,
    /// Depth the node must report.
    pub depth: u16,
    /// Device bounds.
    pub geometry: &'a Geometry,
    /// Checksum seed; `None` skips the trailer check.
    pub seed: Option<u32>,
    /// Block the node was read from, for error reports.
    pub block: Option<Pblk>,
}

impl Node {
    /// Empty leaf with capacity `max`.
    pub fn empty_leaf(max: u16) -> Self {
        Self {
            max,
            depth: 0,
            generation: 0,
            entries: Entries::Leaf(Vec::new()),
        }
    }

    /// True if the node holds extents.
    pub fn is_leaf(&self) -> bool {
        matches!(self.entries, Entries::Leaf(_))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match &self.entries {
            Entries::Leaf(v) => v.len(),
            Entries::Index(v) => v.len(),
        }
    }

    /// True if the node has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if another entry fits.
    pub fn has_free_slot(&self) -> bool {
        self.len() < usize::from(self.max)
    }

    /// Key of the first entry.
    pub fn first_key(&self) -> Option<Lblk> {
        match &self.entries {
            Entries::Leaf(v) => v.first().map(|e| e.logical),
            Entries::Index(v) => v.first().map(|e| e.logical),
        }
    }

    /// Key of entry `idx`.
    pub fn key_at(&self, idx: usize) -> Option<Lblk> {
        match &self.entries {
            Entries::Leaf(v) => v.get(idx).map(|e| e.logical),
            Entries::Index(v) => v.get(idx).map(|e| e.logical),
        }
    }

    /// Leaf entries, or a role error for index nodes.
    pub fn extents(&self) -> Result<&[Extent]> {
        match &self.entries {
            Entries::Leaf(v) => Ok(v),
            Entries::Index(_) => Err(ExtentError::corrupt(CorruptionKind::RoleMismatch, None)),
        }
    }

    /// Mutable leaf entries.
    pub fn extents_mut(&mut self) -> Result<&mut Vec<Extent>> {
        match &mut self.entries {
            Entries::Leaf(v) => Ok(v),
            Entries::Index(_) => Err(ExtentError::corrupt(CorruptionKind::RoleMismatch, None)),
        }
    }

    /// Index entries, or a role error for leaves.
    pub fn indexes(&self) -> Result<&[IndexEntry]> {
        match &self.entries {
            Entries::Index(v) => Ok(v),
            Entries::Leaf(_) => Err(ExtentError::corrupt(CorruptionKind::RoleMismatch, None)),
        }
    }

    /// Mutable index entries.
    pub fn indexes_mut(&mut self) -> Result<&mut Vec<IndexEntry>> {
        match &mut self.entries {
            Entries::Index(v) => Ok(v),
            Entries::Leaf(_) => Err(ExtentError::corrupt(CorruptionKind::RoleMismatch, None)),
        }
    }

    /// Decodes without validation. Only bounds are enforced.
    pub fn parse(raw: &[u8], block: Option<Pblk>) -> Result<Self> {
        let corrupt = |kind| ExtentError::corrupt(kind, block);
        if raw.len() < HEADER_LEN {
            return Err(corrupt(CorruptionKind::Truncated));
        }
        let count = usize::from(get_u16(raw, header::ENTRIES));
        let max = get_u16(raw, header::MAX);
        let depth = get_u16(raw, header::DEPTH);
        let generation = get_u32(raw, header::GENERATION);
        if HEADER_LEN + count * ENTRY_LEN > raw.len() {
            return Err(corrupt(CorruptionKind::InvalidEntries));
        }
        let slot = |i: usize| &raw[HEADER_LEN + i * ENTRY_LEN..HEADER_LEN + (i + 1) * ENTRY_LEN];
        let entries = if depth == 0 {
            Entries::Leaf(
                (0..count)
                    .map(|i| {
                        let e = slot(i);
                        let hi = u64::from(get_u16(e, leaf_entry::START_HI));
                        let lo = u64::from(get_u32(e, leaf_entry::START_LO));
                        Extent::from_raw(
                            get_u32(e, leaf_entry::BLOCK),
                            get_u16(e, leaf_entry::LEN),
                            (hi << 32) | lo,
                        )
                    })
                    .collect(),
            )
        } else {
            Entries::Index(
                (0..count)
                    .map(|i| {
                        let e = slot(i);
                        let hi = u64::from(get_u16(e, index_entry::LEAF_HI));
                        let lo = u64::from(get_u32(e, index_entry::LEAF_LO));
                        IndexEntry {
                            logical: get_u32(e, index_entry::BLOCK),
                            child: (hi << 32) | lo,
                        }
                    })
                    .collect(),
            )
        };
        Ok(Self {
            max,
            depth,
            generation,
            entries,
        })
    }

    /// Decodes and checks every structural invariant, in a fixed order.
    pub fn parse_and_validate(raw: &[u8], check: &NodeCheck<'_>) -> Result<Self> {
        let corrupt = |kind| ExtentError::corrupt(kind, check.block);
        if raw.len() < HEADER_LEN {
            return Err(corrupt(CorruptionKind::Truncated));
        }
        if get_u16(raw, header::MAGIC) != EXTENT_MAGIC {
            return Err(corrupt(CorruptionKind::BadMagic));
        }
        let depth = get_u16(raw, header::DEPTH);
        if depth != check.depth {
            return Err(corrupt(CorruptionKind::UnexpectedDepth));
        }
        let max = get_u16(raw, header::MAX);
        if max == 0 {
            return Err(corrupt(CorruptionKind::InvalidMax));
        }
        let limit = check.geometry.capacity(check.role);
        if max > limit || HEADER_LEN + usize::from(max) * ENTRY_LEN > raw.len() {
            return Err(corrupt(CorruptionKind::MaxTooLarge));
        }
        if get_u16(raw, header::ENTRIES) > max {
            return Err(corrupt(CorruptionKind::InvalidEntries));
        }
        let node = Self::parse(raw, check.block)?;
        if !node.entries_valid(check.geometry) {
            return Err(corrupt(CorruptionKind::InvalidExtentEntries));
        }
        if let (NodeRole::Block, Some(seed)) = (check.role, check.seed) {
            if !verify_checksum(raw, seed) {
                return Err(corrupt(CorruptionKind::ChecksumMismatch));
            }
        }
        Ok(node)
    }

    fn entries_valid(&self, geometry: &Geometry) -> bool {
        match &self.entries {
            Entries::Leaf(extents) => {
                let mut prev_end: Option<u64> = None;
                for ext in extents {
                    if ext.len == 0 || !geometry.extent_in_bounds(ext) {
                        return false;
                    }
                    if prev_end.is_some_and(|end| u64::from(ext.logical) < end) {
                        return false;
                    }
                    prev_end = Some(ext.end());
                }
                true
            }
            Entries::Index(indexes) => {
                let mut prev: Option<Lblk> = None;
                for idx in indexes {
                    if !geometry.block_in_bounds(idx.child) {
                        return false;
                    }
                    if prev.is_some_and(|p| idx.logical <= p) {
                        return false;
                    }
                    prev = Some(idx.logical);
                }
                true
            }
        }
    }

    /// Encodes header and entries into `dst`, zeroing unused slots.
    pub fn encode_into(&self, dst: &mut [u8]) -> Result<()> {
        let slots = usize::from(self.max);
        if self.len() > slots {
            return Err(ExtentError::corrupt(CorruptionKind::NodeFull, None));
        }
        if dst.len() < HEADER_LEN + slots * ENTRY_LEN {
            return Err(ExtentError::Invalid("node buffer too small"));
        }
        put_u16(dst, header::MAGIC, EXTENT_MAGIC);
        put_u16(dst, header::ENTRIES, self.len() as u16);
        put_u16(dst, header::MAX, self.max);
        put_u16(dst, header::DEPTH, self.depth);
        put_u32(dst, header::GENERATION, self.generation);
        dst[HEADER_LEN..HEADER_LEN + slots * ENTRY_LEN].fill(0);
        match &self.entries {
            Entries::Leaf(extents) => {
                for (i, ext) in extents.iter().enumerate() {
                    let at = HEADER_LEN + i * ENTRY_LEN;
                    put_u32(dst, shift(leaf_entry::BLOCK, at), ext.logical);
                    put_u16(dst, shift(leaf_entry::LEN, at), ext.raw_len());
                    put_u16(dst, shift(leaf_entry::START_HI, at), (ext.physical >> 32) as u16);
                    put_u32(dst, shift(leaf_entry::START_LO, at), ext.physical as u32);
                }
            }
            Entries::Index(indexes) => {
                for (i, idx) in indexes.iter().enumerate() {
                    let at = HEADER_LEN + i * ENTRY_LEN;
                    put_u32(dst, shift(index_entry::BLOCK, at), idx.logical);
                    put_u32(dst, shift(index_entry::LEAF_LO, at), idx.child as u32);
                    put_u16(dst, shift(index_entry::LEAF_HI, at), (idx.child >> 32) as u16);
                    put_u16(dst, shift(index_entry::UNUSED, at), 0);
                }
            }
        }
        Ok(())
    }
}

fn tail_offset(max: u16) -> usize {
    HEADER_LEN + usize::from(max) * ENTRY_LEN
}

/// Checksum over the header and all `max` entry slots.
pub fn compute_checksum(raw: &[u8], seed: u32) -> Option<u32> {
    if raw.len() < HEADER_LEN {
        return None;
    }
    let end = tail_offset(get_u16(raw, header::MAX));
    raw.get(..end).map(|payload| node_crc32(seed, payload))
}

/// Writes the trailer of a block node. Must follow every entry change.
pub fn set_checksum(raw: &mut [u8], seed: u32) -> Result<()> {
    let crc = compute_checksum(raw, seed).ok_or(ExtentError::Invalid("node buffer too small"))?;
    let at = tail_offset(get_u16(raw, header::MAX));
    if at + TAIL_LEN > raw.len() {
        return Err(ExtentError::Invalid("node buffer too small"));
    }
    put_u32(raw, at..at + TAIL_LEN, crc);
    Ok(())
}

/// True if the trailer matches the node contents.
pub fn verify_checksum(raw: &[u8], seed: u32) -> bool {
    let Some(crc) = compute_checksum(raw, seed) else {
        return false;
    };
    let at = tail_offset(get_u16(raw, header::MAX));
    raw.get(at..at + TAIL_LEN)
        .is_some_and(|tail| get_u32(tail, 0..TAIL_LEN) == crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            block_size: 128,
            first_data_block: 1,
            block_count: 10_000,
            checksums: true,
        }
    }

    fn leaf(extents: Vec<Extent>, max: u16) -> Node {
        Node {
            max,
            depth: 0,
            generation: 0,
            entries: Entries::Leaf(extents),
        }
    }

    fn check<'a>(geometry: &'a Geometry, role: NodeRole, seed: Option<u32>) -> NodeCheck<'a> {
        NodeCheck {
            role,
            depth: 0,
            geometry,
            seed,
            block: Some(7),
        }
    }

    #[test]
    fn capacities_follow_block_size() {
        let g = geometry();
        assert_eq!(g.capacity(NodeRole::Root), 4);
        assert_eq!(g.capacity(NodeRole::Block), 9);
        let big = Geometry {
            block_size: 4096,
            ..g
        };
        assert_eq!(big.capacity(NodeRole::Block), 340);
    }

    #[test]
    fn unwritten_flag_lives_in_length_top_bit() {
        let g = geometry();
        let node = leaf(
            vec![
                Extent::new(0, 32768, 100),
                Extent::new_unwritten(40_000, 5, 40_000 % 9_000),
            ],
            9,
        );
        let wide = Geometry {
            block_count: 1 << 20,
            ..g
        };
        let mut raw = vec![0u8; 128];
        node.encode_into(&mut raw).unwrap();
        assert_eq!(get_u16(&raw, shift(leaf_entry::LEN, HEADER_LEN)), 32768);
        assert_eq!(
            get_u16(&raw, shift(leaf_entry::LEN, HEADER_LEN + ENTRY_LEN)),
            32768 + 5
        );
        let decoded = Node::parse_and_validate(&raw, &check(&wide, NodeRole::Block, None)).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn validation_reports_first_violated_invariant() {
        let g = geometry();
        let node = leaf(vec![Extent::new(0, 4, 10), Extent::new(10, 2, 20)], 9);
        let mut raw = vec![0u8; 128];
        node.encode_into(&mut raw).unwrap();
        set_checksum(&mut raw, 5).unwrap();
        let ok = Node::parse_and_validate(&raw, &check(&g, NodeRole::Block, Some(5)));
        assert!(ok.is_ok());

        let kind = |raw: &[u8], role, seed| {
            Node::parse_and_validate(raw, &check(&g, role, seed))
                .unwrap_err()
                .corruption_kind()
        };

        let mut bad = raw.clone();
        bad[0] = 0;
        assert_eq!(kind(&bad, NodeRole::Block, None), Some(CorruptionKind::BadMagic));

        let mut bad = raw.clone();
        put_u16(&mut bad, header::DEPTH, 1);
        assert_eq!(kind(&bad, NodeRole::Block, None), Some(CorruptionKind::UnexpectedDepth));

        let mut bad = raw.clone();
        put_u16(&mut bad, header::MAX, 0);
        assert_eq!(kind(&bad, NodeRole::Block, None), Some(CorruptionKind::InvalidMax));

        assert_eq!(kind(&raw, NodeRole::Root, None), Some(CorruptionKind::MaxTooLarge));

        let mut bad = raw.clone();
        put_u16(&mut bad, header::ENTRIES, 10);
        assert_eq!(kind(&bad, NodeRole::Block, None), Some(CorruptionKind::InvalidEntries));

        let mut bad = raw.clone();
        put_u32(&mut bad, shift(leaf_entry::BLOCK, HEADER_LEN + ENTRY_LEN), 2);
        assert_eq!(
            kind(&bad, NodeRole::Block, None),
            Some(CorruptionKind::InvalidExtentEntries)
        );

        let mut bad = raw.clone();
        put_u16(&mut bad, shift(leaf_entry::LEN, HEADER_LEN), 0);
        assert_eq!(
            kind(&bad, NodeRole::Block, None),
            Some(CorruptionKind::InvalidExtentEntries)
        );

        let mut bad = raw.clone();
        put_u32(&mut bad, shift(leaf_entry::START_LO, HEADER_LEN), 9_999);
        assert_eq!(
            kind(&bad, NodeRole::Block, None),
            Some(CorruptionKind::InvalidExtentEntries)
        );

        let mut bad = raw.clone();
        bad[HEADER_LEN + 3 * ENTRY_LEN] = 1;
        assert_eq!(
            kind(&bad, NodeRole::Block, Some(5)),
            Some(CorruptionKind::ChecksumMismatch)
        );
        assert!(Node::parse_and_validate(&bad, &check(&g, NodeRole::Block, None)).is_ok());
    }

    #[test]
    fn index_entries_must_ascend_and_stay_on_device() {
        let g = geometry();
        let node = Node {
            max: 9,
            depth: 1,
            generation: 3,
            entries: Entries::Index(vec![
                IndexEntry {
                    logical: 0,
                    child: 50,
                },
                IndexEntry {
                    logical: 100,
                    child: 1 << 33,
                },
            ]),
        };
        let mut raw = vec![0u8; 128];
        node.encode_into(&mut raw).unwrap();
        let mut ctx = check(&g, NodeRole::Block, None);
        ctx.depth = 1;
        let err = Node::parse_and_validate(&raw, &ctx).unwrap_err();
        assert_eq!(err.corruption_kind(), Some(CorruptionKind::InvalidExtentEntries));

        let wide = Geometry {
            block_count: 1 << 40,
            ..g
        };
        ctx.geometry = &wide;
        let decoded = Node::parse_and_validate(&raw, &ctx).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn encode_rejects_overfull_node() {
        let node = leaf(vec![Extent::new(0, 1, 10); 5], 4);
        let mut raw = vec![0u8; ROOT_LEN];
        assert!(node.encode_into(&mut raw).is_err());
    }
}
