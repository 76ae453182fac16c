//! Extent-status cache: delayed-allocation ranges and known holes.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{InodeNo, Lblk};

/// Range of logical blocks written but not yet allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DelayedRange {
    /// First logical block.
    pub start: Lblk,
    /// Number of blocks.
    pub len: u32,
}

impl DelayedRange {
    /// One past the last block.
    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.len)
    }
}

/// Status cache contract consumed by the extent engine.
pub trait ExtentStatusCache: Send + Sync {
    /// First delayed range of `ino` that ends after `from`.
    fn find_delayed(&self, ino: InodeNo, from: Lblk) -> Option<DelayedRange>;
    /// Cached hole covering `lblk`, as (start, len).
    fn cached_hole(&self, ino: InodeNo, lblk: Lblk) -> Option<(Lblk, u32)>;
    /// Remembers that `[start, start + len)` is a hole.
    fn insert_hole(&self, ino: InodeNo, start: Lblk, len: u32);
    /// Forgets everything known about `[start, start + len)`.
    fn invalidate(&self, ino: InodeNo, start: Lblk, len: u64);
}

#[derive(Default)]
struct InodeStatus {
    delayed: BTreeMap<Lblk, u32>,
    holes: BTreeMap<Lblk, u32>,
}

/// Trims every range of `map` that intersects `[start, end)`.
fn carve(map: &mut BTreeMap<Lblk, u32>, start: u64, end: u64) {
    let hits: Vec<(Lblk, u32)> = map
        .range(..=Lblk::try_from(end.saturating_sub(1)).unwrap_or(Lblk::MAX))
        .filter(|(s, l)| u64::from(**s) + u64::from(**l) > start)
        .map(|(s, l)| (*s, *l))
        .collect();
    for (s, l) in hits {
        map.remove(&s);
        let r_start = u64::from(s);
        let r_end = r_start + u64::from(l);
        if r_start < start {
            map.insert(s, (start - r_start) as u32);
        }
        if r_end > end {
            map.insert(end as Lblk, (r_end - end) as u32);
        }
    }
}

fn covering(map: &BTreeMap<Lblk, u32>, lblk: Lblk) -> Option<(Lblk, u32)> {
    map.range(..=lblk)
        .next_back()
        .filter(|(s, l)| u64::from(**s) + u64::from(**l) > u64::from(lblk))
        .map(|(s, l)| (*s, *l))
}

/// In-memory status cache shared by all trees of a volume.
#[derive(Default)]
pub struct StatusTree {
    inodes: Mutex<HashMap<InodeNo, InodeStatus>>,
}

impl StatusTree {
    /// Records a delayed-allocation range.
    pub fn add_delayed(&self, ino: InodeNo, start: Lblk, len: u32) {
        if len == 0 {
            return;
        }
        let mut inodes = self.inodes.lock();
        let status = inodes.entry(ino).or_default();
        let end = u64::from(start) + u64::from(len);
        carve(&mut status.delayed, u64::from(start), end);
        carve(&mut status.holes, u64::from(start), end);
        status.delayed.insert(start, len);
    }

    /// Every delayed range of `ino`, in order.
    pub fn delayed_ranges(&self, ino: InodeNo) -> Vec<DelayedRange> {
        self.inodes
            .lock()
            .get(&ino)
            .map(|s| {
                s.delayed
                    .iter()
                    .map(|(start, len)| DelayedRange {
                        start: *start,
                        len: *len,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of cached holes for `ino`.
    pub fn hole_count(&self, ino: InodeNo) -> usize {
        self.inodes.lock().get(&ino).map_or(0, |s| s.holes.len())
    }

    /// Drops all state for `ino`.
    pub fn clear(&self, ino: InodeNo) {
        self.inodes.lock().remove(&ino);
    }
}

impl ExtentStatusCache for StatusTree {
    fn find_delayed(&self, ino: InodeNo, from: Lblk) -> Option<DelayedRange> {
        let inodes = self.inodes.lock();
        let status = inodes.get(&ino)?;
        if let Some((start, len)) = covering(&status.delayed, from) {
            return Some(DelayedRange { start, len });
        }
        status
            .delayed
            .range(from..)
            .next()
            .map(|(start, len)| DelayedRange {
                start: *start,
                len: *len,
            })
    }

    fn cached_hole(&self, ino: InodeNo, lblk: Lblk) -> Option<(Lblk, u32)> {
        let inodes = self.inodes.lock();
        covering(&inodes.get(&ino)?.holes, lblk)
    }

    fn insert_hole(&self, ino: InodeNo, start: Lblk, len: u32) {
        if len == 0 {
            return;
        }
        let mut inodes = self.inodes.lock();
        let status = inodes.entry(ino).or_default();
        let end = u64::from(start) + u64::from(len);
        carve(&mut status.holes, u64::from(start), end);
        status.holes.insert(start, len);
    }

    fn invalidate(&self, ino: InodeNo, start: Lblk, len: u64) {
        if len == 0 {
            return;
        }
        let mut inodes = self.inodes.lock();
        if let Some(status) = inodes.get_mut(&ino) {
            let end = u64::from(start) + len;
            carve(&mut status.delayed, u64::from(start), end);
            carve(&mut status.holes, u64::from(start), end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INO: InodeNo = InodeNo(12);

    #[test]
    fn holes_are_served_until_invalidated() {
        let status = StatusTree::default();
        status.insert_hole(INO, 100, 50);
        assert_eq!(status.cached_hole(INO, 120), Some((100, 50)));
        assert_eq!(status.cached_hole(INO, 150), None);
        status.invalidate(INO, 110, 10);
        assert_eq!(status.cached_hole(INO, 115), None);
        assert_eq!(status.cached_hole(INO, 105), Some((100, 10)));
        assert_eq!(status.cached_hole(INO, 125), Some((120, 30)));
    }

    #[test]
    fn delayed_lookup_finds_covering_or_next() {
        let status = StatusTree::default();
        status.add_delayed(INO, 10, 5);
        status.add_delayed(INO, 40, 5);
        assert_eq!(
            status.find_delayed(INO, 12),
            Some(DelayedRange { start: 10, len: 5 })
        );
        assert_eq!(
            status.find_delayed(INO, 15),
            Some(DelayedRange { start: 40, len: 5 })
        );
        assert_eq!(status.find_delayed(INO, 45), None);
        assert_eq!(status.find_delayed(InodeNo(99), 0), None);
    }

    #[test]
    fn delayed_write_clears_overlapping_hole() {
        let status = StatusTree::default();
        status.insert_hole(INO, 0, 100);
        status.add_delayed(INO, 20, 10);
        assert_eq!(status.cached_hole(INO, 25), None);
        assert_eq!(status.hole_count(INO), 2);
        status.invalidate(INO, 0, u64::from(u32::MAX) + 1);
        assert!(status.delayed_ranges(INO).is_empty());
        assert_eq!(status.hole_count(INO), 0);
    }
}
