//! Splitting and state conversion of unwritten extents.

use super::super::super::node::{Extent, MAX_EXTENT_LEN};
use super::super::super::stats::ExtentEvent;
use super::path::ExtentPath;
use super::types::{InsertFlags, SplitFlags};
use super::ExtentTree;
use crate::types::{CorruptionKind, ExtentError, Lblk, Result};

impl ExtentTree {
    fn cursor_extent(path: &ExtentPath) -> Result<(usize, Extent)> {
        let leaf = path.leaf();
        let cursor = leaf.cursor_or_corrupt()?;
        let ex = leaf
            .extents()?
            .get(cursor)
            .copied()
            .ok_or(ExtentError::corrupt(CorruptionKind::MissingCursor, leaf.block()))?;
        Ok((cursor, ex))
    }

    /// Zero-fills the blocks behind `ext`.
    pub(super) fn zeroout(&self, ext: &Extent) -> Result<()> {
        self.env.cache.zeroout(ext.physical, u32::from(ext.len))?;
        self.env
            .status
            .invalidate(self.ino, ext.logical, u64::from(ext.len));
        tracing::trace!(
            target: "extmap::extent::split",
            ino = self.ino.0,
            logical = ext.logical,
            physical = ext.physical,
            len = ext.len,
            "zeroed extent"
        );
        self.record(ExtentEvent::Zeroout {
            blocks: u32::from(ext.len),
        });
        Ok(())
    }

    /// Rewrites the extent starting at `ext.logical` to `ext`.
    fn restore_extent(&mut self, path: &mut ExtentPath, ext: &Extent) -> Result<()> {
        *path = self.locate(ext.logical)?;
        let (cursor, current) = Self::cursor_extent(path)?;
        if current.logical != ext.logical {
            return Err(ExtentError::corrupt(
                CorruptionKind::InvalidExtentEntries,
                path.leaf().block(),
            ));
        }
        let depth = path.depth();
        self.get_access(path, depth)?;
        path.leaf_mut().extents_mut()?[cursor] = *ext;
        self.dirty(path, depth)
    }

    /// Puts `orig` back after a failed split and returns `err`.
    fn fix_extent_len(&mut self, path: &mut ExtentPath, orig: &Extent, err: ExtentError) -> Result<()> {
        if let Err(restore) = self.restore_extent(path, orig) {
            tracing::warn!(
                target: "extmap::extent::split",
                ino = self.ino.0,
                logical = orig.logical,
                error = %restore,
                "could not restore extent after failed split"
            );
        }
        Err(err)
    }

    /// Splits the cursor extent so that a new extent starts at `split`.
    ///
    /// When `split` is the extent's first block only its state changes.
    /// If the second half cannot be inserted for lack of space and
    /// `may_zeroout` is set, the relevant blocks are zero-filled and the
    /// whole extent becomes initialized instead.
    pub(super) fn split_in_path(
        &mut self,
        path: &mut ExtentPath,
        split: Lblk,
        split_flags: SplitFlags,
        flags: InsertFlags,
    ) -> Result<()> {
        if split_flags.data_valid1 && split_flags.data_valid2 {
            return Err(ExtentError::Invalid("only one split half may hold valid data"));
        }
        let (cursor, ex) = Self::cursor_extent(path)?;
        if !ex.contains(split) {
            return Err(ExtentError::Invalid("split point outside the extent"));
        }
        let depth = path.depth();
        self.get_access(path, depth)?;

        if split == ex.logical {
            path.leaf_mut().extents_mut()?[cursor].unwritten = split_flags.mark_uninit2;
            if !flags.pre_io {
                self.try_merge(path, cursor)?;
            }
            let depth = path.depth();
            return self.dirty(path, depth);
        }

        let orig = ex;
        let head = (split - ex.logical) as u16;
        let first = Extent {
            len: head,
            unwritten: split_flags.mark_uninit1,
            ..ex
        };
        path.leaf_mut().extents_mut()?[cursor] = first;
        if let Err(err) = self.dirty(path, depth) {
            return self.fix_extent_len(path, &orig, err);
        }
        let second = Extent {
            logical: split,
            len: ex.len - head,
            physical: ex.physical + u64::from(head),
            unwritten: split_flags.mark_uninit2,
        };
        tracing::trace!(
            target: "extmap::extent::split",
            ino = self.ino.0,
            logical = ex.logical,
            split,
            "splitting extent"
        );
        match self.insert_extent_path(path, &second, flags) {
            Ok(()) => {
                self.record(ExtentEvent::ExtentSplit);
                Ok(())
            }
            Err(ExtentError::NoSpace) if split_flags.may_zeroout => {
                let zero = if split_flags.data_valid1 {
                    second
                } else if split_flags.data_valid2 {
                    first
                } else {
                    orig
                };
                tracing::debug!(
                    target: "extmap::extent::split",
                    ino = self.ino.0,
                    logical = orig.logical,
                    len = orig.len,
                    "no space to split, zeroing instead"
                );
                if let Err(err) = self.zeroout(&zero) {
                    return self.fix_extent_len(path, &orig, err);
                }
                let whole = Extent {
                    unwritten: false,
                    ..orig
                };
                if let Err(err) = self.restore_merged(path, &whole) {
                    return self.fix_extent_len(path, &orig, err);
                }
                Ok(())
            }
            Err(err) => self.fix_extent_len(path, &orig, err),
        }
    }

    fn restore_merged(&mut self, path: &mut ExtentPath, ext: &Extent) -> Result<()> {
        *path = self.locate(ext.logical)?;
        let (cursor, current) = Self::cursor_extent(path)?;
        if current.logical != ext.logical {
            return Err(ExtentError::corrupt(
                CorruptionKind::InvalidExtentEntries,
                path.leaf().block(),
            ));
        }
        let depth = path.depth();
        self.get_access(path, depth)?;
        path.leaf_mut().extents_mut()?[cursor] = *ext;
        self.try_merge(path, cursor)?;
        let depth = path.depth();
        self.dirty(path, depth)
    }

    /// Isolates `[lblk, lblk + len)` inside the cursor extent with at most
    /// two splits. Returns the blocks from `lblk` to the end of the isolated
    /// range.
    pub(super) fn split_extent(
        &mut self,
        path: &mut ExtentPath,
        lblk: Lblk,
        len: u32,
        split_flags: SplitFlags,
        flags: InsertFlags,
    ) -> Result<u32> {
        let (_, ex) = Self::cursor_extent(path)?;
        let map_end = u64::from(lblk) + u64::from(len);
        let mut allocated = len;
        if map_end < ex.end() {
            let tail_flags = SplitFlags {
                may_zeroout: split_flags.may_zeroout,
                mark_uninit1: ex.unwritten,
                mark_uninit2: ex.unwritten,
                data_valid1: split_flags.data_valid2,
                data_valid2: false,
            };
            self.split_in_path(
                path,
                map_end as Lblk,
                tail_flags,
                InsertFlags {
                    pre_io: true,
                    ..flags
                },
            )?;
        } else {
            allocated = (ex.end() - u64::from(lblk)) as u32;
        }

        // The first split may have moved the extent to another leaf or
        // zeroed it whole.
        *path = self.locate(lblk)?;
        let (_, ex) = Self::cursor_extent(path)?;
        if lblk >= ex.logical {
            let head_flags = SplitFlags {
                data_valid2: split_flags.data_valid2,
                mark_uninit1: ex.unwritten,
                may_zeroout: ex.unwritten && split_flags.may_zeroout,
                mark_uninit2: ex.unwritten && split_flags.mark_uninit2,
                data_valid1: false,
            };
            self.split_in_path(path, lblk, head_flags, flags)?;
        }
        Ok(allocated)
    }

    /// Largest unwritten extent (in blocks) that is zero-filled instead of
    /// split, or zero when zero-out is not allowed.
    fn max_zeroout_blocks(&self) -> u32 {
        let bytes = u64::from(self.options.max_zeroout_kb) * 1024;
        (bytes / self.env.geometry.block_size as u64).min(u64::from(u32::MAX)) as u32
    }

    /// Turns `[lblk, lblk + len)` of the unwritten cursor extent into
    /// initialized blocks ahead of a buffered write. Returns the number of
    /// initialized blocks starting at `lblk`.
    pub(super) fn convert_to_initialized(
        &mut self,
        path: &mut ExtentPath,
        lblk: Lblk,
        len: u32,
    ) -> Result<u32> {
        let depth = path.depth();
        let (cursor, ex) = Self::cursor_extent(path)?;
        if !ex.unwritten || !ex.contains(lblk) {
            return Err(ExtentError::Invalid("conversion needs a covering unwritten extent"));
        }
        let map_end = u64::from(lblk) + u64::from(len);
        let eof = self.size_blocks.max(map_end);
        let count = path.leaf().node.len();

        // Hand the written blocks to an initialized neighbour in the same
        // leaf when both abut logically and physically.
        let transfer = if lblk == ex.logical && len < u32::from(ex.len) && cursor > 0 {
            let prev = path.leaf().extents()?[cursor - 1];
            (!prev.unwritten
                && prev.end() == u64::from(ex.logical)
                && prev.physical_end() == ex.physical
                && u32::from(prev.len) + len <= u32::from(MAX_EXTENT_LEN))
                .then_some(cursor - 1)
        } else if map_end == ex.end() && len < u32::from(ex.len) && cursor + 1 < count {
            let next = path.leaf().extents()?[cursor + 1];
            (!next.unwritten
                && map_end == u64::from(next.logical)
                && ex.physical_end() == next.physical
                && u32::from(next.len) + len <= u32::from(MAX_EXTENT_LEN))
                .then_some(cursor + 1)
        } else {
            None
        };
        if let Some(abut) = transfer {
            self.get_access(path, depth)?;
            let moved = len as u16;
            let leaf = path.leaf_mut();
            let extents = leaf.extents_mut()?;
            if abut < cursor {
                let cur = &mut extents[cursor];
                cur.logical += len;
                cur.physical += u64::from(len);
                cur.len -= moved;
                extents[abut].len += moved;
            } else {
                extents[cursor].len -= moved;
                let next = &mut extents[abut];
                next.logical -= len;
                next.physical -= u64::from(len);
                next.len += moved;
            }
            leaf.cursor = Some(abut);
            self.dirty(path, depth)?;
            tracing::trace!(
                target: "extmap::extent::split",
                ino = self.ino.0,
                lblk,
                len,
                "moved written blocks into neighbour"
            );
            return Ok(len);
        }

        let mut allocated = (ex.end() - u64::from(lblk)) as u32;
        let may_zeroout = ex.end() <= eof;
        let max_zeroout = if may_zeroout {
            self.max_zeroout_blocks()
        } else {
            0
        };

        if max_zeroout > 0 && u32::from(ex.len) <= max_zeroout {
            self.zeroout(&ex)?;
            self.get_access(path, depth)?;
            path.leaf_mut().extents_mut()?[cursor].unwritten = false;
            self.try_merge(path, cursor)?;
            let depth = path.depth();
            self.dirty(path, depth)?;
            return Ok(allocated);
        }

        let mut split_lblk = lblk;
        let mut split_len = len;
        let mut head_zeroed = false;
        if max_zeroout > 0 && allocated > len {
            if allocated <= max_zeroout {
                // Zero the tail and convert it together with the range.
                self.zeroout(&Extent::new(lblk, allocated as u16, ex.physical_at(lblk)))?;
                split_len = allocated;
            } else if lblk - ex.logical + len < max_zeroout {
                // Zero the head and convert it together with the range.
                if lblk != ex.logical {
                    self.zeroout(&Extent::new(
                        ex.logical,
                        (lblk - ex.logical) as u16,
                        ex.physical,
                    ))?;
                }
                split_lblk = ex.logical;
                split_len = lblk - ex.logical + len;
                head_zeroed = true;
            }
        }
        let split_flags = SplitFlags {
            may_zeroout,
            ..SplitFlags::default()
        };
        let split = self.split_extent(
            path,
            split_lblk,
            split_len,
            split_flags,
            InsertFlags {
                pre_io: false,
                nofail: true,
            },
        )?;
        allocated = if head_zeroed { len } else { split };
        Ok(allocated)
    }

    /// Isolates `[lblk, lblk + len)` as its own unwritten extent ahead of
    /// direct I/O, or ahead of its conversion when `converting`.
    pub(super) fn split_unwritten(
        &mut self,
        path: &mut ExtentPath,
        lblk: Lblk,
        len: u32,
        converting: bool,
    ) -> Result<u32> {
        let (_, ex) = Self::cursor_extent(path)?;
        let eof = self
            .size_blocks
            .max(u64::from(lblk) + u64::from(len));
        let split_flags = SplitFlags {
            may_zeroout: ex.end() <= eof,
            mark_uninit2: true,
            data_valid2: converting,
            ..SplitFlags::default()
        };
        self.split_extent(
            path,
            lblk,
            len,
            split_flags,
            InsertFlags {
                pre_io: true,
                nofail: true,
            },
        )
    }

    /// Marks `[lblk, lblk + len)` written once its data is on disk.
    pub(super) fn convert_endio(&mut self, path: &mut ExtentPath, lblk: Lblk, len: u32) -> Result<()> {
        let (_, ex) = Self::cursor_extent(path)?;
        if ex.logical != lblk || u32::from(ex.len) > len {
            tracing::debug!(
                target: "extmap::extent::split",
                ino = self.ino.0,
                extent = ex.logical,
                extent_len = ex.len,
                lblk,
                len,
                "conversion range differs from extent"
            );
            self.split_unwritten(path, lblk, len, true)?;
            *path = self.locate(lblk)?;
        }
        let (cursor, _) = Self::cursor_extent(path)?;
        let depth = path.depth();
        self.get_access(path, depth)?;
        path.leaf_mut().extents_mut()?[cursor].unwritten = false;
        self.try_merge(path, cursor)?;
        let depth = path.depth();
        self.dirty(path, depth)
    }
}
