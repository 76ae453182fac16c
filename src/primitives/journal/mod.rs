#![forbid(unsafe_code)]

//! Transaction bookkeeping consumed by the extent engine.
//!
//! The engine never logs or replays anything itself. It asks the journal for
//! write access before touching a persisted node, marks the node dirty after
//! every change and asks for more credits before large steps. [`MemJournal`]
//! enforces that protocol in memory and hands committed buffers to the block
//! cache for write-back.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::primitives::pager::{BlockBuffer, BlockCache};
use crate::types::{ExtentError, InodeNo, Pblk, Result};

/// Journal contract consumed by the extent engine.
pub trait Journal: Send + Sync {
    /// Must precede the first change to `buf` inside a transaction.
    fn get_write_access(&self, buf: &BlockBuffer) -> Result<()>;
    /// Records that `buf` changed.
    fn mark_dirty(&self, buf: &BlockBuffer) -> Result<()>;
    /// Records that the inode holding the inline root changed.
    fn mark_inode_dirty(&self, ino: InodeNo) -> Result<()>;
    /// Reserves `credits` more blocks. `Err(Retry)` restarts the transaction.
    fn extend_transaction(&self, credits: u32) -> Result<()>;
}

/// Tuning knobs for [`MemJournal`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalOptions {
    /// Credits granted when a transaction starts.
    pub initial_credits: u32,
    /// Upper bound a transaction may be extended to before it must restart.
    pub max_credits: u32,
    /// Force a restart on every n-th extension request (0 disables).
    pub restart_every: u32,
    /// Keep an ordered event log for inspection.
    pub record_events: bool,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            initial_credits: 64,
            max_credits: 4096,
            restart_every: 0,
            record_events: false,
        }
    }
}

/// One protocol event, in call order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JournalEvent {
    /// Write access granted on a block.
    Access(Pblk),
    /// Block marked dirty.
    Dirty(Pblk),
    /// Inode marked dirty.
    InodeDirty(InodeNo),
    /// Credits extended in place.
    Extend(u32),
    /// Transaction committed and restarted.
    Restart,
}

/// Summary of a committed transaction.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CommitSummary {
    /// Transaction id that was closed.
    pub tid: u64,
    /// Distinct blocks dirtied.
    pub blocks: usize,
    /// Distinct inodes dirtied.
    pub inodes: usize,
}

#[derive(Default)]
struct TxnState {
    tid: u64,
    credits: u32,
    extensions: u64,
    access: HashSet<Pblk>,
    dirty_blocks: HashSet<Pblk>,
    dirty_inodes: HashSet<InodeNo>,
    restarts: u64,
    events: Vec<JournalEvent>,
}

/// In-memory journal that enforces the access-then-dirty protocol.
pub struct MemJournal {
    options: JournalOptions,
    cache: Option<Arc<BlockCache>>,
    state: Mutex<TxnState>,
}

impl MemJournal {
    /// Creates a journal that only tracks state.
    pub fn new(options: JournalOptions) -> Self {
        let state = TxnState {
            credits: options.initial_credits,
            ..TxnState::default()
        };
        Self {
            options,
            cache: None,
            state: Mutex::new(state),
        }
    }

    /// Creates a journal that flushes `cache` on every commit.
    pub fn with_cache(options: JournalOptions, cache: Arc<BlockCache>) -> Self {
        let mut journal = Self::new(options);
        journal.cache = Some(cache);
        journal
    }

    fn close(&self, state: &mut TxnState) -> CommitSummary {
        let summary = CommitSummary {
            tid: state.tid,
            blocks: state.dirty_blocks.len(),
            inodes: state.dirty_inodes.len(),
        };
        state.tid += 1;
        state.credits = self.options.initial_credits;
        state.access.clear();
        state.dirty_blocks.clear();
        state.dirty_inodes.clear();
        summary
    }

    /// Closes the running transaction and writes dirty buffers back.
    pub fn commit(&self) -> Result<CommitSummary> {
        let summary = {
            let mut state = self.state.lock();
            self.close(&mut state)
        };
        if let Some(cache) = &self.cache {
            cache.flush()?;
        }
        tracing::debug!(
            target: "extmap::journal",
            tid = summary.tid,
            blocks = summary.blocks,
            inodes = summary.inodes,
            "committed transaction"
        );
        Ok(summary)
    }

    /// Id of the running transaction.
    pub fn tid(&self) -> u64 {
        self.state.lock().tid
    }

    /// Number of forced restarts so far.
    pub fn restarts(&self) -> u64 {
        self.state.lock().restarts
    }

    /// Credits available to the running transaction.
    pub fn credits(&self) -> u32 {
        self.state.lock().credits
    }

    /// True if `block` was dirtied in the running transaction.
    pub fn is_block_dirty(&self, block: Pblk) -> bool {
        self.state.lock().dirty_blocks.contains(&block)
    }

    /// Drains the recorded event log.
    pub fn take_events(&self) -> Vec<JournalEvent> {
        std::mem::take(&mut self.state.lock().events)
    }

    fn record(&self, state: &mut TxnState, event: JournalEvent) {
        if self.options.record_events {
            state.events.push(event);
        }
    }
}

impl Journal for MemJournal {
    fn get_write_access(&self, buf: &BlockBuffer) -> Result<()> {
        let mut state = self.state.lock();
        state.access.insert(buf.block());
        self.record(&mut state, JournalEvent::Access(buf.block()));
        Ok(())
    }

    fn mark_dirty(&self, buf: &BlockBuffer) -> Result<()> {
        let mut state = self.state.lock();
        if !state.access.contains(&buf.block()) {
            tracing::warn!(
                target: "extmap::journal",
                block = buf.block(),
                "buffer dirtied without write access"
            );
            return Err(ExtentError::Invalid("buffer dirtied without write access"));
        }
        buf.mark_dirty();
        state.dirty_blocks.insert(buf.block());
        self.record(&mut state, JournalEvent::Dirty(buf.block()));
        Ok(())
    }

    fn mark_inode_dirty(&self, ino: InodeNo) -> Result<()> {
        let mut state = self.state.lock();
        state.dirty_inodes.insert(ino);
        self.record(&mut state, JournalEvent::InodeDirty(ino));
        Ok(())
    }

    fn extend_transaction(&self, credits: u32) -> Result<()> {
        let restart = {
            let mut state = self.state.lock();
            state.extensions += 1;
            let forced = self.options.restart_every > 0
                && state.extensions % u64::from(self.options.restart_every) == 0;
            if !forced && state.credits >= credits {
                return Ok(());
            }
            if !forced && credits <= self.options.max_credits {
                state.credits = credits.max(state.credits);
                self.record(&mut state, JournalEvent::Extend(credits));
                return Ok(());
            }
            state.restarts += 1;
            self.record(&mut state, JournalEvent::Restart);
            self.close(&mut state)
        };
        if let Some(cache) = &self.cache {
            cache.flush()?;
        }
        tracing::debug!(
            target: "extmap::journal",
            tid = restart.tid,
            credits,
            "transaction restart requested"
        );
        Err(ExtentError::Retry)
    }
}
