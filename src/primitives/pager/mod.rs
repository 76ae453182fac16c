#![forbid(unsafe_code)]

//! Block buffer cache sitting between the extent engine and the device.

mod frame;

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use frame::{BlockBuffer, BufferHandle};

use crate::primitives::io::FileIo;
use crate::types::{ExtentError, Pblk, Result};

/// Buffer cache contract consumed by the extent engine.
pub trait BufferCache: Send + Sync {
    /// Size of one block in bytes.
    fn block_size(&self) -> usize;
    /// Returns a pinned buffer for `block`. Contents are not read yet.
    fn get_buffer(&self, block: Pblk) -> Result<BufferHandle>;
    /// Fills `buf` from the device unless it is already up to date.
    fn read_buffer(&self, buf: &BufferHandle) -> Result<()>;
    /// Writes zeroes over `count` blocks starting at `start`.
    fn zeroout(&self, start: Pblk, count: u32) -> Result<()>;
    /// Drops any cached copy of `block` without writing it back.
    fn forget(&self, block: Pblk);
}

/// Tuning knobs for [`BlockCache`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Number of blocks kept resident before clean, unpinned buffers are evicted.
    pub capacity_blocks: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity_blocks: 1024,
        }
    }
}

/// Snapshot of cache counters.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct CacheStatsSnapshot {
    /// Lookups satisfied from memory.
    pub hits: u64,
    /// Lookups that created a new buffer.
    pub misses: u64,
    /// Device reads issued.
    pub reads: u64,
    /// Device writes issued by flush or eviction.
    pub writes: u64,
    /// Buffers evicted.
    pub evictions: u64,
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

/// LRU write-back cache over a [`FileIo`] device.
pub struct BlockCache {
    io: Arc<dyn FileIo>,
    block_size: usize,
    capacity: usize,
    buffers: Mutex<LruCache<Pblk, Arc<BlockBuffer>>>,
    stats: CacheStats,
}

impl BlockCache {
    /// Creates a cache for `io` using `block_size` byte blocks.
    pub fn new(io: Arc<dyn FileIo>, block_size: usize, options: &CacheOptions) -> Self {
        Self {
            io,
            block_size,
            capacity: options.capacity_blocks.max(8),
            buffers: Mutex::new(LruCache::unbounded()),
            stats: CacheStats::default(),
        }
    }

    /// Underlying device.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.io
    }

    fn offset(&self, block: Pblk) -> Result<u64> {
        block
            .checked_mul(self.block_size as u64)
            .ok_or(ExtentError::Invalid("block offset overflow"))
    }

    fn write_back(&self, buf: &BlockBuffer) -> Result<()> {
        if !buf.clear_dirty() {
            return Ok(());
        }
        let data = buf.read();
        if let Err(err) = self.io.write_at(self.offset(buf.block())?, &data) {
            buf.mark_dirty();
            return Err(err);
        }
        self.stats.writes.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn evict_excess(&self, buffers: &mut LruCache<Pblk, Arc<BlockBuffer>>) -> Result<()> {
        while buffers.len() > self.capacity {
            let victim = buffers
                .iter()
                .rev()
                .find(|(_, buf)| buf.pin_count() == 0)
                .map(|(block, _)| *block);
            let Some(block) = victim else {
                break;
            };
            if let Some(buf) = buffers.pop(&block) {
                self.write_back(&buf)?;
                self.stats.evictions.fetch_add(1, AtomicOrdering::Relaxed);
                tracing::trace!(target: "extmap::cache", block, "evicted buffer");
            }
        }
        Ok(())
    }

    /// Writes every dirty buffer back to the device and returns how many were written.
    pub fn flush(&self) -> Result<usize> {
        let dirty: Vec<Arc<BlockBuffer>> = self
            .buffers
            .lock()
            .iter()
            .filter(|(_, buf)| buf.is_dirty())
            .map(|(_, buf)| Arc::clone(buf))
            .collect();
        for buf in &dirty {
            self.write_back(buf)?;
        }
        self.io.sync_all()?;
        tracing::debug!(target: "extmap::cache", written = dirty.len(), "flushed block cache");
        Ok(dirty.len())
    }

    /// Number of buffers currently resident.
    pub fn resident(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Number of resident buffers with at least one live handle.
    pub fn pinned(&self) -> usize {
        self.buffers
            .lock()
            .iter()
            .filter(|(_, buf)| buf.pin_count() > 0)
            .count()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(AtomicOrdering::Relaxed),
            misses: self.stats.misses.load(AtomicOrdering::Relaxed),
            reads: self.stats.reads.load(AtomicOrdering::Relaxed),
            writes: self.stats.writes.load(AtomicOrdering::Relaxed),
            evictions: self.stats.evictions.load(AtomicOrdering::Relaxed),
        }
    }
}

impl BufferCache for BlockCache {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn get_buffer(&self, block: Pblk) -> Result<BufferHandle> {
        let mut buffers = self.buffers.lock();
        if let Some(buf) = buffers.get(&block) {
            self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(BufferHandle::pin(Arc::clone(buf)));
        }
        self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
        let buf = Arc::new(BlockBuffer::new(block, self.block_size));
        let handle = BufferHandle::pin(Arc::clone(&buf));
        buffers.put(block, buf);
        self.evict_excess(&mut buffers)?;
        Ok(handle)
    }

    fn read_buffer(&self, buf: &BufferHandle) -> Result<()> {
        if buf.is_uptodate() {
            return Ok(());
        }
        let off = self.offset(buf.block())?;
        {
            let mut data = buf.write();
            self.io.read_at(off, &mut data)?;
        }
        buf.set_uptodate();
        self.stats.reads.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn zeroout(&self, start: Pblk, count: u32) -> Result<()> {
        let len = (count as u64)
            .checked_mul(self.block_size as u64)
            .ok_or(ExtentError::Invalid("zero-out length overflow"))?;
        self.io.write_zeroes(self.offset(start)?, len)?;
        let buffers = self.buffers.lock();
        for (block, buf) in buffers.iter() {
            if *block >= start && *block < start + count as u64 {
                buf.write().fill(0);
                buf.clear_dirty();
                buf.set_uptodate();
            }
        }
        tracing::trace!(target: "extmap::cache", start, count, "zeroed blocks");
        Ok(())
    }

    fn forget(&self, block: Pblk) {
        if let Some(buf) = self.buffers.lock().pop(&block) {
            buf.clear_dirty();
        }
    }
}
