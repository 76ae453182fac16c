use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::Pblk;

/// In-memory copy of one device block.
pub struct BlockBuffer {
    block: Pblk,
    data: RwLock<Box<[u8]>>,
    uptodate: AtomicBool,
    verified: AtomicBool,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl BlockBuffer {
    pub(crate) fn new(block: Pblk, block_size: usize) -> Self {
        Self {
            block,
            data: RwLock::new(vec![0u8; block_size].into_boxed_slice()),
            uptodate: AtomicBool::new(false),
            verified: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }

    /// Block number this buffer caches.
    pub fn block(&self) -> Pblk {
        self.block
    }

    /// Shared view of the block contents.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Exclusive view of the block contents. Clears the verified flag.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.verified.store(false, Ordering::Release);
        self.data.write()
    }

    /// True once the contents reflect the device (or were fully initialised).
    pub fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Acquire)
    }

    /// Marks the contents as valid.
    pub fn set_uptodate(&self) {
        self.uptodate.store(true, Ordering::Release);
    }

    /// True if the node in this buffer already passed validation.
    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    /// Records that the node passed validation.
    pub fn set_verified(&self) {
        self.verified.store(true, Ordering::Release);
    }

    /// True if the buffer holds changes not yet written back.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Flags the buffer for write-back.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Number of live handles pinning this buffer.
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }
}

/// Pinned reference to a cached block. Cloning pins again; dropping unpins.
pub struct BufferHandle {
    inner: Arc<BlockBuffer>,
}

impl BufferHandle {
    pub(crate) fn pin(inner: Arc<BlockBuffer>) -> Self {
        inner.pins.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Clone for BufferHandle {
    fn clone(&self) -> Self {
        Self::pin(Arc::clone(&self.inner))
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.inner.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Deref for BufferHandle {
    type Target = BlockBuffer;

    fn deref(&self) -> &BlockBuffer {
        &self.inner
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("block", &self.inner.block)
            .field("pins", &self.inner.pin_count())
            .finish()
    }
}
