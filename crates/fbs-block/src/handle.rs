use crate::cache::BlockCell;
use crate::device::ByteDevice;
use crate::store::BlockStore;
use fbs_error::Result;
use fbs_types::BlockIndex;
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A pinned reference to one cached block.
///
/// While at least one handle for a block is alive the block cannot be
/// evicted. Dropping the handle (or calling [`release`](Self::release))
/// gives the reference back; the last release makes the block eligible for
/// eviction again. [`Clone`] takes an additional reference.
///
/// Buffer guards returned by [`data`](Self::data) and
/// [`data_mut`](Self::data_mut) must be dropped before calling
/// [`BlockStore::flush`], which reads every queued buffer.
pub struct BlockHandle<'s, D: ByteDevice> {
    store: &'s BlockStore<D>,
    index: BlockIndex,
    cell: Arc<BlockCell>,
}

impl<'s, D: ByteDevice> BlockHandle<'s, D> {
    pub(crate) fn new(store: &'s BlockStore<D>, index: BlockIndex, cell: Arc<BlockCell>) -> Self {
        Self { store, index, cell }
    }

    #[must_use]
    pub fn index(&self) -> BlockIndex {
        self.index
    }

    /// Shared view of the block's bytes.
    #[must_use]
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        self.cell.read()
    }

    /// Exclusive view of the block's bytes for in-place mutation.
    ///
    /// Changes reach the file only after [`mark_dirty`](Self::mark_dirty)
    /// and a flush.
    #[must_use]
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        self.cell.write()
    }

    /// Hang `value` off the cached block, replacing any earlier attachment.
    ///
    /// Every handle to the block sees the same attachment. It is kept while
    /// the block stays resident and dropped when the block is evicted, so a
    /// later [`get`](BlockStore::get) that has to read the block again
    /// starts without one. Flushes leave it alone.
    pub fn set_attachment<T: Any + Send + Sync>(&self, value: T) {
        drop(self.cell.set_attachment(Arc::new(value)));
    }

    /// The current attachment if there is one of type `T`.
    #[must_use]
    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.cell.attachment()?.downcast::<T>().ok()
    }

    /// Remove and return the attachment, whatever its type.
    pub fn clear_attachment(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.cell.clear_attachment()
    }

    /// Queue this block for the next flush cycle. Idempotent.
    pub fn mark_dirty(&self) {
        self.store.mark_dirty(self.index);
    }

    /// Queue this block and flush everything queued.
    pub fn flush(&self) -> Result<()> {
        self.mark_dirty();
        self.store.flush()
    }

    /// Give the reference back.
    pub fn release(self) {
        drop(self);
    }
}

impl<D: ByteDevice> Clone for BlockHandle<'_, D> {
    fn clone(&self) -> Self {
        self.store.reacquire(self.index);
        Self {
            store: self.store,
            index: self.index,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<D: ByteDevice> Drop for BlockHandle<'_, D> {
    fn drop(&mut self) {
        self.store.release(self.index);
    }
}

impl<D: ByteDevice> fmt::Debug for BlockHandle<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
