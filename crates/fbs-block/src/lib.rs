#![forbid(unsafe_code)]
//! Cached, block-granular access to a flat byte file.
//!
//! A [`BlockStore`] views a [`ByteDevice`] as an array of fixed-size blocks.
//! [`BlockStore::get`] pins a block and returns a [`BlockHandle`]; misses
//! are served with one vectored read covering the configured prefetch
//! window. Dirty blocks are queued with [`BlockHandle::mark_dirty`] and
//! written by [`BlockStore::flush`] in runs of consecutive blocks, one
//! vectored write per run.
//!
//! Unreferenced blocks age through two generations (young, then old) and
//! are evicted from the old generation once the cache is over its soft cap.
//! Pinned, queued, and in-flight blocks are never evicted.

mod cache;
mod device;
mod handle;
mod store;
pub mod vectored;

pub use cache::CacheStats;
pub use device::{
    ByteDevice, FileByteDevice, IoKind, IoRecord, IoStats, MAX_STAGING_BYTES, MemByteDevice,
};
pub use handle::BlockHandle;
pub use store::{BlockStore, StoreInfo};
