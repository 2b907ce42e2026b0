#![forbid(unsafe_code)]
//! Fixed block store public API facade.
//!
//! Re-exports the store, its error type, and the shared vocabulary types
//! through one crate so downstream users depend on a single name.
//!
//! ```no_run
//! use fbs::{BlockIndex, BlockStore, StoreConfig};
//!
//! let store = BlockStore::new("data.img", StoreConfig::default())?;
//! let block = store.get(BlockIndex(3))?;
//! block.data_mut()[..5].copy_from_slice(b"hello");
//! block.mark_dirty();
//! drop(block);
//! store.flush()?;
//! store.close()?;
//! # Ok::<(), fbs::FbsError>(())
//! ```

pub use fbs_block::*;
pub use fbs_error::{FbsError, Result};
pub use fbs_types::{
    BLOCK_SIZE, BlockIndex, ByteOffset, MAX_RUN_BLOCKS, ParseError, ReadBatch, StoreConfig,
};
