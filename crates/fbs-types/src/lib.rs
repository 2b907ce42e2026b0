#![forbid(unsafe_code)]
//! Shared vocabulary for the fixed block store.
//!
//! The on-disk format is a flat file viewed as a logical array of
//! [`BLOCK_SIZE`]-byte blocks. Block `i` occupies bytes
//! `[BLOCK_SIZE * i, BLOCK_SIZE * (i + 1))`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of one block (the unit of addressing, caching, and I/O).
pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_SIZE_U64: u64 = 4096;
pub const BLOCK_SHIFT: u32 = 12;

/// Upper bound on the number of blocks coalesced into one vectored write.
pub const MAX_RUN_BLOCKS: usize = 131_072;

/// Default soft cap on resident zero-refcount blocks.
pub const DEFAULT_MAX_CACHE: usize = 128;

/// Upper bound on the number of flush workers when resolved automatically.
pub const AUTO_FLUSH_WORKERS_CAP: usize = 8;

/// Upper bound on an explicit flush worker count.
pub const MAX_FLUSH_WORKERS: usize = 256;

/// Zero-based block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u64);

impl BlockIndex {
    /// Byte offset of the first byte of this block, `None` on overflow.
    #[must_use]
    pub fn byte_offset(self) -> Option<ByteOffset> {
        self.0.checked_mul(BLOCK_SIZE_U64).map(ByteOffset)
    }

    /// Number of whole blocks contained in a byte length (truncating).
    #[must_use]
    pub fn count_for_len(len_bytes: u64) -> u64 {
        len_bytes >> BLOCK_SHIFT
    }

    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, blocks: u64) -> Option<Self> {
        self.0.checked_sub(blocks).map(Self)
    }
}

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

/// Validated prefetch window size, in blocks.
///
/// Must be a power of two in `1..=MAX_RUN_BLOCKS`. A batch of 1 disables
/// prefetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ReadBatch(u32);

impl ReadBatch {
    pub const NONE: Self = Self(1);

    /// Create a `ReadBatch` if `value` is a power of two in `1..=MAX_RUN_BLOCKS`.
    pub fn new(value: u32) -> Result<Self, ParseError> {
        let max = u32::try_from(MAX_RUN_BLOCKS).map_err(|_| ParseError::IntegerConversion {
            field: "read_batch",
        })?;
        if !value.is_power_of_two() || value > max {
            return Err(ParseError::InvalidField {
                field: "read_batch",
                reason: "must be power of two in 1..=131072",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Prefetch window `[start, end)` around `index`.
    ///
    /// The window reaches back only to the batch alignment boundary but
    /// always extends a full batch forward from `index`, so it is not
    /// symmetric unless `index` is aligned. The upper bound saturates.
    #[must_use]
    pub fn window(self, index: BlockIndex) -> (BlockIndex, BlockIndex) {
        let batch = u64::from(self.0);
        let start = index.0 - (index.0 & (batch - 1));
        let end = index.0.saturating_add(batch);
        (BlockIndex(start), BlockIndex(end))
    }
}

impl Default for ReadBatch {
    fn default() -> Self {
        Self::NONE
    }
}

impl TryFrom<u32> for ReadBatch {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ReadBatch> for u32 {
    fn from(value: ReadBatch) -> Self {
        value.0
    }
}

/// Tunables for a block store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Soft cap on resident blocks that nobody holds a reference to.
    /// Default: 128.
    pub max_cache: usize,
    /// Prefetch window used on a cache miss. Default: 1 (no prefetch).
    pub read_batch: ReadBatch,
    /// Issue `fsync` after every successful flush cycle. Default: true.
    pub sync_on_flush: bool,
    /// Concurrent write runs per flush cycle.
    ///
    /// `0` means "auto": `min(available_parallelism, 8)`.
    pub flush_workers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_cache: DEFAULT_MAX_CACHE,
            read_batch: ReadBatch::NONE,
            sync_on_flush: true,
            flush_workers: 0,
        }
    }
}

impl StoreConfig {
    /// Reject values the store cannot honor.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.flush_workers > MAX_FLUSH_WORKERS {
            return Err(ParseError::InvalidField {
                field: "flush_workers",
                reason: "must be at most 256",
            });
        }
        Ok(())
    }

    /// Resolved flush worker count (at least 1).
    #[must_use]
    pub fn resolved_flush_workers(&self) -> usize {
        if self.flush_workers == 0 {
            std::thread::available_parallelism()
                .map_or(1, usize::from)
                .min(AUTO_FLUSH_WORKERS_CAP)
        } else {
            self.flush_workers
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ReadBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
