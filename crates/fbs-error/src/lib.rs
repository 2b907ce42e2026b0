#![forbid(unsafe_code)]
//! Error types for the fixed block store.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Validation | `ParseError` | `fbs-types` | Configuration values that fail validation |
//! | Runtime | `FbsError` | `fbs-error` (this crate) | Errors surfaced by store operations |
//!
//! `fbs-error` is independent of `fbs-types`. `fbs-block` converts a
//! `ParseError` into [`FbsError::InvalidConfig`] at its boundary.
//!
//! ## Failure scope
//!
//! | Variant | Scope | Retryable |
//! |---------|-------|-----------|
//! | `Open` | store-wide until a later open succeeds | yes |
//! | `Io` | the calling operation | yes |
//! | `Read` | the calling `get` (its run is dropped from the cache) | yes |
//! | `Write` | the calling `flush` (its run is re-queued) | yes |
//! | `LoadFailed` | a `get` that waited on another caller's read | yes |
//! | `FlushFailed` | a `flush` that waited on another caller's cycle | yes |
//! | `Closed` | every operation after `close` | no |
//! | `InvalidConfig` | construction | no |
//! | `OutOfRange` | the calling operation | no |
//!
//! A short read at end-of-file is not an error: the missing region is
//! zero-filled.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all block store operations.
#[derive(Debug, Error)]
pub enum FbsError {
    /// The backing file could not be opened.
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A batched read of `count` blocks starting at `start` failed.
    #[error("read of {count} blocks at block {start} failed: {source}")]
    Read {
        start: u64,
        count: usize,
        #[source]
        source: std::io::Error,
    },

    /// A coalesced write of `count` blocks starting at `start` failed.
    #[error("write of {count} blocks at block {start} failed: {source}")]
    Write {
        start: u64,
        count: usize,
        #[source]
        source: std::io::Error,
    },

    /// A shared in-flight load that this caller waited on failed.
    #[error("load of block {block} failed: {detail}")]
    LoadFailed { block: u64, detail: String },

    /// A flush cycle that this caller waited on failed.
    #[error("flush failed: {0}")]
    FlushFailed(String),

    /// The store was closed.
    #[error("block store is closed")]
    Closed,

    /// Configuration rejected at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An index or byte range does not fit the addressable space.
    #[error("out of range: {0}")]
    OutOfRange(String),
}

impl FbsError {
    /// Whether repeating the failed operation may succeed.
    ///
    /// The mapping is exhaustive so a new variant has to pick a side.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Open { .. }
            | Self::Io(_)
            | Self::Read { .. }
            | Self::Write { .. }
            | Self::LoadFailed { .. }
            | Self::FlushFailed(_) => true,
            Self::Closed | Self::InvalidConfig(_) | Self::OutOfRange(_) => false,
        }
    }
}

/// Result alias using `FbsError`.
pub type Result<T> = std::result::Result<T, FbsError>;
