//! Error taxonomy for cache operations.

use std::io;
use thiserror::Error;

/// Errors surfaced by the cache and its editors and snapshots.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The underlying storage failed (read, write, rename, fsync, stat).
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// The journal header disagrees with the open parameters. The usual
    /// caller response is `delete()` followed by a fresh `open()`.
    #[error("journal header mismatch: {0}")]
    VersionMismatch(String),

    /// Operation on a cache that has been closed.
    #[error("cache is closed")]
    Closed,

    /// The key has a live editor, so the operation was refused.
    #[error("key {key:?} has an edit in progress")]
    ConcurrentEdit { key: String },

    /// A newly created entry was committed without writing every slot.
    #[error("newly created entry {key:?} did not write slot {slot}")]
    IncompleteEdit { key: String, slot: usize },

    /// The key does not match `[a-z0-9_-]{1,120}`.
    #[error("invalid key {key:?}")]
    InvalidKey { key: String },
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
