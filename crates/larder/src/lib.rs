//! Bounded, journaled LRU cache on the local filesystem.
//!
//! A cache owns one directory. Each entry stores a fixed number of byte
//! streams ("slots") under a short key; writes go through an [`Editor`] and
//! become visible atomically on commit, reads go through [`Snapshot`]s that
//! stay stable while the entry is overwritten or evicted. An append-only
//! journal makes the contents durable across crashes, and entries are
//! evicted least recently used first to keep the total size under a budget.
//!
//! ```no_run
//! use larder::DiskLruCache;
//!
//! # fn main() -> Result<(), larder::CacheError> {
//! let cache = DiskLruCache::open("/var/cache/thumbs", 1, 2, 10 * 1024 * 1024)?;
//!
//! if let Some(mut editor) = cache.edit("a1b2c3")? {
//!     editor.write(0, b"pixel data")?;
//!     editor.write(1, b"{\"width\":320}")?;
//!     editor.commit()?;
//! }
//!
//! if let Some(snapshot) = cache.get("a1b2c3")? {
//!     let pixels = snapshot.read(0)?;
//!     assert_eq!(pixels, b"pixel data");
//! }
//! # Ok(())
//! # }
//! ```

mod cache;
mod editor;
mod entry;
mod error;
mod index;
mod journal;
mod layout;
mod snapshot;

pub use cache::DiskLruCache;
pub use editor::{Editor, SlotWriter};
pub use error::{CacheError, Result};
pub use layout::MAX_KEY_LENGTH;
pub use snapshot::Snapshot;
