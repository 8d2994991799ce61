//! Image cache with typed metadata on top of [`larder`].
//!
//! Each stored image occupies one cache entry with two slots: the raw encoded
//! image bytes and a JSON document describing them. The metadata type is
//! caller-defined; anything that implements serde's traits works. Caller keys
//! are free-form strings and are hashed before they reach the disk, so URLs
//! and paths are fine as-is.
//!
//! Lookups and stores never fail loudly. A damaged entry, a full disk, or a
//! concurrent writer all collapse into a cache miss (`None`) or a rejected
//! store (`false`), logged at `warn` level. Errors that the caller must act
//! on, such as removing an entry or closing the cache, keep their `Result`.
//!
//! ```no_run
//! use larder_image::{ImageCache, ImageEntry};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Dimensions {
//!     width: u32,
//!     height: u32,
//! }
//!
//! let cache = ImageCache::open_default("thumbnails", 64 * 1024 * 1024)?;
//! cache.put(
//!     "https://example.com/a.jpg",
//!     &ImageEntry { image: vec![0xff, 0xd8], metadata: Dimensions { width: 120, height: 80 } },
//! );
//! if let Some(entry) = cache.get::<Dimensions>("https://example.com/a.jpg") {
//!     assert_eq!(entry.metadata.width, 120);
//! }
//! # Ok::<(), larder_image::ImageCacheError>(())
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use larder::{CacheError, DiskLruCache, Editor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

const APP_VERSION: u32 = 1;
const VALUE_COUNT: usize = 2;
const IMAGE_SLOT: usize = 0;
const METADATA_SLOT: usize = 1;

/// Failures surfaced by the operations that keep a `Result`.
#[derive(Debug, Error)]
pub enum ImageCacheError {
    #[error("cache failure: {0}")]
    Cache(#[from] CacheError),

    #[error("metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// An image together with its caller-defined metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry<M> {
    pub image: Vec<u8>,
    pub metadata: M,
}

/// A bounded on-disk store for encoded images and their metadata.
///
/// Cloning is cheap and every clone shares the same underlying cache.
#[derive(Debug, Clone)]
pub struct ImageCache {
    cache: DiskLruCache,
}

impl ImageCache {
    /// Opens the image cache in `directory`, creating it when absent.
    ///
    /// If the directory holds a cache written by an incompatible version of
    /// this crate, its contents are discarded and the cache starts empty.
    pub fn open(
        directory: impl Into<PathBuf>,
        max_size: u64,
    ) -> Result<ImageCache, ImageCacheError> {
        let directory = directory.into();
        let cache = match DiskLruCache::open(&directory, APP_VERSION, VALUE_COUNT, max_size) {
            Ok(cache) => cache,
            Err(CacheError::VersionMismatch(reason)) => {
                warn!(
                    directory = %directory.display(),
                    reason = %reason,
                    "cache format changed; discarding old contents"
                );
                fs::remove_dir_all(&directory).map_err(CacheError::from)?;
                DiskLruCache::open(&directory, APP_VERSION, VALUE_COUNT, max_size)?
            }
            Err(err) => return Err(err.into()),
        };
        debug!(directory = %cache.directory().display(), "image cache opened");
        Ok(ImageCache { cache })
    }

    /// Opens the cache under the platform cache directory, in a subdirectory
    /// named `name`. Falls back to the system temp directory on platforms
    /// without a cache directory.
    pub fn open_default(name: &str, max_size: u64) -> Result<ImageCache, ImageCacheError> {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self::open(base.join(name), max_size)
    }

    /// Stores an image under `key`, replacing any previous entry.
    ///
    /// Returns `false` without storing anything when the entry is being
    /// written by someone else or when any part of the write fails.
    pub fn put<M: Serialize>(&self, key: &str, entry: &ImageEntry<M>) -> bool {
        let digest = key_digest(key);
        match self.try_put(&digest, entry) {
            Ok(true) => {
                debug!(key, bytes = entry.image.len(), "image stored");
                true
            }
            Ok(false) => {
                debug!(key, "image not stored; entry busy");
                false
            }
            Err(err) => {
                warn!(key, error = %err, "failed to store image");
                false
            }
        }
    }

    /// Loads the image and metadata stored under `key`.
    ///
    /// Missing entries, metadata that no longer deserializes as `M`, and I/O
    /// failures all come back as `None`.
    pub fn get<M: DeserializeOwned>(&self, key: &str) -> Option<ImageEntry<M>> {
        let digest = key_digest(key);
        match self.try_get(&digest) {
            Ok(found) => {
                debug!(key, hit = found.is_some(), "image lookup");
                found
            }
            Err(err) => {
                warn!(key, error = %err, "failed to load image");
                None
            }
        }
    }

    /// Reports whether an entry is stored under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        let digest = key_digest(key);
        match self.cache.get(&digest) {
            Ok(snapshot) => {
                let contained = snapshot.is_some();
                debug!(key, contained, "image probe");
                contained
            }
            Err(err) => {
                warn!(key, error = %err, "failed to probe for image");
                false
            }
        }
    }

    /// Removes the entry stored under `key`, reporting whether one existed.
    pub fn remove(&self, key: &str) -> Result<bool, ImageCacheError> {
        let removed = self.cache.remove(&key_digest(key))?;
        debug!(key, removed, "image removed");
        Ok(removed)
    }

    /// Number of bytes currently stored.
    pub fn size(&self) -> Result<u64, ImageCacheError> {
        Ok(self.cache.size()?)
    }

    /// The configured size bound in bytes.
    pub fn max_size(&self) -> u64 {
        self.cache.max_size()
    }

    /// The directory holding the cached files.
    pub fn directory(&self) -> &Path {
        self.cache.directory()
    }

    pub fn is_closed(&self) -> bool {
        self.cache.is_closed()
    }

    /// Flushes state to disk and releases the cache. Further operations
    /// return errors or report misses.
    pub fn close(&self) -> Result<(), ImageCacheError> {
        debug!(directory = %self.cache.directory().display(), "closing image cache");
        Ok(self.cache.close()?)
    }

    /// Closes the cache and deletes everything it stored.
    pub fn delete(&self) -> Result<(), ImageCacheError> {
        debug!(directory = %self.cache.directory().display(), "deleting image cache");
        Ok(self.cache.delete()?)
    }

    fn try_put<M: Serialize>(
        &self,
        digest: &str,
        entry: &ImageEntry<M>,
    ) -> Result<bool, ImageCacheError> {
        // Serialize before taking the editor so an encoding failure never
        // leaves an edit to unwind.
        let metadata = serde_json::to_vec(&entry.metadata)?;
        let Some(mut editor) = self.cache.edit(digest)? else {
            return Ok(false);
        };
        if let Err(err) = self.write_slots(&mut editor, &entry.image, &metadata) {
            let _ = editor.abort();
            return Err(err.into());
        }
        editor.commit()?;
        Ok(true)
    }

    fn write_slots(
        &self,
        editor: &mut Editor,
        image: &[u8],
        metadata: &[u8],
    ) -> larder::Result<()> {
        editor.write(METADATA_SLOT, metadata)?;
        editor.write(IMAGE_SLOT, image)?;
        self.cache.flush()
    }

    fn try_get<M: DeserializeOwned>(
        &self,
        digest: &str,
    ) -> Result<Option<ImageEntry<M>>, ImageCacheError> {
        let Some(snapshot) = self.cache.get(digest)? else {
            return Ok(None);
        };
        let image = snapshot.read(IMAGE_SLOT)?;
        let metadata = serde_json::from_slice(&snapshot.read(METADATA_SLOT)?)?;
        Ok(Some(ImageEntry { image, metadata }))
    }
}

/// Caller keys may be URLs or paths; the cache accepts only short
/// filename-safe keys, so store everything under the hex MD5 of the key.
fn key_digest(key: &str) -> String {
    format!("{:x}", md5::compute(key))
}
