//! Read handles over committed entries.

use std::fs::File;
use std::io::Read;

use crate::cache::DiskLruCache;
use crate::editor::Editor;
use crate::error::Result;

/// The committed content of one entry at the moment [`get`](DiskLruCache::get)
/// was called.
///
/// A snapshot owns an open file per slot, so a concurrent overwrite or
/// removal cannot disturb it: publish renames new content into place and the
/// snapshot's handles keep reading the old files. Dropping the snapshot
/// closes them.
#[derive(Debug)]
pub struct Snapshot {
    cache: DiskLruCache,
    key: String,
    sequence_number: u64,
    files: Vec<File>,
    lengths: Vec<u64>,
}

impl Snapshot {
    pub(crate) fn new(
        cache: DiskLruCache,
        key: String,
        sequence_number: u64,
        files: Vec<File>,
        lengths: Vec<u64>,
    ) -> Self {
        Self {
            cache,
            key,
            sequence_number,
            files,
            lengths,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Byte length of slot `slot` as committed.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range for the cache's value count.
    pub fn length(&self, slot: usize) -> u64 {
        self.lengths[slot]
    }

    /// A reader over slot `slot`. Each slot's read position is consumed
    /// once; callers wanting the bytes twice should keep them.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range for the cache's value count.
    pub fn reader(&self, slot: usize) -> &File {
        &self.files[slot]
    }

    /// Reads slot `slot` to the end.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range for the cache's value count.
    pub fn read(&self, slot: usize) -> Result<Vec<u8>> {
        let mut value = Vec::with_capacity(self.lengths[slot] as usize);
        self.reader(slot).read_to_end(&mut value)?;
        Ok(value)
    }

    /// Opens an editor only if the entry has not been committed or removed
    /// since this snapshot was taken.
    pub fn edit(&self) -> Result<Option<Editor>> {
        self.cache.edit_at(&self.key, Some(self.sequence_number))
    }
}
