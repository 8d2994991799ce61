//! Exclusive write transactions over one entry.

use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::DiskLruCache;
use crate::error::Result;

/// An exclusive edit of one entry's slots.
///
/// At most one editor exists per key at a time. Writes go to dirty files and
/// become visible atomically on [`commit`](Editor::commit); [`abort`](Editor::abort)
/// discards them. Both consume the editor, so an edit terminates exactly once.
/// Dropping an editor without doing either leaves the entry locked against
/// edits and removal for the life of the cache handle; crash recovery cleans
/// it up on the next open.
#[derive(Debug)]
pub struct Editor {
    cache: DiskLruCache,
    key: String,
    written: Vec<bool>,
    has_error: Arc<AtomicBool>,
}

impl Editor {
    pub(crate) fn new(cache: DiskLruCache, key: String, value_count: usize) -> Self {
        Self {
            cache,
            key,
            written: vec![false; value_count],
            has_error: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The key this editor locks.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opens a writer over slot `slot`'s dirty file, creating or truncating
    /// it. Reopening a slot within one edit discards the bytes written so
    /// far. The writer is unbuffered; wrap it in a `BufWriter` for many
    /// small writes.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range for the cache's value count.
    pub fn new_sink(&mut self, slot: usize) -> Result<SlotWriter> {
        assert!(
            slot < self.written.len(),
            "slot {slot} out of range for {} values",
            self.written.len()
        );
        let file = self.cache.open_slot_sink(&self.key, slot)?;
        self.written[slot] = true;
        Ok(SlotWriter {
            file,
            has_error: Arc::clone(&self.has_error),
        })
    }

    /// Opens the last-committed content of slot `slot`, or `None` if the
    /// entry has never been published.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range for the cache's value count.
    pub fn new_source(&self, slot: usize) -> Result<Option<File>> {
        assert!(
            slot < self.written.len(),
            "slot {slot} out of range for {} values",
            self.written.len()
        );
        self.cache.open_slot_source(&self.key, slot)
    }

    /// Writes `value` as the full content of slot `slot`.
    pub fn write(&mut self, slot: usize, value: &[u8]) -> Result<()> {
        let mut sink = self.new_sink(slot)?;
        sink.write_all(value)?;
        Ok(())
    }

    /// Reads the last-committed content of slot `slot`, or `None` if the
    /// entry has never been published.
    pub fn read(&self, slot: usize) -> Result<Option<Vec<u8>>> {
        match self.new_source(slot)? {
            Some(mut file) => {
                let mut value = Vec::new();
                file.read_to_end(&mut value)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Publishes the written slots atomically.
    ///
    /// Fails with `IncompleteEdit` if the entry has never been readable and
    /// some slot was never opened, and with `Io` if a slot writer reported a
    /// write failure. On failure the edit is discarded as if aborted.
    pub fn commit(self) -> Result<()> {
        if self.has_error.load(Ordering::SeqCst) {
            self.cache.complete_edit(&self.key, &self.written, false)?;
            return Err(io::Error::other("a slot write failed; edit discarded").into());
        }
        self.cache.complete_edit(&self.key, &self.written, true)
    }

    /// Discards the edit. Dirty files are deleted; if the entry was never
    /// readable it is expunged, otherwise its published state is untouched.
    pub fn abort(self) -> Result<()> {
        self.cache.complete_edit(&self.key, &self.written, false)
    }
}

/// Writer over one slot's dirty file.
///
/// Any write or flush failure is reported to the caller and also recorded in
/// the owning editor, whose `commit` will then refuse to publish.
#[derive(Debug)]
pub struct SlotWriter {
    file: File,
    has_error: Arc<AtomicBool>,
}

impl Write for SlotWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf).inspect_err(|_| {
            self.has_error.store(true, Ordering::SeqCst);
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush().inspect_err(|_| {
            self.has_error.store(true, Ordering::SeqCst);
        })
    }
}
