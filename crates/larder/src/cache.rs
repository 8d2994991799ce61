//! The cache facade.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::editor::Editor;
use crate::error::{CacheError, Result};
use crate::index::Index;
use crate::journal::{self, JournalWriter, Record};
use crate::layout::{self, CacheLayout};
use crate::snapshot::Snapshot;

/// Journal compaction threshold: the journal is rewritten once it holds this
/// many redundant records, provided they also outnumber the live entries.
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

/// A bounded, journaled key-value cache on the local filesystem.
///
/// Each entry holds a fixed number of byte streams ("slots") published
/// atomically by an [`Editor`] and read through [`Snapshot`]s. Entries are
/// evicted least recently used first whenever the total of published bytes
/// exceeds the budget. Every state change is appended to a journal, so the
/// cache survives process crashes: interrupted edits are discarded on the
/// next open and everything committed before the crash is kept.
///
/// The handle is cheap to clone and safe to share across threads; all
/// operations serialize on one internal lock, held only for metadata work
/// and journal appends, never while slot content is read or written.
#[derive(Debug, Clone)]
pub struct DiskLruCache {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    layout: CacheLayout,
    app_version: u32,
    value_count: usize,
    max_size: u64,
    state: Mutex<Option<OpenState>>,
}

#[derive(Debug)]
struct OpenState {
    index: Index,
    journal: JournalWriter,
    redundant_op_count: usize,
    next_sequence_number: u64,
    /// Advisory lock on the cache directory, held until close.
    _lock: File,
}

impl DiskLruCache {
    /// Opens the cache in `directory`, creating it if absent.
    ///
    /// An existing journal is validated against `app_version` and
    /// `value_count` and replayed; edits interrupted by a crash are
    /// discarded and any leftover temporary files deleted. `max_size` may
    /// differ from the previous open, in which case surplus entries are
    /// evicted immediately.
    ///
    /// Fails with [`CacheError::VersionMismatch`] when the journal header
    /// disagrees with the arguments (callers normally delete the directory
    /// and retry) and with [`CacheError::Io`] when the directory is already
    /// open in this or another process.
    ///
    /// # Panics
    ///
    /// Panics if `value_count` or `max_size` is zero.
    pub fn open(
        directory: impl Into<PathBuf>,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> Result<DiskLruCache> {
        assert!(value_count > 0, "value_count must be positive");
        assert!(max_size > 0, "max_size must be positive");

        let layout = CacheLayout::new(directory.into());
        fs::create_dir_all(layout.directory())?;
        let lock = acquire_directory_lock(&layout)?;

        // A crash mid-rewrite can leave the backup as the only journal.
        let backup = layout.journal_backup();
        if backup.exists() {
            if layout.journal().exists() {
                fs::remove_file(&backup)?;
            } else {
                debug!(directory = %layout.directory().display(), "restoring journal from backup");
                fs::rename(&backup, layout.journal())?;
            }
        }

        let journal_path = layout.journal();
        let (index, journal, redundant_op_count) = if journal_path.exists() {
            let replay = journal::replay(&journal_path, app_version, value_count)?;
            let mut index = replay.index;
            resolve_interrupted_edits(&layout, &mut index, value_count)?;
            sweep_temp_files(&layout)?;
            if replay.truncated {
                warn!("journal ends in a truncated record; compacting");
                let journal = journal::rewrite(&layout, &index, app_version, value_count)?;
                (index, journal, 0)
            } else {
                let redundant = replay.record_count.saturating_sub(index.len());
                (index, JournalWriter::open_append(&journal_path)?, redundant)
            }
        } else {
            sweep_temp_files(&layout)?;
            let index = Index::new();
            let journal = journal::rewrite(&layout, &index, app_version, value_count)?;
            (index, journal, 0)
        };

        debug!(
            directory = %layout.directory().display(),
            entries = index.len(),
            size = index.size(),
            "cache opened"
        );

        let cache = DiskLruCache {
            shared: Arc::new(Shared {
                layout,
                app_version,
                value_count,
                max_size,
                state: Mutex::new(Some(OpenState {
                    index,
                    journal,
                    redundant_op_count,
                    next_sequence_number: 1,
                    _lock: lock,
                })),
            }),
        };

        // The budget may have shrunk since the cache was last open.
        let mut guard = cache.shared.state.lock().unwrap();
        cache.trim_to_size(&mut guard)?;
        drop(guard);

        Ok(cache)
    }

    /// Returns a snapshot of `key`'s committed content, or `None` if the
    /// key has never been committed.
    ///
    /// The snapshot reads the content current at this call even if the
    /// entry is overwritten or removed afterwards. A missing or unreadable
    /// slot file is reported as [`CacheError::Io`] rather than `None`; the
    /// distinction between "not cached" and "cache damaged" is the
    /// caller's to collapse.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        layout::validate_key(key)?;
        let mut guard = self.shared.state.lock().unwrap();
        let state = guard.as_mut().ok_or(CacheError::Closed)?;

        let (sequence_number, lengths) = match state.index.get(key) {
            Some(entry) if entry.readable => (entry.sequence_number, entry.lengths.clone()),
            _ => return Ok(None),
        };

        let mut files = Vec::with_capacity(self.shared.value_count);
        for slot in 0..self.shared.value_count {
            files.push(File::open(self.shared.layout.clean_file(key, slot))?);
        }

        state.index.touch(key);
        state.redundant_op_count += 1;
        Self::append_record(&mut guard, &Record::Read(key.to_string()))?;
        self.compact_if_required(&mut guard)?;

        Ok(Some(Snapshot::new(
            self.clone(),
            key.to_string(),
            sequence_number,
            files,
            lengths,
        )))
    }

    /// Opens an editor on `key`, creating the entry if absent.
    ///
    /// Returns `None` when another editor is already live on the key.
    pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
        self.edit_at(key, None)
    }

    /// Removes `key`, deleting its slot files.
    ///
    /// Returns whether an entry existed. Fails with
    /// [`CacheError::ConcurrentEdit`] while an editor is live on the key.
    pub fn remove(&self, key: &str) -> Result<bool> {
        layout::validate_key(key)?;
        let mut guard = self.shared.state.lock().unwrap();
        let state = guard.as_mut().ok_or(CacheError::Closed)?;

        match state.index.get(key) {
            None => return Ok(false),
            Some(entry) if entry.current_editor => {
                return Err(CacheError::ConcurrentEdit {
                    key: key.to_string(),
                })
            }
            Some(_) => {}
        }

        self.remove_entry(&mut guard, key)?;
        self.compact_if_required(&mut guard)?;
        Ok(true)
    }

    /// Forces all journal appends to the storage medium.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.shared.state.lock().unwrap();
        let state = guard.as_mut().ok_or(CacheError::Closed)?;
        if let Err(err) = state.journal.sync() {
            warn!(error = %err, "journal flush failed; closing cache");
            *guard = None;
            return Err(err.into());
        }
        Ok(())
    }

    /// Flushes and closes the cache, releasing the directory lock.
    ///
    /// Closing twice is a no-op. Fails with [`CacheError::ConcurrentEdit`]
    /// while any editor is outstanding; commit or abort them first.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.shared.state.lock().unwrap();
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };

        if let Some(key) = state.index.keys_with_editor().into_iter().next() {
            return Err(CacheError::ConcurrentEdit { key });
        }
        if let Err(err) = state.journal.sync() {
            *guard = None;
            return Err(err.into());
        }
        *guard = None;
        debug!(directory = %self.shared.layout.directory().display(), "cache closed");
        Ok(())
    }

    /// Closes the cache if open, then deletes the cache directory and all
    /// its contents.
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        match fs::remove_dir_all(self.shared.layout.directory()) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Total bytes of published content.
    pub fn size(&self) -> Result<u64> {
        let guard = self.shared.state.lock().unwrap();
        let state = guard.as_ref().ok_or(CacheError::Closed)?;
        Ok(state.index.size())
    }

    /// The byte budget entries are evicted to stay within.
    pub fn max_size(&self) -> u64 {
        self.shared.max_size
    }

    /// The cache directory.
    pub fn directory(&self) -> &Path {
        self.shared.layout.directory()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().is_none()
    }

    /// Opens an editor, optionally guarded by the sequence number the
    /// caller last observed. `None` when the entry changed since then or
    /// another editor is live.
    pub(crate) fn edit_at(
        &self,
        key: &str,
        expected_sequence: Option<u64>,
    ) -> Result<Option<Editor>> {
        layout::validate_key(key)?;
        let mut guard = self.shared.state.lock().unwrap();
        let state = guard.as_mut().ok_or(CacheError::Closed)?;

        if let Some(expected) = expected_sequence {
            // The snapshot is stale if the entry was removed or republished.
            match state.index.get(key) {
                Some(entry) if entry.sequence_number == expected => {}
                _ => return Ok(None),
            }
        }
        if state.index.get(key).is_some_and(|entry| entry.current_editor) {
            return Ok(None);
        }

        if state.index.contains(key) {
            state.index.touch(key);
        } else {
            state.index.insert_new(key, self.shared.value_count);
        }
        if let Some(entry) = state.index.get_mut(key) {
            entry.current_editor = true;
        }

        // DIRTY reaches the OS before any dirty file exists, so recovery
        // can always pair leftover files with a record.
        Self::append_record(&mut guard, &Record::Dirty(key.to_string()))?;

        Ok(Some(Editor::new(
            self.clone(),
            key.to_string(),
            self.shared.value_count,
        )))
    }

    /// Creates or truncates the dirty file behind an editor's slot writer.
    pub(crate) fn open_slot_sink(&self, key: &str, slot: usize) -> Result<File> {
        let guard = self.shared.state.lock().unwrap();
        let state = guard.as_ref().ok_or(CacheError::Closed)?;
        debug_assert!(state.index.get(key).is_some_and(|entry| entry.current_editor));
        Ok(File::create(self.shared.layout.dirty_file(key, slot))?)
    }

    /// Opens the committed content behind an editor's slot source, or
    /// `None` if the entry has never been published.
    pub(crate) fn open_slot_source(&self, key: &str, slot: usize) -> Result<Option<File>> {
        let guard = self.shared.state.lock().unwrap();
        let state = guard.as_ref().ok_or(CacheError::Closed)?;
        if !state.index.get(key).is_some_and(|entry| entry.readable) {
            return Ok(None);
        }
        Ok(Some(File::open(self.shared.layout.clean_file(key, slot))?))
    }

    /// Terminates an edit. With `success`, written slots are renamed into
    /// place, lengths are stat'd and a CLEAN record is appended; without it
    /// the dirty files are deleted and a never-published entry is expunged.
    ///
    /// A commit that cannot publish (slot never opened on a first edit, or
    /// a dirty file missing) is downgraded to the failure path and reports
    /// why; the edit is discarded either way, so the entry is never left
    /// locked.
    pub(crate) fn complete_edit(&self, key: &str, written: &[bool], success: bool) -> Result<()> {
        let layout = &self.shared.layout;
        let value_count = self.shared.value_count;

        let mut guard = self.shared.state.lock().unwrap();
        let state = guard.as_mut().ok_or(CacheError::Closed)?;

        let Some(was_readable) = state.index.get(key).map(|entry| entry.readable) else {
            debug_assert!(false, "edit completed for an unknown entry");
            return Ok(());
        };

        let mut failure: Option<CacheError> = None;
        if success && !was_readable {
            // A first publish must populate every slot.
            if let Some(slot) = written.iter().position(|&opened| !opened) {
                failure = Some(CacheError::IncompleteEdit {
                    key: key.to_string(),
                    slot,
                });
            }
        }

        let mut published: Option<Vec<u64>> = None;
        if success && failure.is_none() {
            let lengths = state
                .index
                .get(key)
                .map(|entry| entry.lengths.clone())
                .unwrap_or_else(|| vec![0; value_count]);
            match rename_into_place(layout, key, lengths, !was_readable) {
                Ok(lengths) => published = Some(lengths),
                Err(err) => failure = Some(err),
            }
        }

        if let Some(lengths) = published {
            state.index.publish(key, lengths.clone());
            if let Some(entry) = state.index.get_mut(key) {
                entry.current_editor = false;
                entry.sequence_number = state.next_sequence_number;
            }
            state.next_sequence_number += 1;
            state.redundant_op_count += 1;
            Self::append_record(
                &mut guard,
                &Record::Clean {
                    key: key.to_string(),
                    lengths,
                },
            )?;
            self.trim_to_size(&mut guard)?;
            self.compact_if_required(&mut guard)?;
            return Ok(());
        }

        // Abort, or a commit that could not publish.
        let mut cleanup: Result<()> = Ok(());
        for slot in 0..value_count {
            if let Err(err) = delete_if_exists(&layout.dirty_file(key, slot)) {
                if cleanup.is_ok() {
                    cleanup = Err(err.into());
                }
            }
        }

        if was_readable {
            // The unterminated DIRTY stays in the journal; replay reverts
            // it to the published state.
            if let Some(entry) = state.index.get_mut(key) {
                entry.current_editor = false;
            }
            state.redundant_op_count += 1;
        } else {
            state.index.remove(key);
            state.redundant_op_count += 1;
            Self::append_record(&mut guard, &Record::Remove(key.to_string()))?;
        }
        self.compact_if_required(&mut guard)?;

        match failure {
            Some(err) => Err(err),
            None => cleanup,
        }
    }

    /// Appends one record, closing the cache when the journal can no
    /// longer be written: with appends lost, recovery guarantees are gone.
    fn append_record(guard: &mut Option<OpenState>, record: &Record) -> Result<()> {
        let state = guard.as_mut().ok_or(CacheError::Closed)?;
        if let Err(err) = state.journal.append(record) {
            warn!(error = %err, "journal append failed; closing cache");
            *guard = None;
            return Err(err.into());
        }
        Ok(())
    }

    /// Evicts from the least recently used end until the budget holds.
    /// Entries pinned by a live editor are skipped.
    fn trim_to_size(&self, guard: &mut Option<OpenState>) -> Result<()> {
        loop {
            let victim = {
                let Some(state) = guard.as_mut() else { return Ok(()) };
                if state.index.size() <= self.shared.max_size {
                    return Ok(());
                }
                match state.index.next_evictable() {
                    Some(key) => key.to_string(),
                    None => return Ok(()),
                }
            };
            debug!(key = %victim, "evicting least recently used entry");
            self.remove_entry(guard, &victim)?;
        }
    }

    /// Deletes `key`'s clean files, drops it from the index and appends a
    /// REMOVE record. The caller has checked there is no live editor.
    fn remove_entry(&self, guard: &mut Option<OpenState>, key: &str) -> Result<()> {
        let Some(state) = guard.as_mut() else {
            return Err(CacheError::Closed);
        };
        for slot in 0..self.shared.value_count {
            delete_if_exists(&self.shared.layout.clean_file(key, slot))?;
        }
        state.index.remove(key);
        state.redundant_op_count += 1;
        Self::append_record(guard, &Record::Remove(key.to_string()))
    }

    /// Rewrites the journal once the redundant records outnumber both the
    /// threshold and the live entries.
    fn compact_if_required(&self, guard: &mut Option<OpenState>) -> Result<()> {
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        if state.redundant_op_count < REDUNDANT_OP_COMPACT_THRESHOLD
            || state.redundant_op_count < state.index.len()
        {
            return Ok(());
        }
        match journal::rewrite(
            &self.shared.layout,
            &state.index,
            self.shared.app_version,
            self.shared.value_count,
        ) {
            Ok(writer) => {
                state.journal = writer;
                state.redundant_op_count = 0;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "journal rewrite failed; closing cache");
                *guard = None;
                Err(err)
            }
        }
    }
}

fn acquire_directory_lock(layout: &CacheLayout) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(layout.lock_file())?;
    if let Err(err) = file.try_lock_exclusive() {
        return Err(CacheError::Io(io::Error::new(
            err.kind(),
            format!(
                "cache directory {} is locked by another instance",
                layout.directory().display()
            ),
        )));
    }
    Ok(file)
}

/// Reconciles entries whose last journal record is DIRTY. A never-published
/// entry is expunged together with any files a partial commit left behind;
/// a published one keeps the content of its last CLEAN.
fn resolve_interrupted_edits(
    layout: &CacheLayout,
    index: &mut Index,
    value_count: usize,
) -> Result<()> {
    for key in index.keys_with_editor() {
        let readable = index.get(&key).is_some_and(|entry| entry.readable);
        if readable {
            debug!(key = %key, "dropping interrupted edit; keeping last published content");
            if let Some(entry) = index.get_mut(&key) {
                entry.current_editor = false;
            }
        } else {
            debug!(key = %key, "discarding entry with interrupted first edit");
            index.remove(&key);
            for slot in 0..value_count {
                delete_if_exists(&layout.clean_file(&key, slot))?;
            }
        }
    }
    Ok(())
}

/// Deletes `journal.tmp` and every dirty slot file.
fn sweep_temp_files(layout: &CacheLayout) -> Result<()> {
    for path in layout.temp_files()? {
        debug!(path = %path.display(), "deleting leftover temporary file");
        delete_if_exists(&path)?;
    }
    Ok(())
}

/// Renames an edit's dirty files over the clean ones, returning the stat'd
/// lengths. Slots without a dirty file keep their previous content unless
/// `require_all` is set, in which case the publish fails.
fn rename_into_place(
    layout: &CacheLayout,
    key: &str,
    mut lengths: Vec<u64>,
    require_all: bool,
) -> Result<Vec<u64>> {
    for (slot, length) in lengths.iter_mut().enumerate() {
        let dirty = layout.dirty_file(key, slot);
        if !dirty.exists() {
            if require_all {
                return Err(CacheError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("dirty file for slot {slot} of {key} vanished before commit"),
                )));
            }
            continue;
        }
        let clean = layout.clean_file(key, slot);
        fs::rename(&dirty, &clean)?;
        *length = fs::metadata(&clean)?.len();
    }
    Ok(lengths)
}

fn delete_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
