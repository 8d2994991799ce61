//! File-naming policy for the cache directory.
//!
//! All paths inside the cache directory are produced here: the journal and
//! its rewrite/backup companions, the advisory lock file, and the per-entry
//! slot files. A clean slot file is named `<key>.<slot>`; its in-progress
//! counterpart is `<key>.<slot>.tmp`. Because every entry file carries a slot
//! suffix, the reserved names can never collide with a key.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};

pub(crate) const JOURNAL_FILE: &str = "journal";
pub(crate) const JOURNAL_FILE_TMP: &str = "journal.tmp";
pub(crate) const JOURNAL_FILE_BACKUP: &str = "journal.bkp";
pub(crate) const LOCK_FILE: &str = "lock";

/// Maximum accepted key length.
pub const MAX_KEY_LENGTH: usize = 120;

/// Checks a key against the grammar `[a-z0-9_-]{1,120}`.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let well_formed = !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'));

    if well_formed {
        Ok(())
    } else {
        Err(CacheError::InvalidKey {
            key: key.to_string(),
        })
    }
}

/// Resolves file paths inside one cache directory.
#[derive(Debug, Clone)]
pub(crate) struct CacheLayout {
    directory: PathBuf,
}

impl CacheLayout {
    pub(crate) fn new(directory: PathBuf) -> Self {
        Self { directory }
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    pub(crate) fn journal(&self) -> PathBuf {
        self.directory.join(JOURNAL_FILE)
    }

    pub(crate) fn journal_tmp(&self) -> PathBuf {
        self.directory.join(JOURNAL_FILE_TMP)
    }

    pub(crate) fn journal_backup(&self) -> PathBuf {
        self.directory.join(JOURNAL_FILE_BACKUP)
    }

    pub(crate) fn lock_file(&self) -> PathBuf {
        self.directory.join(LOCK_FILE)
    }

    /// Path of the published file for one slot of `key`.
    pub(crate) fn clean_file(&self, key: &str, slot: usize) -> PathBuf {
        self.directory.join(format!("{key}.{slot}"))
    }

    /// Path of the in-progress file for one slot of `key`.
    pub(crate) fn dirty_file(&self, key: &str, slot: usize) -> PathBuf {
        self.directory.join(format!("{key}.{slot}.tmp"))
    }

    /// Scans the directory for every `*.tmp` file.
    ///
    /// Used by recovery, which deletes them all: dirty slot files from
    /// interrupted edits and any abandoned journal rewrite destination.
    pub(crate) fn temp_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();

        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("tmp") {
                found.push(path);
            }
        }

        Ok(found)
    }
}
