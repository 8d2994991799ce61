//! Append-only journal of index transitions.
//!
//! The journal is a line-oriented text file. Five header lines (magic, format
//! version, application version, value count, blank) are followed by one
//! record per line:
//!
//! ```text
//! DIRTY <key>            an editor opened on <key>
//! CLEAN <key> <l0> <l1>  the editor committed; slot lengths recorded
//! READ  <key>            a reader observed <key>
//! REMOVE <key>           the entry was deleted
//! ```
//!
//! Replaying the records in order reconstructs the index. A DIRTY with no
//! terminal CLEAN or REMOVE marks an interrupted edit; the caller resolves
//! those against the filesystem after replay. Rewriting compacts the log to
//! one line per live entry and swaps it in through `journal.tmp` with the
//! old journal parked at `journal.bkp` until the swap completes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{CacheError, Result};
use crate::index::Index;
use crate::layout::{self, CacheLayout};

pub(crate) const MAGIC: &str = "libcore.io.DiskLruCache";
pub(crate) const FORMAT_VERSION: &str = "1";

const DIRTY: &str = "DIRTY";
const CLEAN: &str = "CLEAN";
const READ: &str = "READ";
const REMOVE: &str = "REMOVE";

/// One journal line, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
    Dirty(String),
    Clean { key: String, lengths: Vec<u64> },
    Read(String),
    Remove(String),
}

impl Record {
    /// The serialized line, trailing newline included.
    pub(crate) fn line(&self) -> String {
        match self {
            Record::Dirty(key) => format!("{DIRTY} {key}\n"),
            Record::Clean { key, lengths } => {
                let mut line = format!("{CLEAN} {key}");
                for length in lengths {
                    line.push(' ');
                    line.push_str(&length.to_string());
                }
                line.push('\n');
                line
            }
            Record::Read(key) => format!("{READ} {key}\n"),
            Record::Remove(key) => format!("{REMOVE} {key}\n"),
        }
    }

    /// Parses one line (no trailing newline). `None` means the line is
    /// malformed: unknown verb, bad key, or a CLEAN whose length list does
    /// not match `value_count`.
    pub(crate) fn parse(line: &str, value_count: usize) -> Option<Record> {
        let mut tokens = line.split(' ');
        let verb = tokens.next()?;
        let key = tokens.next()?;
        if layout::validate_key(key).is_err() {
            return None;
        }
        let rest = tokens.next();
        match verb {
            DIRTY if rest.is_none() => Some(Record::Dirty(key.to_string())),
            READ if rest.is_none() => Some(Record::Read(key.to_string())),
            REMOVE if rest.is_none() => Some(Record::Remove(key.to_string())),
            CLEAN => {
                let mut lengths = Vec::with_capacity(value_count);
                for token in rest.into_iter().chain(tokens) {
                    lengths.push(token.parse().ok()?);
                }
                if lengths.len() == value_count {
                    Some(Record::Clean {
                        key: key.to_string(),
                        lengths,
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Splits a byte buffer into lines, reporting whether each line carried its
/// terminating newline. A missing terminator on the final line is how a
/// crash mid-append shows up.
struct Lines<'a> {
    rest: &'a [u8],
}

impl<'a> Lines<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = (&'a [u8], bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match self.rest.iter().position(|&b| b == b'\n') {
            Some(at) => {
                let line = &self.rest[..at];
                self.rest = &self.rest[at + 1..];
                Some((line, true))
            }
            None => {
                let line = self.rest;
                self.rest = &[];
                Some((line, false))
            }
        }
    }
}

/// Result of replaying a journal.
#[derive(Debug)]
pub(crate) struct Replay {
    pub(crate) index: Index,
    /// Record lines applied, header excluded.
    pub(crate) record_count: usize,
    /// True when the final line was missing its newline. The truncated tail
    /// is discarded and the journal must be rewritten before it is appended
    /// to again.
    pub(crate) truncated: bool,
}

/// Replays the journal at `path` into a fresh index.
///
/// Entries left in a dirty-only state keep their `current_editor` flag set;
/// the caller reconciles them against the filesystem.
pub(crate) fn replay(path: &Path, app_version: u32, value_count: usize) -> Result<Replay> {
    let bytes = fs::read(path)?;
    let mut lines = Lines::new(&bytes);
    verify_header(&mut lines, app_version, value_count)?;

    let mut index = Index::new();
    let mut record_count = 0;
    let mut truncated = false;
    for (raw, terminated) in lines {
        if !terminated {
            truncated = true;
            break;
        }
        let line = String::from_utf8_lossy(raw);
        let record = Record::parse(&line, value_count).ok_or_else(|| malformed(&line))?;
        apply(&mut index, record, value_count);
        record_count += 1;
    }

    Ok(Replay {
        index,
        record_count,
        truncated,
    })
}

fn verify_header(lines: &mut Lines<'_>, app_version: u32, value_count: usize) -> Result<()> {
    let mut fields = Vec::with_capacity(5);
    for _ in 0..5 {
        match lines.next() {
            Some((raw, true)) => fields.push(String::from_utf8_lossy(raw).into_owned()),
            _ => {
                return Err(CacheError::VersionMismatch(
                    "journal header truncated".to_string(),
                ))
            }
        }
    }
    let matches = fields[0] == MAGIC
        && fields[1] == FORMAT_VERSION
        && fields[2] == app_version.to_string()
        && fields[3] == value_count.to_string()
        && fields[4].is_empty();
    if !matches {
        return Err(CacheError::VersionMismatch(format!(
            "unexpected journal header: [{}, {}, {}, {}]",
            fields[0], fields[1], fields[2], fields[3]
        )));
    }
    Ok(())
}

fn apply(index: &mut Index, record: Record, value_count: usize) {
    match record {
        Record::Dirty(key) => {
            if index.contains(&key) {
                index.touch(&key);
            } else {
                index.insert_new(&key, value_count);
            }
            if let Some(entry) = index.get_mut(&key) {
                entry.current_editor = true;
            }
        }
        Record::Clean { key, lengths } => {
            if index.contains(&key) {
                index.touch(&key);
            } else {
                index.insert_new(&key, value_count);
            }
            if let Some(entry) = index.get_mut(&key) {
                entry.current_editor = false;
            }
            index.publish(&key, lengths);
        }
        // READ on an unknown key is a no-op rather than a phantom entry.
        Record::Read(key) => index.touch(&key),
        Record::Remove(key) => {
            index.remove(&key);
        }
    }
}

fn malformed(line: &str) -> CacheError {
    CacheError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected journal line: {line:?}"),
    ))
}

/// Appending side of the live journal.
#[derive(Debug)]
pub(crate) struct JournalWriter {
    out: BufWriter<File>,
}

impl JournalWriter {
    pub(crate) fn open_append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    /// Appends one record. State-changing verbs are flushed to the OS
    /// immediately, so a dirty slot file can never exist without its DIRTY
    /// record and a committed entry cannot lose its CLEAN to a crash.
    /// READ records stay buffered; losing a recency bump is harmless.
    pub(crate) fn append(&mut self, record: &Record) -> io::Result<()> {
        self.out.write_all(record.line().as_bytes())?;
        if !matches!(record, Record::Read(_)) {
            self.out.flush()?;
        }
        Ok(())
    }

    /// Flushes buffered records and forces them to the storage medium.
    pub(crate) fn sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }
}

fn write_header(out: &mut impl Write, app_version: u32, value_count: usize) -> io::Result<()> {
    writeln!(out, "{MAGIC}")?;
    writeln!(out, "{FORMAT_VERSION}")?;
    writeln!(out, "{app_version}")?;
    writeln!(out, "{value_count}")?;
    writeln!(out)
}

/// Writes a compacted journal for `index` and swaps it over the live one.
///
/// The compacted journal holds one CLEAN per readable entry and one DIRTY
/// per entry with a live editor, least recently used first, so replay
/// reproduces both the entries and their recency order. Returns a writer
/// appending to the new live journal.
pub(crate) fn rewrite(
    layout: &CacheLayout,
    index: &Index,
    app_version: u32,
    value_count: usize,
) -> Result<JournalWriter> {
    let tmp = layout.journal_tmp();
    let mut out = BufWriter::new(File::create(&tmp)?);
    write_header(&mut out, app_version, value_count)?;
    for (key, entry) in index.iter_lru() {
        if entry.readable {
            let clean = Record::Clean {
                key: key.to_string(),
                lengths: entry.lengths.clone(),
            };
            out.write_all(clean.line().as_bytes())?;
        }
        if entry.current_editor {
            // The CLEAN precedes the DIRTY, so an edit interrupted after
            // this compaction reverts to the published lengths on replay
            // instead of expunging the entry.
            out.write_all(Record::Dirty(key.to_string()).line().as_bytes())?;
        }
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    drop(out);

    let live = layout.journal();
    if live.exists() {
        let backup = layout.journal_backup();
        let _ = fs::remove_file(&backup);
        fs::rename(&live, &backup)?;
    }
    fs::rename(&tmp, &live)?;
    let _ = fs::remove_file(layout.journal_backup());

    debug!(entries = index.len(), "journal rewritten");
    JournalWriter::open_append(&live).map_err(CacheError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn record_body(records: &[Record]) -> String {
        records.iter().map(Record::line).collect()
    }

    fn write_journal(dir: &Path, app_version: u32, value_count: usize, body: &str) -> PathBuf {
        let path = dir.join(layout::JOURNAL_FILE);
        let mut content = Vec::new();
        write_header(&mut content, app_version, value_count).expect("header should format");
        content.extend_from_slice(body.as_bytes());
        fs::write(&path, content).expect("journal should be written");
        path
    }

    #[test]
    fn record_lines_match_format() {
        assert_eq!(Record::Dirty("k1".into()).line(), "DIRTY k1\n");
        assert_eq!(
            Record::Clean {
                key: "k1".into(),
                lengths: vec![10, 0]
            }
            .line(),
            "CLEAN k1 10 0\n"
        );
        assert_eq!(Record::Read("k1".into()).line(), "READ k1\n");
        assert_eq!(Record::Remove("k1".into()).line(), "REMOVE k1\n");
    }

    #[test]
    fn parse_round_trips_each_verb() {
        let records = [
            Record::Dirty("abc".into()),
            Record::Clean {
                key: "abc".into(),
                lengths: vec![5, 7],
            },
            Record::Read("abc".into()),
            Record::Remove("abc".into()),
        ];
        for record in records {
            let line = record.line();
            let parsed = Record::parse(line.trim_end(), 2).expect("line should parse");
            assert_eq!(parsed, record);
        }
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        // Unknown verb, wrong arity, bad lengths, bad key.
        assert_eq!(Record::parse("SHRED k1", 2), None);
        assert_eq!(Record::parse("DIRTY", 2), None);
        assert_eq!(Record::parse("DIRTY k1 extra", 2), None);
        assert_eq!(Record::parse("READ k1 extra", 2), None);
        assert_eq!(Record::parse("CLEAN k1 10", 2), None);
        assert_eq!(Record::parse("CLEAN k1 10 20 30", 2), None);
        assert_eq!(Record::parse("CLEAN k1 ten 20", 2), None);
        assert_eq!(Record::parse("CLEAN k1 -1 20", 2), None);
        assert_eq!(Record::parse("DIRTY BadKey", 2), None);
        assert_eq!(Record::parse("DIRTY ../escape", 2), None);
        assert_eq!(Record::parse("", 2), None);
    }

    #[test]
    fn replay_reconstructs_entries_in_order() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let body = record_body(&[
            Record::Dirty("aa".into()),
            Record::Clean {
                key: "aa".into(),
                lengths: vec![3, 4],
            },
            Record::Dirty("bb".into()),
            Record::Clean {
                key: "bb".into(),
                lengths: vec![1, 1],
            },
            Record::Read("aa".into()),
        ]);
        let path = write_journal(dir.path(), 1, 2, &body);

        let replay = replay(&path, 1, 2).expect("journal should replay");
        assert_eq!(replay.record_count, 5);
        assert!(!replay.truncated);
        assert_eq!(replay.index.len(), 2);
        assert_eq!(replay.index.size(), 9);

        let order: Vec<&str> = replay.index.iter_lru().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["bb", "aa"]);

        let aa = replay.index.get("aa").expect("aa should exist");
        assert!(aa.readable);
        assert!(!aa.current_editor);
        assert_eq!(aa.lengths, vec![3, 4]);
    }

    #[test]
    fn replay_tracks_removals_and_live_editors() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let body = record_body(&[
            Record::Dirty("aa".into()),
            Record::Clean {
                key: "aa".into(),
                lengths: vec![3, 4],
            },
            Record::Remove("aa".into()),
            Record::Dirty("bb".into()),
        ]);
        let path = write_journal(dir.path(), 1, 2, &body);

        let replay = replay(&path, 1, 2).expect("journal should replay");
        assert_eq!(replay.index.size(), 0);
        assert!(!replay.index.contains("aa"));

        let bb = replay.index.get("bb").expect("bb should exist");
        assert!(bb.current_editor);
        assert!(!bb.readable);
    }

    #[test]
    fn replay_discards_truncated_tail() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let mut body = record_body(&[
            Record::Dirty("aa".into()),
            Record::Clean {
                key: "aa".into(),
                lengths: vec![3, 4],
            },
        ]);
        body.push_str("DIRTY b");
        let path = write_journal(dir.path(), 1, 2, &body);

        let replay = replay(&path, 1, 2).expect("journal should replay");
        assert!(replay.truncated);
        assert_eq!(replay.record_count, 2);
        assert_eq!(replay.index.len(), 1);
        assert!(!replay.index.contains("b"));
    }

    #[test]
    fn replay_rejects_header_mismatch() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = write_journal(dir.path(), 7, 2, "");

        match replay(&path, 1, 2) {
            Err(CacheError::VersionMismatch(_)) => {}
            other => panic!("expected VersionMismatch, got {other:?}"),
        }

        let path = write_journal(dir.path(), 1, 3, "");
        match replay(&path, 1, 2) {
            Err(CacheError::VersionMismatch(_)) => {}
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn replay_fails_on_unknown_verb() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = write_journal(dir.path(), 1, 2, "SHRED aa\n");

        match replay(&path, 1, 2) {
            Err(CacheError::Io(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::InvalidData);
            }
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn read_before_any_write_does_not_create_an_entry() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = write_journal(dir.path(), 1, 2, "READ aa\n");

        let replay = replay(&path, 1, 2).expect("journal should replay");
        assert_eq!(replay.index.len(), 0);
        assert_eq!(replay.record_count, 1);
    }

    #[test]
    fn rewrite_then_replay_then_rewrite_is_stable() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let layout = CacheLayout::new(dir.path().to_path_buf());

        let mut index = Index::new();
        index.insert_new("aa", 2);
        index.publish("aa", vec![3, 4]);
        index.insert_new("bb", 2);
        index.get_mut("bb").expect("bb should exist").current_editor = true;
        index.insert_new("cc", 2);
        index.publish("cc", vec![0, 9]);
        index.touch("aa");
        // aa is both published and mid-edit; its CLEAN must survive the
        // compaction alongside the DIRTY.
        index.get_mut("aa").expect("aa should exist").current_editor = true;

        drop(rewrite(&layout, &index, 1, 2).expect("journal should rewrite"));
        let first = fs::read(layout.journal()).expect("journal should be readable");

        let replayed = replay(&layout.journal(), 1, 2).expect("journal should replay");
        drop(rewrite(&layout, &replayed.index, 1, 2).expect("journal should rewrite"));
        let second = fs::read(layout.journal()).expect("journal should be readable");

        assert_eq!(first, second);
        assert!(!layout.journal_tmp().exists());
        assert!(!layout.journal_backup().exists());

        let text = String::from_utf8(first).expect("journal is ascii");
        let mut lines = text.lines().skip(5);
        assert_eq!(lines.next(), Some("DIRTY bb"));
        assert_eq!(lines.next(), Some("CLEAN cc 0 9"));
        assert_eq!(lines.next(), Some("CLEAN aa 3 4"));
        assert_eq!(lines.next(), Some("DIRTY aa"));
        assert_eq!(lines.next(), None);
    }
}
