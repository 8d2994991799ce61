//! In-memory index with access ordering and size accounting.
//!
//! The index is the source of truth between journal flushes: a map from
//! normalized key to [`Entry`] plus a recency queue (front = least recently
//! used) and the running byte total of all readable entries. It is always
//! reconstructible from the journal plus file presence.

use std::collections::{HashMap, VecDeque};

use crate::entry::Entry;

#[derive(Debug, Default)]
pub(crate) struct Index {
    entries: HashMap<String, Entry>,
    /// LRU queue: front = least recently used, back = most recently used.
    recency: VecDeque<String>,
    /// Sum of slot lengths over all readable entries.
    size: u64,
}

impl Index {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts a fresh entry at the most-recently-used position.
    ///
    /// The key must not already be present.
    pub(crate) fn insert_new(&mut self, key: &str, value_count: usize) -> &mut Entry {
        debug_assert!(!self.entries.contains_key(key));
        self.recency.push_back(key.to_string());
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(value_count))
    }

    /// Moves a key to the most-recently-used position.
    pub(crate) fn touch(&mut self, key: &str) {
        if !self.entries.contains_key(key) {
            return;
        }
        // Remove from current position and add to back (most recent).
        self.recency.retain(|k| k != key);
        self.recency.push_back(key.to_string());
    }

    /// Records newly published lengths for `key`, marking it readable and
    /// keeping the running size total consistent.
    pub(crate) fn publish(&mut self, key: &str, lengths: Vec<u64>) {
        if let Some(entry) = self.entries.get_mut(key) {
            let old: u64 = entry.lengths.iter().sum();
            let new: u64 = lengths.iter().sum();
            self.size = self.size - old + new;
            entry.lengths = lengths;
            entry.readable = true;
        }
    }

    /// Removes an entry, subtracting its published bytes from the total.
    pub(crate) fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.recency.retain(|k| k != key);
        self.size = self.size.saturating_sub(entry.total_length());
        Some(entry)
    }

    /// First key from the least-recently-used end without a live editor.
    pub(crate) fn next_evictable(&self) -> Option<&str> {
        self.recency
            .iter()
            .find(|key| {
                self.entries
                    .get(key.as_str())
                    .is_some_and(|entry| !entry.current_editor)
            })
            .map(String::as_str)
    }

    /// Entries from least to most recently used.
    pub(crate) fn iter_lru(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.recency
            .iter()
            .filter_map(|key| self.entries.get_key_value(key))
            .map(|(key, entry)| (key.as_str(), entry))
    }

    /// Keys of entries currently holding an editor, LRU first.
    pub(crate) fn keys_with_editor(&self) -> Vec<String> {
        self.iter_lru()
            .filter(|(_, entry)| entry.current_editor)
            .map(|(key, _)| key.to_string())
            .collect()
    }
}
