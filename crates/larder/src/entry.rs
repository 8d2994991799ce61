//! Per-key entry records.

/// State of one key across all of its slots.
///
/// Entries are plain records owned by the index and addressed by key; editors
/// and snapshots hold the key and re-look the entry up under the cache lock
/// when they need it.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    /// Byte length of each published slot; zero for slots never published.
    pub(crate) lengths: Vec<u64>,

    /// True once every slot has been published at least once.
    pub(crate) readable: bool,

    /// True while an editor holds this entry.
    pub(crate) current_editor: bool,

    /// Token stamped at publish time; used to detect stale snapshots.
    pub(crate) sequence_number: u64,
}

impl Entry {
    pub(crate) fn new(value_count: usize) -> Self {
        Self {
            lengths: vec![0; value_count],
            readable: false,
            current_editor: false,
            sequence_number: 0,
        }
    }

    /// Sum of the published slot lengths.
    pub(crate) fn total_length(&self) -> u64 {
        self.lengths.iter().sum()
    }
}
