//! Sparse index
//!
//! An in-memory `(timestamp, record_index)` subsample of the on-disk array,
//! one entry every `step` records. Binary search over the entries plus a
//! short forward scan bounds every timestamp lookup to
//! `O(log(N/step) + step)`.

use crate::error::Result;
use crate::storage::file::DataFile;
use crate::types::{IndexEntry, Timestamp};

/// Ordered index entries with a fixed stride
#[derive(Debug, Clone)]
pub struct SparseIndex {
    entries: Vec<IndexEntry>,
    step: usize,
}

impl SparseIndex {
    /// Create an empty index with the given stride. A stride of zero would
    /// never index anything and is normalized to 1.
    pub fn new(step: usize) -> Self {
        Self {
            entries: Vec::new(),
            step: step.max(1),
        }
    }

    /// Rebuild the index from disk by reading only the timestamp field at
    /// every stride position. Payload integrity is enforced at query time,
    /// not here.
    pub fn build(file: &DataFile, record_count: usize, step: usize) -> Result<Self> {
        let mut index = Self::new(step);
        let mut position = 0;
        while position < record_count {
            let timestamp = file.read_timestamp(position)?;
            index.entries.push(IndexEntry {
                timestamp,
                record_index: position,
            });
            position += index.step;
        }
        Ok(index)
    }

    /// Record an entry when `position` lands on the stride.
    ///
    /// `position` is the record's index before the persisted count is
    /// incremented, so entries sit at positions 0, step, 2*step, ... -
    /// the same shape [`SparseIndex::build`] reconstructs on open.
    pub fn observe_append(&mut self, timestamp: Timestamp, position: usize) {
        if position % self.step == 0 {
            self.entries.push(IndexEntry {
                timestamp,
                record_index: position,
            });
        }
    }

    /// Greatest entry with `timestamp <= target`, or `None` when every
    /// entry is newer than `target`
    pub fn anchor_before(&self, target: Timestamp) -> Option<IndexEntry> {
        if self.entries.first().map_or(true, |e| e.timestamp > target) {
            return None;
        }
        // Half-open binary search for the first entry past `target`; the
        // guard above ensures the partition point is at least 1.
        let mut lo = 0;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entries[mid].timestamp <= target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Some(self.entries[lo - 1])
    }

    /// Timestamp of the first indexed record, when any
    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.entries.first().map(|e| e.timestamp)
    }

    /// The index stride
    pub fn step(&self) -> usize {
        self.step
    }

    /// All entries in record order
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no records have been indexed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
