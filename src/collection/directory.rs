//! In-memory map from record id to the sequence number of its newest version.
//!
//! Segments are never rewritten when a record is replaced or deleted. Instead
//! a stored record is live only while the directory still points at its
//! sequence number and that version is not a tombstone.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::segment::SegmentView;
use crate::vector::VectorRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub seq: u64,
    pub deleted: bool,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, DirectoryEntry>,
    live: usize,
}

#[derive(Debug, Default)]
pub struct RecordDirectory {
    inner: RwLock<Inner>,
}

impl RecordDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the directory from every readable record of `view`.
    pub fn rebuild(view: &SegmentView) -> Self {
        let directory = RecordDirectory::new();
        {
            let mut inner = directory.inner.write();
            for segment in view.healthy_sealed() {
                for record in segment.records().iter() {
                    apply_locked(&mut inner, record);
                }
            }
            for record in view.active.snapshot().records.iter() {
                apply_locked(&mut inner, record);
            }
        }
        directory
    }

    /// Record a new version. Older versions than the one known are ignored.
    pub fn apply(&self, record: &VectorRecord) {
        apply_locked(&mut self.inner.write(), record);
    }

    pub fn get(&self, id: &str) -> Option<DirectoryEntry> {
        self.inner.read().entries.get(id).copied()
    }

    /// Sequence number of the live version of `id`.
    pub fn live_seq(&self, id: &str) -> Option<u64> {
        self.get(id).filter(|e| !e.deleted).map(|e| e.seq)
    }

    pub fn contains_live(&self, id: &str) -> bool {
        self.live_seq(id).is_some()
    }

    /// Whether `record` is the current, non-deleted version of its id.
    pub fn is_live(&self, record: &VectorRecord) -> bool {
        !record.deleted && self.live_seq(&record.id) == Some(record.seq)
    }

    /// Whether `record` is the newest version of its id, tombstones included.
    pub fn is_current(&self, record: &VectorRecord) -> bool {
        self.get(&record.id).is_some_and(|e| e.seq == record.seq)
    }

    /// Forget a tombstone that no longer exists anywhere on disk.
    pub fn forget_tombstone(&self, id: &str, seq: u64) {
        let mut inner = self.inner.write();
        if inner
            .entries
            .get(id)
            .is_some_and(|e| e.deleted && e.seq == seq)
        {
            inner.entries.remove(id);
        }
    }

    /// Number of live ids.
    pub fn live_count(&self) -> usize {
        self.inner.read().live
    }

    /// Number of ids known, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn apply_locked(inner: &mut Inner, record: &VectorRecord) {
    let next = DirectoryEntry {
        seq: record.seq,
        deleted: record.deleted,
    };
    match inner.entries.get_mut(&record.id) {
        Some(existing) if existing.seq >= record.seq => {}
        Some(existing) => {
            match (existing.deleted, next.deleted) {
                (true, false) => inner.live += 1,
                (false, true) => inner.live -= 1,
                _ => {}
            }
            *existing = next;
        }
        None => {
            if !next.deleted {
                inner.live += 1;
            }
            inner.entries.insert(record.id.clone(), next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(id: &str, seq: u64) -> VectorRecord {
        VectorRecord::new(id, vec![1.0]).with_seq(seq)
    }

    #[test]
    fn test_newest_version_wins() {
        let directory = RecordDirectory::new();
        directory.apply(&put("a", 1));
        directory.apply(&put("a", 5));
        directory.apply(&put("a", 3));

        assert_eq!(directory.live_seq("a"), Some(5));
        assert!(directory.is_live(&put("a", 5)));
        assert!(!directory.is_live(&put("a", 1)));
        assert_eq!(directory.live_count(), 1);
    }

    #[test]
    fn test_tombstones_track_live_count() {
        let directory = RecordDirectory::new();
        directory.apply(&put("a", 1));
        directory.apply(&put("b", 2));
        directory.apply(&VectorRecord::tombstone("a").with_seq(3));

        assert_eq!(directory.live_count(), 1);
        assert!(!directory.contains_live("a"));
        assert!(directory.is_current(&VectorRecord::tombstone("a").with_seq(3)));

        directory.apply(&put("a", 4));
        assert_eq!(directory.live_count(), 2);

        directory.forget_tombstone("a", 3);
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_forget_tombstone_only_removes_matching_entry() {
        let directory = RecordDirectory::new();
        directory.apply(&VectorRecord::tombstone("a").with_seq(2));
        directory.forget_tombstone("a", 1);
        assert_eq!(directory.len(), 1);
        directory.forget_tombstone("a", 2);
        assert!(directory.is_empty());
        assert_eq!(directory.live_count(), 0);
    }
}
