//! The active segment: the in-memory buffer accepting writes.
//!
//! Records are only ever appended, in WAL sequence order. Readers take a
//! [`ActiveSnapshot`] (a cheap copy of the record pointers) and scan it
//! without holding any lock, so a concurrent append is never blocked by a
//! long scan and a scan never sees a partially written record.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::vector::VectorRecord;

#[derive(Debug)]
pub struct ActiveSegment {
    id: u64,
    dimension: usize,
    records: RwLock<Vec<Arc<VectorRecord>>>,
    /// Records already persisted to the segment file.
    flushed: AtomicUsize,
}

impl ActiveSegment {
    pub fn new(id: u64, dimension: usize) -> Self {
        ActiveSegment {
            id,
            dimension,
            records: RwLock::new(Vec::new()),
            flushed: AtomicUsize::new(0),
        }
    }

    /// Rebuild from records recovered from the segment file.
    pub fn with_flushed(id: u64, dimension: usize, records: Vec<Arc<VectorRecord>>) -> Self {
        let flushed = records.len();
        ActiveSegment {
            id,
            dimension,
            records: RwLock::new(records),
            flushed: AtomicUsize::new(flushed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Append a record. The caller serialises writers and validates it.
    pub fn push(&self, record: Arc<VectorRecord>) {
        self.records.write().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flushed_count(&self) -> usize {
        self.flushed.load(Ordering::Acquire)
    }

    /// Buffered records not yet persisted to the segment file.
    pub fn pending_count(&self) -> usize {
        self.len().saturating_sub(self.flushed_count())
    }

    pub(crate) fn mark_flushed(&self, count: usize) {
        self.flushed.fetch_max(count, Ordering::AcqRel);
    }

    /// Records from `start` onwards.
    pub fn records_from(&self, start: usize) -> Vec<Arc<VectorRecord>> {
        let records = self.records.read();
        records.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Highest sequence number in the buffer.
    pub fn last_seq(&self) -> Option<u64> {
        self.records.read().last().map(|r| r.seq)
    }

    /// Immutable view of every record buffered so far.
    pub fn snapshot(&self) -> ActiveSnapshot {
        ActiveSnapshot {
            segment_id: self.id,
            records: Arc::new(self.records.read().clone()),
        }
    }
}

/// Point-in-time copy of the active segment's record list.
#[derive(Debug, Clone)]
pub struct ActiveSnapshot {
    pub segment_id: u64,
    pub records: Arc<Vec<Arc<VectorRecord>>>,
}

impl ActiveSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
