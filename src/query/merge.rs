//! K-way merge of per-segment ranked lists.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use crate::vector::VectorRecord;
use crate::vector::distance::compare_scored;

/// A record found by one segment search.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub distance: f32,
    pub record: Arc<VectorRecord>,
    pub segment_id: u64,
}

impl ScoredRecord {
    pub fn compare(&self, other: &Self) -> Ordering {
        compare_scored(self.distance, &self.record.id, other.distance, &other.record.id)
    }
}

/// Head of one input list, ordered so the `BinaryHeap` pops the smallest.
struct Head {
    item: ScoredRecord,
    list: usize,
    next: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .item
            .compare(&self.item)
            .then_with(|| other.list.cmp(&self.list))
    }
}

/// Sort one segment's hits into merge order.
pub fn sort_ranked(list: &mut [ScoredRecord]) {
    list.sort_by(|a, b| a.compare(b));
}

/// Merge lists that are each sorted by [`sort_ranked`] into the overall top
/// `k`. An id seen again further down is dropped.
pub fn merge_ranked(lists: Vec<Vec<ScoredRecord>>, k: usize) -> Vec<ScoredRecord> {
    let mut heap = BinaryHeap::with_capacity(lists.len());
    for (list, items) in lists.iter().enumerate() {
        if let Some(first) = items.first() {
            heap.push(Head {
                item: first.clone(),
                list,
                next: 1,
            });
        }
    }

    let mut merged = Vec::with_capacity(k);
    let mut seen = HashSet::new();
    while merged.len() < k {
        let Some(head) = heap.pop() else { break };
        if let Some(item) = lists[head.list].get(head.next) {
            heap.push(Head {
                item: item.clone(),
                list: head.list,
                next: head.next + 1,
            });
        }
        if seen.insert(head.item.record.id.clone()) {
            merged.push(head.item);
        }
    }
    merged
}
