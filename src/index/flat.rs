//! Brute-force scan, used for the active segment which has no graph yet.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::Result;
use crate::index::hnsw::SearchCandidate;
use crate::query::cancel::CancelToken;
use crate::vector::distance::compare_scored;
use crate::vector::{DistanceMetric, VectorRecord};

const CANCEL_CHECK_INTERVAL: usize = 1024;

struct Hit<'a> {
    distance: f32,
    id: &'a str,
    node: u32,
}

impl PartialEq for Hit<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Hit<'_> {}

impl PartialOrd for Hit<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hit<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_scored(self.distance, self.id, other.distance, other.id)
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// Exact top-`k` over `records`, skipping tombstones and records rejected by
/// `allow`. Ordered by ascending distance, ties by ascending id.
pub fn scan(
    records: &[Arc<VectorRecord>],
    query: &[f32],
    k: usize,
    metric: DistanceMetric,
    allow: &dyn Fn(usize, &VectorRecord) -> bool,
    cancel: &CancelToken,
) -> Result<Vec<SearchCandidate>> {
    if k == 0 {
        return Ok(Vec::new());
    }

    let mut heap: BinaryHeap<Hit<'_>> = BinaryHeap::with_capacity(k + 1);
    for (position, record) in records.iter().enumerate() {
        if position % CANCEL_CHECK_INTERVAL == 0 {
            cancel.check()?;
        }
        if record.deleted || !allow(position, record) {
            continue;
        }

        let hit = Hit {
            distance: metric.distance_unchecked(query, &record.embedding),
            id: &record.id,
            node: position as u32,
        };
        if heap.len() < k {
            heap.push(hit);
        } else if heap.peek().is_some_and(|worst| hit < *worst) {
            heap.pop();
            heap.push(hit);
        }
    }

    Ok(heap
        .into_sorted_vec()
        .into_iter()
        .map(|hit| SearchCandidate {
            distance: hit.distance,
            rank: hit.node,
            node: hit.node,
        })
        .collect())
}
