//! HNSW (Hierarchical Navigable Small World) proximity graph over one sealed
//! segment.
//!
//! Nodes are record positions within the segment; tombstones get no node. The
//! graph holds only adjacency lists. Vectors are read from the segment through
//! [`VectorSource`], so an index snapshot is small and is rebuilt only by
//! replacing the segment.
//!
//! Construction is greedy and layered: each node draws a top layer from an
//! exponential distribution (seeded, so a rebuild reproduces the same graph),
//! descends from the entry point with a beam of one, then links to the `m`
//! closest nodes found by a beam of `ef_construction` on each of its layers.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use bit_vec::BitVec;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};
use crate::index::config::HnswConfig;
use crate::query::cancel::CancelToken;
use crate::vector::{DistanceMetric, VectorRecord};

/// Highest layer a node may be assigned.
const MAX_LEVEL: usize = 16;

/// How many node expansions happen between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 64;

/// Random access to the vectors an index was built over.
pub trait VectorSource {
    /// Number of addressable positions.
    fn node_count(&self) -> usize;

    /// Vector at `node`, or `None` when the position holds no vector.
    fn vector(&self, node: usize) -> Option<&[f32]>;

    /// Tie-break key of `node`: among equally distant nodes the lower rank
    /// wins. Defaults to the position itself.
    fn rank(&self, node: usize) -> u32 {
        node as u32
    }
}

impl VectorSource for [Arc<VectorRecord>] {
    fn node_count(&self) -> usize {
        self.len()
    }

    fn vector(&self, node: usize) -> Option<&[f32]> {
        self.get(node)
            .filter(|record| !record.deleted)
            .map(|record| record.embedding.as_slice())
    }
}

impl VectorSource for Vec<Arc<VectorRecord>> {
    fn node_count(&self) -> usize {
        self.as_slice().node_count()
    }

    fn vector(&self, node: usize) -> Option<&[f32]> {
        self.as_slice().vector(node)
    }
}

/// Records of a segment paired with the ascending-id rank of each position,
/// so that equally distant records are ordered by id.
#[derive(Debug, Clone, Copy)]
pub struct RankedRecords<'a> {
    pub records: &'a [Arc<VectorRecord>],
    pub ranks: &'a [u32],
}

impl<'a> RankedRecords<'a> {
    pub fn new(records: &'a [Arc<VectorRecord>], ranks: &'a [u32]) -> Self {
        RankedRecords { records, ranks }
    }
}

impl VectorSource for RankedRecords<'_> {
    fn node_count(&self) -> usize {
        self.records.len()
    }

    fn vector(&self, node: usize) -> Option<&[f32]> {
        self.records.vector(node)
    }

    fn rank(&self, node: usize) -> u32 {
        self.ranks.get(node).copied().unwrap_or(node as u32)
    }
}

/// Rank of every position of `records` in ascending `(id, seq)` order.
pub fn id_ranks(records: &[Arc<VectorRecord>]) -> Vec<u32> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| {
        records[a]
            .id
            .cmp(&records[b].id)
            .then_with(|| records[a].seq.cmp(&records[b].seq))
    });
    let mut ranks = vec![0u32; records.len()];
    for (rank, position) in order.into_iter().enumerate() {
        ranks[position] = rank as u32;
    }
    ranks
}

/// Priority queue entry for HNSW search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchCandidate {
    pub distance: f32,
    /// Tie-break key, see [`VectorSource::rank`].
    pub rank: u32,
    pub node: u32,
}

impl Eq for SearchCandidate {}

impl PartialOrd for SearchCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.rank.cmp(&other.rank))
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// The proximity graph of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswIndex {
    metric: DistanceMetric,
    m: usize,
    m_upper: usize,
    /// `neighbors[node][layer]`; empty for positions without a vector.
    neighbors: Vec<Vec<Vec<u32>>>,
    entry_point: Option<u32>,
    max_level: usize,
    indexed: usize,
}

impl HnswIndex {
    /// Build the graph over every vector in `source`.
    pub fn build<S: VectorSource + ?Sized>(
        source: &S,
        metric: DistanceMetric,
        config: &HnswConfig,
    ) -> Result<Self> {
        config.validate()?;
        let node_count = source.node_count();
        if node_count > u32::MAX as usize {
            return Err(QuiverError::invalid_argument(
                "segment too large for a single index",
            ));
        }

        let mut index = HnswIndex {
            metric,
            m: config.m,
            m_upper: config.m_upper,
            neighbors: vec![Vec::new(); node_count],
            entry_point: None,
            max_level: 0,
            indexed: 0,
        };
        let mut rng = StdRng::seed_from_u64(config.seed);
        let ml = config.level_multiplier();
        let no_cancel = CancelToken::new();

        for node in 0..node_count {
            let Some(vector) = source.vector(node) else {
                continue;
            };
            let level = select_level(&mut rng, ml);
            index.neighbors[node] = vec![Vec::new(); level + 1];
            index.indexed += 1;

            let Some(entry) = index.entry_point else {
                index.entry_point = Some(node as u32);
                index.max_level = level;
                continue;
            };

            let mut entry_points = vec![entry];
            for layer in ((level + 1)..=index.max_level).rev() {
                entry_points = index
                    .search_layer(source, vector, &entry_points, 1, layer, None, &no_cancel)?
                    .into_iter()
                    .map(|c| c.node)
                    .take(1)
                    .collect();
            }

            for layer in (0..=level.min(index.max_level)).rev() {
                let candidates = index.search_layer(
                    source,
                    vector,
                    &entry_points,
                    config.ef_construction,
                    layer,
                    None,
                    &no_cancel,
                )?;
                let max_connections = index.max_connections(layer);
                let selected: Vec<u32> = candidates
                    .iter()
                    .take(max_connections)
                    .map(|c| c.node)
                    .collect();

                index.neighbors[node][layer] = selected.clone();
                for &neighbor in &selected {
                    index.neighbors[neighbor as usize][layer].push(node as u32);
                    if index.neighbors[neighbor as usize][layer].len() > max_connections {
                        index.prune_connections(source, neighbor as usize, layer, max_connections);
                    }
                }

                entry_points = candidates.into_iter().map(|c| c.node).collect();
            }

            if level > index.max_level {
                index.entry_point = Some(node as u32);
                index.max_level = level;
            }
        }

        Ok(index)
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Number of positions the index was built over (vectors or not).
    pub fn node_count(&self) -> usize {
        self.neighbors.len()
    }

    /// Number of vectors in the graph.
    pub fn len(&self) -> usize {
        self.indexed
    }

    pub fn is_empty(&self) -> bool {
        self.indexed == 0
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// Neighbors of `node` on `layer`.
    pub fn neighbors(&self, node: usize, layer: usize) -> &[u32] {
        self.neighbors
            .get(node)
            .and_then(|layers| layers.get(layer))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Find up to `k` nodes closest to `query` for which `allow` holds.
    ///
    /// `ef` bounds the candidate list on layer 0 and is raised to at least
    /// `k`. Nodes rejected by `allow` are still traversed, so the filter does
    /// not disconnect the graph. If the graph walk yields fewer than `k`
    /// allowed nodes, the remaining positions are scanned exhaustively.
    /// Results are ordered by ascending distance, then [`VectorSource::rank`].
    pub fn search<S: VectorSource + ?Sized>(
        &self,
        source: &S,
        query: &[f32],
        k: usize,
        ef: usize,
        allow: &dyn Fn(usize) -> bool,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchCandidate>> {
        if source.node_count() != self.node_count() {
            return Err(QuiverError::internal(format!(
                "index built over {} positions, segment has {}",
                self.node_count(),
                source.node_count()
            )));
        }
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut entry_points = vec![entry];
        for layer in (1..=self.max_level).rev() {
            entry_points = self
                .search_layer(source, query, &entry_points, 1, layer, None, cancel)?
                .into_iter()
                .map(|c| c.node)
                .take(1)
                .collect();
        }

        let ef = ef.max(k);
        let mut results =
            self.search_layer(source, query, &entry_points, ef, 0, Some(allow), cancel)?;

        if results.len() < k && results.len() < self.indexed {
            results = self.exhaustive(source, query, k, allow, cancel)?;
        }

        results.truncate(k);
        Ok(results)
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 { self.m } else { self.m_upper }
    }

    #[allow(clippy::too_many_arguments)]
    fn search_layer<S: VectorSource + ?Sized>(
        &self,
        source: &S,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        layer: usize,
        allow: Option<&dyn Fn(usize) -> bool>,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchCandidate>> {
        let mut visited = BitVec::from_elem(self.neighbors.len(), false);
        let mut candidates = BinaryHeap::new(); // Min-heap of nodes to expand
        let mut results: BinaryHeap<SearchCandidate> = BinaryHeap::new(); // Max-heap of best nodes
        let allowed = |node: u32| allow.map(|f| f(node as usize)).unwrap_or(true);

        for &entry in entry_points {
            if visited.get(entry as usize).unwrap_or(true) {
                continue;
            }
            visited.set(entry as usize, true);
            if let Some(vector) = source.vector(entry as usize) {
                let candidate = SearchCandidate {
                    distance: self.metric.distance_unchecked(query, vector),
                    rank: source.rank(entry as usize),
                    node: entry,
                };
                candidates.push(Reverse(candidate));
                if allowed(entry) {
                    results.push(candidate);
                }
            }
        }

        let mut expansions = 0usize;
        while let Some(Reverse(current)) = candidates.pop() {
            if results.len() >= ef {
                if let Some(farthest) = results.peek() {
                    if current.distance > farthest.distance {
                        break;
                    }
                }
            }

            expansions += 1;
            if expansions % CANCEL_CHECK_INTERVAL == 0 {
                cancel.check()?;
            }

            for &neighbor in self.neighbors(current.node as usize, layer) {
                let idx = neighbor as usize;
                if visited.get(idx).unwrap_or(true) {
                    continue;
                }
                visited.set(idx, true);

                let Some(vector) = source.vector(idx) else {
                    continue;
                };
                let candidate = SearchCandidate {
                    distance: self.metric.distance_unchecked(query, vector),
                    rank: source.rank(idx),
                    node: neighbor,
                };

                let closer_than_worst = results
                    .peek()
                    .map(|farthest| candidate < *farthest)
                    .unwrap_or(true);
                if results.len() < ef || closer_than_worst {
                    candidates.push(Reverse(candidate));
                    if allowed(neighbor) {
                        results.push(candidate);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        Ok(results.into_sorted_vec())
    }

    fn exhaustive<S: VectorSource + ?Sized>(
        &self,
        source: &S,
        query: &[f32],
        k: usize,
        allow: &dyn Fn(usize) -> bool,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchCandidate>> {
        let mut results: BinaryHeap<SearchCandidate> = BinaryHeap::with_capacity(k + 1);
        for node in 0..source.node_count() {
            if node % (CANCEL_CHECK_INTERVAL * 16) == 0 {
                cancel.check()?;
            }
            let Some(vector) = source.vector(node) else {
                continue;
            };
            if !allow(node) {
                continue;
            }
            results.push(SearchCandidate {
                distance: self.metric.distance_unchecked(query, vector),
                rank: source.rank(node),
                node: node as u32,
            });
            if results.len() > k {
                results.pop();
            }
        }
        Ok(results.into_sorted_vec())
    }

    /// Keep only the `max_connections` closest neighbors of `node` on `layer`.
    fn prune_connections<S: VectorSource + ?Sized>(
        &mut self,
        source: &S,
        node: usize,
        layer: usize,
        max_connections: usize,
    ) {
        let Some(base) = source.vector(node) else {
            return;
        };
        let mut scored: Vec<SearchCandidate> = self.neighbors[node][layer]
            .iter()
            .filter_map(|&neighbor| {
                source.vector(neighbor as usize).map(|v| SearchCandidate {
                    distance: self.metric.distance_unchecked(base, v),
                    rank: source.rank(neighbor as usize),
                    node: neighbor,
                })
            })
            .collect();
        scored.sort();
        scored.truncate(max_connections);
        self.neighbors[node][layer] = scored.into_iter().map(|c| c.node).collect();
    }
}

/// Randomly select a layer for a new node using the level multiplier.
fn select_level(rng: &mut StdRng, ml: f64) -> usize {
    let uniform: f64 = 1.0 - rng.random::<f64>(); // (0, 1]
    ((-uniform.ln() * ml).floor() as usize).min(MAX_LEVEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(vectors: Vec<Vec<f32>>) -> Vec<Arc<VectorRecord>> {
        vectors
            .into_iter()
            .enumerate()
            .map(|(i, v)| Arc::new(VectorRecord::new(format!("r{i}"), v).with_seq(i as u64 + 1)))
            .collect()
    }

    fn grid(n: usize) -> Vec<Arc<VectorRecord>> {
        records(
            (0..n)
                .map(|i| vec![(i % 10) as f32, (i / 10) as f32, ((i * 7) % 13) as f32])
                .collect(),
        )
    }

    fn brute_force(source: &[Arc<VectorRecord>], query: &[f32], k: usize) -> Vec<u32> {
        let mut scored: Vec<SearchCandidate> = (0..source.len())
            .filter_map(|i| {
                source.vector(i).map(|v| SearchCandidate {
                    distance: DistanceMetric::L2.distance_unchecked(query, v),
                    rank: i as u32,
                    node: i as u32,
                })
            })
            .collect();
        scored.sort();
        scored.into_iter().take(k).map(|c| c.node).collect()
    }

    #[test]
    fn test_empty_index() {
        let source: Vec<Arc<VectorRecord>> = Vec::new();
        let index = HnswIndex::build(&source, DistanceMetric::L2, &HnswConfig::default()).unwrap();
        assert!(index.is_empty());
        let results = index
            .search(&source, &[0.0], 3, 10, &|_| true, &CancelToken::new())
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_exact_match_is_first() {
        let source = grid(200);
        let index = HnswIndex::build(&source, DistanceMetric::L2, &HnswConfig::default()).unwrap();
        assert_eq!(index.len(), 200);

        for node in [0usize, 57, 123, 199] {
            let query = source[node].embedding.clone();
            let results = index
                .search(&source, &query, 1, 64, &|_| true, &CancelToken::new())
                .unwrap();
            assert_eq!(results[0].distance, 0.0);
            // Duplicated points share distance 0; ties go to the lower node.
            assert!(results[0].node as usize <= node);
        }
    }

    #[test]
    fn test_recall_against_brute_force() {
        let source = grid(300);
        let index = HnswIndex::build(&source, DistanceMetric::L2, &HnswConfig::default()).unwrap();

        let query = [4.5, 12.2, 6.1];
        let expected = brute_force(&source, &query, 10);
        let found: Vec<u32> = index
            .search(&source, &query, 10, 128, &|_| true, &CancelToken::new())
            .unwrap()
            .into_iter()
            .map(|c| c.node)
            .collect();

        let hits = found.iter().filter(|n| expected.contains(n)).count();
        assert!(hits >= 9, "recall too low: {hits}/10");
    }

    #[test]
    fn test_tombstones_are_not_indexed() {
        let mut source = grid(20);
        source[3] = Arc::new(VectorRecord::tombstone("r3").with_seq(99));

        let index = HnswIndex::build(&source, DistanceMetric::L2, &HnswConfig::default()).unwrap();
        assert_eq!(index.len(), 19);
        assert_eq!(index.node_count(), 20);

        let results = index
            .search(&source, &[3.0, 0.0, 8.0], 20, 32, &|_| true, &CancelToken::new())
            .unwrap();
        assert_eq!(results.len(), 19);
        assert!(results.iter().all(|c| c.node != 3));
    }

    #[test]
    fn test_filtered_search_only_returns_allowed_nodes() {
        let source = grid(150);
        let index = HnswIndex::build(&source, DistanceMetric::L2, &HnswConfig::default()).unwrap();

        let allow = |node: usize| node % 25 == 0;
        let results = index
            .search(&source, &[0.0, 0.0, 0.0], 10, 16, &allow, &CancelToken::new())
            .unwrap();

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|c| c.node % 25 == 0));
        assert!(results.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_build_is_deterministic() {
        let source = grid(120);
        let a = HnswIndex::build(&source, DistanceMetric::Cosine, &HnswConfig::default()).unwrap();
        let b = HnswIndex::build(&source, DistanceMetric::Cosine, &HnswConfig::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_degree_is_bounded() {
        let source = grid(400);
        let config = HnswConfig::default().with_m(6).with_ef_construction(32);
        let index = HnswIndex::build(&source, DistanceMetric::L2, &config).unwrap();

        for node in 0..source.len() {
            assert!(index.neighbors(node, 0).len() <= 6);
            for layer in 1..=index.max_level() {
                assert!(index.neighbors(node, layer).len() <= 3);
            }
        }
    }

    #[test]
    fn test_cancelled_search() {
        let source = grid(1_000);
        let config = HnswConfig::default().with_ef_construction(64);
        let index = HnswIndex::build(&source, DistanceMetric::L2, &config).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = index
            .search(&source, &[1.0, 1.0, 1.0], 10, 400, &|_| true, &cancel)
            .unwrap_err();
        assert!(matches!(err, QuiverError::OperationCancelled(_)));
    }
}
