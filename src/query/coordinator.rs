//! The query coordinator.
//!
//! A query fans out to one task per segment on a dedicated rayon pool: graph
//! search on each healthy sealed segment and a brute-force scan of the active
//! segment. Each task applies the liveness check and the metadata filter
//! while it searches, so the per-segment lists only hold candidates that can
//! be returned. The lists are then combined with a k-way merge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::collection::directory::RecordDirectory;
use crate::error::{QuiverError, Result};
use crate::index::flat;
use crate::index::hnsw::SearchCandidate;
use crate::query::cancel::CancelToken;
use crate::query::config::QueryConfig;
use crate::query::merge::{self, ScoredRecord};
use crate::query::request::{Consistency, QueryRequest};
use crate::query::response::{QueryHit, QueryResponse};
use crate::segment::{SealedSegment, SegmentView};
use crate::vector::{DistanceMetric, VectorRecord};

/// What a query runs against: one collection's published state.
#[derive(Debug, Clone)]
pub struct SearchScope {
    pub collection: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub default_ef_search: usize,
    pub view: Arc<SegmentView>,
    pub directory: Arc<RecordDirectory>,
}

enum SegmentTask<'a> {
    Sealed(&'a Arc<SealedSegment>),
    Active,
}

enum TaskOutcome {
    Hits(Vec<ScoredRecord>),
    Unavailable(u64),
}

#[derive(Debug)]
pub struct QueryCoordinator {
    config: QueryConfig,
    pool: Arc<ThreadPool>,
}

impl QueryCoordinator {
    pub fn new(config: QueryConfig) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("quiver-query-{i}"))
            .build()
            .map_err(|e| QuiverError::internal(format!("Failed to create thread pool: {e}")))?;

        Ok(QueryCoordinator {
            config,
            pool: Arc::new(pool),
        })
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Run `request` against `scope`.
    pub fn query(&self, scope: &SearchScope, request: &QueryRequest) -> Result<QueryResponse> {
        let timeout_ms = request.timeout_ms.or(self.config.default_timeout_ms);
        let cancel = match timeout_ms {
            Some(ms) => CancelToken::with_timeout(Duration::from_millis(ms)),
            None => CancelToken::new(),
        };
        self.query_with_cancel(scope, request, &cancel)
    }

    /// Run `request`, stopping every segment search once `cancel` fires.
    pub fn query_with_cancel(
        &self,
        scope: &SearchScope,
        request: &QueryRequest,
        cancel: &CancelToken,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        self.validate(scope, request)?;
        if request.k == 0 {
            return Ok(QueryResponse::default());
        }

        let k = request.k;
        let ef = request
            .ef_search
            .unwrap_or(scope.default_ef_search)
            .max(k);
        let filter = request.filter.as_ref();
        let directory = scope.directory.as_ref();
        let view = scope.view.as_ref();
        let sealed_only = request.consistency == Consistency::SealedOnly;
        // Sealed-only queries see the newest sealed version of each id, even
        // when a newer write is still in the active segment.
        let allow = |_: usize, record: &VectorRecord| -> bool {
            let live = directory.is_live(record)
                || (sealed_only && !record.deleted && view.is_newest_sealed(record));
            live && filter.is_none_or(|f| f.matches(&record.metadata))
        };

        let mut tasks: Vec<SegmentTask<'_>> = scope
            .view
            .healthy_sealed()
            .filter(|segment| !segment.is_empty())
            .map(SegmentTask::Sealed)
            .collect();
        if request.consistency == Consistency::ReadYourWrites {
            tasks.push(SegmentTask::Active);
        }
        let mut unavailable = scope.view.corrupted_ids();

        let outcomes: Vec<Result<TaskOutcome>> = self.pool.install(|| {
            tasks
                .par_iter()
                .map(|task| self.run_task(scope, task, &request.embedding, k, ef, &allow, cancel))
                .collect()
        });

        let mut lists = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome? {
                TaskOutcome::Hits(hits) => lists.push(hits),
                TaskOutcome::Unavailable(id) => unavailable.push(id),
            }
        }
        cancel.check()?;

        let merged = merge::merge_ranked(lists, k);
        let results = merged
            .into_iter()
            .map(|scored| to_hit(scored, request))
            .collect();

        unavailable.sort_unstable();
        if !unavailable.is_empty() {
            log::warn!(
                "Query on {} skipped unreadable segments {:?}",
                scope.collection,
                unavailable
            );
        }
        Ok(QueryResponse {
            results,
            degraded: !unavailable.is_empty(),
            unavailable_segments: unavailable,
            segments_searched: tasks.len(),
            took_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn validate(&self, scope: &SearchScope, request: &QueryRequest) -> Result<()> {
        if request.embedding.len() != scope.dimension {
            return Err(QuiverError::dimension_mismatch(
                scope.dimension,
                request.embedding.len(),
            ));
        }
        if request.embedding.iter().any(|v| !v.is_finite()) {
            return Err(QuiverError::invalid_argument(
                "query embedding contains a non-finite value",
            ));
        }
        if request.k > self.config.max_k {
            return Err(QuiverError::invalid_argument(format!(
                "k = {} exceeds the limit of {}",
                request.k, self.config.max_k
            )));
        }
        if request.ef_search == Some(0) {
            return Err(QuiverError::invalid_argument("ef_search must be at least 1"));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_task(
        &self,
        scope: &SearchScope,
        task: &SegmentTask<'_>,
        query: &[f32],
        k: usize,
        ef: usize,
        allow: &(dyn Fn(usize, &VectorRecord) -> bool + Sync),
        cancel: &CancelToken,
    ) -> Result<TaskOutcome> {
        cancel.check()?;
        match task {
            SegmentTask::Active => {
                let snapshot = scope.view.active.snapshot();
                let hits = flat::scan(&snapshot.records, query, k, scope.metric, allow, cancel)?;
                Ok(TaskOutcome::Hits(collect(
                    hits,
                    &snapshot.records,
                    snapshot.segment_id,
                )))
            }
            SegmentTask::Sealed(segment) => {
                let hits = match segment.search(query, k, ef, allow, cancel) {
                    Ok(hits) => hits,
                    Err(err @ QuiverError::OperationCancelled(_)) => return Err(err),
                    Err(err) => {
                        log::warn!(
                            "Graph search of segment {} failed, scanning instead: {err}",
                            segment.id()
                        );
                        match flat::scan(segment.records(), query, k, scope.metric, allow, cancel) {
                            Ok(hits) => hits,
                            Err(err @ QuiverError::OperationCancelled(_)) => return Err(err),
                            Err(err) => {
                                log::error!("Segment {} is unavailable: {err}", segment.id());
                                return Ok(TaskOutcome::Unavailable(segment.id()));
                            }
                        }
                    }
                };
                Ok(TaskOutcome::Hits(collect(hits, segment.records(), segment.id())))
            }
        }
    }
}

fn collect(
    hits: Vec<SearchCandidate>,
    records: &[Arc<VectorRecord>],
    segment_id: u64,
) -> Vec<ScoredRecord> {
    let mut scored: Vec<ScoredRecord> = hits
        .into_iter()
        .filter_map(|hit| {
            records.get(hit.node as usize).map(|record| ScoredRecord {
                distance: hit.distance,
                record: Arc::clone(record),
                segment_id,
            })
        })
        .collect();
    merge::sort_ranked(&mut scored);
    scored
}

fn to_hit(scored: ScoredRecord, request: &QueryRequest) -> QueryHit {
    let record = scored.record;
    let include = request.include;
    QueryHit {
        id: record.id.clone(),
        distance: scored.distance,
        metadata: include.metadata.then(|| record.metadata.clone()),
        document: if include.document {
            record.document.clone()
        } else {
            None
        },
        embedding: include.embedding.then(|| record.embedding.clone()),
    }
}
