//! A named collection: one segment store, its commit pipeline and record
//! directory, and the compaction that keeps its segment count down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collection::compaction::{self, CompactionConfig, CompactionOutcome};
use crate::collection::config::CollectionConfig;
use crate::collection::directory::RecordDirectory;
use crate::collection::gc::{GcQueue, GcTask};
use crate::error::{QuiverError, Result};
use crate::query::{QueryCoordinator, QueryRequest, QueryResponse, SearchScope};
use crate::segment::{RecoveryReport, SegmentHealth, SegmentStore};
use crate::storage::Storage;
use crate::vector::{DistanceMetric, VectorRecord};
use crate::wal::{CommitConfig, CommitPipeline, ReplayReport, WriteMode, WriteReceipt};

/// Engine-wide settings every collection is opened with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionSettings {
    #[serde(default)]
    pub commit: CommitConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

/// Health of one sealed segment, as reported by [`Collection::info`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentInfo {
    pub id: u64,
    pub records: usize,
    pub tombstones: u64,
    pub size_bytes: u64,
    pub indexed: bool,
    pub health: SegmentHealth,
}

/// Description of a collection and its storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub id: Uuid,
    pub dimension: usize,
    pub metric: DistanceMetric,
    /// Live records.
    pub count: usize,
    pub generation: u64,
    pub active_segment: u64,
    pub active_records: usize,
    pub pending_records: usize,
    pub segments: Vec<SegmentInfo>,
    pub corrupted_segments: Vec<u64>,
}

impl CollectionInfo {
    pub fn is_healthy(&self) -> bool {
        self.corrupted_segments.is_empty()
    }
}

#[derive(Debug)]
pub struct Collection {
    id: Uuid,
    store: Arc<SegmentStore>,
    directory: Arc<RecordDirectory>,
    pipeline: CommitPipeline,
    coordinator: Arc<QueryCoordinator>,
    compaction: CompactionConfig,
    /// Held for the whole of a compaction run.
    compaction_lock: Mutex<()>,
    compacting: AtomicBool,
    /// Deletion of a dropped collection's files, parked until a running
    /// compaction has finished with them.
    deferred_cleanup: Mutex<Option<GcTask>>,
    gc: GcQueue,
}

impl Collection {
    /// Create the files of a new collection in `storage`.
    pub fn create(
        storage: Arc<dyn Storage>,
        id: Uuid,
        config: CollectionConfig,
        settings: &CollectionSettings,
        coordinator: Arc<QueryCoordinator>,
        gc: GcQueue,
    ) -> Result<Self> {
        let store = Arc::new(SegmentStore::create(storage, id, config)?);
        let directory = Arc::new(RecordDirectory::new());
        let pipeline =
            CommitPipeline::create(store.clone(), directory.clone(), settings.commit.clone())?;
        log::info!(
            "Created collection {} (dimension {}, metric {})",
            store.config().name,
            store.dimension(),
            store.metric().name()
        );
        Ok(Self::assemble(
            id,
            store,
            directory,
            pipeline,
            settings,
            coordinator,
            gc,
        ))
    }

    /// Open a collection from its files, recovering from an unclean shutdown.
    pub fn open(
        storage: Arc<dyn Storage>,
        expected_id: Uuid,
        settings: &CollectionSettings,
        coordinator: Arc<QueryCoordinator>,
        gc: GcQueue,
    ) -> Result<(Self, RecoveryReport, ReplayReport)> {
        let (store, recovery) = SegmentStore::open(storage)?
            .ok_or_else(|| QuiverError::corruption("collection manifest is missing"))?;
        let id = store.manifest().collection_id;
        if id != expected_id {
            return Err(QuiverError::corruption(format!(
                "manifest belongs to collection {id}, expected {expected_id}"
            )));
        }

        let store = Arc::new(store);
        let (pipeline, replay) = CommitPipeline::recover(
            store.clone(),
            |store| Arc::new(RecordDirectory::rebuild(&store.view())),
            settings.commit.clone(),
        )?;
        let directory = pipeline.directory().clone();

        if !recovery.corrupted_segments.is_empty() {
            log::error!(
                "Collection {} opened with corrupted segments {:?}",
                store.config().name,
                recovery.corrupted_segments
            );
        }
        log::info!(
            "Opened collection {}: {} sealed segments, {} live records",
            store.config().name,
            recovery.sealed_segments,
            directory.live_count()
        );

        let collection = Self::assemble(id, store, directory, pipeline, settings, coordinator, gc);
        Ok((collection, recovery, replay))
    }

    fn assemble(
        id: Uuid,
        store: Arc<SegmentStore>,
        directory: Arc<RecordDirectory>,
        pipeline: CommitPipeline,
        settings: &CollectionSettings,
        coordinator: Arc<QueryCoordinator>,
        gc: GcQueue,
    ) -> Self {
        Collection {
            id,
            store,
            directory,
            pipeline,
            coordinator,
            compaction: settings.compaction.clone(),
            compaction_lock: Mutex::new(()),
            compacting: AtomicBool::new(false),
            deferred_cleanup: Mutex::new(None),
            gc,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.store.config().name
    }

    pub fn config(&self) -> &CollectionConfig {
        self.store.config()
    }

    pub fn dimension(&self) -> usize {
        self.store.dimension()
    }

    pub fn metric(&self) -> DistanceMetric {
        self.store.metric()
    }

    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &CommitPipeline {
        &self.pipeline
    }

    fn ensure_open(&self) -> Result<()> {
        if self.pipeline.is_closed() {
            return Err(QuiverError::collection_not_found(self.name()));
        }
        Ok(())
    }

    /// Insert a new record. Fails with `AlreadyExists` if its id is live.
    pub fn add(&self, record: VectorRecord) -> Result<WriteReceipt> {
        self.pipeline.write(vec![record], WriteMode::Insert)
    }

    /// Insert several new records, all or none.
    pub fn add_batch(&self, records: Vec<VectorRecord>) -> Result<WriteReceipt> {
        self.pipeline.write(records, WriteMode::Insert)
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: VectorRecord) -> Result<WriteReceipt> {
        self.pipeline.write(vec![record], WriteMode::Upsert)
    }

    pub fn upsert_batch(&self, records: Vec<VectorRecord>) -> Result<WriteReceipt> {
        self.pipeline.write(records, WriteMode::Upsert)
    }

    /// Delete `id`. Returns whether it was live.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.pipeline.delete(id)
    }

    /// The live version of `id`.
    pub fn get(&self, id: &str) -> Result<Option<VectorRecord>> {
        self.ensure_open()?;
        let Some(seq) = self.directory.live_seq(id) else {
            return Ok(None);
        };

        let view = self.store.view();
        let snapshot = view.active.snapshot();
        let in_active = snapshot
            .records
            .iter()
            .rev()
            .find(|r| r.id == id && r.seq == seq);
        if let Some(record) = in_active {
            return Ok(Some(record.as_ref().clone()));
        }

        Ok(view
            .healthy_sealed()
            .filter_map(|segment| segment.get(id))
            .find(|r| r.seq == seq)
            .map(|r| r.as_ref().clone()))
    }

    /// Number of live records.
    pub fn count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.directory.live_count())
    }

    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        self.ensure_open()?;
        self.coordinator.query(&self.search_scope(), request)
    }

    /// The state a query started now would run against.
    pub fn search_scope(&self) -> SearchScope {
        SearchScope {
            collection: self.name().to_string(),
            dimension: self.dimension(),
            metric: self.metric(),
            default_ef_search: self.config().index.ef_search,
            view: self.store.view(),
            directory: self.directory.clone(),
        }
    }

    /// Seal the active segment. Sealing twice in a row returns the same id.
    pub fn seal(&self) -> Result<u64> {
        self.ensure_open()?;
        self.pipeline.seal()
    }

    pub fn flush(&self) -> Result<usize> {
        self.ensure_open()?;
        self.pipeline.flush()
    }

    pub fn flush_if_due(&self) -> Result<usize> {
        if self.pipeline.is_closed() {
            return Ok(0);
        }
        self.pipeline.flush_if_due()
    }

    /// Whether the compaction policy would merge anything now.
    pub fn needs_compaction(&self) -> bool {
        compaction::plan(&self.store.view(), &self.directory, &self.compaction).is_some()
    }

    /// Merge small sealed segments now. Returns `None` when the policy finds
    /// nothing to do.
    pub fn compact(&self) -> Result<Option<CompactionOutcome>> {
        let outcome = {
            let _guard = self.compaction_lock.lock();
            self.compact_locked()
        };
        self.release_deferred_cleanup();
        outcome
    }

    fn compact_locked(&self) -> Result<Option<CompactionOutcome>> {
        self.ensure_open()?;

        let view = self.store.view();
        let Some(plan) = compaction::plan(&view, &self.directory, &self.compaction) else {
            log::debug!("Nothing to compact in {}", self.name());
            return Ok(None);
        };
        drop(view);

        log::info!("Compacting segments {:?} of {}", plan.inputs, self.name());
        let outcome = compaction::compact(&self.store, &self.directory, &plan, &|| {
            self.pipeline.is_closed()
        })?;
        self.gc.submit(GcTask::SegmentFiles {
            storage: self.store.storage().clone(),
            segment_ids: outcome.inputs.clone(),
        });
        log::info!(
            "Compacted {} segments of {} into {:?}: {} records in, {} out, {} tombstones dropped",
            outcome.inputs.len(),
            self.name(),
            outcome.output,
            outcome.records_in,
            outcome.records_out,
            outcome.dropped_tombstones
        );
        Ok(Some(outcome))
    }

    /// Start a compaction on its own thread and return at once.
    ///
    /// Returns `false` when a background compaction is already running.
    pub fn compact_in_background(self: &Arc<Self>) -> Result<bool> {
        self.ensure_open()?;
        if self.compacting.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        let collection = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("quiver-compact-{}", self.name()))
            .spawn(move || {
                if let Err(err) = collection.compact() {
                    log::warn!("Compaction of {} failed: {err}", collection.name());
                }
                collection.compacting.store(false, Ordering::Release);
            });

        match spawned {
            Ok(_) => Ok(true),
            Err(err) => {
                self.compacting.store(false, Ordering::Release);
                Err(QuiverError::internal(format!(
                    "Failed to spawn compaction thread: {err}"
                )))
            }
        }
    }

    /// Whether a background compaction is running.
    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    pub fn info(&self) -> CollectionInfo {
        let view = self.store.view();
        let segments = view
            .sealed
            .iter()
            .map(|segment| SegmentInfo {
                id: segment.id(),
                records: segment.descriptor().record_count as usize,
                tombstones: segment.descriptor().tombstone_count,
                size_bytes: segment.descriptor().size_bytes,
                indexed: segment.has_index(),
                health: segment.health().clone(),
            })
            .collect();

        CollectionInfo {
            name: self.name().to_string(),
            id: self.id,
            dimension: self.dimension(),
            metric: self.metric(),
            count: self.directory.live_count(),
            generation: view.generation,
            active_segment: view.active.id(),
            active_records: view.active.len(),
            pending_records: view.active.pending_count(),
            segments,
            corrupted_segments: view.corrupted_ids(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pipeline.is_closed()
    }

    /// Flush and stop accepting writes.
    pub fn close(&self) -> Result<()> {
        let _guard = self.compaction_lock.lock();
        self.pipeline.close()
    }

    /// Stop accepting writes without flushing and schedule `cleanup`, the
    /// deletion of the collection's files. Returns at once; when a compaction
    /// is running, `cleanup` is queued by it after it stops.
    pub fn abandon(&self, cleanup: GcTask) {
        self.pipeline.abandon();
        *self.deferred_cleanup.lock() = Some(cleanup);
        if let Some(_guard) = self.compaction_lock.try_lock() {
            self.release_deferred_cleanup();
        }
    }

    fn release_deferred_cleanup(&self) {
        if let Some(cleanup) = self.deferred_cleanup.lock().take() {
            self.gc.submit(cleanup);
        }
    }
}
