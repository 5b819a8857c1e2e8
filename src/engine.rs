//! The engine: the context object that owns every collection.
//!
//! There is no global state. An [`Engine`] is started once per process (or
//! per test), handed to whatever serves requests, and stopped at shutdown.
//! While running it drives a maintenance thread that flushes buffers that
//! waited too long and, when enabled, compacts collections in the background.

pub mod config;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;
use serde::Serialize;

use crate::collection::{Collection, CollectionInfo, CollectionManager};
use crate::error::{QuiverError, Result};
use crate::storage::{FileStorage, MemoryStorage, Storage};
use crate::vector::DistanceMetric;

pub use self::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub version: &'static str,
    pub persistent: bool,
    pub collections: usize,
    /// Collections with sealed segments that failed validation.
    pub corrupted_segments: BTreeMap<String, Vec<u64>>,
    /// Catalogued collections that could not be opened.
    pub unavailable_collections: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Maintenance {
    shutdown: Sender<()>,
    worker: thread::JoinHandle<()>,
}

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    manager: Arc<CollectionManager>,
    persistent: bool,
    maintenance: Mutex<Option<Maintenance>>,
    stopped: AtomicBool,
}

impl Engine {
    /// Start an engine as configured: on disk under `data_dir`, or in memory.
    pub fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let storage: Arc<dyn Storage> = if config.in_memory {
            Arc::new(MemoryStorage::new(config.storage.clone()))
        } else {
            Arc::new(FileStorage::new(&config.data_dir, config.storage.clone())?)
        };
        let persistent = !config.in_memory;
        Self::start_with(storage, config, persistent)
    }

    /// Start an engine over an existing storage backend.
    pub fn open(storage: Arc<dyn Storage>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Self::start_with(storage, config, true)
    }

    fn start_with(storage: Arc<dyn Storage>, config: EngineConfig, persistent: bool) -> Result<Self> {
        let manager = Arc::new(CollectionManager::open(
            storage,
            config.collection_settings(),
            config.index.clone(),
            config.query.clone(),
        )?);

        let maintenance = spawn_maintenance(manager.clone(), &config)?;
        if persistent && !config.in_memory {
            log::info!(
                "Engine started at {} with {} collections",
                config.data_dir.display(),
                manager.names().len()
            );
        } else {
            log::info!("Engine started with {} collections", manager.names().len());
        }

        Ok(Engine {
            config,
            manager,
            persistent,
            maintenance: Mutex::new(Some(maintenance)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<CollectionManager> {
        &self.manager
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(QuiverError::other("engine is stopped"));
        }
        Ok(())
    }

    pub fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Arc<Collection>> {
        self.ensure_running()?;
        self.manager.create(name, dimension, metric)
    }

    pub fn get_or_create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Arc<Collection>> {
        self.ensure_running()?;
        self.manager.get_or_create(name, dimension, metric)
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.ensure_running()?;
        self.manager.get(name)
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        self.manager.drop_collection(name)
    }

    pub fn list_collections(&self) -> Vec<CollectionInfo> {
        self.manager.list()
    }

    /// Start a background compaction of `name`. Returns whether one was
    /// started; `false` means one is already running.
    pub fn compact_in_background(&self, name: &str) -> Result<bool> {
        self.collection(name)?.compact_in_background()
    }

    pub fn health(&self) -> EngineHealth {
        let collections = self.manager.list();
        let corrupted_segments: BTreeMap<String, Vec<u64>> = collections
            .iter()
            .filter(|info| !info.is_healthy())
            .map(|info| (info.name.clone(), info.corrupted_segments.clone()))
            .collect();
        let unavailable_collections = self.manager.unavailable();

        let healthy = corrupted_segments.is_empty()
            && unavailable_collections.is_empty()
            && !self.stopped.load(Ordering::Acquire);
        EngineHealth {
            status: if healthy {
                HealthStatus::Ok
            } else {
                HealthStatus::Degraded
            },
            version: crate::VERSION,
            persistent: self.persistent,
            collections: collections.len(),
            corrupted_segments,
            unavailable_collections,
        }
    }

    /// Stop maintenance, then flush and close every collection.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(maintenance) = self.maintenance.lock().take() {
            let _ = maintenance.shutdown.send(());
            if maintenance.worker.join().is_err() {
                log::error!("Maintenance thread panicked");
            }
        }
        let closed = self.manager.close();
        log::info!("Engine stopped");
        closed
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("Engine did not stop cleanly: {err}");
        }
    }
}

fn spawn_maintenance(manager: Arc<CollectionManager>, config: &EngineConfig) -> Result<Maintenance> {
    let (shutdown, signal) = bounded::<()>(1);
    let tick = Duration::from_millis((config.commit.flush_interval_ms / 2).clamp(10, 1_000));
    let compaction_interval = Duration::from_millis(config.compaction.interval_ms);

    let worker = thread::Builder::new()
        .name("quiver-maintenance".to_string())
        .spawn(move || {
            let mut last_compaction = Instant::now();
            loop {
                match signal.recv_timeout(tick) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        let compact = last_compaction.elapsed() >= compaction_interval;
                        if compact {
                            last_compaction = Instant::now();
                        }
                        manager.maintain(compact);
                    }
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .map_err(|e| QuiverError::internal(format!("Failed to spawn maintenance thread: {e}")))?;

    Ok(Maintenance { shutdown, worker })
}
