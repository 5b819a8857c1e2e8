//! The collection manager: named collections, their lifecycle, and the
//! shared query pool and garbage collector they use.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::collection::catalog::{COLLECTIONS_DIR, Catalog, CatalogEntry, collection_prefix};
use crate::collection::collection::{Collection, CollectionInfo, CollectionSettings};
use crate::collection::config::CollectionConfig;
use crate::collection::gc::{GarbageCollector, GcTask};
use crate::error::{QuiverError, Result};
use crate::index::HnswConfig;
use crate::query::{QueryConfig, QueryCoordinator};
use crate::storage::{PrefixedStorage, Storage};
use crate::vector::DistanceMetric;

#[derive(Debug)]
pub struct CollectionManager {
    root: Arc<dyn Storage>,
    catalog: Catalog,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    /// Catalogued collections that failed to open, with the reason.
    unavailable: RwLock<BTreeMap<String, String>>,
    settings: CollectionSettings,
    default_index: HnswConfig,
    coordinator: Arc<QueryCoordinator>,
    gc: GarbageCollector,
    /// Serialises create, drop and get-or-create.
    lifecycle: Mutex<()>,
}

impl CollectionManager {
    /// Open every catalogued collection under `root`.
    ///
    /// A collection that cannot be opened is reported as unavailable instead
    /// of failing the whole manager. Collection directories the catalog does
    /// not reference are left over from an interrupted create or drop and are
    /// deleted in the background.
    pub fn open(
        root: Arc<dyn Storage>,
        settings: CollectionSettings,
        default_index: HnswConfig,
        query: QueryConfig,
    ) -> Result<Self> {
        settings.commit.validate()?;
        settings.compaction.validate()?;
        default_index.validate()?;

        let catalog = Catalog::load(root.clone())?;
        let coordinator = Arc::new(QueryCoordinator::new(query)?);
        let gc = GarbageCollector::start()?;

        let mut collections = HashMap::new();
        let mut unavailable = BTreeMap::new();
        for (name, entry) in catalog.list() {
            let storage: Arc<dyn Storage> =
                Arc::new(PrefixedStorage::new(entry.prefix(), root.clone()));
            match Collection::open(storage, entry.id, &settings, coordinator.clone(), gc.queue()) {
                Ok((collection, _, _)) => {
                    collections.insert(name, Arc::new(collection));
                }
                Err(err) => {
                    log::error!("Collection {name} is unavailable: {err}");
                    unavailable.insert(name, err.to_string());
                }
            }
        }

        let manager = CollectionManager {
            root,
            catalog,
            collections: RwLock::new(collections),
            unavailable: RwLock::new(unavailable),
            settings,
            default_index,
            coordinator,
            gc,
            lifecycle: Mutex::new(()),
        };
        manager.collect_unreferenced()?;
        Ok(manager)
    }

    fn collect_unreferenced(&self) -> Result<()> {
        let referenced: HashSet<Uuid> = self.catalog.list().into_iter().map(|(_, e)| e.id).collect();
        let mut orphans = HashSet::new();
        for name in self.root.list_files()? {
            let Some(rest) = name
                .strip_prefix(COLLECTIONS_DIR)
                .and_then(|rest| rest.strip_prefix('/'))
            else {
                continue;
            };
            let Some((dir, _)) = rest.split_once('/') else {
                continue;
            };
            let known = Uuid::parse_str(dir).is_ok_and(|id| referenced.contains(&id));
            if !known {
                orphans.insert(dir.to_string());
            }
        }

        for dir in orphans {
            log::info!("Removing unreferenced collection directory {dir}");
            self.gc.submit(GcTask::Collection {
                root: self.root.clone(),
                prefix: format!("{COLLECTIONS_DIR}/{dir}"),
            });
        }
        Ok(())
    }

    pub fn settings(&self) -> &CollectionSettings {
        &self.settings
    }

    pub fn coordinator(&self) -> &Arc<QueryCoordinator> {
        &self.coordinator
    }

    /// Create a collection with the default index settings.
    pub fn create(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Arc<Collection>> {
        self.create_with(
            CollectionConfig::new(name, dimension, metric).with_index(self.default_index.clone()),
        )
    }

    /// Create a collection. Fails with `AlreadyExists` if the name is taken.
    pub fn create_with(&self, config: CollectionConfig) -> Result<Arc<Collection>> {
        config.validate()?;
        let _guard = self.lifecycle.lock();
        self.create_locked(config)
    }

    fn create_locked(&self, config: CollectionConfig) -> Result<Arc<Collection>> {
        let name = config.name.clone();
        if self.catalog.contains(&name) {
            return Err(QuiverError::already_exists(format!(
                "collection {name} already exists"
            )));
        }

        // Files first, catalog second: a crash in between leaves only an
        // unreferenced directory behind.
        let entry = CatalogEntry::new();
        let storage: Arc<dyn Storage> =
            Arc::new(PrefixedStorage::new(entry.prefix(), self.root.clone()));
        let collection = Collection::create(
            storage,
            entry.id,
            config,
            &self.settings,
            self.coordinator.clone(),
            self.gc.queue(),
        )?;

        if let Err(err) = self.catalog.insert(&name, entry.clone()) {
            collection.abandon(GcTask::Collection {
                root: self.root.clone(),
                prefix: entry.prefix(),
            });
            return Err(err);
        }

        let collection = Arc::new(collection);
        self.collections
            .write()
            .insert(name.clone(), collection.clone());
        self.unavailable.write().remove(&name);
        Ok(collection)
    }

    /// Return the collection called `name`, creating it when missing.
    ///
    /// An existing collection with a different dimension or metric is an
    /// `AlreadyExists` error.
    pub fn get_or_create(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Arc<Collection>> {
        let config =
            CollectionConfig::new(name, dimension, metric).with_index(self.default_index.clone());
        config.validate()?;
        let _guard = self.lifecycle.lock();

        if let Some(existing) = self.collections.read().get(name).cloned() {
            if existing.dimension() != dimension || existing.metric() != metric {
                return Err(QuiverError::already_exists(format!(
                    "collection {name} exists with dimension {} and metric {}",
                    existing.dimension(),
                    existing.metric().name()
                )));
            }
            return Ok(existing);
        }
        self.create_locked(config)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QuiverError::collection_not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    /// Remove `name` from the catalog and delete its files in the background.
    ///
    /// Handles to the dropped collection that callers still hold fail every
    /// further operation with `CollectionNotFound`.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let _guard = self.lifecycle.lock();
        let entry = self.catalog.remove(name)?;

        let cleanup = GcTask::Collection {
            root: self.root.clone(),
            prefix: collection_prefix(entry.id),
        };
        let removed = self.collections.write().remove(name);
        match removed {
            Some(collection) => collection.abandon(cleanup),
            None => self.gc.submit(cleanup),
        }
        self.unavailable.write().remove(name);
        log::info!("Dropped collection {name}");
        Ok(())
    }

    /// Names of the open collections, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptions of the open collections, sorted by name.
    pub fn list(&self) -> Vec<CollectionInfo> {
        let mut collections: Vec<Arc<Collection>> =
            self.collections.read().values().cloned().collect();
        collections.sort_by(|a, b| a.name().cmp(b.name()));
        collections.iter().map(|c| c.info()).collect()
    }

    /// Catalogued collections that could not be opened.
    pub fn unavailable(&self) -> BTreeMap<String, String> {
        self.unavailable.read().clone()
    }

    /// Flush buffers that waited too long and, when `compact` is set and
    /// automatic compaction is on, start compactions the policy asks for.
    pub fn maintain(&self, compact: bool) {
        let collections: Vec<Arc<Collection>> =
            self.collections.read().values().cloned().collect();
        for collection in collections {
            if let Err(err) = collection.flush_if_due() {
                log::warn!("Periodic flush of {} failed: {err}", collection.name());
            }
            if compact
                && self.settings.compaction.auto
                && !collection.is_compacting()
                && collection.needs_compaction()
            {
                if let Err(err) = collection.compact_in_background() {
                    log::warn!("Could not start compaction of {}: {err}", collection.name());
                }
            }
        }
    }

    /// Wait for queued file deletions. Returns false on timeout.
    pub fn wait_for_gc(&self, timeout: Duration) -> bool {
        self.gc.wait_idle(timeout)
    }

    /// Flush and close every collection, then stop the garbage collector.
    pub fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        let collections: Vec<Arc<Collection>> =
            self.collections.write().drain().map(|(_, c)| c).collect();

        let mut first_error = None;
        for collection in collections {
            if let Err(err) = collection.close() {
                log::error!("Closing collection {} failed: {err}", collection.name());
                first_error.get_or_insert(err);
            }
        }
        self.gc.shutdown();
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::vector::VectorRecord;

    fn open(storage: &MemoryStorage) -> CollectionManager {
        CollectionManager::open(
            Arc::new(storage.clone()),
            CollectionSettings::default(),
            HnswConfig::default(),
            QueryConfig::default().with_threads(2),
        )
        .unwrap()
    }

    #[test]
    fn test_create_get_and_reopen() {
        let storage = MemoryStorage::new_default();
        let manager = open(&storage);
        let docs = manager.create("docs", 3, DistanceMetric::Cosine).unwrap();
        docs.add(VectorRecord::new("a", vec![1.0, 0.0, 0.0])).unwrap();
        assert!(matches!(
            manager.create("docs", 3, DistanceMetric::Cosine).unwrap_err(),
            QuiverError::AlreadyExists(_)
        ));
        assert!(matches!(
            manager.get("missing").unwrap_err(),
            QuiverError::CollectionNotFound(_)
        ));
        manager.close().unwrap();

        let manager = open(&storage);
        assert_eq!(manager.names(), vec!["docs"]);
        assert_eq!(manager.get("docs").unwrap().count().unwrap(), 1);
    }

    #[test]
    fn test_get_or_create() {
        let storage = MemoryStorage::new_default();
        let manager = open(&storage);
        let first = manager.get_or_create("docs", 3, DistanceMetric::L2).unwrap();
        let second = manager.get_or_create("docs", 3, DistanceMetric::L2).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(
            manager.get_or_create("docs", 4, DistanceMetric::L2).unwrap_err(),
            QuiverError::AlreadyExists(_)
        ));
        assert!(manager.get_or_create("docs", 3, DistanceMetric::Dot).is_err());
    }

    #[test]
    fn test_drop_deletes_files_in_background() {
        let storage = MemoryStorage::new_default();
        let manager = open(&storage);
        let docs = manager.create("docs", 2, DistanceMetric::L2).unwrap();
        docs.add(VectorRecord::new("a", vec![1.0, 0.0])).unwrap();
        docs.seal().unwrap();
        manager.create("other", 2, DistanceMetric::L2).unwrap();

        manager.drop_collection("docs").unwrap();
        assert!(matches!(
            docs.add(VectorRecord::new("b", vec![0.0, 1.0])).unwrap_err(),
            QuiverError::CollectionNotFound(_)
        ));
        assert!(manager.drop_collection("docs").is_err());
        assert!(manager.wait_for_gc(Duration::from_secs(5)));

        let prefix = collection_prefix(docs.id());
        assert!(
            storage
                .list_files()
                .unwrap()
                .iter()
                .all(|f| !f.starts_with(&prefix))
        );

        // The name can be reused and starts empty.
        let again = manager.create("docs", 2, DistanceMetric::L2).unwrap();
        assert_eq!(again.count().unwrap(), 0);
        assert_ne!(again.id(), docs.id());
    }

    #[test]
    fn test_unreferenced_directories_are_removed_on_open() {
        let storage = MemoryStorage::new_default();
        let stray = format!("{COLLECTIONS_DIR}/{}/MANIFEST", Uuid::new_v4());
        storage.write_atomic(&stray, b"{}").unwrap();

        let manager = open(&storage);
        assert!(manager.wait_for_gc(Duration::from_secs(5)));
        assert!(!storage.file_exists(&stray));
    }

    #[test]
    fn test_broken_collection_is_unavailable() {
        let storage = MemoryStorage::new_default();
        let manager = open(&storage);
        let docs = manager.create("docs", 2, DistanceMetric::L2).unwrap();
        manager.create("fine", 2, DistanceMetric::L2).unwrap();
        let id = docs.id();
        manager.close().unwrap();

        let manifest = format!("{}/MANIFEST", collection_prefix(id));
        storage.write_atomic(&manifest, b"garbage").unwrap();

        let manager = open(&storage);
        assert_eq!(manager.names(), vec!["fine"]);
        assert!(manager.unavailable().contains_key("docs"));
    }
}
