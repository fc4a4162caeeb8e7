//! Shared test utilities for atlas-engine tests.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use atlas_journal::{CommitLog, JournalWriter};
use atlas_meta::OwnershipRegistry;
use atlas_store::{LayerDb, LayerStore, LayerTimeseries, Snapshot, StoreError};
use atlas_types::{AccessKey, DatasourceId, Feature, FeatureCollection, Timestamp};
use serde_json::json;

use crate::command::{Caller, Command};
use crate::dispatcher::Dispatcher;
use crate::hub::SubscriberHub;
use crate::importer::{FormatConverter, ImportError, Importer};

/// In-memory layer store that counts every call and can fail deletes.
pub struct CountingStore {
    inner: LayerDb,
    calls: AtomicUsize,
    pub fail_deletes: AtomicBool,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: LayerDb::in_memory(),
            calls: AtomicUsize::new(0),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl LayerStore for CountingStore {
    async fn new_layer(&self) -> Result<DatasourceId, StoreError> {
        self.hit();
        self.inner.new_layer().await
    }

    async fn insert_layer(
        &self,
        id: &DatasourceId,
        collection: FeatureCollection,
    ) -> Result<(), StoreError> {
        self.hit();
        self.inner.insert_layer(id, collection).await
    }

    async fn get_layer(&self, id: &DatasourceId) -> Result<FeatureCollection, StoreError> {
        self.hit();
        self.inner.get_layer(id).await
    }

    async fn delete_layer(&self, id: &DatasourceId) -> Result<(), StoreError> {
        self.hit();
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("disk on fire".into()));
        }
        self.inner.delete_layer(id).await
    }

    async fn insert_feature(
        &self,
        id: &DatasourceId,
        feature: Feature,
    ) -> Result<String, StoreError> {
        self.hit();
        self.inner.insert_feature(id, feature).await
    }

    async fn edit_feature(
        &self,
        id: &DatasourceId,
        geo_id: &str,
        feature: Feature,
    ) -> Result<Feature, StoreError> {
        self.hit();
        self.inner.edit_feature(id, geo_id, feature).await
    }

    async fn get_layers(&self) -> Result<Vec<DatasourceId>, StoreError> {
        self.hit();
        self.inner.get_layers().await
    }

    async fn select_timeseries(&self, id: &DatasourceId) -> Result<LayerTimeseries, StoreError> {
        self.hit();
        self.inner.select_timeseries(id).await
    }

    async fn previous_by_timestamp(
        &self,
        id: &DatasourceId,
        timestamp: Timestamp,
    ) -> Result<Snapshot, StoreError> {
        self.hit();
        self.inner.previous_by_timestamp(id, timestamp).await
    }
}

/// Copies a fixed GeoJSON file into place instead of running ogr2ogr.
pub struct CopyConverter;

#[async_trait::async_trait]
impl FormatConverter for CopyConverter {
    async fn convert(&self, _input: &Path, output: &Path) -> Result<(), ImportError> {
        tokio::fs::write(output, sample_collection_json().to_string()).await?;
        Ok(())
    }
}

pub fn sample_collection_json() -> serde_json::Value {
    json!({
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [0, 0]}, "properties": {"geo_id": "a"}},
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [1, 1]}, "properties": {"geo_id": "b"}}
        ]
    })
}

/// A dispatcher over counting/in-memory components.
///
/// The journal writer is held but never run, so `journal.depth()` counts the
/// entries each test enqueued.
pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<CountingStore>,
    pub registry: Arc<OwnershipRegistry>,
    pub hub: Arc<SubscriberHub>,
    pub journal: CommitLog,
    pub _writer: JournalWriter,
}

pub fn harness() -> Harness {
    harness_with_capacity(1024)
}

pub fn harness_with_capacity(capacity: usize) -> Harness {
    build_harness(OwnershipRegistry::open_temporary().unwrap(), capacity)
}

/// A harness over a caller-supplied registry.
pub fn harness_with_registry(registry: OwnershipRegistry) -> Harness {
    build_harness(registry, 1024)
}

fn build_harness(registry: OwnershipRegistry, capacity: usize) -> Harness {
    let store = Arc::new(CountingStore::new());
    let registry = Arc::new(registry);
    let hub = Arc::new(SubscriberHub::default());
    let (journal, writer) = CommitLog::new(capacity);
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        store.clone(),
        journal.clone(),
        hub.clone(),
        Importer::new(Arc::new(CopyConverter)),
    ));
    Harness {
        dispatcher,
        store,
        registry,
        hub,
        journal,
        _writer: writer,
    }
}

pub fn point_feature(x: f64, y: f64) -> Feature {
    Feature::new(json!({"type": "Point", "coordinates": [x, y]}))
}

impl Harness {
    /// Issue a key and create a layer it owns.
    pub async fn owner_with_layer(&self) -> (AccessKey, DatasourceId) {
        let key = self.registry.create_customer().unwrap().apikey;
        let ds = self.store.inner.new_layer().await.unwrap();
        self.registry.add_datasource(&key, &ds).unwrap();
        (key, ds)
    }

    pub async fn run(&self, caller: &Caller, command: Command) -> crate::Outcome {
        self.dispatcher.dispatch(caller, command).await.unwrap()
    }
}
