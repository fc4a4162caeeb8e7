//! [`LayerDb`]: layer storage over Fjall (disk) or pure memory.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use atlas_types::{DatasourceId, Feature, FeatureCollection, Timestamp, geojson::GEO_ID};
use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::traits::{LayerStore, LayerTimeseries, Snapshot};

type Result<T> = std::result::Result<T, StoreError>;

/// Separator between the layer id and the timestamp in snapshot keys.
const SNAPSHOT_SEP: u8 = 0x00;

/// Inner backend: either Fjall-backed (disk) or pure in-memory.
enum Backend {
    Fjall {
        #[allow(dead_code)]
        db: Database,
        /// id -> current collection JSON.
        layers: Keyspace,
        /// id ++ 0x00 ++ ts (8 bytes BE) -> collection JSON.
        snapshots: Keyspace,
    },
    Memory(Box<MemoryBackend>),
}

/// Pure in-memory storage.
struct MemoryBackend {
    layers: RwLock<HashMap<DatasourceId, Vec<u8>>>,
    snapshots: RwLock<BTreeMap<(DatasourceId, Timestamp), Vec<u8>>>,
}

/// Per-layer write slot: holds the last snapshot timestamp once known.
type WriteSlot = Arc<tokio::sync::Mutex<Option<Timestamp>>>;

/// Layer store with full snapshot history.
///
/// Writes to one layer are serialized through a per-id async lock; writes to
/// different layers proceed independently.
pub struct LayerDb {
    backend: Backend,
    slots: Mutex<HashMap<DatasourceId, WriteSlot>>,
}

fn storage_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn snapshot_prefix(id: &DatasourceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(id.as_bytes().len() + 1);
    key.extend_from_slice(id.as_bytes());
    key.push(SNAPSHOT_SEP);
    key
}

/// Build the snapshot key: `id ++ 0x00 ++ timestamp (8 bytes big-endian)`.
///
/// Timestamps are non-negative, so byte order matches numeric order.
fn snapshot_key(id: &DatasourceId, ts: Timestamp) -> Vec<u8> {
    let mut key = snapshot_prefix(id);
    key.extend_from_slice(&(ts as u64).to_be_bytes());
    key
}

fn decode_ts(key: &[u8]) -> Result<Timestamp> {
    let start = key
        .len()
        .checked_sub(8)
        .ok_or_else(|| storage_err("snapshot key too short"))?;
    let arr: [u8; 8] = key[start..].try_into().map_err(storage_err)?;
    Ok(u64::from_be_bytes(arr) as Timestamp)
}

/// Next snapshot timestamp: now, or `last + 1` if the clock has not advanced.
fn next_timestamp(last: Option<Timestamp>) -> Timestamp {
    let now = atlas_types::now_millis();
    match last {
        Some(last) if now <= last => last + 1,
        _ => now,
    }
}

impl LayerDb {
    /// Open a persistent store at the given path (Fjall backend).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open().map_err(storage_err)?;
        Ok(Self::with_backend(Self::init_fjall(db)?))
    }

    /// Open a temporary store backed by Fjall (cleaned up on drop).
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(storage_err)?;
        let db = Database::builder(tmp.path())
            .temporary(true)
            .open()
            .map_err(storage_err)?;
        Ok(Self::with_backend(Self::init_fjall(db)?))
    }

    /// Create a pure in-memory store.
    pub fn in_memory() -> Self {
        Self::with_backend(Backend::Memory(Box::new(MemoryBackend {
            layers: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(BTreeMap::new()),
        })))
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn init_fjall(db: Database) -> Result<Backend> {
        let layers = db
            .keyspace("layers", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        let snapshots = db
            .keyspace("snapshots", KeyspaceCreateOptions::default)
            .map_err(storage_err)?;
        Ok(Backend::Fjall {
            db,
            layers,
            snapshots,
        })
    }

    fn slot(&self, id: &DatasourceId) -> WriteSlot {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        slots.entry(id.clone()).or_default().clone()
    }

    /// Forget the slot of `id` once nothing else holds it.
    fn release_slot(&self, id: &DatasourceId) {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        if slots.get(id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(id);
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().expect("slot lock poisoned").len()
    }

    // ----- Raw access -----

    fn get_raw(&self, id: &DatasourceId) -> Result<Option<Vec<u8>>> {
        match &self.backend {
            Backend::Fjall { layers, .. } => Ok(layers
                .get(id.as_bytes())
                .map_err(storage_err)?
                .map(|v| v.to_vec())),
            Backend::Memory(m) => Ok(m.layers.read().expect("lock poisoned").get(id).cloned()),
        }
    }

    fn load(&self, id: &DatasourceId) -> Result<FeatureCollection> {
        match self.get_raw(id)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    fn exists(&self, id: &DatasourceId) -> Result<bool> {
        match &self.backend {
            Backend::Fjall { layers, .. } => layers.contains_key(id.as_bytes()).map_err(storage_err),
            Backend::Memory(m) => Ok(m.layers.read().expect("lock poisoned").contains_key(id)),
        }
    }

    fn snapshot_timestamps(&self, id: &DatasourceId) -> Result<Vec<Timestamp>> {
        match &self.backend {
            Backend::Fjall { snapshots, .. } => {
                let mut stamps = Vec::new();
                for guard in snapshots.prefix(snapshot_prefix(id)) {
                    stamps.push(decode_ts(&guard.key().map_err(storage_err)?)?);
                }
                Ok(stamps)
            }
            Backend::Memory(m) => Ok(m
                .snapshots
                .read()
                .expect("lock poisoned")
                .range((id.clone(), Timestamp::MIN)..=(id.clone(), Timestamp::MAX))
                .map(|((_, ts), _)| *ts)
                .collect()),
        }
    }

    /// Latest `(timestamp, body)` at or before `ts`, reading one entry.
    fn snapshot_at(&self, id: &DatasourceId, ts: Timestamp) -> Result<Option<(Timestamp, Vec<u8>)>> {
        if ts < 0 {
            return Ok(None);
        }
        match &self.backend {
            Backend::Fjall { snapshots, .. } => {
                match snapshots
                    .range(snapshot_prefix(id)..=snapshot_key(id, ts))
                    .next_back()
                {
                    Some(guard) => {
                        let (k, v) = guard.into_inner().map_err(storage_err)?;
                        Ok(Some((decode_ts(&k)?, v.to_vec())))
                    }
                    None => Ok(None),
                }
            }
            Backend::Memory(m) => Ok(m
                .snapshots
                .read()
                .expect("lock poisoned")
                .range((id.clone(), Timestamp::MIN)..=(id.clone(), ts))
                .next_back()
                .map(|((_, ts), v)| (*ts, v.clone()))),
        }
    }

    fn last_timestamp(&self, id: &DatasourceId) -> Result<Option<Timestamp>> {
        match &self.backend {
            Backend::Fjall { snapshots, .. } => match snapshots.prefix(snapshot_prefix(id)).next_back() {
                Some(guard) => Ok(Some(decode_ts(&guard.key().map_err(storage_err)?)?)),
                None => Ok(None),
            },
            Backend::Memory(m) => Ok(m
                .snapshots
                .read()
                .expect("lock poisoned")
                .range((id.clone(), Timestamp::MIN)..=(id.clone(), Timestamp::MAX))
                .next_back()
                .map(|((_, ts), _)| *ts)),
        }
    }

    /// Write the current content and its snapshot. Caller holds the id's slot.
    fn commit(
        &self,
        id: &DatasourceId,
        last: &mut Option<Timestamp>,
        collection: &FeatureCollection,
    ) -> Result<Timestamp> {
        if last.is_none() {
            *last = self.last_timestamp(id)?;
        }
        let ts = next_timestamp(*last);
        let bytes = serde_json::to_vec(collection)?;

        match &self.backend {
            Backend::Fjall {
                layers, snapshots, ..
            } => {
                snapshots
                    .insert(snapshot_key(id, ts), bytes.as_slice())
                    .map_err(storage_err)?;
                layers
                    .insert(id.as_bytes(), bytes.as_slice())
                    .map_err(storage_err)?;
            }
            Backend::Memory(m) => {
                m.snapshots
                    .write()
                    .expect("lock poisoned")
                    .insert((id.clone(), ts), bytes.clone());
                m.layers.write().expect("lock poisoned").insert(id.clone(), bytes);
            }
        }

        *last = Some(ts);
        debug!(datasource = %id, timestamp = ts, features = collection.features.len(), "recorded snapshot");
        Ok(ts)
    }

    fn remove(&self, id: &DatasourceId) -> Result<()> {
        match &self.backend {
            Backend::Fjall {
                layers, snapshots, ..
            } => {
                let mut keys = Vec::new();
                for guard in snapshots.prefix(snapshot_prefix(id)) {
                    keys.push(guard.key().map_err(storage_err)?);
                }
                for key in keys {
                    snapshots.remove(key).map_err(storage_err)?;
                }
                layers.remove(id.as_bytes()).map_err(storage_err)?;
            }
            Backend::Memory(m) => {
                m.snapshots
                    .write()
                    .expect("lock poisoned")
                    .retain(|(layer, _), _| layer != id);
                m.layers.write().expect("lock poisoned").remove(id);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LayerStore for LayerDb {
    async fn new_layer(&self) -> Result<DatasourceId> {
        let id = loop {
            let candidate = DatasourceId::generate();
            if !self.exists(&candidate)? {
                break candidate;
            }
        };
        self.insert_layer(&id, FeatureCollection::new()).await?;
        Ok(id)
    }

    async fn insert_layer(&self, id: &DatasourceId, collection: FeatureCollection) -> Result<()> {
        let slot = self.slot(id);
        let mut last = slot.lock().await;
        self.commit(id, &mut last, &collection)?;
        info!(datasource = %id, features = collection.features.len(), "stored layer");
        Ok(())
    }

    async fn get_layer(&self, id: &DatasourceId) -> Result<FeatureCollection> {
        self.load(id)
    }

    async fn delete_layer(&self, id: &DatasourceId) -> Result<()> {
        let slot = self.slot(id);
        let result = {
            let mut last = slot.lock().await;
            match self.exists(id) {
                Ok(true) => {
                    let removed = self.remove(id);
                    *last = None;
                    removed
                }
                Ok(false) => Err(StoreError::NotFound(id.clone())),
                Err(e) => Err(e),
            }
        };
        drop(slot);
        self.release_slot(id);
        result?;
        info!(datasource = %id, "deleted layer");
        Ok(())
    }

    async fn insert_feature(&self, id: &DatasourceId, mut feature: Feature) -> Result<String> {
        let slot = self.slot(id);
        let mut last = slot.lock().await;
        let mut collection = self.load(id)?;

        let geo_id = match feature.geo_id() {
            Some(geo_id) => geo_id,
            None => {
                let generated = atlas_types::random_hex(8);
                feature.set_geo_id(generated.clone());
                generated
            }
        };
        collection.features.push(feature);
        self.commit(id, &mut last, &collection)?;
        debug!(datasource = %id, %geo_id, "inserted feature");
        Ok(geo_id)
    }

    async fn edit_feature(&self, id: &DatasourceId, geo_id: &str, mut feature: Feature) -> Result<Feature> {
        let slot = self.slot(id);
        let mut last = slot.lock().await;
        let mut collection = self.load(id)?;

        let pos = collection
            .position(geo_id)
            .ok_or_else(|| StoreError::FeatureNotFound {
                datasource: id.clone(),
                geo_id: geo_id.to_string(),
            })?;

        // Carry the stored geo_id value over unchanged (it may be numeric).
        let stored = collection.features[pos]
            .properties
            .as_ref()
            .and_then(|p| p.get(GEO_ID))
            .cloned();
        if let Some(value) = stored {
            feature
                .properties
                .get_or_insert_with(Default::default)
                .insert(GEO_ID.to_string(), value);
        }
        collection.features[pos] = feature.clone();
        self.commit(id, &mut last, &collection)?;
        debug!(datasource = %id, geo_id, "edited feature");
        Ok(feature)
    }

    async fn get_layers(&self) -> Result<Vec<DatasourceId>> {
        match &self.backend {
            Backend::Fjall { layers, .. } => {
                let mut ids = Vec::new();
                for guard in layers.iter() {
                    let k = guard.key().map_err(storage_err)?;
                    let id = std::str::from_utf8(&k).map_err(storage_err)?;
                    ids.push(DatasourceId::from(id));
                }
                Ok(ids)
            }
            Backend::Memory(m) => {
                let mut ids: Vec<_> = m.layers.read().expect("lock poisoned").keys().cloned().collect();
                ids.sort();
                Ok(ids)
            }
        }
    }

    async fn select_timeseries(&self, id: &DatasourceId) -> Result<LayerTimeseries> {
        if !self.exists(id)? {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(LayerTimeseries::new(self.snapshot_timestamps(id)?))
    }

    async fn previous_by_timestamp(&self, id: &DatasourceId, timestamp: Timestamp) -> Result<Snapshot> {
        if !self.exists(id)? {
            return Err(StoreError::NotFound(id.clone()));
        }
        match self.snapshot_at(id, timestamp)? {
            Some((ts, bytes)) => Ok(Snapshot {
                timestamp: ts,
                collection: serde_json::from_slice(&bytes)?,
            }),
            None => Err(StoreError::SnapshotNotFound {
                datasource: id.clone(),
                timestamp,
            }),
        }
    }

    async fn has_layer(&self, id: &DatasourceId) -> Result<bool> {
        self.exists(id)
    }
}
