//! Core trait and types for layer storage.

use atlas_types::{DatasourceId, Feature, FeatureCollection, Timestamp};

use crate::error::StoreError;

/// Storage of versioned feature collections ("layers").
///
/// All implementations must be `Send + Sync` for use across async tasks.
/// Every successful mutation records a snapshot of the resulting collection.
#[async_trait::async_trait]
pub trait LayerStore: Send + Sync {
    /// Allocate a new, empty layer and return its id.
    async fn new_layer(&self) -> Result<DatasourceId, StoreError>;

    /// Store `collection` as the content of `id`, creating the layer if needed.
    async fn insert_layer(
        &self,
        id: &DatasourceId,
        collection: FeatureCollection,
    ) -> Result<(), StoreError>;

    /// Current content of a layer.
    async fn get_layer(&self, id: &DatasourceId) -> Result<FeatureCollection, StoreError>;

    /// Delete a layer and its snapshot history.
    async fn delete_layer(&self, id: &DatasourceId) -> Result<(), StoreError>;

    /// Append a feature. A generated geo_id is assigned when the feature has
    /// none. Returns the feature's geo_id.
    async fn insert_feature(&self, id: &DatasourceId, feature: Feature)
    -> Result<String, StoreError>;

    /// Replace the feature addressed by `geo_id`. The replacement keeps the
    /// stored geo_id value. Returns the feature as stored.
    async fn edit_feature(
        &self,
        id: &DatasourceId,
        geo_id: &str,
        feature: Feature,
    ) -> Result<Feature, StoreError>;

    /// Ids of every stored layer.
    async fn get_layers(&self) -> Result<Vec<DatasourceId>, StoreError>;

    /// Snapshot timestamps of a layer. Reads keys only, never snapshot bodies.
    async fn select_timeseries(&self, id: &DatasourceId) -> Result<LayerTimeseries, StoreError>;

    /// The latest snapshot of `id` at or before `timestamp`.
    ///
    /// Returns `SnapshotNotFound` when `timestamp` precedes every snapshot.
    async fn previous_by_timestamp(
        &self,
        id: &DatasourceId,
        timestamp: Timestamp,
    ) -> Result<Snapshot, StoreError>;

    /// Whether a layer exists.
    async fn has_layer(&self, id: &DatasourceId) -> Result<bool, StoreError> {
        match self.get_layer(id).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// One point-in-time copy of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Unix milliseconds at which the snapshot was recorded.
    pub timestamp: Timestamp,
    /// The layer content at that time.
    pub collection: FeatureCollection,
}

/// Snapshot timestamps of one layer, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerTimeseries {
    timestamps: Vec<Timestamp>,
}

impl LayerTimeseries {
    pub fn new(mut timestamps: Vec<Timestamp>) -> Self {
        timestamps.sort_unstable();
        Self { timestamps }
    }

    /// Snapshot timestamps, oldest first.
    pub fn snapshots(&self) -> Vec<Timestamp> {
        self.timestamps.clone()
    }
}
