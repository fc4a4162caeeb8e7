//! Error types for layer storage operations.

use atlas_types::{DatasourceId, Timestamp};

/// Errors that can occur during layer storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested layer does not exist.
    #[error("layer not found: {0}")]
    NotFound(DatasourceId),

    /// No feature in the layer carries the requested geo_id.
    #[error("feature {geo_id} not found in layer {datasource}")]
    FeatureNotFound {
        datasource: DatasourceId,
        geo_id: String,
    },

    /// The requested timestamp precedes every snapshot of the layer.
    #[error("no snapshot of layer {datasource} at or before {timestamp}")]
    SnapshotNotFound {
        datasource: DatasourceId,
        timestamp: Timestamp,
    },

    /// The underlying database failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored collection could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this error is a "not found" outcome rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::FeatureNotFound { .. } | Self::SnapshotNotFound { .. }
        )
    }
}
