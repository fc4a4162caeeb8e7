//! Minimal GeoJSON payload types.
//!
//! Geometry is kept as opaque JSON: Atlas never inspects coordinates, it
//! only addresses features by their `geo_id` property. Unknown members are
//! preserved through a round trip.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Property used to address a feature within a layer.
pub const GEO_ID: &str = "geo_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum FeatureKind {
    Feature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CollectionKind {
    FeatureCollection,
}

/// A GeoJSON feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    kind: FeatureKind,
    /// Optional GeoJSON `id` member (distinct from `geo_id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Geometry object, or `null`.
    #[serde(default)]
    pub geometry: Value,
    /// Property map, or `null`.
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    /// Foreign members (e.g. `bbox`).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Feature {
    /// A feature with the given geometry and no properties.
    pub fn new(geometry: Value) -> Self {
        Self {
            kind: FeatureKind::Feature,
            id: None,
            geometry,
            properties: None,
            extra: Map::new(),
        }
    }

    /// The feature's `geo_id` property rendered as text.
    ///
    /// Strings are returned as-is and numbers in their decimal form; any other
    /// JSON type (or a missing property) yields `None`.
    pub fn geo_id(&self) -> Option<String> {
        match self.properties.as_ref()?.get(GEO_ID)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Set the `geo_id` property, creating the property map if needed.
    pub fn set_geo_id(&mut self, geo_id: impl Into<String>) {
        self.properties
            .get_or_insert_with(Map::new)
            .insert(GEO_ID.to_string(), Value::String(geo_id.into()));
    }

    /// Set an arbitrary property.
    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }
}

/// A GeoJSON feature collection: the full content of one layer version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    kind: CollectionKind,
    /// Features in insertion order.
    #[serde(default)]
    pub features: Vec<Feature>,
    /// Foreign members (e.g. `crs`, `bbox`).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for FeatureCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureCollection {
    /// An empty collection.
    pub fn new() -> Self {
        Self {
            kind: CollectionKind::FeatureCollection,
            features: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Find a feature by its `geo_id`. Scans by property, not by index.
    pub fn find(&self, geo_id: &str) -> Option<&Feature> {
        self.features
            .iter()
            .find(|f| f.geo_id().as_deref() == Some(geo_id))
    }

    /// Index of the feature with the given `geo_id`.
    pub fn position(&self, geo_id: &str) -> Option<usize> {
        self.features
            .iter()
            .position(|f| f.geo_id().as_deref() == Some(geo_id))
    }
}
