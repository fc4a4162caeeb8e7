//! Shared types and identifiers for Atlas.
//!
//! This crate defines the core types used across the Atlas workspace:
//! identifiers ([`AccessKey`], [`DatasourceId`]), ownership records
//! ([`Customer`], [`TileLayer`]), GeoJSON payloads ([`Feature`],
//! [`FeatureCollection`]), commit log entries ([`JournalEntry`]) and the
//! live-view notification ([`LayerChanged`]).

pub mod geojson;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

pub use geojson::{Feature, FeatureCollection};

/// Version reported by `ping`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Milliseconds since the Unix epoch, used to address layer snapshots.
pub type Timestamp = i64;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Return the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Return the raw bytes of the identifier (storage key form).
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }

            /// Whether the identifier is the empty string.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_id!(
    /// Bearer credential identifying a customer. Ownership only, no secret semantics.
    AccessKey
);

define_id!(
    /// Identifier of one versioned feature collection ("layer").
    DatasourceId
);

/// Table of alphanumeric characters used for access keys.
const ALPHA_NUMERIC: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of generated access keys.
pub const ACCESS_KEY_LEN: usize = 12;

/// Generate `len` random alphanumeric characters.
pub fn random_alphanumeric(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % ALPHA_NUMERIC.len();
            ALPHA_NUMERIC[idx] as char
        })
        .collect()
}

/// Generate `n` random bytes rendered as lowercase hex.
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl AccessKey {
    /// Generate a fresh random access key.
    pub fn generate() -> Self {
        Self(random_alphanumeric(ACCESS_KEY_LEN))
    }
}

impl DatasourceId {
    /// Generate a fresh random datasource id (32 hex characters).
    pub fn generate() -> Self {
        Self(random_hex(16))
    }
}

// ---------------------------------------------------------------------------
// Ownership records
// ---------------------------------------------------------------------------

/// A named tile base layer attached to a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileLayer {
    /// Tile URL template.
    pub url: String,
    /// Display name.
    pub name: String,
}

/// Ownership record stored in the registry, keyed by access key.
///
/// `datasources` has set semantics: the mutators below never introduce
/// duplicates, and ordering carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    /// The customer's access key.
    pub apikey: AccessKey,
    /// Datasources this customer owns.
    #[serde(default)]
    pub datasources: Vec<DatasourceId>,
    /// Tile base layers, in display order.
    #[serde(default)]
    pub tilelayers: Vec<TileLayer>,
}

impl Customer {
    /// A customer owning nothing.
    pub fn new(apikey: AccessKey) -> Self {
        Self {
            apikey,
            datasources: Vec::new(),
            tilelayers: Vec::new(),
        }
    }

    /// Pure membership test.
    pub fn has_datasource(&self, id: &DatasourceId) -> bool {
        self.datasources.contains(id)
    }

    /// Add a datasource. Returns `false` if it was already owned.
    pub fn add_datasource(&mut self, id: DatasourceId) -> bool {
        if self.has_datasource(&id) {
            return false;
        }
        self.datasources.push(id);
        true
    }

    /// Remove a datasource. Returns `false` if it was not owned.
    pub fn remove_datasource(&mut self, id: &DatasourceId) -> bool {
        let before = self.datasources.len();
        self.datasources.retain(|d| d != id);
        before != self.datasources.len()
    }

    /// Collapse duplicate datasource ids (records imported from outside).
    pub fn dedup_datasources(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.datasources.retain(|d| seen.insert(d.clone()));
    }
}

// ---------------------------------------------------------------------------
// Commit log and notifications
// ---------------------------------------------------------------------------

/// One accepted mutation intent, as written to the commit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Canonical method name of the command (e.g. `insert_feature`).
    pub method: String,
    /// Payload needed to replay the command.
    pub data: serde_json::Value,
}

impl JournalEntry {
    /// Build an entry from a method name and any serializable payload.
    pub fn new(method: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            method: method.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// "Layer changed" notification delivered to live viewers of a datasource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerChanged {
    /// The datasource that changed.
    pub datasource: DatasourceId,
    /// Method that caused the change.
    pub method: String,
    /// Unix milliseconds when the change was accepted.
    pub timestamp: Timestamp,
}
