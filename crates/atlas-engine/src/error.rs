//! Error types for the engine.

use atlas_meta::MetaError;
use atlas_store::StoreError;

use crate::importer::ImportError;

/// Failure classes a command can end in.
///
/// Transports map each class to a response (HTTP status, socket error
/// envelope). Only `Storage` indicates a fault on our side.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing or unknown access key, or a key that does not own the datasource.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown datasource, feature or snapshot.
    #[error("{0}")]
    NotFound(String),

    /// Malformed payload or missing required field.
    #[error("{0}")]
    BadRequest(String),

    /// Layer store, registry or converter I/O failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    /// Whether the caller can recover from this error (everything but `Storage`).
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        if e.is_not_found() {
            Self::NotFound(e.to_string())
        } else {
            Self::Storage(e.to_string())
        }
    }
}

impl From<MetaError> for EngineError {
    fn from(e: MetaError) -> Self {
        if e.is_not_found() {
            Self::NotFound(e.to_string())
        } else {
            Self::Storage(e.to_string())
        }
    }
}

impl From<ImportError> for EngineError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Unsupported(_) | ImportError::Parse(_) | ImportError::Missing(_) => {
                Self::BadRequest(e.to_string())
            }
            ImportError::Converter(_) | ImportError::Io(_) => Self::Storage(e.to_string()),
        }
    }
}
