//! Error types for the ownership registry.

use atlas_types::AccessKey;

/// Errors returned by [`OwnershipRegistry`](crate::OwnershipRegistry) operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// No customer record exists for the key.
    #[error("customer not found: {0}")]
    CustomerNotFound(AccessKey),

    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error (e.g. from Fjall guard operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MetaError {
    /// Whether this error means the key is unknown (as opposed to a storage fault).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CustomerNotFound(_))
    }
}
