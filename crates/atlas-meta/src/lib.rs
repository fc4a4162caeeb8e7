//! Ownership registry persistence wrapping Fjall.
//!
//! [`OwnershipRegistry`] stores one [`Customer`](atlas_types::Customer) record
//! per access key in the `apikeys` keyspace, serialized as JSON with the
//! `apikey`, `datasources` and `tilelayers` field names. Ownership checks read
//! the record fresh on every call; there is no cache in front of Fjall.

mod error;
mod registry;

pub use error::MetaError;
pub use registry::OwnershipRegistry;
