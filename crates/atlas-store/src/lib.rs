//! Layer storage trait and its Fjall / in-memory implementation.
//!
//! This crate defines the [`LayerStore`] trait the dispatcher talks to, and
//! [`LayerDb`], the implementation the daemon runs on. Every accepted
//! mutation records a full snapshot of the layer addressed by a strictly
//! increasing Unix-millisecond timestamp; [`LayerTimeseries`] lists that
//! history and [`LayerStore::previous_by_timestamp`] reads one entry of it.

mod error;
mod layer_db;
mod traits;

pub use error::StoreError;
pub use layer_db::LayerDb;
pub use traits::{LayerStore, LayerTimeseries, Snapshot};
