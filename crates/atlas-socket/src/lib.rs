//! Loopback command socket for Atlas.
//!
//! A [`SocketServer`] accepts TCP connections from loopback peers only and
//! reads newline-delimited JSON requests, running each through the shared
//! [`Dispatcher`](atlas_engine::Dispatcher) in arrival order. See
//! [`protocol`] for the wire format.

mod error;
pub mod protocol;
mod server;


pub use error::SocketError;
pub use server::{SessionTracker, SocketServer, is_allowed_peer};
