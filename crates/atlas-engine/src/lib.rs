//! Command pipeline tying the Atlas components together.
//!
//! The [`Dispatcher`] owns handles to the ownership registry, the layer
//! store, the commit log and the [`SubscriberHub`], and exposes one
//! operation table ([`Command`]) shared by every transport.
//!
//! Transports resolve the caller to a [`Caller`], build a [`Command`] and
//! turn the resulting [`Outcome`] or [`EngineError`] into their own
//! response format. The dispatcher never writes to a transport.

pub mod command;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod importer;

pub use command::{Caller, Command, CommandArgs, CommandData, Outcome};
pub use dispatcher::Dispatcher;
pub use error::EngineError;
pub use hub::{ConnectionId, LiveView, SubscriberHub};
pub use importer::{FormatConverter, ImportError, Importer, Ogr2Ogr};

#[cfg(test)]
mod tests;
