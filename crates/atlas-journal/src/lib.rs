//! Commit log for accepted mutations.
//!
//! Producers hold a cheap [`CommitLog`] handle and call
//! [`enqueue`](CommitLog::enqueue), which never blocks: when the bounded
//! queue is full the entry is dropped and a warning is logged. A single
//! [`JournalWriter`] drains the queue and appends one JSON line per entry to
//! the log file, flushing after each write.
//!
//! A write failure ends [`JournalWriter::run`] with a [`JournalError`]; the
//! daemon treats that as fatal.

mod error;
mod commit;

pub use error::JournalError;
pub use commit::{CommitLog, DEFAULT_CAPACITY, Enqueued, JournalWriter, read_entries};
