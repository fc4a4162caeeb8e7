//! Error types for the commit log.

use std::path::PathBuf;

/// Errors returned by the journal writer and reader.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Opening, writing or flushing the log file failed.
    #[error("commit log io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An entry could not be encoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A line in an existing log could not be decoded.
    #[error("corrupt commit log entry at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}
