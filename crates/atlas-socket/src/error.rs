//! Error types for the command socket.

/// Errors that can occur while serving the command socket.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Failed to bind the listening address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Error reading from or writing to a connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A response could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
