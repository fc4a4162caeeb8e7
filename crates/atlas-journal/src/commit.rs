//! [`CommitLog`] producer handle and [`JournalWriter`] consumer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use atlas_types::JournalEntry;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::JournalError;

type Result<T> = std::result::Result<T, JournalError>;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Outcome of [`CommitLog::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The entry is queued and will be written.
    Accepted,
    /// The queue was full (or the writer is gone); the entry was discarded.
    Dropped,
}

/// Counters shared between producers and the writer.
struct QueueState {
    /// Entries enqueued but not yet written and flushed.
    pending: AtomicUsize,
    /// Signalled whenever `pending` reaches zero.
    drained: Notify,
}

/// Producer handle for the commit log. Clone freely.
#[derive(Clone)]
pub struct CommitLog {
    tx: mpsc::Sender<JournalEntry>,
    state: Arc<QueueState>,
}

/// The single consumer that appends queued entries to the log file.
pub struct JournalWriter {
    rx: mpsc::Receiver<JournalEntry>,
    state: Arc<QueueState>,
}

impl CommitLog {
    /// Create a commit log with a queue of `capacity` entries.
    ///
    /// The returned [`JournalWriter`] must be driven with
    /// [`run`](JournalWriter::run) for entries to reach disk.
    pub fn new(capacity: usize) -> (Self, JournalWriter) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let state = Arc::new(QueueState {
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
        });
        let log = Self {
            tx,
            state: state.clone(),
        };
        (log, JournalWriter { rx, state })
    }

    /// Queue an entry for writing. Never blocks or suspends.
    pub fn enqueue(&self, entry: JournalEntry) -> Enqueued {
        let method = entry.method.clone();
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(entry) {
            Ok(()) => {
                debug!(%method, "commit log entry queued");
                Enqueued::Accepted
            }
            Err(e) => {
                self.release(1);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "writer stopped",
                };
                warn!(%method, reason, "commit log entry dropped");
                Enqueued::Dropped
            }
        }
    }

    /// Entries enqueued but not yet written and flushed.
    pub fn depth(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Wait until every queued entry has been written, or `timeout` elapses.
    ///
    /// Returns `true` if the queue drained.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.state.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.depth() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.depth() == 0;
            }
        }
    }

    fn release(&self, n: usize) {
        release(&self.state, n);
    }
}

fn release(state: &QueueState, n: usize) {
    if state.pending.fetch_sub(n, Ordering::SeqCst) == n {
        state.drained.notify_waiters();
    }
}

impl JournalWriter {
    /// Append queued entries to `path` until every [`CommitLog`] handle is
    /// dropped and the queue is empty.
    ///
    /// The file is opened in append mode and created (mode `0600` on Unix) if
    /// missing. Returns the number of entries written. Any I/O failure ends the
    /// writer with an error.
    pub async fn run(mut self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref().to_path_buf();
        let mut file = open_append(&path).await?;
        info!(path = %path.display(), "commit log writer started");

        let mut written = 0u64;
        while let Some(entry) = self.rx.recv().await {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            file.write_all(&line).await.map_err(|e| io_err(&path, e))?;
            file.flush().await.map_err(|e| io_err(&path, e))?;
            release(&self.state, 1);
            written += 1;
        }

        info!(path = %path.display(), written, "commit log writer stopped");
        Ok(written)
    }
}

async fn open_append(path: &Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;
    }

    let mut opts = tokio::fs::OpenOptions::new();
    opts.append(true).create(true);
    #[cfg(unix)]
    opts.mode(0o600);
    opts.open(path).await.map_err(|e| io_err(path, e))
}

fn io_err(path: &Path, source: std::io::Error) -> JournalError {
    JournalError::Io {
        path: PathBuf::from(path),
        source,
    }
}

/// Read every entry of an existing commit log, in file order.
pub async fn read_entries(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| io_err(path, e))?;

    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(line).map_err(|source| JournalError::Corrupt {
            line: idx + 1,
            source,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}
