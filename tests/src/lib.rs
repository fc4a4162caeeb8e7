//! Shared test harness for Atlas end-to-end tests.
//!
//! Provides [`TestNode`]: a full node (registry, layer store, commit log,
//! subscriber hub, dispatcher) with the command socket listening on an
//! ephemeral loopback port and the HTTP router available in-process.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use atlas_engine::{Dispatcher, Importer, SubscriberHub};
use atlas_http::{HttpServer, HttpServerConfig};
use atlas_journal::{CommitLog, JournalError, JournalWriter};
use atlas_meta::OwnershipRegistry;
use atlas_socket::{SessionTracker, SocketError, SocketServer};
use atlas_store::{LayerDb, LayerStore};
use atlas_types::JournalEntry;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Superuser key every test node is started with.
pub const SUPERUSER_KEY: &str = "integration-superuser";

const IO_TIMEOUT: Duration = Duration::from_secs(5);

// =========================================================================
// Test node
// =========================================================================

enum Journal {
    /// Writer running against `path`.
    Running(JoinHandle<Result<u64, JournalError>>),
    /// Writer held but never run, so enqueued entries stay queued.
    Stalled(JournalWriter),
}

/// A running Atlas node.
pub struct TestNode {
    pub dispatcher: Arc<Dispatcher>,
    pub socket_addr: SocketAddr,
    pub journal_path: PathBuf,
    router: axum::Router,
    journal: CommitLog,
    writer: Journal,
    sessions: Arc<SessionTracker>,
    stop: watch::Sender<bool>,
    socket_task: JoinHandle<Result<(), SocketError>>,
    _dir: Option<TempDir>,
}

impl TestNode {
    /// Start a node persisting to a fresh temporary directory.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        Self::boot(&path, Some(dir), None).await
    }

    /// Start a node persisting to `dir`, which outlives the node.
    pub async fn start_in(dir: &Path) -> Self {
        Self::boot(dir, None, None).await
    }

    /// Start a node whose commit log has room for `capacity` entries and is
    /// never drained.
    pub async fn start_with_stalled_journal(capacity: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        Self::boot(&path, Some(dir), Some(capacity)).await
    }

    async fn boot(dir: &Path, owned: Option<TempDir>, stalled: Option<usize>) -> Self {
        let registry = Arc::new(OwnershipRegistry::open(dir.join("meta")).unwrap());
        let store: Arc<dyn LayerStore> = Arc::new(LayerDb::open(dir.join("layers")).unwrap());
        let journal_path = dir.join("commit.log");

        let (journal, writer) = CommitLog::new(stalled.unwrap_or(atlas_journal::DEFAULT_CAPACITY));
        let writer = match stalled {
            Some(_) => Journal::Stalled(writer),
            None => Journal::Running(tokio::spawn(writer.run(journal_path.clone()))),
        };

        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            store,
            journal.clone(),
            Arc::new(SubscriberHub::default()),
            Importer::default(),
        ));

        let router = HttpServer::new(HttpServerConfig {
            dispatcher: dispatcher.clone(),
            superuser_key: SUPERUSER_KEY.to_string(),
        })
        .into_router();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socket_addr = listener.local_addr().unwrap();
        let socket = SocketServer::new(dispatcher.clone());
        let sessions = socket.sessions();
        let (stop, mut stop_rx) = watch::channel(false);
        let socket_task = tokio::spawn(socket.serve_with_shutdown(listener, async move {
            let _ = stop_rx.wait_for(|s| *s).await;
        }));

        Self {
            dispatcher,
            socket_addr,
            journal_path,
            router,
            journal,
            writer,
            sessions,
            stop,
            socket_task,
            _dir: owned,
        }
    }

    /// Open a command socket connection.
    pub async fn socket(&self) -> SocketClient {
        SocketClient::connect(self.socket_addr).await
    }

    /// Issue an HTTP request against the node's router.
    pub async fn http(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// The HTTP router, for requests that need the raw response (streams).
    pub fn router(&self) -> axum::Router {
        self.router.clone()
    }

    /// Entries enqueued but not yet written.
    pub fn journal_depth(&self) -> usize {
        self.journal.depth()
    }

    /// Stop the node the way the daemon does and return what the commit log
    /// holds on disk. A stalled journal is discarded and yields nothing.
    pub async fn shutdown(self) -> Vec<JournalEntry> {
        let Self {
            dispatcher,
            journal_path,
            router,
            journal,
            writer,
            sessions,
            stop,
            socket_task,
            _dir,
            ..
        } = self;

        dispatcher.hub().close_all();
        let _ = stop.send(true);
        tokio::time::timeout(IO_TIMEOUT, socket_task)
            .await
            .expect("socket server stops")
            .unwrap()
            .unwrap();
        assert!(sessions.wait_idle(IO_TIMEOUT).await, "sessions close");
        assert!(
            matches!(writer, Journal::Stalled(_)) || journal.wait_drained(IO_TIMEOUT).await,
            "journal drains"
        );

        drop(router);
        drop(dispatcher);
        drop(journal);

        match writer {
            Journal::Running(handle) => {
                tokio::time::timeout(IO_TIMEOUT, handle)
                    .await
                    .expect("writer stops")
                    .unwrap()
                    .unwrap();
                atlas_journal::read_entries(&journal_path).await.unwrap()
            }
            Journal::Stalled(_) => Vec::new(),
        }
    }
}

// =========================================================================
// Socket client
// =========================================================================

/// Line-oriented client for the command socket.
pub struct SocketClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SocketClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (r, w) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Next line, or `None` once the server closed the connection.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(IO_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("line within timeout")
            .unwrap();
        (n > 0).then_some(line)
    }

    /// Send one request and parse the response line.
    pub async fn call(&mut self, request: Value) -> Value {
        self.send_line(&request.to_string()).await;
        let line = self.read_line().await.expect("response line");
        serde_json::from_str(&line).unwrap()
    }

    /// Send one request and return `data`, failing if the status is not ok.
    pub async fn ok(&mut self, request: Value) -> Value {
        let resp = self.call(request.clone()).await;
        assert_eq!(resp["status"], "ok", "{request} -> {resp}");
        resp["data"].clone()
    }
}
