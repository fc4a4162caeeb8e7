//! Accept loop and per-connection sessions.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use atlas_engine::{Command, Dispatcher};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::error::SocketError;
use crate::protocol::{Request, Response, caller_for, help_text};

type Result<T> = std::result::Result<T, SocketError>;

/// Only loopback peers may use the command socket.
pub fn is_allowed_peer(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(v6.is_loopback(), |v4| v4.is_loopback()),
    }
}

/// Count of open sessions, shared with whoever drives shutdown.
#[derive(Debug, Default)]
pub struct SessionTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl SessionTracker {
    /// Sessions currently open.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until no session is open. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn enter(self: &Arc<Self>) -> SessionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        SessionGuard(self.clone())
    }
}

struct SessionGuard(Arc<SessionTracker>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Line-delimited JSON command server for loopback clients.
pub struct SocketServer {
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionTracker>,
}

impl SocketServer {
    /// Create a server running commands through `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            sessions: Arc::new(SessionTracker::default()),
        }
    }

    /// Handle for observing open sessions.
    pub fn sessions(&self) -> Arc<SessionTracker> {
        self.sessions.clone()
    }

    /// Bind `addr` and serve until the process exits.
    pub async fn serve(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SocketError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve on `listener` until `shutdown` completes.
    ///
    /// After shutdown no connection is accepted, and each open session stops
    /// once its in-flight command has been answered.
    pub async fn serve_with_shutdown(
        self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "command socket listening");
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if !is_allowed_peer(&peer) {
                        warn!(%peer, "rejected non-loopback connection");
                        drop(stream);
                        continue;
                    }

                    let dispatcher = self.dispatcher.clone();
                    let guard = self.sessions.enter();
                    let stop = stop_rx.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        debug!(%peer, "session opened");
                        if let Err(e) = run_session(dispatcher, stream, stop).await {
                            debug!(%peer, error = %e, "session ended with error");
                        }
                        debug!(%peer, "session closed");
                    });
                }
            }
        }

        let _ = stop_tx.send(true);
        info!(open_sessions = self.sessions.active(), "command socket stopped accepting");
        Ok(())
    }
}

/// Serve one connection: read a line, run it to completion, answer, repeat.
async fn run_session(
    dispatcher: Arc<Dispatcher>,
    stream: TcpStream,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        if *stop.borrow() {
            return Ok(());
        }
        let line = tokio::select! {
            _ = stop.changed() => return Ok(()),
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(e) => {
                // Non-UTF-8 input is malformed too.
                respond(&mut write_half, &Response::Error { error: e.to_string() }).await?;
                return Ok(());
            }
        };
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed request, closing session");
                respond(&mut write_half, &Response::Error { error: e.to_string() }).await?;
                return Ok(());
            }
        };

        if request.method == "help" {
            write_half.write_all(help_text().as_bytes()).await?;
            continue;
        }

        let response = execute(&dispatcher, request).await;
        respond(&mut write_half, &response).await?;
    }
}

async fn execute(dispatcher: &Arc<Dispatcher>, request: Request) -> Response {
    let apikey = request.args.apikey.clone();
    let command = match Command::from_method(&request.method, request.args) {
        Ok(command) => command,
        Err(e) => {
            debug!(method = %request.method, error = %e, "rejected request");
            return Response::Error { error: e.to_string() };
        }
    };
    let caller = caller_for(&command, apikey);

    match dispatcher.dispatch_detached(caller, command).await {
        Ok(outcome) => Response::Ok {
            data: outcome.to_json(),
        },
        Err(e) => Response::Error { error: e.to_string() },
    }
}

async fn respond<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    writer.write_all(response.to_line()?.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
