//! Live-view subscriptions and "layer changed" fan-out.
//!
//! Each viewer connection gets its own bounded channel. A broadcast walks the
//! connections subscribed to the datasource under the hub mutex and uses
//! `try_send`, so a slow viewer loses events instead of stalling the mutation
//! that triggered them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use atlas_types::{DatasourceId, LayerChanged};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events buffered per viewer before new ones are dropped.
pub const DEFAULT_VIEWER_BUFFER: usize = 64;

/// Identity of one viewer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Viewer {
    tx: mpsc::Sender<LayerChanged>,
    datasources: HashSet<DatasourceId>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    viewers: HashMap<ConnectionId, Viewer>,
}

/// Tracks which connections view which datasources.
pub struct SubscriberHub {
    inner: Mutex<HubInner>,
    buffer: usize,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new(DEFAULT_VIEWER_BUFFER)
    }
}

impl SubscriberHub {
    /// Create a hub whose viewers buffer up to `buffer` events each.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().expect("hub lock poisoned")
    }

    /// Register a new connection. It views nothing until [`subscribe`](Self::subscribe).
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<LayerChanged>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = ConnectionId(inner.next_id);
        inner.viewers.insert(
            id,
            Viewer {
                tx,
                datasources: HashSet::new(),
            },
        );
        debug!(%id, "viewer connected");
        (id, rx)
    }

    /// Start delivering events for `datasource` to `conn`.
    ///
    /// Returns `false` if the connection is not registered.
    pub fn subscribe(&self, conn: ConnectionId, datasource: DatasourceId) -> bool {
        let mut inner = self.lock();
        match inner.viewers.get_mut(&conn) {
            Some(viewer) => {
                debug!(%conn, %datasource, "viewer subscribed");
                viewer.datasources.insert(datasource);
                true
            }
            None => false,
        }
    }

    /// Drop a connection and all of its subscriptions.
    pub fn unsubscribe(&self, conn: ConnectionId) {
        if self.lock().viewers.remove(&conn).is_some() {
            debug!(%conn, "viewer disconnected");
        }
    }

    /// Connect and subscribe in one step. The view unsubscribes when dropped.
    pub fn open_view(self: &Arc<Self>, datasource: DatasourceId) -> LiveView {
        let (id, rx) = self.connect();
        self.subscribe(id, datasource.clone());
        LiveView {
            hub: self.clone(),
            id,
            datasource,
            rx,
        }
    }

    /// Deliver `event` to every viewer of its datasource without blocking.
    ///
    /// Returns the number of viewers the event was handed to. Full buffers
    /// drop the event; closed viewers are pruned.
    pub fn broadcast(&self, event: &LayerChanged) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, viewer) in inner.viewers.iter() {
            if !viewer.datasources.contains(&event.datasource) {
                continue;
            }
            match viewer.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn = %id, datasource = %event.datasource, "viewer buffer full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            inner.viewers.remove(&id);
            debug!(conn = %id, "pruned closed viewer");
        }
        delivered
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.lock().viewers.len()
    }

    /// Number of connections viewing `datasource`.
    pub fn viewer_count(&self, datasource: &DatasourceId) -> usize {
        self.lock()
            .viewers
            .values()
            .filter(|v| v.datasources.contains(datasource))
            .count()
    }

    /// Drop every connection. Their receivers observe end-of-stream.
    pub fn close_all(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.viewers.len();
        inner.viewers.clear();
        n
    }
}

/// A connection-scoped live view of one datasource.
pub struct LiveView {
    hub: Arc<SubscriberHub>,
    id: ConnectionId,
    datasource: DatasourceId,
    rx: mpsc::Receiver<LayerChanged>,
}

impl LiveView {
    /// The connection backing this view.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The datasource being viewed.
    pub fn datasource(&self) -> &DatasourceId {
        &self.datasource
    }

    /// Next change notification, or `None` once the hub closed the view.
    pub async fn recv(&mut self) -> Option<LayerChanged> {
        self.rx.recv().await
    }
}

impl Drop for LiveView {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
