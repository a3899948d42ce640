//! Connection pool -- live connections plus the single active one.
//!
//! Requests dispatched while nothing is active wait in a FIFO queue that is
//! drained, in order, by the next `set_active`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::Value;
use switchboard_manager::{ConnId, ConnectionSnapshot, ConnectionState};
use switchboard_protocol::{ApiAction, ApiError, RequestEnvelope};
use tokio::sync::{oneshot, RwLock};

use crate::connection::{Connection, ConnectionEvent};

/// Called once, the first time a registered connection reaches Open.
pub type OnOpen = Box<dyn FnOnce(&Arc<Connection>) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnId),
    #[error("connection {0} is not registered")]
    NotRegistered(ConnId),
    #[error("connection {id} is {state}, only open connections can be activated")]
    NotOpen { id: ConnId, state: ConnectionState },
}

/// Result of a dispatched request and the connection that served it.
#[derive(Debug)]
pub struct Served {
    pub connection: Option<Arc<Connection>>,
    pub result: Result<Value, ApiError>,
}

enum Queued {
    Request {
        envelope: RequestEnvelope,
        timeout: Duration,
        reply: oneshot::Sender<(Arc<Connection>, oneshot::Receiver<Result<Value, ApiError>>)>,
    },
    Api {
        timeout: Duration,
        reply: oneshot::Sender<oneshot::Receiver<Option<Vec<ApiAction>>>>,
    },
}

impl Queued {
    fn issue(self, conn: &Arc<Connection>) {
        match self {
            Queued::Request {
                envelope,
                timeout,
                reply,
            } => {
                let rx = conn.submit(envelope, timeout);
                let _ = reply.send((conn.clone(), rx));
            }
            Queued::Api { timeout, reply } => {
                let _ = reply.send(conn.fetch_direct_api(timeout));
            }
        }
    }
}

#[derive(Default)]
struct PoolInner {
    connections: HashMap<ConnId, Arc<Connection>>,
    on_open: HashMap<ConnId, OnOpen>,
    active: Option<Arc<Connection>>,
    queue: VecDeque<Queued>,
}

impl PoolInner {
    /// The active connection, dropped here if it left Open before its
    /// state event reached the pool.
    fn usable_active(&mut self) -> Option<Arc<Connection>> {
        let conn = self.active.clone()?;
        if conn.state() == ConnectionState::Open {
            return Some(conn);
        }
        tracing::info!(conn = conn.id(), authority = %conn.authority(), state = %conn.state(), "active connection lost");
        self.active = None;
        None
    }
}

/// Thread-safe pool of live connections. Closed connections are removed.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    inner: Arc<RwLock<PoolInner>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. `on_open` fires the first time it reaches Open.
    pub async fn add_connection(&self, conn: Arc<Connection>, on_open: OnOpen) -> Result<(), PoolError> {
        let mut inner = self.inner.write().await;
        let id = conn.id();
        if inner.connections.contains_key(&id) {
            return Err(PoolError::AlreadyRegistered(id));
        }
        inner.connections.insert(id, conn);
        inner.on_open.insert(id, on_open);
        let pool_size = inner.connections.len();
        drop(inner);

        tracing::debug!(conn = id, pool_size, "connection registered");
        Ok(())
    }

    /// Apply a connection state change.
    pub async fn handle_event(&self, event: &ConnectionEvent) {
        let (conn, on_open) = {
            let mut inner = self.inner.write().await;
            let Some(conn) = inner.connections.get(&event.id).cloned() else {
                return;
            };

            if event.state != ConnectionState::Open
                && inner.active.as_ref().is_some_and(|a| a.id() == event.id)
            {
                inner.active = None;
                tracing::info!(conn = event.id, authority = %event.authority, state = %event.state, "active connection lost");
            }

            match event.state {
                ConnectionState::Closed => {
                    inner.connections.remove(&event.id);
                    inner.on_open.remove(&event.id);
                    (conn, None)
                }
                ConnectionState::Open => {
                    let cb = inner.on_open.remove(&event.id);
                    (conn, cb)
                }
                _ => (conn, None),
            }
        };

        if let Some(cb) = on_open {
            cb(&conn);
        }
    }

    /// Make `id` the active connection and flush queued requests to it.
    pub async fn set_active(&self, id: ConnId) -> Result<(), PoolError> {
        let mut inner = self.inner.write().await;
        let conn = inner
            .connections
            .get(&id)
            .cloned()
            .ok_or(PoolError::NotRegistered(id))?;

        let state = conn.state();
        if state != ConnectionState::Open {
            return Err(PoolError::NotOpen { id, state });
        }
        if inner.active.as_ref().is_some_and(|a| a.id() == id) {
            return Ok(());
        }

        tracing::info!(conn = id, authority = %conn.authority(), "activating connection");
        if let Some(prev) = inner.active.take() {
            prev.set_active(false);
        }
        conn.set_active(true);
        inner.active = Some(conn.clone());

        // Held under the write lock, so dispatches racing the flush queue up behind it.
        let queued: Vec<Queued> = inner.queue.drain(..).collect();
        if !queued.is_empty() {
            tracing::debug!(conn = id, flushed = queued.len(), "flushing queued requests");
        }
        for job in queued {
            job.issue(&conn);
        }
        Ok(())
    }

    /// Send a request on the active connection, or queue it until one exists.
    pub async fn dispatch(&self, envelope: RequestEnvelope, timeout: Duration) -> Served {
        let (conn, rx) = {
            let mut inner = self.inner.write().await;
            match inner.usable_active() {
                Some(conn) => {
                    let rx = conn.submit(envelope, timeout);
                    (conn, rx)
                }
                None => {
                    let (tx, queued_rx) = oneshot::channel();
                    inner.queue.push_back(Queued::Request {
                        envelope,
                        timeout,
                        reply: tx,
                    });
                    tracing::debug!(queued = inner.queue.len(), "no active connection, request queued");
                    drop(inner);
                    match queued_rx.await {
                        Ok(issued) => issued,
                        Err(_) => {
                            return Served {
                                connection: None,
                                result: Err(ApiError::transport("client shut down")),
                            }
                        }
                    }
                }
            }
        };

        let result = rx.await.unwrap_or_else(|_| Err(ApiError::connection_lost()));
        Served {
            connection: Some(conn),
            result,
        }
    }

    /// Fetch the API listing through the active connection, queued like requests.
    pub async fn fetch_direct_api(&self, timeout: Duration) -> Option<Vec<ApiAction>> {
        let rx = {
            let mut inner = self.inner.write().await;
            match inner.usable_active() {
                Some(conn) => conn.fetch_direct_api(timeout),
                None => {
                    let (tx, queued_rx) = oneshot::channel();
                    inner.queue.push_back(Queued::Api { timeout, reply: tx });
                    drop(inner);
                    queued_rx.await.ok()?
                }
            }
        };
        rx.await.ok().flatten()
    }

    /// Uniformly random Open connection other than the active one.
    pub async fn random_standby_connection(&self) -> Option<Arc<Connection>> {
        let inner = self.inner.read().await;
        let active = inner.active.as_ref().map(|a| a.id());
        let standby: Vec<&Arc<Connection>> = inner
            .connections
            .values()
            .filter(|c| Some(c.id()) != active && c.state() == ConnectionState::Open)
            .collect();
        standby.choose(&mut rand::thread_rng()).map(|c| Arc::clone(c))
    }

    pub async fn active(&self) -> Option<Arc<Connection>> {
        self.inner.read().await.active.clone()
    }

    pub async fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.inner.read().await.connections.get(&id).cloned()
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.read().await.connections.values().cloned().collect()
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.read().await.queue.len()
    }

    /// Snapshots of every live connection plus the active id.
    pub async fn snapshots(&self) -> (Vec<ConnectionSnapshot>, Option<ConnId>) {
        let inner = self.inner.read().await;
        let mut snaps: Vec<ConnectionSnapshot> =
            inner.connections.values().map(|c| c.snapshot()).collect();
        snaps.sort_by_key(|s| s.id);
        (snaps, inner.active.as_ref().map(|a| a.id()))
    }

    /// Drop queued work; waiters observe a transport error.
    pub async fn clear_queue(&self) {
        self.inner.write().await.queue.clear();
    }
}
