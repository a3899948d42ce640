//! Connection -- one dispatcher link: state machine, RTT window, pending requests.
//!
//! Lifecycle:
//!
//! ```text
//! Connecting -> Open      first ping round trip completes
//! Open       -> Closing   local shutdown() or server shutdown push
//! any        -> Closed    transport closed, or Closing with nothing pending
//! ```
//!
//! Closed is terminal. Every state change is published as a `ConnectionEvent`.
//! Each request runs on its own stream task; its timeout is authoritative and
//! a late reply for a finalized slot is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use switchboard_manager::{ConnId, ConnectionSnapshot, ConnectionState, RecentPings};
use switchboard_protocol::{
    decode_reply, ApiAction, ApiError, RequestEnvelope, StreamDescriptor, API_FETCH_REQUEST_ID,
    SHUTDOWN_CLOSE_CODE, SHUTDOWN_CLOSE_REASON,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::transport::{Connector, Link, LinkError};

/// RTT samples kept per connection, newest first.
pub const RTT_WINDOW: usize = 10;

/// How much an outstanding ping's elapsed time is discounted per window position.
const OUTSTANDING_PING_DECAY_MS: u64 = 50;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// RTT window
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RttTracker {
    samples: VecDeque<u64>,
    sent_at: Option<Instant>,
}

impl RttTracker {
    pub fn mark_sent(&mut self, now: Instant) {
        self.sent_at = Some(now);
    }

    /// Record the round trip for the outstanding probe. None if nothing was outstanding.
    pub fn mark_received(&mut self, now: Instant) -> Option<u64> {
        let sent = self.sent_at.take()?;
        let rtt = now.saturating_duration_since(sent).as_millis() as u64;
        self.samples.push_front(rtt);
        self.samples.truncate(RTT_WINDOW);
        Some(rtt)
    }

    pub fn samples(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().copied()
    }

    pub fn is_outstanding(&self) -> bool {
        self.sent_at.is_some()
    }

    /// Running minima over the window. An outstanding probe raises each
    /// minimum to its elapsed time, less 50ms per position, so a stalled
    /// link degrades `last` quickly and `min5` slowly.
    pub fn recent(&self, now: Instant) -> RecentPings {
        let mut mins: Vec<u64> = Vec::with_capacity(RTT_WINDOW);
        if self.samples.is_empty() {
            mins.push(0);
        } else {
            let mut min = u64::MAX;
            for &sample in &self.samples {
                min = min.min(sample);
                mins.push(min);
            }
        }

        if let Some(sent) = self.sent_at {
            let outstanding = now.saturating_duration_since(sent).as_millis() as u64;
            if outstanding > 0 {
                for (i, m) in mins.iter_mut().enumerate() {
                    *m = (*m).max(outstanding.saturating_sub(OUTSTANDING_PING_DECAY_MS * i as u64));
                }
            }
        }

        let last = mins[0];
        let tail = mins[mins.len() - 1];
        RecentPings {
            last,
            min2: mins.get(1).copied().unwrap_or(tail),
            min5: mins.get(4).copied().unwrap_or(tail),
        }
    }
}

// ============================================================================
// Pending requests
// ============================================================================

enum Waiter {
    Request(oneshot::Sender<Result<Value, ApiError>>),
    Api(oneshot::Sender<Option<Vec<ApiAction>>>),
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Dropped,
    TimedOut,
    Shutdown,
}

struct Pending {
    request_id: u64,
    waiter: Waiter,
    stream: Option<AbortHandle>,
}

impl Pending {
    fn fail(self, why: Failure) {
        if let Some(stream) = self.stream {
            stream.abort();
        }
        match self.waiter {
            Waiter::Request(tx) => {
                let err = match why {
                    Failure::Dropped => ApiError::connection_lost(),
                    Failure::TimedOut => ApiError::timed_out(),
                    Failure::Shutdown => ApiError::dispatcher_shutdown(),
                };
                let _ = tx.send(Err(err));
            }
            Waiter::Api(tx) => {
                let _ = tx.send(None);
            }
        }
    }
}

/// Requests awaiting completion, keyed by an internal slot so the API
/// fetch (request id 0) never collides with numbered requests.
#[derive(Default)]
struct PendingTable {
    next_slot: u64,
    entries: HashMap<u64, Pending>,
}

impl PendingTable {
    fn insert(&mut self, request_id: u64, waiter: Waiter) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.entries.insert(
            slot,
            Pending {
                request_id,
                waiter,
                stream: None,
            },
        );
        slot
    }

    fn attach_stream(&mut self, slot: u64, handle: AbortHandle) {
        if let Some(p) = self.entries.get_mut(&slot) {
            p.stream = Some(handle);
        }
    }

    fn take(&mut self, slot: u64) -> Option<Pending> {
        self.entries.remove(&slot)
    }

    fn drain(&mut self) -> Vec<Pending> {
        self.entries.drain().map(|(_, p)| p).collect()
    }

    /// Remove and return requests the server will never answer.
    fn split_above(&mut self, cutoff: u64) -> Vec<Pending> {
        let slots: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, p)| p.request_id > cutoff)
            .map(|(slot, _)| *slot)
            .collect();
        slots
            .into_iter()
            .filter_map(|slot| self.entries.remove(&slot))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Connection
// ============================================================================

/// State change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub id: ConnId,
    pub authority: String,
    pub state: ConnectionState,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection {id} is {state}; shutdown only legal when open or connecting")]
    IllegalShutdown { id: ConnId, state: ConnectionState },
}

struct Inner {
    state: ConnectionState,
    link: Option<Arc<dyn Link>>,
    rtt: RttTracker,
    pending: PendingTable,
    next_request_id: u64,
    last_activity: Instant,
    /// Connect, ping and push tasks; aborted once Closed.
    tasks: Vec<AbortHandle>,
}

enum StreamKind {
    Request,
    Api,
}

pub struct Connection {
    id: ConnId,
    authority: String,
    ping_interval: Duration,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("authority", &self.authority)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Start dialing `authority`. The returned connection is Connecting.
    pub fn open(
        authority: impl Into<String>,
        ping_interval: Duration,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let mut rtt = RttTracker::default();
        // The connect handshake counts as the first probe.
        rtt.mark_sent(now);

        let conn = Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            authority: authority.into(),
            ping_interval,
            events,
            inner: Mutex::new(Inner {
                state: ConnectionState::Connecting,
                link: None,
                rtt,
                pending: PendingTable::default(),
                next_request_id: 1,
                last_activity: now,
                tasks: Vec::new(),
            }),
        });
        tracing::info!(conn = conn.id, authority = %conn.authority, "connecting");

        let weak = Arc::downgrade(&conn);
        let authority = conn.authority.clone();
        let mut inner = conn.lock();
        let dial = tokio::spawn(async move {
            let result = connector.connect(&authority).await;
            let Some(conn) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(link) => conn.on_connected(link),
                Err(e) => {
                    tracing::warn!(conn = conn.id, authority = %conn.authority, "dial failed: {e}");
                    conn.on_link_closed(&e);
                }
            }
        });
        inner.tasks.push(dial.abort_handle());
        drop(inner);

        conn
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn recent_pings(&self) -> RecentPings {
        self.lock().rtt.recent(Instant::now())
    }

    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.lock();
        ConnectionSnapshot {
            id: self.id,
            authority: self.authority.clone(),
            state: inner.state,
            pings: inner.rtt.recent(Instant::now()),
            last_activity: inner.last_activity.into_std(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state == state || inner.state == ConnectionState::Closed {
            return;
        }
        tracing::debug!(conn = self.id, from = %inner.state, to = %state, "state change");
        inner.state = state;
        let _ = self.events.send(ConnectionEvent {
            id: self.id,
            authority: self.authority.clone(),
            state,
        });
    }

    /// Finalize a Closing connection once nothing is pending.
    fn check_close(&self, inner: &mut Inner) {
        if inner.state != ConnectionState::Closing || !inner.pending.is_empty() {
            return;
        }
        self.set_state(inner, ConnectionState::Closed);
        if let Some(link) = inner.link.take() {
            link.close(SHUTDOWN_CLOSE_CODE, SHUTDOWN_CLOSE_REASON);
        }
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        tracing::info!(conn = self.id, authority = %self.authority, "connection closed gracefully");
    }

    fn on_connected(self: &Arc<Self>, link: Arc<dyn Link>) {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Connecting {
            drop(inner);
            link.close(SHUTDOWN_CLOSE_CODE, SHUTDOWN_CLOSE_REASON);
            return;
        }

        if let Some(rtt) = inner.rtt.mark_received(Instant::now()) {
            tracing::debug!(conn = self.id, authority = %self.authority, rtt_ms = rtt, "transport established");
        }
        inner.link = Some(link.clone());

        let push = tokio::spawn(Self::push_loop(Arc::downgrade(self), link.clone()));
        let ping = tokio::spawn(Self::ping_loop(Arc::downgrade(self), link));
        inner.tasks.push(push.abort_handle());
        inner.tasks.push(ping.abort_handle());
    }

    fn on_link_closed(&self, reason: &LinkError) {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closed {
            return;
        }
        let pending = inner.pending.drain();
        tracing::info!(
            conn = self.id,
            authority = %self.authority,
            pending = pending.len(),
            "connection lost: {reason}"
        );
        self.set_state(&mut inner, ConnectionState::Closed);
        inner.link = None;
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        for p in pending {
            p.fail(Failure::Dropped);
        }
    }

    fn on_server_shutdown(&self, cutoff: u64) {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closed {
            return;
        }
        let abandoned = inner.pending.split_above(cutoff);
        tracing::info!(
            conn = self.id,
            authority = %self.authority,
            cutoff,
            abandoned = abandoned.len(),
            remaining = inner.pending.len(),
            "server shutdown push"
        );
        self.set_state(&mut inner, ConnectionState::Closing);
        for p in abandoned {
            p.fail(Failure::Shutdown);
        }
        self.check_close(&mut inner);
    }

    fn on_ping_reply(&self) {
        let mut inner = self.lock();
        if let Some(rtt) = inner.rtt.mark_received(Instant::now()) {
            tracing::trace!(conn = self.id, rtt_ms = rtt, "ping");
        }
        // Officially open after the first ping reply.
        if inner.state == ConnectionState::Connecting {
            self.set_state(&mut inner, ConnectionState::Open);
            tracing::info!(conn = self.id, authority = %self.authority, "connection open");
        }
    }

    /// Probe back to back: the next ping goes out one interval after the
    /// previous reply. A probe that never returns stays outstanding and
    /// inflates `recent_pings`.
    async fn ping_loop(weak: Weak<Self>, link: Arc<dyn Link>) {
        loop {
            let interval = {
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                let mut inner = conn.lock();
                if !matches!(inner.state, ConnectionState::Connecting | ConnectionState::Open) {
                    return;
                }
                inner.rtt.mark_sent(Instant::now());
                conn.ping_interval
            };

            if let Err(e) = link.exchange(StreamDescriptor::ping()).await {
                tracing::debug!("ping stream failed: {e}");
                return;
            }

            match weak.upgrade() {
                Some(conn) => conn.on_ping_reply(),
                None => return,
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn push_loop(weak: Weak<Self>, link: Arc<dyn Link>) {
        loop {
            let pushed = link.accept_push().await;
            let Some(conn) = weak.upgrade() else {
                return;
            };
            match pushed {
                Ok(StreamDescriptor::Ready) => {
                    tracing::debug!(conn = conn.id, "server ready");
                }
                Ok(StreamDescriptor::Shutdown { last_id }) => conn.on_server_shutdown(last_id),
                Ok(other) => {
                    tracing::warn!(conn = conn.id, class = other.class(), "unexpected server push");
                }
                Err(e @ (LinkError::Protocol(_) | LinkError::Stream(_))) => {
                    tracing::warn!(conn = conn.id, "unexpected server push: {e}");
                }
                Err(e) => {
                    conn.on_link_closed(&e);
                    return;
                }
            }
        }
    }

    /// Issue a request. Fails with a transport error unless Open.
    pub fn submit(
        self: &Arc<Self>,
        envelope: RequestEnvelope,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<Value, ApiError>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();

        let link = match (&inner.state, &inner.link) {
            (ConnectionState::Open, Some(link)) => link.clone(),
            (state, _) => {
                tracing::debug!(conn = self.id, %state, "request dispatched to non-open connection");
                let _ = tx.send(Err(ApiError::transport(
                    "request dispatched to closed connection",
                )));
                return rx;
            }
        };

        let id = inner.next_request_id;
        inner.next_request_id += 1;
        tracing::debug!(conn = self.id, id, action = %envelope.action, "dispatching request");

        let slot = inner.pending.insert(id, Waiter::Request(tx));
        let stream = tokio::spawn(Self::run_stream(
            Arc::downgrade(self),
            link,
            StreamDescriptor::request(id, envelope),
            slot,
            timeout,
            StreamKind::Request,
        ));
        inner.pending.attach_stream(slot, stream.abort_handle());
        rx
    }

    pub async fn request(
        self: &Arc<Self>,
        envelope: RequestEnvelope,
        timeout: Duration,
    ) -> Result<Value, ApiError> {
        self.submit(envelope, timeout)
            .await
            .unwrap_or_else(|_| Err(ApiError::connection_lost()))
    }

    /// One-shot listing of callable actions. Resolves to None on failure or timeout.
    pub fn fetch_direct_api(self: &Arc<Self>, timeout: Duration) -> oneshot::Receiver<Option<Vec<ApiAction>>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();

        let Some(link) = inner.link.clone() else {
            let _ = tx.send(None);
            return rx;
        };

        let slot = inner.pending.insert(API_FETCH_REQUEST_ID, Waiter::Api(tx));
        let stream = tokio::spawn(Self::run_stream(
            Arc::downgrade(self),
            link,
            StreamDescriptor::Api,
            slot,
            timeout,
            StreamKind::Api,
        ));
        inner.pending.attach_stream(slot, stream.abort_handle());
        rx
    }

    async fn run_stream(
        weak: Weak<Self>,
        link: Arc<dyn Link>,
        descriptor: StreamDescriptor,
        slot: u64,
        timeout: Duration,
        kind: StreamKind,
    ) {
        let deadline = Instant::now() + timeout;
        let frames = match tokio::time::timeout_at(deadline, link.exchange(descriptor)).await {
            Ok(Ok(frames)) => Some(frames),
            Ok(Err(e)) => {
                // Wait for the close event or the timeout, whichever comes first.
                tracing::debug!("request stream failed: {e}");
                tokio::time::sleep_until(deadline).await;
                None
            }
            Err(_) => None,
        };

        let Some(conn) = weak.upgrade() else {
            return;
        };
        let pending = {
            let mut inner = conn.lock();
            let Some(mut pending) = inner.pending.take(slot) else {
                // Already finalized by close, shutdown cutoff or timeout.
                return;
            };
            pending.stream = None;
            conn.check_close(&mut inner);
            pending
        };

        match (frames, kind) {
            (None, _) => {
                tracing::debug!(conn = conn.id, id = pending.request_id, "request timed out");
                pending.fail(Failure::TimedOut);
            }
            (Some(frames), StreamKind::Request) => {
                if let Waiter::Request(tx) = pending.waiter {
                    let _ = tx.send(decode_reply(frames));
                }
            }
            (Some(frames), StreamKind::Api) => {
                if let Waiter::Api(tx) = pending.waiter {
                    let _ = tx.send(parse_api_listing(&frames));
                }
            }
        }
    }

    /// Hint the far end whether this is the client's chosen connection.
    pub fn set_active(&self, active: bool) {
        let link = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Open {
                return;
            }
            if active {
                inner.last_activity = Instant::now();
            }
            inner.link.clone()
        };
        let Some(link) = link else {
            return;
        };

        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = link.notify(StreamDescriptor::activity(active)).await {
                tracing::debug!(conn = id, "activity hint failed: {e}");
            }
        });
    }

    /// Begin a graceful close. Finalizes immediately when nothing is pending.
    pub fn shutdown(&self) -> Result<(), ConnectionError> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Connecting | ConnectionState::Open => {}
            state => return Err(ConnectionError::IllegalShutdown { id: self.id, state }),
        }
        tracing::info!(
            conn = self.id,
            authority = %self.authority,
            pending = inner.pending.len(),
            "shutting down connection"
        );
        self.set_state(&mut inner, ConnectionState::Closing);
        self.check_close(&mut inner);
        Ok(())
    }
}

fn parse_api_listing(frames: &[Bytes]) -> Option<Vec<ApiAction>> {
    let first = frames.first()?;
    match serde_json::from_slice(first) {
        Ok(actions) => Some(actions),
        Err(e) => {
            tracing::warn!("malformed api listing: {e}");
            None
        }
    }
}
