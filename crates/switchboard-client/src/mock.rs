//! Scripted in-memory transport for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use switchboard_manager::ConnectionState;
use switchboard_protocol::{ApiAction, RequestEnvelope, StreamDescriptor};
use tokio::sync::mpsc;

use crate::connection::{Connection, ConnectionEvent};
use crate::transport::{BoxFuture, Connector, Link, LinkError};

pub(crate) type Handler = Arc<dyn Fn(u64, &RequestEnvelope) -> MockReply + Send + Sync>;

#[derive(Clone)]
pub(crate) enum MockReply {
    Frames(Vec<Bytes>),
    Delayed(Duration, Vec<Bytes>),
    Hang,
    Fail,
}

pub(crate) fn reply_ok(value: Value) -> Vec<Bytes> {
    vec![
        Bytes::from_static(b"{}"),
        Bytes::from(value.to_string()),
        Bytes::from_static(b"{}"),
    ]
}

pub(crate) fn reply_err(code: &str, message: &str, data: Option<Value>) -> Vec<Bytes> {
    let mut header = json!({ "error_code": code, "error": message });
    if let Some(data) = data {
        header["error_data"] = data;
    }
    vec![Bytes::from(header.to_string()), Bytes::from_static(b"{}")]
}

fn echo(id: u64, env: &RequestEnvelope) -> MockReply {
    MockReply::Frames(reply_ok(json!({
        "id": id,
        "action": env.action,
        "params": env.params,
        "session": env.session,
    })))
}

#[derive(Clone)]
pub(crate) struct NodeScript {
    ping_delay: Duration,
    connect_delay: Duration,
    refuse: bool,
    handler: Handler,
    api: Vec<ApiAction>,
}

impl NodeScript {
    /// A node whose handshake and pings both take `ping_ms`.
    pub fn new(ping_ms: u64) -> Self {
        Self {
            ping_delay: Duration::from_millis(ping_ms),
            connect_delay: Duration::from_millis(ping_ms),
            refuse: false,
            handler: Arc::new(echo),
            api: Vec::new(),
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new(0)
        }
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(u64, &RequestEnvelope) -> MockReply + Send + Sync + 'static,
    {
        self.handler = Arc::new(f);
        self
    }

    pub fn with_api(mut self, api: Vec<ApiAction>) -> Self {
        self.api = api;
        self
    }
}

pub(crate) struct MockLink {
    pub authority: String,
    script: NodeScript,
    ping_delay: Mutex<Duration>,
    push_tx: mpsc::UnboundedSender<Result<StreamDescriptor, LinkError>>,
    push_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<StreamDescriptor, LinkError>>>,
    notified: Mutex<Vec<StreamDescriptor>>,
    requests: Mutex<Vec<(u64, RequestEnvelope)>>,
    closed: Mutex<Option<(u32, String)>>,
}

impl MockLink {
    fn new(authority: &str, script: NodeScript) -> Self {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        Self {
            authority: authority.to_string(),
            ping_delay: Mutex::new(script.ping_delay),
            script,
            push_tx,
            push_rx: tokio::sync::Mutex::new(push_rx),
            notified: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
        }
    }

    pub fn push(&self, descriptor: StreamDescriptor) {
        let _ = self.push_tx.send(Ok(descriptor));
    }

    /// Deliver a push stream that fails to read or decode.
    pub fn push_error(&self, error: LinkError) {
        let _ = self.push_tx.send(Err(error));
    }

    /// Simulate the peer vanishing.
    pub fn drop_connection(&self) {
        let _ = self.push_tx.send(Err(LinkError::Closed("reset by peer".into())));
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock().unwrap() = delay;
    }

    pub fn closed_with(&self) -> Option<(u32, String)> {
        self.closed.lock().unwrap().clone()
    }

    pub fn notified(&self) -> Vec<StreamDescriptor> {
        self.notified.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<(u64, RequestEnvelope)> {
        self.requests.lock().unwrap().clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.lock().unwrap().is_some()
    }
}

impl Link for MockLink {
    fn exchange(&self, descriptor: StreamDescriptor) -> BoxFuture<'_, Result<Vec<Bytes>, LinkError>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(LinkError::Closed("closed locally".into()));
            }
            match descriptor {
                StreamDescriptor::Ping { .. } => {
                    let delay = *self.ping_delay.lock().unwrap();
                    tokio::time::sleep(delay).await;
                    Ok(vec![Bytes::from_static(b"{}")])
                }
                StreamDescriptor::Api => {
                    let listing = serde_json::to_vec(&self.script.api)
                        .map_err(|e| LinkError::Protocol(e.to_string()))?;
                    Ok(vec![Bytes::from(listing)])
                }
                StreamDescriptor::Request { id, request } => {
                    self.requests.lock().unwrap().push((id, request.clone()));
                    match (self.script.handler)(id, &request) {
                        MockReply::Frames(frames) => Ok(frames),
                        MockReply::Delayed(delay, frames) => {
                            tokio::time::sleep(delay).await;
                            Ok(frames)
                        }
                        MockReply::Hang => std::future::pending().await,
                        MockReply::Fail => Err(LinkError::Stream("stream reset".into())),
                    }
                }
                _ => Ok(Vec::new()),
            }
        })
    }

    fn notify(&self, descriptor: StreamDescriptor) -> BoxFuture<'_, Result<(), LinkError>> {
        Box::pin(async move {
            self.notified.lock().unwrap().push(descriptor);
            Ok(())
        })
    }

    fn accept_push(&self) -> BoxFuture<'_, Result<StreamDescriptor, LinkError>> {
        Box::pin(async move {
            let mut rx = self.push_rx.lock().await;
            match rx.recv().await {
                Some(pushed) => pushed,
                None => Err(LinkError::Closed("push channel gone".into())),
            }
        })
    }

    fn close(&self, code: u32, reason: &str) {
        *self.closed.lock().unwrap() = Some((code, reason.to_string()));
        let _ = self.push_tx.send(Err(LinkError::Closed("closed locally".into())));
    }
}

#[derive(Default)]
pub(crate) struct MockConnector {
    scripts: Mutex<HashMap<String, NodeScript>>,
    links: Mutex<Vec<Arc<MockLink>>>,
    dials: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, authority: &str, script: NodeScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(authority.to_string(), script);
    }

    pub fn dials(&self) -> Vec<String> {
        self.dials.lock().unwrap().clone()
    }

    pub fn links_to(&self, authority: &str) -> Vec<Arc<MockLink>> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.authority == authority)
            .cloned()
            .collect()
    }
}

impl Connector for MockConnector {
    fn connect(&self, authority: &str) -> BoxFuture<'_, Result<Arc<dyn Link>, LinkError>> {
        let authority = authority.to_string();
        Box::pin(async move {
            self.dials.lock().unwrap().push(authority.clone());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(&authority)
                .cloned()
                .unwrap_or_else(NodeScript::refusing);

            tokio::time::sleep(script.connect_delay).await;
            if script.refuse {
                return Err(LinkError::Connect {
                    authority,
                    reason: "connection refused".into(),
                });
            }

            let link = Arc::new(MockLink::new(&authority, script));
            self.links.lock().unwrap().push(link.clone());
            Ok(link as Arc<dyn Link>)
        })
    }
}

/// Dial `authority` through a fresh connector and wait until it is Open.
pub(crate) async fn open_connection(
    authority: &str,
    script: NodeScript,
) -> (
    Arc<Connection>,
    Arc<MockLink>,
    mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    let connector = MockConnector::new();
    connector.script(authority, script);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Connection::open(authority, Duration::from_secs(5), connector.clone(), tx);

    while let Some(event) = rx.recv().await {
        if event.state == ConnectionState::Open {
            break;
        }
    }
    let link = connector.links_to(authority).remove(0);
    (conn, link, rx)
}
