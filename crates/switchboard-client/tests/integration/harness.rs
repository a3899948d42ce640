//! Loopback dispatcher stub speaking the real QUIC wire protocol.
//!
//! Answers ping, api and request1 streams; requests are echoed back after an
//! optional delay. Tests can push `shutdown` to every connected client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};
use switchboard_client::config::TransportSection;
use switchboard_client::quic_transport::QuicConnector;
use switchboard_protocol::codec::{encode_json_frame, split_frames};
use switchboard_protocol::tls::{self, QuicTimings};
use switchboard_protocol::{ApiAction, StreamDescriptor, MAX_REPLY_BYTES};

pub struct StubDispatcher {
    pub addr: SocketAddr,
    state: Arc<StubState>,
    _endpoint: quinn::Endpoint,
    _accept: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct StubState {
    reply_delay_ms: AtomicU64,
    requests: AtomicUsize,
    activity: Mutex<Vec<bool>>,
    connections: Mutex<Vec<quinn::Connection>>,
    api: Vec<ApiAction>,
}

/// Certificate material shared by every stub in a test.
pub struct TestCa {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    dir: tempfile::TempDir,
}

impl TestCa {
    pub fn new() -> Self {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = ring::signature::Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let (cert_der, key_der) =
            tls::generate_self_signed_cert(pkcs8.as_ref(), tls::DEFAULT_SERVER_NAME).unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.der"), &cert_der).unwrap();
        Self {
            cert_der,
            key_der,
            dir,
        }
    }

    /// Transport settings that trust this CA.
    pub fn transport(&self) -> TransportSection {
        TransportSection {
            ca_cert: Some(self.dir.path().join("ca.der").display().to_string()),
            bind_addr: "127.0.0.1:0".into(),
            ..Default::default()
        }
    }

    pub fn connector(&self) -> Arc<QuicConnector> {
        Arc::new(QuicConnector::new(&self.transport()).unwrap())
    }

    pub async fn dispatcher(&self, api: Vec<ApiAction>) -> StubDispatcher {
        let server_config = tls::build_server_config(
            self.cert_der.clone(),
            self.key_der.clone(),
            QuicTimings::default(),
        )
        .unwrap();
        let endpoint =
            quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = endpoint.local_addr().unwrap();
        let state = Arc::new(StubState {
            api,
            ..Default::default()
        });

        let accept = tokio::spawn(accept_loop(endpoint.clone(), state.clone()));
        StubDispatcher {
            addr,
            state,
            _endpoint: endpoint,
            _accept: accept,
        }
    }
}

#[allow(dead_code)]
impl StubDispatcher {
    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub fn set_reply_delay(&self, delay: Duration) {
        self.state
            .reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn activity(&self) -> Vec<bool> {
        self.state.activity.lock().unwrap().clone()
    }

    /// Announce a drain to every client: requests above `last_id` will not be answered.
    pub async fn push_shutdown(&self, last_id: u64) {
        let conns = self.state.connections.lock().unwrap().clone();
        for conn in conns {
            let Ok(mut send) = conn.open_uni().await else {
                continue;
            };
            let _ = send
                .write_all(&frame(&StreamDescriptor::Shutdown { last_id }))
                .await;
            let _ = send.finish();
        }
    }
}

fn frame<T: serde::Serialize>(value: &T) -> Bytes {
    let mut buf = BytesMut::new();
    encode_json_frame(value, &mut buf).unwrap();
    buf.freeze()
}

async fn accept_loop(endpoint: quinn::Endpoint, state: Arc<StubState>) {
    while let Some(incoming) = endpoint.accept().await {
        let state = state.clone();
        tokio::spawn(async move {
            let Ok(conn) = incoming.await else {
                return;
            };
            state.connections.lock().unwrap().push(conn.clone());
            tokio::spawn(uni_loop(conn.clone(), state.clone()));
            while let Ok((send, recv)) = conn.accept_bi().await {
                tokio::spawn(serve_stream(send, recv, state.clone()));
            }
        });
    }
}

async fn uni_loop(conn: quinn::Connection, state: Arc<StubState>) {
    while let Ok(mut recv) = conn.accept_uni().await {
        let Ok(body) = recv.read_to_end(MAX_REPLY_BYTES).await else {
            continue;
        };
        let Some(first) = split_frames(&body).ok().and_then(|f| f.into_iter().next()) else {
            continue;
        };
        if let Ok(StreamDescriptor::Activity { active }) = serde_json::from_slice(&first) {
            state.activity.lock().unwrap().push(active);
        }
    }
}

async fn serve_stream(mut send: quinn::SendStream, mut recv: quinn::RecvStream, state: Arc<StubState>) {
    let Ok(body) = recv.read_to_end(MAX_REPLY_BYTES).await else {
        return;
    };
    let Some(first) = split_frames(&body).ok().and_then(|f| f.into_iter().next()) else {
        return;
    };
    let Ok(descriptor) = serde_json::from_slice::<StreamDescriptor>(&first) else {
        return;
    };

    let mut out = BytesMut::new();
    match descriptor {
        StreamDescriptor::Ping { .. } => out.extend_from_slice(&frame(&json!({}))),
        StreamDescriptor::Api => out.extend_from_slice(&frame(&state.api)),
        StreamDescriptor::Request { id, request } => {
            state.requests.fetch_add(1, Ordering::SeqCst);
            let delay = state.reply_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let payload: Value = json!({
                "id": id,
                "action": request.action,
                "params": request.params,
                "session": request.session,
            });
            out.extend_from_slice(&frame(&json!({})));
            out.extend_from_slice(&frame(&payload));
            out.extend_from_slice(&frame(&json!({})));
        }
        _ => {}
    }
    let _ = send.write_all(&out).await;
    let _ = send.finish();
}

/// Discovery payload for a single zone of `authorities`.
pub fn zone(authorities: &[String]) -> Value {
    json!({ "zones": [{
        "name": "loopback",
        "nodes": authorities
            .iter()
            .map(|a| json!({ "authority": a, "shortname": a }))
            .collect::<Vec<_>>(),
    }]})
}

/// Poll `check` every 50ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
