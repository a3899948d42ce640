//! Connection over the real QUIC transport against a loopback dispatcher.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use switchboard_client::connection::{Connection, ConnectionEvent};
use switchboard_client::transport::Connector;
use switchboard_manager::ConnectionState;
use switchboard_protocol::{ApiAction, RequestEnvelope};
use tokio::sync::mpsc;

use crate::harness::{wait_until, TestCa};

async fn wait_for_state(
    rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    state: ConnectionState,
) -> bool {
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            if event.state == state {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

fn envelope(action: &str) -> RequestEnvelope {
    RequestEnvelope {
        action: action.into(),
        version: 1,
        params: json!({ "q": 42 }),
        kind: Default::default(),
        terminal: None,
        session: Some("tok".into()),
    }
}

#[tokio::test]
async fn test_connection_opens_and_answers_requests() {
    let ca = TestCa::new();
    let stub = ca
        .dispatcher(vec![ApiAction("Echo.get".into(), 1)])
        .await;
    let connector: Arc<dyn Connector> = ca.connector();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let conn = Connection::open(stub.authority(), Duration::from_secs(5), connector, tx);
    assert!(wait_for_state(&mut rx, ConnectionState::Open).await);
    assert!(conn.recent_pings().last < 1000);

    let reply = conn
        .request(envelope("Echo.get"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply["action"], "Echo.get");
    assert_eq!(reply["params"]["q"], 42);
    assert_eq!(reply["session"], "tok");
    assert_eq!(stub.requests(), 1);

    let api = conn
        .fetch_direct_api(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(api, Some(vec![ApiAction("Echo.get".into(), 1)]));

    conn.shutdown().unwrap();
    assert!(wait_for_state(&mut rx, ConnectionState::Closed).await);
}

#[tokio::test]
async fn test_activity_hint_reaches_dispatcher() {
    let ca = TestCa::new();
    let stub = ca.dispatcher(Vec::new()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let conn = Connection::open(stub.authority(), Duration::from_secs(5), ca.connector(), tx);
    assert!(wait_for_state(&mut rx, ConnectionState::Open).await);

    conn.set_active(true);
    assert!(wait_until(Duration::from_secs(5), || async { stub.activity() == vec![true] }).await);
}

#[tokio::test]
async fn test_dial_to_closed_port_fails() {
    let ca = TestCa::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    // Bind and drop a UDP socket to find a port nobody answers on.
    let port = std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let mut transport = ca.transport();
    transport.idle_timeout_secs = 2;
    let connector = Arc::new(switchboard_client::quic_transport::QuicConnector::new(&transport).unwrap());
    let conn = Connection::open(format!("127.0.0.1:{port}"), Duration::from_secs(5), connector, tx);

    assert!(wait_for_state(&mut rx, ConnectionState::Closed).await);
    assert_eq!(conn.state(), ConnectionState::Closed);
}
