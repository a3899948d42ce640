//! Full client against loopback dispatchers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use switchboard_client::notice::TracingSurface;
use switchboard_client::persistence::{MemoryPersistence, Persistence, TAILORED_ZONE_CACHE};
use switchboard_client::{Client, ClientConfig};
use switchboard_protocol::ApiAction;

use crate::harness::{wait_until, zone, StubDispatcher, TestCa};

async fn start_client(ca: &TestCa, stubs: &[&StubDispatcher]) -> Client {
    let mut config = ClientConfig::default();
    config.client.bootstrap_url = "http://127.0.0.1:9/zone.json".into();
    config.transport = ca.transport();

    let persistence = Arc::new(MemoryPersistence::new());
    let authorities: Vec<String> = stubs.iter().map(|s| s.authority()).collect();
    persistence
        .set(TAILORED_ZONE_CACHE, &zone(&authorities).to_string())
        .unwrap();

    Client::start(&config, ca.connector(), persistence, Arc::new(TracingSurface))
        .await
        .unwrap()
}

async fn active_authority(client: &Client) -> Option<String> {
    client.pool().active().await.map(|c| c.authority().to_string())
}

#[tokio::test]
async fn test_client_calls_through_active_dispatcher() {
    let ca = TestCa::new();
    let stub = ca
        .dispatcher(vec![ApiAction("Report.Sales.run".into(), 2)])
        .await;
    let client = start_client(&ca, &[&stub]).await;

    let reply = client
        .call("Report.Sales.run~2", json!({ "month": 3 }))
        .await
        .unwrap();
    assert_eq!(reply["action"], "Report.Sales.run");
    assert_eq!(reply["params"]["month"], 3);

    let catalog = tokio::time::timeout(Duration::from_secs(10), client.wait_for_api())
        .await
        .unwrap()
        .unwrap();
    assert!(catalog.resolve("ReportSalesV2", "run").is_some());

    client.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_push_reissues_on_other_dispatcher() {
    let ca = TestCa::new();
    let a = ca.dispatcher(Vec::new()).await;
    let b = ca.dispatcher(Vec::new()).await;
    let client = start_client(&ca, &[&a, &b]).await;

    let both_open = wait_until(Duration::from_secs(10), || async {
        client
            .connection_info(true)
            .await
            .iter()
            .filter(|i| i.ping.is_some())
            .count()
            == 2
            && active_authority(&client).await.is_some()
    })
    .await;
    assert!(both_open);

    let active = active_authority(&client).await.unwrap();
    let (draining, other) = if active == a.authority() { (&a, &b) } else { (&b, &a) };
    draining.set_reply_delay(Duration::from_secs(3));

    let call = {
        let dispatcher = client.dispatcher().clone();
        tokio::spawn(async move { dispatcher.call("Slow.op~1", json!({})).await })
    };
    assert!(wait_until(Duration::from_secs(5), || async { draining.requests() == 1 }).await);

    // Nothing was answered yet: every pending request is abandoned.
    draining.push_shutdown(0).await;

    let reply = tokio::time::timeout(Duration::from_secs(10), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply["action"], "Slow.op");
    assert_eq!(other.requests(), 1);
    assert_eq!(active_authority(&client).await.as_deref(), Some(other.authority().as_str()));

    client.shutdown().await;
}
