//! Manager background task -- ticks every `eval_interval_ms`.
//!
//! On each tick:
//!   1. snapshot the pool, manager.evaluate() -> ManagerActions
//!   2. shut down culled connections
//!   3. dial the chosen node and register it with the pool
//!   4. activate the best open connection
//!
//! Between ticks it applies connection state events to the pool and reacts
//! to dials reaching Open.

use std::sync::Arc;

use switchboard_manager::{ConnId, ConnectionManager, ManagerActions};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};

use crate::connection::{Connection, ConnectionEvent};
use crate::pool::ConnectionPool;
use crate::transport::Connector;

/// Run the manager loop until shutdown, then close every connection.
pub async fn run_manager_loop(
    manager: Arc<Mutex<ConnectionManager>>,
    pool: ConnectionPool,
    connector: Arc<dyn Connector>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (eval_interval, ping_interval) = {
        let mgr = manager.lock().await;
        (mgr.tuning().eval_interval(), mgr.tuning().ping_interval())
    };
    let (opened_tx, mut opened_rx) = mpsc::unbounded_channel::<Arc<Connection>>();

    let mut ticker = tokio::time::interval(eval_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick_count: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (snapshots, active) = pool.snapshots().await;
                let actions = manager
                    .lock()
                    .await
                    .evaluate(&snapshots, active, Instant::now().into_std());

                if !actions.shutdown.is_empty() || actions.dial.is_some() {
                    tracing::debug!(
                        live = snapshots.len(),
                        culled = actions.shutdown.len(),
                        dial = actions.dial.as_ref().map(|n| n.authority.as_str()),
                        tick = tick_count,
                        "manager tick"
                    );
                }

                apply_actions(actions, active, &pool, &connector, ping_interval, &events_tx, &opened_tx).await;
                tick_count += 1;
            }

            Some(event) = events_rx.recv() => {
                pool.handle_event(&event).await;
            }

            Some(conn) = opened_rx.recv() => {
                let pings = conn.recent_pings();
                manager.lock().await.connection_opened(conn.authority(), pings);

                // A successful dial obsoletes other attempts to the same node.
                let (snapshots, _) = pool.snapshots().await;
                for id in ConnectionManager::redundant_attempts(conn.authority(), conn.id(), &snapshots) {
                    shutdown_connection(&pool, id).await;
                }
            }

            _ = shutdown.recv() => {
                tracing::info!("shutdown signal, stopping manager loop");
                break;
            }
        }
    }

    for conn in pool.connections().await {
        if let Err(e) = conn.shutdown() {
            tracing::debug!(conn = conn.id(), "skip shutdown: {e}");
        }
    }
    pool.clear_queue().await;
}

async fn apply_actions(
    actions: ManagerActions,
    active: Option<ConnId>,
    pool: &ConnectionPool,
    connector: &Arc<dyn Connector>,
    ping_interval: std::time::Duration,
    events_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    opened_tx: &mpsc::UnboundedSender<Arc<Connection>>,
) {
    for id in actions.shutdown {
        shutdown_connection(pool, id).await;
    }

    if let Some(node) = actions.dial {
        let conn = Connection::open(
            node.authority.clone(),
            ping_interval,
            connector.clone(),
            events_tx.clone(),
        );
        let opened_tx = opened_tx.clone();
        let registered = pool
            .add_connection(
                conn,
                Box::new(move |c| {
                    let _ = opened_tx.send(c.clone());
                }),
            )
            .await;
        if let Err(e) = registered {
            tracing::warn!(authority = %node.authority, "failed to register connection: {e}");
        }
    }

    if let Some(id) = actions.activate {
        if active != Some(id) {
            if let Err(e) = pool.set_active(id).await {
                tracing::debug!(conn = id, "activation skipped: {e}");
            }
        }
    }
}

async fn shutdown_connection(pool: &ConnectionPool, id: ConnId) {
    if let Some(conn) = pool.get(id).await {
        if let Err(e) = conn.shutdown() {
            tracing::debug!(conn = id, "skip shutdown: {e}");
        }
    }
}
