//! Client -- assembles manager, pool, dispatcher and background tasks.
//!
//! Startup order:
//!   1. bootstrap zone list over HTTP (fallback tier, in the background)
//!   2. cached tailored list from persistence (cached tier)
//!   3. persisted user override
//!   4. API listing, fetched through the pool once a connection is active
//!   5. tailored node list from the server (authenticated sessions only)
//!   6. session renewal, idle logout, manager tick loop

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use switchboard_manager::{ConnectionInfo, ConnectionManager, Tier, ZoneDirectory};
use switchboard_protocol::ApiError;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::catalog::ApiCatalog;
use crate::config::ClientConfig;
use crate::dispatcher::{DispatchError, Dispatcher, DispatcherSettings, Request};
use crate::manager_task::run_manager_loop;
use crate::notice::{ErrorSurface, Notice, TracingSurface};
use crate::persistence::{
    FilePersistence, Persistence, PersistenceError, TAILORED_ZONE_CACHE, TERMINAL,
    USER_NODE_OVERRIDE,
};
use crate::pool::ConnectionPool;
use crate::quic_transport::QuicConnector;
use crate::transport::Connector;
use crate::zone_loader::load_bootstrap_zone;

const API_FETCH_RETRY: Duration = Duration::from_secs(1);

pub struct Client {
    dispatcher: Dispatcher,
    manager: Arc<Mutex<ConnectionManager>>,
    pool: ConnectionPool,
    persistence: Arc<dyn Persistence>,
    api: watch::Receiver<Option<ApiCatalog>>,
    shutdown_tx: broadcast::Sender<()>,
    manager_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    background: Vec<JoinHandle<()>>,
}

impl Client {
    /// Start with the QUIC transport, file persistence and log-only notices.
    pub async fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        let connector = QuicConnector::new(&config.transport)
            .map_err(|e| anyhow::anyhow!("failed to set up QUIC endpoint: {e}"))?;
        let state_file = crate::expand_tilde(&config.client.state_file);
        let persistence = FilePersistence::open(&state_file)?;
        let client = Self::start(
            config,
            Arc::new(connector),
            Arc::new(persistence),
            Arc::new(TracingSurface),
        )
        .await?;
        Ok(client)
    }

    pub async fn start(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        persistence: Arc<dyn Persistence>,
        surface: Arc<dyn ErrorSurface>,
    ) -> Result<Self, DispatchError> {
        let node_list = Request::parse(&config.client.node_list_action, json!({}))?;
        let manager = Arc::new(Mutex::new(ConnectionManager::new(config.tuning.clone())));
        let pool = ConnectionPool::new();
        let mut background = Vec::new();

        background.push(spawn_bootstrap(
            config.client.bootstrap_url.clone(),
            manager.clone(),
            surface.clone(),
        ));

        {
            let mut mgr = manager.lock().await;
            if let Some(cached) = persistence.get(TAILORED_ZONE_CACHE) {
                match serde_json::from_str::<Value>(&cached) {
                    Ok(payload) => {
                        ZoneDirectory::parse_zone(Tier::Cached, true, &payload, &mut mgr);
                    }
                    Err(e) => tracing::warn!("ignoring unreadable cached node list: {e}"),
                }
            }
            if let Some(pref) = persistence.get(USER_NODE_OVERRIDE) {
                tracing::info!(authority = %pref, "applying saved node preference");
                mgr.set_user_pref(Some(pref));
            }
        }

        let terminal = config
            .client
            .terminal
            .clone()
            .or_else(|| persistence.get(TERMINAL));
        let dispatcher = Dispatcher::new(
            pool.clone(),
            DispatcherSettings {
                terminal,
                session: config.client.session.clone(),
                authenticated: config.client.authenticated,
                request_timeout: config.session.request_timeout(),
                logout_after: config.session.logout_after(),
            },
            surface,
        );

        let (api_tx, api) = watch::channel(None);
        background.push(spawn_api_fetch(pool.clone(), config.session.api_timeout(), api_tx));

        if config.client.authenticated {
            background.push(spawn_node_list_fetch(
                dispatcher.clone(),
                node_list,
                manager.clone(),
                persistence.clone(),
            ));
            background.push(dispatcher.spawn_renewal(config.session.renew_every()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let manager_task = tokio::spawn(run_manager_loop(
            manager.clone(),
            pool.clone(),
            connector,
            events_tx,
            events_rx,
            shutdown_rx,
        ));

        Ok(Self {
            dispatcher,
            manager,
            pool,
            persistence,
            api,
            shutdown_tx,
            manager_task: std::sync::Mutex::new(Some(manager_task)),
            background,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub async fn request(&self, req: &Request) -> Result<Value, ApiError> {
        self.dispatcher.request(req).await
    }

    pub async fn call(&self, action: &str, params: Value) -> Result<Value, DispatchError> {
        self.dispatcher.call(action, params).await
    }

    /// The API listing, if one has arrived.
    pub fn api(&self) -> Option<ApiCatalog> {
        self.api.borrow().clone()
    }

    /// Wait until the API listing is known. None if the client shut down first.
    pub async fn wait_for_api(&self) -> Option<ApiCatalog> {
        let mut rx = self.api.clone();
        let listing = rx.wait_for(Option::is_some).await.ok()?;
        listing.clone()
    }

    pub async fn connection_info(&self, all: bool) -> Vec<ConnectionInfo> {
        let (snapshots, active) = self.pool.snapshots().await;
        self.manager
            .lock()
            .await
            .connection_info(all, &snapshots, active)
    }

    /// Prefer `authority` over the priority list (None clears it) and remember the choice.
    pub async fn set_user_pref(&self, authority: Option<String>) -> Result<(), PersistenceError> {
        let stored = authority.clone().unwrap_or_default();
        self.manager.lock().await.set_user_pref(authority);
        self.persistence.set(USER_NODE_OVERRIDE, &stored)
    }

    /// Stop background work and shut down every connection gracefully.
    pub async fn shutdown(&self) {
        for task in &self.background {
            task.abort();
        }
        self.dispatcher.stop_idle_timer();
        let _ = self.shutdown_tx.send(());

        let task = self
            .manager_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("manager loop ended abnormally: {e}");
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
        self.dispatcher.stop_idle_timer();
        let _ = self.shutdown_tx.send(());
    }
}

fn spawn_bootstrap(
    url: String,
    manager: Arc<Mutex<ConnectionManager>>,
    surface: Arc<dyn ErrorSurface>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let http = reqwest::Client::new();
        if let Err(e) = load_bootstrap_zone(&http, &url, &manager).await {
            tracing::warn!(url, "bootstrap zone load failed: {e}");
            surface.notify(Notice::BootstrapFailed {
                reason: e.to_string(),
            });
        }
    })
}

/// Fetch the API listing through the pool until one arrives. The first
/// listing wins; later dispatcher restarts do not replace it.
fn spawn_api_fetch(
    pool: ConnectionPool,
    timeout: Duration,
    api_tx: watch::Sender<Option<ApiCatalog>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Some(actions) = pool.fetch_direct_api(timeout).await {
                tracing::info!(actions = actions.len(), "api listing received");
                api_tx.send_if_modified(|current| {
                    if current.is_some() {
                        return false;
                    }
                    *current = Some(ApiCatalog::new(actions));
                    true
                });
                return;
            }
            tracing::debug!("api listing unavailable, retrying");
            tokio::time::sleep(API_FETCH_RETRY).await;
        }
    })
}

fn spawn_node_list_fetch(
    dispatcher: Dispatcher,
    request: Request,
    manager: Arc<Mutex<ConnectionManager>>,
    persistence: Arc<dyn Persistence>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reply = match dispatcher.request(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(action = %request.action, "tailored node list unavailable: {e}");
                return;
            }
        };
        let Some(nodelist) = reply.get("nodelist") else {
            tracing::warn!(action = %request.action, "reply has no nodelist");
            return;
        };

        let accepted = {
            let mut mgr = manager.lock().await;
            ZoneDirectory::parse_zone(Tier::Tailored, true, nodelist, &mut mgr)
        };
        if accepted {
            if let Err(e) = persistence.set(TAILORED_ZONE_CACHE, &nodelist.to_string()) {
                tracing::warn!("failed to cache node list: {e}");
            }
        }
    })
}
