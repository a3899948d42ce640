//! Dispatcher -- request retry policy, session token, idle logout, renewal.
//!
//! Retry policy:
//!   dispatcher_shutdown  reissue through the pool, unbounded
//!   dispatch_failure     one retry pinned to a random standby connection
//!   anything else        returned to the caller, surfaced unless handled

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use switchboard_protocol::{ApiError, EnvelopeKind, ErrorCode, RequestEnvelope};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use crate::connection::Connection;
use crate::notice::{classify, ErrorSurface, Notice};
use crate::pool::ConnectionPool;

pub const SESSION_RENEW_ACTION: &str = "User.updateSession";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("action string must be ACTION~VERSION, got {0:?}")]
    MalformedAction(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// One API call.
#[derive(Debug, Clone)]
pub struct Request {
    pub action: String,
    pub version: u32,
    pub params: Value,
    /// Ask for store-shaped replies.
    pub store: bool,
    /// Background call: does not count as user activity.
    pub idle: bool,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(action: impl Into<String>, version: u32, params: Value) -> Self {
        Self {
            action: action.into(),
            version,
            params,
            store: false,
            idle: false,
            timeout: None,
        }
    }

    /// Parse the `Action~Version` form.
    pub fn parse(action: &str, params: Value) -> Result<Self, DispatchError> {
        let malformed = || DispatchError::MalformedAction(action.to_string());
        let (name, version) = action.split_once('~').ok_or_else(malformed)?;
        if name.is_empty() || version.contains('~') {
            return Err(malformed());
        }
        let version: u32 = version.parse().map_err(|_| malformed())?;
        Ok(Self::new(name, version, params))
    }

    pub fn idle(mut self) -> Self {
        self.idle = true;
        self
    }

    pub fn store(mut self) -> Self {
        self.store = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a caller did with a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    Surface,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub terminal: Option<String>,
    pub session: Option<String>,
    pub authenticated: bool,
    pub request_timeout: Duration,
    pub logout_after: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            terminal: None,
            session: None,
            authenticated: false,
            request_timeout: Duration::from_millis(switchboard_protocol::DEFAULT_REQUEST_TIMEOUT_MS),
            logout_after: Duration::from_secs(1800),
        }
    }
}

// ============================================================================
// Idle logout
// ============================================================================

/// Raises `SessionExpired` after `logout_after` without user activity.
/// Re-arms on the next reset.
pub struct IdleLogout {
    deadline: watch::Sender<Instant>,
    logout_after: Duration,
    task: AbortHandle,
}

impl IdleLogout {
    pub fn start(logout_after: Duration, surface: Arc<dyn ErrorSurface>) -> Self {
        let (deadline, mut rx) = watch::channel(Instant::now() + logout_after);
        let task = tokio::spawn(async move {
            loop {
                let at = *rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        surface.notify(Notice::SessionExpired);
                        if rx.changed().await.is_err() {
                            return;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Self {
            deadline,
            logout_after,
            task: task.abort_handle(),
        }
    }

    pub fn reset(&self) {
        self.deadline.send_replace(Instant::now() + self.logout_after);
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for IdleLogout {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct DispatcherInner {
    pool: ConnectionPool,
    surface: Arc<dyn ErrorSurface>,
    session: RwLock<Option<String>>,
    terminal: Option<String>,
    authenticated: bool,
    request_timeout: Duration,
    idle: Option<IdleLogout>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Must be called inside a tokio runtime; the idle timer starts immediately
    /// for authenticated sessions.
    pub fn new(pool: ConnectionPool, settings: DispatcherSettings, surface: Arc<dyn ErrorSurface>) -> Self {
        let idle = settings
            .authenticated
            .then(|| IdleLogout::start(settings.logout_after, surface.clone()));
        Self {
            inner: Arc::new(DispatcherInner {
                pool,
                surface,
                session: RwLock::new(settings.session),
                terminal: settings.terminal,
                authenticated: settings.authenticated,
                request_timeout: settings.request_timeout,
                idle,
            }),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn authenticated(&self) -> bool {
        self.inner.authenticated
    }

    pub fn session(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_session(&self, token: Option<String>) {
        *self.inner.session.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    fn envelope(&self, req: &Request) -> RequestEnvelope {
        RequestEnvelope {
            action: req.action.clone(),
            version: req.version,
            params: req.params.clone(),
            kind: if req.store {
                EnvelopeKind::JsonStore
            } else {
                EnvelopeKind::Json
            },
            terminal: self.inner.terminal.clone(),
            session: self.session(),
        }
    }

    fn touch(&self, req: &Request) {
        if req.idle {
            return;
        }
        if let Some(idle) = &self.inner.idle {
            idle.reset();
        }
    }

    pub fn stop_idle_timer(&self) {
        if let Some(idle) = &self.inner.idle {
            idle.stop();
        }
    }

    /// Run `req` under the retry policy. Errors are returned, never surfaced.
    pub async fn execute(&self, req: &Request) -> Result<Value, ApiError> {
        let timeout = req.timeout.unwrap_or(self.inner.request_timeout);
        let mut pinned: Option<Arc<Connection>> = None;
        let mut standby_tried = false;

        loop {
            self.touch(req);
            if !req.idle {
                tracing::debug!(action = %req.action, version = req.version, "api request");
            }

            let envelope = self.envelope(req);
            let (served_by, result) = match &pinned {
                Some(conn) => (Some(conn.id()), conn.request(envelope, timeout).await),
                None => {
                    let served = self.inner.pool.dispatch(envelope, timeout).await;
                    (served.connection.map(|c| c.id()), served.result)
                }
            };

            let err = match result {
                Ok(value) => {
                    if !req.idle {
                        tracing::debug!(action = %req.action, conn = ?served_by, "api response");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.code == ErrorCode::DispatcherShutdown {
                tracing::info!(
                    action = %req.action,
                    conn = ?served_by,
                    "reissuing request, dispatcher shut down before handling it"
                );
                pinned = None;
                continue;
            }

            if err.is_dispatch_failure() && pinned.is_none() && !standby_tried {
                standby_tried = true;
                if let Some(conn) = self.inner.pool.random_standby_connection().await {
                    tracing::info!(
                        action = %req.action,
                        conn = conn.id(),
                        authority = %conn.authority(),
                        "retrying request on another dispatcher"
                    );
                    pinned = Some(conn);
                    continue;
                }
            }

            tracing::debug!(action = %req.action, conn = ?served_by, code = %err.code, "api error: {}", err.message);
            return Err(err);
        }
    }

    /// Run `req`; unhandled errors go to the error surface.
    pub async fn request(&self, req: &Request) -> Result<Value, ApiError> {
        self.request_with(req, |_| Disposition::Surface).await
    }

    /// Run `req` and let `handler` decide whether a failure is surfaced.
    pub async fn request_with<F>(&self, req: &Request, handler: F) -> Result<Value, ApiError>
    where
        F: FnOnce(&Result<Value, ApiError>) -> Disposition,
    {
        let result = self.execute(req).await;
        if let Err(err) = &result {
            if handler(&result) == Disposition::Surface {
                self.surface(err);
            }
        }
        result
    }

    /// `call("Action~Version", params)`.
    pub async fn call(&self, action: &str, params: Value) -> Result<Value, DispatchError> {
        let req = Request::parse(action, params)?;
        Ok(self.request(&req).await?)
    }

    pub fn surface(&self, err: &ApiError) {
        tracing::debug!(code = %err.code, "api exception: {}", err.message);
        self.inner
            .surface
            .notify(classify(err, self.inner.authenticated));
    }

    /// Renew the session every `every`, forever. Failures are ignored.
    pub fn spawn_renewal(&self, every: Duration) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let renew = Request::new(SESSION_RENEW_ACTION, 1, json!({})).idle();
            loop {
                tokio::time::sleep(every).await;
                match dispatcher.execute(&renew).await {
                    Ok(reply) => {
                        if let Some(token) = reply.get("session").and_then(Value::as_str) {
                            dispatcher.set_session(Some(token.to_string()));
                            tracing::debug!("session renewed");
                        }
                    }
                    Err(e) => tracing::debug!("session renewal failed: {e}"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockLink, MockReply, NodeScript};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSurface(Mutex<Vec<Notice>>);

    impl ErrorSurface for RecordingSurface {
        fn notify(&self, notice: Notice) {
            self.0.lock().unwrap().push(notice);
        }
    }

    impl RecordingSurface {
        fn notices(&self) -> Vec<Notice> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Pool with one open connection per script; the first one is active.
    async fn pool_with(scripts: Vec<(&str, NodeScript)>) -> (ConnectionPool, Vec<Arc<MockLink>>) {
        let pool = ConnectionPool::new();
        let mut links = Vec::new();
        let mut first = None;
        for (auth, script) in scripts {
            let (conn, link, _rx) = mock::open_connection(auth, script).await;
            pool.add_connection(conn.clone(), Box::new(|_| {})).await.unwrap();
            first.get_or_insert(conn.id());
            links.push(link);
        }
        if let Some(id) = first {
            pool.set_active(id).await.unwrap();
        }
        (pool, links)
    }

    fn dispatcher(pool: ConnectionPool, authenticated: bool) -> (Dispatcher, Arc<RecordingSurface>) {
        let surface = Arc::new(RecordingSurface::default());
        let settings = DispatcherSettings {
            terminal: Some("term-7".into()),
            session: Some("tok-1".into()),
            authenticated,
            ..Default::default()
        };
        (Dispatcher::new(pool, settings, surface.clone()), surface)
    }

    fn dispatch_failure() -> MockReply {
        MockReply::Frames(mock::reply_err(
            "unroutable",
            "cannot route",
            Some(json!({"dispatch_failure": true})),
        ))
    }

    #[test]
    fn test_parse_action_string() {
        let req = Request::parse("Report.run~2", json!({"x": 1})).unwrap();
        assert_eq!(req.action, "Report.run");
        assert_eq!(req.version, 2);
        for bad in ["Report.run", "Report.run~", "~1", "A~1~2", "A~x"] {
            assert!(
                matches!(Request::parse(bad, json!({})), Err(DispatchError::MalformedAction(_))),
                "{bad}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_envelope_carries_session_and_terminal() {
        let (pool, links) = pool_with(vec![("a:1", NodeScript::new(10))]).await;
        let (d, _surface) = dispatcher(pool, false);

        let reply = d.execute(&Request::new("Echo.x", 3, json!({"k": "v"})).store()).await.unwrap();
        assert_eq!(reply["session"], "tok-1");

        let (_, env) = &links[0].requests()[0];
        assert_eq!(env.version, 3);
        assert_eq!(env.kind, EnvelopeKind::JsonStore);
        assert_eq!(env.terminal.as_deref(), Some("term-7"));
        assert_eq!(env.params, json!({"k": "v"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_shutdown_is_reissued() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let script = NodeScript::new(10).with_handler(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                MockReply::Frames(mock::reply_err("dispatcher_shutdown", "", None))
            } else {
                MockReply::Frames(mock::reply_ok(json!("done")))
            }
        });
        let (pool, _links) = pool_with(vec![("a:1", script)]).await;
        let (d, surface) = dispatcher(pool, false);

        assert_eq!(d.request(&Request::new("A.b", 1, json!({}))).await.unwrap(), json!("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(surface.notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_retries_on_standby() {
        let (pool, links) = pool_with(vec![
            ("a:1", NodeScript::new(10).with_handler(|_, _| dispatch_failure())),
            ("b:1", NodeScript::new(10)),
        ])
        .await;
        let (d, surface) = dispatcher(pool, false);

        let reply = d.request(&Request::new("A.b", 1, json!({}))).await.unwrap();
        assert_eq!(reply["action"], "A.b");
        assert_eq!(links[0].requests().len(), 1);
        assert_eq!(links[1].requests().len(), 1);
        assert!(surface.notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_retried_only_once() {
        let (pool, links) = pool_with(vec![
            ("a:1", NodeScript::new(10).with_handler(|_, _| dispatch_failure())),
            ("b:1", NodeScript::new(10).with_handler(|_, _| dispatch_failure())),
        ])
        .await;
        let (d, surface) = dispatcher(pool, false);

        let err = d.request(&Request::new("A.b", 1, json!({}))).await.unwrap_err();
        assert!(err.is_dispatch_failure());
        assert_eq!(links[0].requests().len(), 1);
        assert_eq!(links[1].requests().len(), 1);
        assert_eq!(surface.notices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_without_standby_surfaces() {
        let (pool, links) = pool_with(vec![(
            "a:1",
            NodeScript::new(10).with_handler(|_, _| dispatch_failure()),
        )])
        .await;
        let (d, surface) = dispatcher(pool, false);

        assert!(d.request(&Request::new("A.b", 1, json!({}))).await.is_err());
        assert_eq!(links[0].requests().len(), 1);
        assert_eq!(
            surface.notices(),
            vec![Notice::RemoteException {
                code: "unroutable".into(),
                message: "cannot route".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_not_retried() {
        let (pool, links) = pool_with(vec![
            ("a:1", NodeScript::new(10).with_handler(|_, _| MockReply::Fail)),
            ("b:1", NodeScript::new(10)),
        ])
        .await;
        let (d, _surface) = dispatcher(pool, false);

        let req = Request::new("A.b", 1, json!({})).with_timeout(Duration::from_secs(2));
        let err = d.execute(&req).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Transport);
        assert_eq!(links[0].requests().len(), 1);
        assert!(links[1].requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handled_errors_are_not_surfaced() {
        let script = NodeScript::new(10)
            .with_handler(|_, _| MockReply::Frames(mock::reply_err("authz", "Access denied - admins only", None)));
        let (pool, _links) = pool_with(vec![("a:1", script)]).await;
        let (d, surface) = dispatcher(pool, true);
        let req = Request::new("A.b", 1, json!({}));

        let _ = d.request_with(&req, |_| Disposition::Handled).await;
        assert!(surface.notices().is_empty());

        let _ = d.request_with(&req, |_| Disposition::Surface).await;
        assert_eq!(
            surface.notices(),
            vec![Notice::AccessDenied {
                message: "admins only".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_rejects_malformed_action() {
        let (pool, links) = pool_with(vec![("a:1", NodeScript::new(10))]).await;
        let (d, _surface) = dispatcher(pool, false);

        assert!(matches!(
            d.call("NoVersion", json!({})).await,
            Err(DispatchError::MalformedAction(_))
        ));
        assert!(links[0].requests().is_empty());
        assert_eq!(d.call("Echo.y~1", json!({})).await.unwrap()["action"], "Echo.y");
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_updates_session() {
        let script = NodeScript::new(10).with_handler(|_, env| {
            if env.action == SESSION_RENEW_ACTION {
                MockReply::Frames(mock::reply_ok(json!({"session": "tok-2"})))
            } else {
                MockReply::Frames(mock::reply_ok(json!(null)))
            }
        });
        let (pool, links) = pool_with(vec![("a:1", script)]).await;
        let (d, _surface) = dispatcher(pool, true);

        let renewal = d.spawn_renewal(Duration::from_secs(40));
        tokio::time::sleep(Duration::from_secs(41)).await;
        assert_eq!(d.session().as_deref(), Some("tok-2"));

        let (_, env) = &links[0].requests()[0];
        assert_eq!(env.action, SESSION_RENEW_ACTION);
        assert_eq!(env.session.as_deref(), Some("tok-1"));
        renewal.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_logout_after_inactivity() {
        let (pool, _links) = pool_with(vec![("a:1", NodeScript::new(10))]).await;
        let (d, surface) = dispatcher(pool, true);

        tokio::time::sleep(Duration::from_secs(1000)).await;
        d.execute(&Request::new("A.b", 1, json!({}))).await.unwrap();
        // Idle calls do not count as activity.
        d.execute(&Request::new("A.c", 1, json!({})).idle()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1000)).await;
        assert!(surface.notices().is_empty());

        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(surface.notices(), vec![Notice::SessionExpired]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_idle_logout_when_anonymous() {
        let (pool, _links) = pool_with(vec![("a:1", NodeScript::new(10))]).await;
        let (_d, surface) = dispatcher(pool, false);
        tokio::time::sleep(Duration::from_secs(4000)).await;
        assert!(surface.notices().is_empty());
    }
}
