//! hyper-util backed server that reports every connection's lifecycle to a
//! [`ConnStateHook`].
//!
//! hyper does not expose connection states, so they are derived here:
//! the accept loop reports `New`, the first in-flight request reports
//! `Active`, the last response body handed to the engine reports `Idle`
//! (or `Hijacked` for a `101 Switching Protocols`), and the end of the
//! connection task reports `Closed`.
use std::{
    convert::Infallible,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{Router, body::Body};
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::Instrument;

use crate::{
    config::models::{InvalidTransitionPolicy, ShutdownConfig},
    core::{
        connection::{ConnectionHandle, ConnectionState},
        readiness::ReadinessGate,
        shutdown::{GracefulShutdownCoordinator, ShutdownOutcome},
    },
    ports::{
        conn_state::{ConnStateHook, TransitionError},
        http_server::{AcceptControl, LifecycleError, ServerLifecycle},
    },
    tracing_setup::{create_connection_span, create_server_span},
    utils::connection_tracker::ConnectionTracker,
};

/// An HTTP server bound to one listening socket.
///
/// The listener is bound on construction; [`start`](Server::start) begins
/// serving and [`close`](Server::close) drains it.
pub struct Server {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    url: OnceLock<String>,
    tracker: ConnectionTracker,
    coordinator: GracefulShutdownCoordinator,
    readiness: ReadinessGate,
    accepting: CancellationToken,
    keep_alives: Arc<AtomicBool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    state_hook: Option<Arc<dyn ConnStateHook>>,
    settings: ShutdownConfig,
}

impl Server {
    /// Bind `addr` (`host:port`, port 0 for an ephemeral port).
    ///
    /// An empty `addr` binds a loopback address, trying IPv4 before IPv6.
    pub async fn bind(
        addr: &str,
        readiness: ReadinessGate,
        settings: ShutdownConfig,
    ) -> Result<Self, LifecycleError> {
        let listener = if addr.is_empty() {
            bind_loopback().await?
        } else {
            let socket_addr: SocketAddr = addr
                .parse()
                .map_err(|_| LifecycleError::InvalidAddress(addr.to_string()))?;
            TcpListener::bind(socket_addr)
                .await
                .map_err(|source| LifecycleError::Bind {
                    addr: addr.to_string(),
                    source,
                })?
        };
        Self::from_listener(listener, readiness, settings)
    }

    /// Wrap an already bound listener.
    pub fn from_listener(
        listener: TcpListener,
        readiness: ReadinessGate,
        settings: ShutdownConfig,
    ) -> Result<Self, LifecycleError> {
        let local_addr = listener
            .local_addr()
            .map_err(|source| LifecycleError::Bind {
                addr: "<listener>".to_string(),
                source,
            })?;
        let tracker = ConnectionTracker::new();
        let coordinator =
            GracefulShutdownCoordinator::new(tracker.clone(), settings.hang_report_interval);

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            url: OnceLock::new(),
            tracker,
            coordinator,
            readiness,
            accepting: CancellationToken::new(),
            keep_alives: Arc::new(AtomicBool::new(true)),
            accept_task: Mutex::new(None),
            state_hook: None,
            settings,
        })
    }

    /// Chain an extra observer after the connection tracker.
    ///
    /// It sees every transition the tracker accepted. Must be set before `start`.
    pub fn with_state_hook(mut self, hook: Arc<dyn ConnStateHook>) -> Self {
        self.state_hook = Some(hook);
        self
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn readiness(&self) -> &ReadinessGate {
        &self.readiness
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_url(&self) -> Option<&str> {
        self.url.get().map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Begin serving `handler` on a background task and mark the process ready.
    pub fn start(&self, handler: Router) -> Result<(), LifecycleError> {
        if self.url.get().is_some() {
            return Err(LifecycleError::AlreadyStarted);
        }
        let listener = lock(&self.listener)
            .take()
            .ok_or(LifecycleError::ListenerUnavailable)?;

        let url = format!("http://{}", self.local_addr);
        let accept_loop = AcceptLoop {
            listener,
            handler,
            hook: Arc::new(TrackingHook {
                tracker: self.tracker.clone(),
                next: self.state_hook.clone(),
            }),
            accepting: self.accepting.clone(),
            keep_alives: self.keep_alives.clone(),
            policy: self.settings.invalid_transition_policy,
        };
        let task = tokio::spawn(accept_loop.run().instrument(create_server_span(&url)));
        *lock(&self.accept_task) = Some(task);

        tracing::info!("Server {} is ready to serve", url);
        let _ = self.url.set(url);
        self.readiness.mark_ready();
        Ok(())
    }

    /// Drain and stop the server; resolves once every connection is gone.
    pub async fn close(&self) -> ShutdownOutcome {
        if self.settings.unready_on_shutdown {
            self.readiness.mark_unready();
        }

        let outcome = self.coordinator.shutdown(self).await;

        let accept_task = lock(&self.accept_task).take();
        if let Some(task) = accept_task
            && let Err(e) = task.await
        {
            tracing::warn!("Accept loop ended abnormally: {}", e);
        }

        if let ShutdownOutcome::Completed { .. } = outcome {
            tracing::info!(
                "Server {} shut down",
                self.base_url().unwrap_or("<unstarted>")
            );
        }
        outcome
    }
}

impl AcceptControl for Server {
    fn stop_accepting(&self) {
        self.accepting.cancel();
        // Never started: release the socket here.
        drop(lock(&self.listener).take());
    }

    fn disable_keep_alives(&self) {
        self.keep_alives.store(false, Ordering::Release);
    }
}

impl ServerLifecycle for Server {
    fn start(&self, handler: Router) -> Result<(), LifecycleError> {
        Server::start(self, handler)
    }

    async fn close(&self) -> ShutdownOutcome {
        Server::close(self).await
    }

    fn base_url(&self) -> Option<&str> {
        Server::base_url(self)
    }

    fn local_addr(&self) -> SocketAddr {
        Server::local_addr(self)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn bind_loopback() -> Result<TcpListener, LifecycleError> {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
        Ok(listener) => Ok(listener),
        Err(_) => TcpListener::bind((Ipv6Addr::LOCALHOST, 0))
            .await
            .map_err(|source| LifecycleError::Bind {
                addr: "[::1]:0".to_string(),
                source,
            }),
    }
}

/// The tracker first, then the optional user hook.
struct TrackingHook {
    tracker: ConnectionTracker,
    next: Option<Arc<dyn ConnStateHook>>,
}

impl ConnStateHook for TrackingHook {
    fn on_state_change(
        &self,
        conn: &ConnectionHandle,
        state: ConnectionState,
    ) -> Result<(), TransitionError> {
        self.tracker.on_state_change(conn, state)?;
        match &self.next {
            Some(next) => next.on_state_change(conn, state),
            None => Ok(()),
        }
    }
}

fn observe(
    hook: &dyn ConnStateHook,
    conn: &ConnectionHandle,
    state: ConnectionState,
    policy: InvalidTransitionPolicy,
) {
    if let Err(e) = hook.on_state_change(conn, state) {
        match policy {
            InvalidTransitionPolicy::Abort => {
                tracing::error!("{}; aborting", e);
                std::process::abort();
            }
            InvalidTransitionPolicy::Log => tracing::error!("{}", e),
        }
    }
}

struct AcceptLoop {
    listener: TcpListener,
    handler: Router,
    hook: Arc<dyn ConnStateHook>,
    accepting: CancellationToken,
    keep_alives: Arc<AtomicBool>,
    policy: InvalidTransitionPolicy,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.accepting.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, remote_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let conn = ConnectionHandle::new(remote_addr);
            observe(&*self.hook, &conn, ConnectionState::New, self.policy);

            let span = create_connection_span(conn.id().as_u64(), &remote_addr.to_string());
            let task = ConnectionTask {
                conn,
                handler: self.handler.clone(),
                hook: self.hook.clone(),
                keep_alive: self.keep_alives.load(Ordering::Acquire),
                policy: self.policy,
            };
            tokio::spawn(task.serve(stream).instrument(span));
        }

        tracing::debug!("Listener closed, no longer accepting connections");
    }
}

struct ConnectionTask {
    conn: ConnectionHandle,
    handler: Router,
    hook: Arc<dyn ConnStateHook>,
    keep_alive: bool,
    policy: InvalidTransitionPolicy,
}

impl ConnectionTask {
    async fn serve(self, stream: TcpStream) {
        let requests = Arc::new(RequestActivity {
            conn: self.conn.clone(),
            hook: self.hook.clone(),
            policy: self.policy,
            in_flight: Mutex::new(0),
        });
        let handler = self.handler;
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let requests = requests.clone();
            async move {
                let mut guard = requests.begin();
                let response = handler.oneshot(req).await?;
                if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                    guard.hijack();
                }
                // The guard lives as long as the body: dropping it marks the
                // request as finished.
                Ok::<_, Infallible>(response.map(move |body| {
                    Body::new(body.map_frame(move |frame| {
                        let _request = &guard;
                        frame
                    }))
                }))
            }
        });

        let control = self.conn.control().clone();
        let result = {
            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder.http1().keep_alive(self.keep_alive);
            let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
            tokio::pin!(connection);

            let mut draining = false;
            loop {
                tokio::select! {
                    biased;
                    _ = control.abort_token().cancelled() => {
                        tracing::debug!("Connection {} force-closed", self.conn.id());
                        break Ok(());
                    }
                    _ = control.drain_token().cancelled(), if !draining => {
                        draining = true;
                        connection.as_mut().graceful_shutdown();
                    }
                    result = connection.as_mut() => break result,
                }
            }
        };

        if let Err(e) = result {
            tracing::debug!("Connection {} ended with error: {}", self.conn.id(), e);
        }
        observe(&*self.hook, &self.conn, ConnectionState::Closed, self.policy);
    }
}

/// In-flight request bookkeeping for one connection.
///
/// The counter and the resulting transition are updated under one lock so a
/// connection's transitions stay ordered when HTTP/2 streams run concurrently.
struct RequestActivity {
    conn: ConnectionHandle,
    hook: Arc<dyn ConnStateHook>,
    policy: InvalidTransitionPolicy,
    in_flight: Mutex<usize>,
}

impl RequestActivity {
    fn begin(self: &Arc<Self>) -> RequestGuard {
        let mut in_flight = lock(&self.in_flight);
        if *in_flight == 0 {
            observe(&*self.hook, &self.conn, ConnectionState::Active, self.policy);
        }
        *in_flight += 1;
        RequestGuard {
            activity: Arc::clone(self),
            hijacked: false,
        }
    }

    fn finish(&self, hijacked: bool) {
        let mut in_flight = lock(&self.in_flight);
        *in_flight = in_flight.saturating_sub(1);
        if hijacked {
            observe(&*self.hook, &self.conn, ConnectionState::Hijacked, self.policy);
        } else if *in_flight == 0 {
            observe(&*self.hook, &self.conn, ConnectionState::Idle, self.policy);
        }
    }
}

struct RequestGuard {
    activity: Arc<RequestActivity>,
    hijacked: bool,
}

impl RequestGuard {
    fn hijack(&mut self) {
        self.hijacked = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.activity.finish(self.hijacked);
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;

    async fn loopback_server() -> Server {
        Server::bind("127.0.0.1:0", ReadinessGate::new(), ShutdownConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_sets_url_and_readiness() {
        let server = loopback_server().await;
        assert!(!server.readiness().is_ready());
        assert!(server.base_url().is_none());

        server
            .start(Router::new().route("/", get(|| async { "ok" })))
            .unwrap();

        assert!(server.readiness().is_ready());
        let expected = format!("http://{}", server.local_addr());
        assert_eq!(server.base_url(), Some(expected.as_str()));
        assert_ne!(server.local_addr().port(), 0);

        server.close().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let server = loopback_server().await;
        server.start(Router::new()).unwrap();
        assert!(matches!(
            server.start(Router::new()),
            Err(LifecycleError::AlreadyStarted)
        ));
        server.close().await;
    }

    #[tokio::test]
    async fn test_close_before_start_releases_listener() {
        let server = loopback_server().await;
        let outcome = tokio::time::timeout(Duration::from_secs(1), server.close())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ShutdownOutcome::Completed {
                force_closed: 0,
                ..
            }
        ));
        assert!(matches!(
            server.start(Router::new()),
            Err(LifecycleError::ListenerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let result = Server::bind(
            "not-an-address",
            ReadinessGate::new(),
            ShutdownConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(LifecycleError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = loopback_server().await;
        let taken = first.local_addr().to_string();
        let result = Server::bind(&taken, ReadinessGate::new(), ShutdownConfig::default()).await;
        assert!(matches!(result, Err(LifecycleError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_empty_address_binds_loopback() {
        let server = Server::bind("", ReadinessGate::new(), ShutdownConfig::default())
            .await
            .unwrap();
        assert!(server.local_addr().ip().is_loopback());
    }
}
