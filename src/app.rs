//! Application shell: configuration, server, readiness and the built-in probes.
use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{Router, middleware};
use chrono::Utc;
use eyre::{Result, WrapErr};
use tower_http::trace::TraceLayer;

use crate::{
    adapters::{
        http_server::Server,
        middleware::{request_id_middleware, request_timing_middleware},
        probes::{ProbeState, probe_routes},
    },
    config::{
        models::AppConfig,
        validation::{ConfigValidator, ValidationError},
    },
    core::{readiness::ReadinessGate, shutdown::ShutdownOutcome},
    ports::conn_state::ConnStateHook,
    utils::{
        connection_tracker::{ConnectionStats, ConnectionTracker},
        graceful_shutdown::{ShutdownReason, ShutdownSignal, run_until_shutdown},
    },
};

/// A configured server with liveness, readiness and info endpoints mounted
/// next to the caller's routes.
pub struct App {
    config: AppConfig,
    server: Server,
    router: Router,
}

impl App {
    /// Validate `config`, bind the listener and mount `routes`.
    ///
    /// `routes` must not define `/healthz`, `/readyz` or `/home`.
    pub async fn new(config: AppConfig, routes: Router) -> Result<Self> {
        Self::build(config, routes, None).await
    }

    /// Like [`App::new`], additionally reporting every accepted connection
    /// transition to `hook`.
    pub async fn with_state_hook(
        config: AppConfig,
        routes: Router,
        hook: Arc<dyn ConnStateHook>,
    ) -> Result<Self> {
        Self::build(config, routes, Some(hook)).await
    }

    async fn build(
        config: AppConfig,
        routes: Router,
        hook: Option<Arc<dyn ConnStateHook>>,
    ) -> Result<Self> {
        ConfigValidator::validate(&config).wrap_err("Invalid application configuration")?;

        let addr = bind_address(&config)?;
        let readiness = ReadinessGate::new();
        let mut server = Server::bind(&addr, readiness.clone(), config.shutdown.clone())
            .await
            .wrap_err_with(|| format!("Failed to bind {}", display_addr(&addr)))?;
        if let Some(hook) = hook {
            server = server.with_state_hook(hook);
        }

        let probes = probe_routes(Arc::new(ProbeState {
            readiness,
            tracker: server.tracker().clone(),
            startup_time: Utc::now(),
            started_at: Instant::now(),
            host: config.host.clone(),
            port: server.local_addr().port(),
            about: config.about.clone(),
        }));
        let router = routes
            .merge(probes)
            .layer(middleware::from_fn(request_timing_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http());

        tracing::debug!("Listening on {}", server.local_addr());
        Ok(Self {
            config,
            server,
            router,
        })
    }

    /// Start serving in the background.
    pub fn start(&self) -> Result<()> {
        self.server
            .start(self.router.clone())
            .wrap_err("Failed to start server")
    }

    /// Gracefully shut the server down.
    pub async fn close(&self) -> ShutdownOutcome {
        self.server.close().await
    }

    /// Start, block until `signal` fires, then close.
    pub async fn run(&self, signal: &ShutdownSignal) -> Result<(ShutdownReason, ShutdownOutcome)> {
        run_until_shutdown(&self.server, self.router.clone(), signal)
            .await
            .wrap_err("Server terminated with an error")
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// `http://host:port`, available once started.
    pub fn base_url(&self) -> Option<&str> {
        self.server.base_url()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn readiness(&self) -> &ReadinessGate {
        self.server.readiness()
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        self.server.tracker()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.server.tracker().get_stats()
    }
}

fn bind_address(config: &AppConfig) -> Result<String, ValidationError> {
    Ok(match ConfigValidator::validate_host(&config.host)? {
        Some(ip) => SocketAddr::new(ip, config.port).to_string(),
        None => String::new(),
    })
}

fn display_addr(addr: &str) -> &str {
    if addr.is_empty() { "a loopback address" } else { addr }
}
