//! Quiesce - an embeddable HTTP server lifecycle manager.
//!
//! Quiesce serves an axum [`Router`](axum::Router) over hyper and owns
//! everything around it: tracking the state of every connection, a
//! readiness flag for orchestrators, and a graceful shutdown that never
//! truncates an in-flight response.
//!
//! # Features
//! - Per-connection state tracking (`new`, `active`, `idle`, `hijacked`, `closed`)
//! - Graceful shutdown: stop accepting, close quiescent connections, wait for the rest
//! - Periodic reports naming the connections that hold up a shutdown
//! - Readiness gate plus built-in `/healthz`, `/readyz` and `/home` endpoints
//! - Run loop that shuts down on SIGINT, SIGTERM or a cancellation token
//! - Layered configuration (file + `QUIESCE_*` environment) and structured tracing
//!
//! # Quick Example
//! ```no_run
//! use axum::{Router, routing::get};
//! use quiesce::{App, ShutdownSignal, config::AppConfig};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let routes = Router::new().route("/", get(|| async { "hello" }));
//! let app = App::new(AppConfig::loopback(), routes).await?;
//! app.run(&ShutdownSignal::new()).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the lifecycle logic inside `core` and `utils`. The hyper transport in
//! [`adapters::http_server`] is the only code that talks to sockets.
//!
//! # Error Handling
//! Library operations return domain error types (`LifecycleError`, `TransitionError`,
//! `ValidationError`); the application shell returns `eyre::Result<T>` with context
//! attached using `WrapErr`.
pub mod app;
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::Server,
    app::App,
    core::{
        ConnectionHandle, ConnectionId, ConnectionState, GracefulShutdownCoordinator,
        ReadinessGate, ShutdownOutcome,
    },
    ports::{ConnStateHook, LifecycleError, ServerLifecycle, TransitionError},
    utils::{ConnectionTracker, ShutdownReason, ShutdownSignal, run_until_shutdown},
};
