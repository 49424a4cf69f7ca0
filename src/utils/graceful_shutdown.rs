use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::Router;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::{
    core::shutdown::ShutdownOutcome,
    ports::http_server::{LifecycleError, ServerLifecycle},
};

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The external cancellation token fired
    Cancelled,
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// Waits for the first of: external cancellation, SIGINT, SIGTERM.
#[derive(Clone)]
pub struct ShutdownSignal {
    cancel: CancellationToken,
    listen_for_os_signals: bool,
    shutdown_initiated: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Listen for OS signals and for cancellation of a fresh token.
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Listen for OS signals and for cancellation of `cancel`.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            listen_for_os_signals: true,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Only react to `cancel`; OS signals are left to the embedding process.
    pub fn cancellation_only(cancel: CancellationToken) -> Self {
        Self {
            listen_for_os_signals: false,
            ..Self::with_token(cancel)
        }
    }

    /// Token whose cancellation ends the wait.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Manually trigger shutdown (useful for API-triggered stops)
    pub fn trigger(&self) {
        self.cancel.cancel();
    }

    /// Block until a termination source fires and report which one won.
    ///
    /// Sources firing after the first are ignored.
    pub async fn wait(&self) -> ShutdownReason {
        let reason = if self.listen_for_os_signals {
            tokio::select! {
                _ = self.cancel.cancelled() => ShutdownReason::Cancelled,
                _ = wait_for_ctrl_c() => ShutdownReason::Interrupt,
                _ = wait_for_sigterm() => ShutdownReason::Terminate,
            }
        } else {
            self.cancel.cancelled().await;
            ShutdownReason::Cancelled
        };

        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!("Shutdown signal received: {:?}", reason);
        } else {
            tracing::debug!("Shutdown already initiated, ignoring {:?}", reason);
        }
        reason
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}

/// Start `server`, block until `signal` fires, then close the server exactly once.
pub async fn run_until_shutdown<S>(
    server: &S,
    handler: Router,
    signal: &ShutdownSignal,
) -> Result<(ShutdownReason, ShutdownOutcome), LifecycleError>
where
    S: ServerLifecycle,
{
    server.start(handler)?;

    let reason = signal.wait().await;
    tracing::info!(
        "Server {} is shutting down ({:?})",
        server.base_url().unwrap_or("<unstarted>"),
        reason
    );

    let outcome = server.close().await;
    tracing::info!(
        "Server {} shut down: {:?}",
        server.base_url().unwrap_or("<unstarted>"),
        outcome
    );
    Ok((reason, outcome))
}
