use std::{io, net::SocketAddr};

use axum::Router;
use thiserror::Error;

use crate::core::shutdown::ShutdownOutcome;

/// Error type for server lifecycle operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LifecycleError {
    /// The listening socket could not be bound
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),
    #[error("server already started")]
    AlreadyStarted,
    #[error("listener is no longer available")]
    ListenerUnavailable,
}

/// AcceptControl is the port the shutdown coordinator uses to reach into the
/// listening side of a server.
pub trait AcceptControl: Send + Sync {
    /// Close the listening socket; no new connections are accepted afterwards.
    fn stop_accepting(&self);

    /// Build subsequent connections without keep-alive.
    fn disable_keep_alives(&self);
}

/// ServerLifecycle defines the port the run loop drives
pub trait ServerLifecycle: Send + Sync + 'static {
    /// Begin serving `handler` on a background task and return immediately.
    ///
    /// Calling this twice on the same server is a usage error.
    fn start(&self, handler: Router) -> Result<(), LifecycleError>;

    /// Shut down gracefully, resolving once every tracked connection is gone.
    fn close(&self) -> impl std::future::Future<Output = ShutdownOutcome> + Send;

    /// `scheme://host:port` of the bound listener, available after `start`.
    fn base_url(&self) -> Option<&str>;

    /// Address the listener is actually bound to.
    fn local_addr(&self) -> SocketAddr;
}
