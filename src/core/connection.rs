//! Connection identity, lifecycle states and per-connection control handles.
//!
//! A connection moves through a small state machine:
//!
//! ```text
//!   New ──▶ Active ◀──▶ Idle
//!    │        │          │
//!    └────────┴──────────┴──▶ Closed | Hijacked
//! ```
//!
//! Any other observed transition means the transport violated its contract
//! and is reported as a [`TransitionError`](crate::ports::conn_state::TransitionError).
use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next process-unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Accepted, no request read yet.
    New,
    /// Processing at least one request.
    Active,
    /// Between requests, kept alive.
    Idle,
    /// Terminal: the connection is gone.
    Closed,
    /// Terminal: ownership moved out of the server (protocol upgrade).
    Hijacked,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Hijacked)
    }

    /// New and Idle connections carry no in-flight request and may be closed
    /// at any time without truncating a response.
    pub fn is_quiescent(self) -> bool {
        matches!(self, Self::New | Self::Idle)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (New, Active) | (Active, Idle) | (Idle, Active) => true,
            (New | Active | Idle, Closed | Hijacked) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Closed => "closed",
            Self::Hijacked => "hijacked",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals the transport listens to for a single connection.
///
/// `drain` asks the protocol engine to stop keep-alive and close the
/// connection as soon as it has nothing in flight. `abort` drops the
/// connection on the spot.
#[derive(Debug, Clone, Default)]
pub struct ConnectionControl {
    drain: CancellationToken,
    abort: CancellationToken,
}

impl ConnectionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) {
        self.drain.cancel();
    }

    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn drain_token(&self) -> &CancellationToken {
        &self.drain
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }
}

/// Handle identifying one accepted connection and carrying its control signals.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote_addr: SocketAddr,
    control: ConnectionControl,
}

impl ConnectionHandle {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::next(),
            remote_addr,
            control: ConnectionControl::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn control(&self) -> &ConnectionControl {
        &self.control
    }
}

/// Point-in-time view of a tracked connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub state: ConnectionState,
    #[serde(with = "humantime_serde")]
    pub age: Duration,
}

impl ConnectionSnapshot {
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        state: ConnectionState,
        since: Instant,
    ) -> Self {
        Self {
            id,
            remote_addr,
            state,
            age: since.elapsed(),
        }
    }
}
