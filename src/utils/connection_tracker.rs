//! Connection tracking for graceful draining.
//!
//! Every accepted connection is registered on its first `New` report and
//! removed the instant it reaches a terminal state. Each tracked connection
//! holds one unit of outstanding work; shutdown waits for that count to reach
//! zero. The live set and the `closed` flag share one lock per server.
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tokio_util::task::{TaskTracker, task_tracker::TaskTrackerToken};

use crate::{
    core::connection::{ConnectionHandle, ConnectionId, ConnectionSnapshot, ConnectionState},
    ports::conn_state::{ConnStateHook, TransitionError},
};

struct TrackedConnection {
    handle: ConnectionHandle,
    state: ConnectionState,
    since: Instant,
    // Released exactly once, when the entry leaves the map.
    _work: TaskTrackerToken,
}

#[derive(Default)]
struct TrackerState {
    closed: bool,
    conns: HashMap<ConnectionId, TrackedConnection>,
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    work: TaskTracker,
}

/// Live set of accepted connections and their states.
#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    /// Create a new empty tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(TrackerState::default()),
                work: TaskTracker::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // Nothing in the critical sections can leave the map half-updated.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Flip the `closed` flag. Returns `true` only for the call that closed it.
    pub fn mark_closed(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Force-close every connection currently in `New` or `Idle`.
    ///
    /// States are read under the lock at the moment of closing, so a
    /// connection that has just become `Active` is left alone.
    pub fn close_quiescent(&self) -> usize {
        let state = self.lock();
        let mut closed = 0;
        for tracked in state.conns.values() {
            if tracked.state.is_quiescent() {
                close_conn(&tracked.handle, tracked.state);
                closed += 1;
            }
        }
        closed
    }

    /// Point-in-time copy of the tracked set, ordered by connection id.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let state = self.lock();
        let mut snapshot: Vec<_> = state
            .conns
            .iter()
            .map(|(id, tracked)| {
                ConnectionSnapshot::new(
                    *id,
                    tracked.handle.remote_addr(),
                    tracked.state,
                    tracked.since,
                )
            })
            .collect();
        drop(state);
        snapshot.sort_by_key(|conn| conn.id);
        snapshot
    }

    /// Current state of a tracked connection.
    pub fn state_of(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.lock().conns.get(&id).map(|tracked| tracked.state)
    }

    /// Number of tracked (non-terminal) connections.
    pub fn connection_count(&self) -> usize {
        self.lock().conns.len()
    }

    /// Outstanding units of work; equals [`connection_count`](Self::connection_count).
    pub fn outstanding_work(&self) -> usize {
        self.inner.work.len()
    }

    /// Resolve once outstanding work reaches zero.
    ///
    /// Seals the work counter, so this is only meant for the shutdown path.
    pub(crate) fn drained(&self) -> impl Future<Output = ()> + '_ {
        self.inner.work.close();
        self.inner.work.wait()
    }

    /// Aggregate snapshot statistics.
    pub fn get_stats(&self) -> ConnectionStats {
        let state = self.lock();
        let mut stats = ConnectionStats {
            total_connections: state.conns.len(),
            ..ConnectionStats::default()
        };
        for tracked in state.conns.values() {
            match tracked.state {
                ConnectionState::New => stats.new_connections += 1,
                ConnectionState::Active => stats.active_connections += 1,
                ConnectionState::Idle => stats.idle_connections += 1,
                ConnectionState::Closed | ConnectionState::Hijacked => {}
            }
            stats.oldest_connection_age = stats.oldest_connection_age.max(tracked.since.elapsed());
        }
        stats
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnStateHook for ConnectionTracker {
    fn on_state_change(
        &self,
        conn: &ConnectionHandle,
        next: ConnectionState,
    ) -> Result<(), TransitionError> {
        let id = conn.id();
        let mut state = self.lock();

        match next {
            ConnectionState::New => {
                if let Some(existing) = state.conns.get(&id) {
                    return Err(TransitionError::InvalidTransition {
                        id,
                        from: existing.state,
                        to: next,
                    });
                }
                state.conns.insert(
                    id,
                    TrackedConnection {
                        handle: conn.clone(),
                        state: next,
                        since: Instant::now(),
                        _work: self.inner.work.token(),
                    },
                );
                if state.closed {
                    // Accepted while shutdown was already under way.
                    close_conn(conn, next);
                }
                tracing::debug!(
                    "Connection registered: id={}, remote_addr={}, total_connections={}",
                    id,
                    conn.remote_addr(),
                    state.conns.len()
                );
            }
            ConnectionState::Active | ConnectionState::Idle => {
                let closed = state.closed;
                let Some(tracked) = state.conns.get_mut(&id) else {
                    tracing::trace!("Ignoring {} for untracked connection {}", next, id);
                    return Ok(());
                };
                if !tracked.state.can_transition_to(next) {
                    return Err(TransitionError::InvalidTransition {
                        id,
                        from: tracked.state,
                        to: next,
                    });
                }
                tracked.state = next;
                if closed && next == ConnectionState::Idle {
                    close_conn(&tracked.handle, next);
                }
            }
            ConnectionState::Closed | ConnectionState::Hijacked => {
                if let Some(tracked) = state.conns.remove(&id) {
                    tracing::debug!(
                        "Connection {}: id={}, age={:?}, total_connections={}",
                        next,
                        id,
                        tracked.since.elapsed(),
                        state.conns.len()
                    );
                }
            }
        }

        Ok(())
    }
}

fn close_conn(conn: &ConnectionHandle, state: ConnectionState) {
    match state {
        // Nothing has been read yet, drop it outright.
        ConnectionState::New => conn.control().abort(),
        // Let the engine flush any buffered response bytes before closing.
        ConnectionState::Idle => conn.control().drain(),
        ConnectionState::Active | ConnectionState::Closed | ConnectionState::Hijacked => {}
    }
}

/// Statistics about current connections
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub new_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    #[serde(with = "humantime_serde")]
    pub oldest_connection_age: Duration,
}
