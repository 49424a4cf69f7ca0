use thiserror::Error;

use crate::core::connection::{ConnectionHandle, ConnectionId, ConnectionState};

/// Raised when a transport reports a state change outside the lifecycle graph.
///
/// This is never a runtime condition a caller can recover from: it means the
/// transport broke its contract. Callers pick the policy (abort or log).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransitionError {
    #[error("invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// ConnStateHook is the port the transport drives on every accept and every
/// protocol-level state change of a connection.
pub trait ConnStateHook: Send + Sync + 'static {
    /// Observe `conn` entering `state`.
    ///
    /// Implementations must tolerate concurrent calls for different
    /// connections. Calls for a single connection arrive in order.
    fn on_state_change(
        &self,
        conn: &ConnectionHandle,
        state: ConnectionState,
    ) -> Result<(), TransitionError>;
}
