pub mod connection;
pub mod readiness;
pub mod shutdown;

pub use connection::{
    ConnectionControl, ConnectionHandle, ConnectionId, ConnectionSnapshot, ConnectionState,
};
pub use readiness::ReadinessGate;
pub use shutdown::{DEFAULT_HANG_REPORT_INTERVAL, GracefulShutdownCoordinator, ShutdownOutcome};
