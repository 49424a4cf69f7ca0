pub mod connection_tracker;
pub mod graceful_shutdown;

pub use connection_tracker::{ConnectionStats, ConnectionTracker};
pub use graceful_shutdown::{ShutdownReason, ShutdownSignal, run_until_shutdown};
