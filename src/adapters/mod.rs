pub mod http_server;
pub mod middleware;
pub mod probes;

pub use http_server::Server;
pub use middleware::{request_id_middleware, request_timing_middleware};
pub use probes::{ProbeState, probe_routes};
