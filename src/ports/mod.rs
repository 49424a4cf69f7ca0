pub mod conn_state;
pub mod http_server;

pub use conn_state::{ConnStateHook, TransitionError};
pub use http_server::{AcceptControl, LifecycleError, ServerLifecycle};
