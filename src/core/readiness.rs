use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Process-wide readiness signal.
///
/// Created once and handed to both the server lifecycle (the only writer)
/// and the readiness probe (a reader). Starts out `false`.
#[derive(Debug, Clone, Default)]
pub struct ReadinessGate {
    ready: Arc<AtomicBool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub(crate) fn mark_unready(&self) {
        self.ready.store(false, Ordering::Release);
    }
}
