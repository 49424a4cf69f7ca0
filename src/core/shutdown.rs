//! Graceful shutdown coordinator.
//!
//! Shutdown never fails and is never cut short: it stops the listener, closes
//! connections that have nothing in flight, then waits for every remaining
//! connection to finish on its own. While waiting it periodically reports
//! which connections are holding it up.
use std::time::{Duration, Instant};

use crate::{ports::http_server::AcceptControl, utils::connection_tracker::ConnectionTracker};

/// Default delay before (and between) reports about a stuck shutdown.
pub const DEFAULT_HANG_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// What a call to shutdown ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// This call performed the shutdown.
    Completed {
        /// Connections closed because they were `New` or `Idle`.
        force_closed: usize,
        /// Time spent from the start of shutdown until the last connection left.
        waited: Duration,
    },
    /// Another call had already begun shutdown; this one only waited for it.
    AlreadyClosed,
}

/// Drives a [`ConnectionTracker`] to quiescence.
#[derive(Clone)]
pub struct GracefulShutdownCoordinator {
    tracker: ConnectionTracker,
    hang_report_interval: Duration,
}

impl GracefulShutdownCoordinator {
    pub fn new(tracker: ConnectionTracker, hang_report_interval: Duration) -> Self {
        Self {
            tracker,
            hang_report_interval,
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Run the shutdown sequence against `acceptor`.
    ///
    /// Only the first call does any work; later calls wait for the first to
    /// finish and return [`ShutdownOutcome::AlreadyClosed`].
    pub async fn shutdown<A>(&self, acceptor: &A) -> ShutdownOutcome
    where
        A: AcceptControl + ?Sized,
    {
        if !self.tracker.mark_closed() {
            tracing::debug!("Shutdown already initiated, waiting for outstanding connections");
            self.tracker.drained().await;
            return ShutdownOutcome::AlreadyClosed;
        }

        let started = Instant::now();
        acceptor.stop_accepting();
        acceptor.disable_keep_alives();

        let force_closed = self.tracker.close_quiescent();
        tracing::info!(
            "Graceful shutdown started: force_closed={}, remaining_connections={}",
            force_closed,
            self.tracker.connection_count()
        );

        self.wait_for_drain(started).await;

        let waited = started.elapsed();
        tracing::info!("All connections drained after {:?}", waited);
        ShutdownOutcome::Completed {
            force_closed,
            waited,
        }
    }

    async fn wait_for_drain(&self, started: Instant) {
        let drained = self.tracker.drained();
        tokio::pin!(drained);

        while tokio::time::timeout(self.hang_report_interval, drained.as_mut())
            .await
            .is_err()
        {
            self.report_hang(started.elapsed());
        }
    }

    fn report_hang(&self, elapsed: Duration) {
        let snapshot = self.tracker.snapshot();
        tracing::warn!(
            "Server blocked in close after {}, waiting for {} connection(s)",
            humantime::format_duration(truncate_to_millis(elapsed)),
            snapshot.len()
        );
        for conn in snapshot {
            tracing::warn!(
                connection_id = %conn.id,
                remote_addr = %conn.remote_addr,
                state = %conn.state,
                age = ?conn.age,
                "Connection still open"
            );
        }
    }
}

fn truncate_to_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;
    use crate::{
        core::connection::{ConnectionHandle, ConnectionState},
        ports::conn_state::ConnStateHook,
    };

    #[derive(Default)]
    struct FakeAcceptor {
        stopped: AtomicUsize,
        keep_alive_disabled: AtomicUsize,
    }

    impl AcceptControl for FakeAcceptor {
        fn stop_accepting(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn disable_keep_alives(&self) {
            self.keep_alive_disabled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connect(tracker: &ConnectionTracker, path: &[ConnectionState]) -> ConnectionHandle {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let conn = ConnectionHandle::new(addr);
        for state in path {
            tracker.on_state_change(&conn, *state).unwrap();
        }

        // Behave like a transport: once told to drain or abort, the connection closes.
        let transport = tracker.clone();
        let closing = conn.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closing.control().drain_token().cancelled() => {}
                _ = closing.control().abort_token().cancelled() => {}
            }
            transport
                .on_state_change(&closing, ConnectionState::Closed)
                .unwrap();
        });
        conn
    }

    #[tokio::test]
    async fn test_shutdown_without_connections_returns_immediately() {
        let tracker = ConnectionTracker::new();
        let coordinator = GracefulShutdownCoordinator::new(tracker.clone(), Duration::from_secs(5));
        let acceptor = FakeAcceptor::default();

        let outcome = tokio::time::timeout(Duration::from_secs(1), coordinator.shutdown(&acceptor))
            .await
            .expect("empty shutdown must not block");

        assert!(matches!(
            outcome,
            ShutdownOutcome::Completed {
                force_closed: 0,
                ..
            }
        ));
        assert_eq!(acceptor.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(acceptor.keep_alive_disabled.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.outstanding_work(), 0);
    }

    #[tokio::test]
    async fn test_second_shutdown_is_a_no_op() {
        let tracker = ConnectionTracker::new();
        let coordinator = GracefulShutdownCoordinator::new(tracker, Duration::from_secs(5));
        let acceptor = FakeAcceptor::default();

        coordinator.shutdown(&acceptor).await;
        let second = coordinator.shutdown(&acceptor).await;

        assert_eq!(second, ShutdownOutcome::AlreadyClosed);
        assert_eq!(acceptor.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_quiescent_connections_are_closed_and_active_ones_waited_out() {
        use ConnectionState::*;

        let tracker = ConnectionTracker::new();
        let coordinator = GracefulShutdownCoordinator::new(tracker.clone(), Duration::from_secs(5));

        let fresh = connect(&tracker, &[New]);
        let idle = connect(&tracker, &[New, Active, Idle]);
        let busy = connect(&tracker, &[New, Active]);

        let shutdown = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.shutdown(&FakeAcceptor::default()).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!shutdown.is_finished());
        assert!(fresh.control().is_aborted());
        assert!(idle.control().is_draining());
        assert!(!busy.control().is_draining());
        assert_eq!(tracker.state_of(busy.id()), Some(Active));

        // The in-flight request completes; landing on Idle closes it.
        tracker.on_state_change(&busy, Idle).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), shutdown)
            .await
            .expect("shutdown should finish once the last request completes")
            .unwrap();
        assert!(matches!(
            outcome,
            ShutdownOutcome::Completed {
                force_closed: 2,
                ..
            }
        ));
        assert_eq!(tracker.outstanding_work(), 0);
    }

    #[tokio::test]
    async fn test_hang_reports_do_not_abort_shutdown() {
        use ConnectionState::*;

        let tracker = ConnectionTracker::new();
        let coordinator =
            GracefulShutdownCoordinator::new(tracker.clone(), Duration::from_millis(10));
        let busy = connect(&tracker, &[New, Active]);

        let shutdown = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.shutdown(&FakeAcceptor::default()).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!shutdown.is_finished());

        tracker.on_state_change(&busy, Closed).unwrap();
        let outcome = shutdown.await.unwrap();
        match outcome {
            ShutdownOutcome::Completed { waited, .. } => {
                assert!(waited >= Duration::from_millis(60));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hang_report_lists_blocking_connections() {
        use ConnectionState::*;

        let tracker = ConnectionTracker::new();
        let coordinator = GracefulShutdownCoordinator::new(tracker.clone(), Duration::from_secs(5));
        let active = connect(&tracker, &[New, Active]);
        let reused = connect(&tracker, &[New, Active, Idle, Active]);

        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            coordinator.report_hang(Duration::from_millis(5_250));
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("waiting for 2 connection(s)"), "{output}");
        assert!(output.contains("5s 250ms"), "{output}");
        for conn in [&active, &reused] {
            let line = output
                .lines()
                .find(|line| line.contains(&format!("connection_id={} ", conn.id())))
                .unwrap_or_else(|| panic!("no report for {}: {output}", conn.id()));
            assert!(line.contains("remote_addr=127.0.0.1:4000"), "{line}");
            assert!(line.contains("state=active"), "{line}");
        }
    }
}
