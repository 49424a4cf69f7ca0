//! Built-in liveness, readiness and info endpoints.
use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};

use crate::{core::readiness::ReadinessGate, utils::connection_tracker::ConnectionTracker};

pub const HEALTHZ_PATH: &str = "/healthz";
pub const READYZ_PATH: &str = "/readyz";
pub const HOME_PATH: &str = "/home";

/// Everything the probe handlers read.
pub struct ProbeState {
    pub readiness: ReadinessGate,
    pub tracker: ConnectionTracker,
    pub startup_time: DateTime<Utc>,
    pub started_at: Instant,
    pub host: String,
    pub port: u16,
    pub about: String,
}

/// Router serving the probe endpoints.
pub fn probe_routes(state: Arc<ProbeState>) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(READYZ_PATH, get(readyz))
        .route(HOME_PATH, get(home))
        .with_state(state)
}

/// Liveness: answers as long as the process can serve requests.
pub async fn healthz() -> &'static str {
    "service is alive.\n"
}

/// Readiness: 503 until the server has started.
pub async fn readyz(State(state): State<Arc<ProbeState>>) -> Response {
    if state.readiness.is_ready() {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
    }
}

pub async fn home(State(state): State<Arc<ProbeState>>) -> Json<serde_json::Value> {
    let up_time = humantime::format_duration(state.started_at.elapsed()).to_string();
    Json(serde_json::json!({
        "up_time": up_time,
        "startup_time": state.startup_time.to_rfc3339(),
        "host": &state.host,
        "port": state.port,
        "about": &state.about,
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.tracker.get_stats(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for oneshot

    use super::*;

    fn probe_state(readiness: ReadinessGate) -> Arc<ProbeState> {
        Arc::new(ProbeState {
            readiness,
            tracker: ConnectionTracker::new(),
            startup_time: Utc::now(),
            started_at: Instant::now(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            about: "probe tests".to_string(),
        })
    }

    async fn get_path(router: Router, path: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_healthz_is_always_ok() {
        let (status, body) =
            get_path(probe_routes(probe_state(ReadinessGate::new())), HEALTHZ_PATH).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"service is alive.\n");
    }

    #[tokio::test]
    async fn test_readyz_follows_the_gate() {
        let gate = ReadinessGate::new();
        let router = probe_routes(probe_state(gate.clone()));

        let (status, body) = get_path(router.clone(), READYZ_PATH).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, b"Service Unavailable");

        gate.mark_ready();
        let (status, _) = get_path(router, READYZ_PATH).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_home_describes_the_instance() {
        let (status, body) =
            get_path(probe_routes(probe_state(ReadinessGate::new())), HOME_PATH).await;
        assert_eq!(status, StatusCode::OK);

        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["host"], "127.0.0.1");
        assert_eq!(info["port"], 8080);
        assert_eq!(info["about"], "probe tests");
        assert_eq!(info["connections"]["total_connections"], 0);
        assert!(info["up_time"].is_string());
        assert!(info["startup_time"].is_string());
    }
}
