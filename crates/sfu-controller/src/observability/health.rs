//! Health endpoints for the SFU Controller.
//!
//! - `GET /health` - liveness, 200 while the process runs
//! - `GET /ready` - readiness, 200 only while signaling accepts clients
//!
//! Both answer with a small JSON body naming the SFU and its phase. The
//! `/metrics` endpoint is merged onto the same router by the binary.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle phase reported by the health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Listeners are not bound yet.
    Starting,
    /// Signaling accepts clients.
    Ready,
    /// Shutdown requested; rooms are being released.
    Draining,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Ready,
            2 => Phase::Draining,
            _ => Phase::Starting,
        }
    }
}

/// Shared phase of the process.
#[derive(Debug)]
pub struct HealthState {
    sfu_id: String,
    phase: AtomicU8,
}

impl HealthState {
    #[must_use]
    pub fn new(sfu_id: impl Into<String>) -> Self {
        Self {
            sfu_id: sfu_id.into(),
            phase: AtomicU8::new(Phase::Starting as u8),
        }
    }

    pub fn set_ready(&self) {
        // Draining is final
        let _ = self.phase.compare_exchange(
            Phase::Starting as u8,
            Phase::Ready as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn set_draining(&self) {
        self.phase.store(Phase::Draining as u8, Ordering::SeqCst);
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    sfu_id: String,
    phase: Phase,
}

impl From<&HealthState> for HealthBody {
    fn from(state: &HealthState) -> Self {
        Self {
            sfu_id: state.sfu_id.clone(),
            phase: state.phase(),
        }
    }
}

/// Router exposing `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<HealthBody>) {
    (StatusCode::OK, Json(HealthBody::from(state.as_ref())))
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<HealthBody>) {
    let status = if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(HealthBody::from(state.as_ref())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[test]
    fn test_phase_transitions() {
        let state = HealthState::new("sfu-test");
        assert_eq!(state.phase(), Phase::Starting);

        state.set_ready();
        assert!(state.is_ready());

        state.set_draining();
        assert_eq!(state.phase(), Phase::Draining);

        // A late set_ready must not undo draining
        state.set_ready();
        assert_eq!(state.phase(), Phase::Draining);
    }

    #[tokio::test]
    async fn test_liveness_reports_phase() {
        let state = Arc::new(HealthState::new("sfu-test"));
        let (status, body) = get(health_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "sfu_id": "sfu-test", "phase": "starting" }));
    }

    #[tokio::test]
    async fn test_readiness_follows_phase() {
        let state = Arc::new(HealthState::new("sfu-test"));

        let (status, _) = get(health_router(Arc::clone(&state)), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready();
        let (status, body) = get(health_router(Arc::clone(&state)), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.get("phase"), Some(&json!("ready")));

        state.set_draining();
        let (status, body) = get(health_router(Arc::clone(&state)), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.get("phase"), Some(&json!("draining")));

        // Liveness stays up while draining
        let (status, _) = get(health_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let app = health_router(Arc::new(HealthState::new("sfu-test")));
        let (status, _) = get(app, "/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
