//! Health endpoints for K8s probes.

use crate::metrics::PrometheusHandle;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status body served by `/health` and `/ready`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub broker_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Shared health state.
#[derive(Clone, Default)]
pub struct HealthState {
    inner: Arc<RwLock<HealthStateInner>>,
}

#[derive(Default)]
struct HealthStateInner {
    broker_connected: bool,
    fatal: bool,
    last_error: Option<String>,
}

impl HealthState {
    /// Starts disconnected and not fatal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a broker (re)connection or disconnection.
    pub async fn set_connected(&self, connected: bool) {
        let mut inner = self.inner.write().await;
        inner.broker_connected = connected;
        if connected {
            inner.last_error = None;
        }
    }

    pub async fn set_error(&self, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.broker_connected = false;
        inner.last_error = Some(error.into());
    }

    /// Record an unrecoverable error; liveness fails from then on.
    pub async fn set_fatal(&self, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.broker_connected = false;
        inner.fatal = true;
        inner.last_error = Some(error.into());
    }

    /// Liveness ignores broker disconnects: the reconnect loop handles those.
    pub async fn is_alive(&self) -> bool {
        !self.inner.read().await.fatal
    }

    /// Readiness requires a live broker connection.
    pub async fn is_ready(&self) -> bool {
        let inner = self.inner.read().await;
        inner.broker_connected && !inner.fatal
    }

    pub async fn status(&self) -> HealthStatus {
        let inner = self.inner.read().await;
        let status = if inner.fatal {
            "fatal"
        } else if inner.broker_connected {
            "healthy"
        } else {
            "degraded"
        };
        HealthStatus {
            status: status.to_string(),
            broker_connected: inner.broker_connected,
            last_error: inner.last_error.clone(),
        }
    }
}

/// `/health`, `/healthz`, `/ready`, `/readyz` and, with a handle, `/metrics`.
pub fn health_router(state: HealthState, metrics: Option<PrometheusHandle>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .with_state(state);

    if let Some(handle) = metrics {
        router = router.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    router
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let code = if state.is_alive().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(state.status().await))
}

async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let code = if state.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(state.status().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    async fn get_status(router: Router, uri: &str) -> StatusCode {
        router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_not_ready_until_connected() {
        let state = HealthState::new();
        let router = health_router(state.clone(), None);

        assert_eq!(get_status(router.clone(), "/health").await, StatusCode::OK);
        assert_eq!(
            get_status(router.clone(), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_connected(true).await;
        assert_eq!(get_status(router, "/readyz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_liveness() {
        let state = HealthState::new();
        state.set_connected(true).await;
        state.set_error("connection reset").await;

        assert!(state.is_alive().await);
        assert!(!state.is_ready().await);
        let status = state.status().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_fatal_fails_liveness() {
        let state = HealthState::new();
        state.set_fatal("retries exhausted").await;
        let router = health_router(state, None);

        assert_eq!(
            get_status(router, "/healthz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_metrics_route_only_with_handle() {
        let router = health_router(HealthState::new(), None);
        assert_eq!(get_status(router, "/metrics").await, StatusCode::NOT_FOUND);

        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let router = health_router(HealthState::new(), Some(handle));
        assert_eq!(get_status(router, "/metrics").await, StatusCode::OK);
    }
}
