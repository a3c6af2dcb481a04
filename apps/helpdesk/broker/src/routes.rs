//! `/publish/*` endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use messaging::{BrokerPublisher, JobRoute, MessagingError};
use serde_json::{json, Value};
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    publisher: BrokerPublisher,
}

/// Publish endpoints; health and metrics are merged in by the caller.
pub fn router(publisher: BrokerPublisher) -> Router {
    Router::new()
        .route("/publish/otp", post(publish_otp))
        .route("/publish/log", post(publish_log))
        .route("/publish/jobs/{routing_key}", post(publish_job))
        .with_state(AppState { publisher })
}

pub enum PublishError {
    BadRequest(String),
    Messaging(MessagingError),
}

impl From<JsonRejection> for PublishError {
    fn from(rejection: JsonRejection) -> Self {
        PublishError::BadRequest(rejection.body_text())
    }
}

impl From<MessagingError> for PublishError {
    fn from(err: MessagingError) -> Self {
        PublishError::Messaging(err)
    }
}

impl IntoResponse for PublishError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            PublishError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            PublishError::Messaging(MessagingError::ChannelNotReady) => (
                StatusCode::SERVICE_UNAVAILABLE,
                MessagingError::ChannelNotReady.to_string(),
            ),
            PublishError::Messaging(err) => {
                error!(error = %err, "Publish failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn publish(
    state: &AppState,
    routing_key: &str,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, PublishError> {
    let Json(message) = payload?;
    state.publisher.publish(routing_key, &message).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn publish_otp(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, PublishError> {
    publish(&state, JobRoute::MailOtp.routing_key(), payload).await
}

async fn publish_log(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, PublishError> {
    publish(&state, JobRoute::LogEvent.routing_key(), payload).await
}

/// Any recognized routing key; unknown keys are refused before reaching the broker.
async fn publish_job(
    State(state): State<AppState>,
    Path(routing_key): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, PublishError> {
    let route = JobRoute::parse(&routing_key);
    if !route.is_known() {
        return Err(PublishError::BadRequest(format!(
            "unknown routing key '{}'",
            routing_key
        )));
    }
    publish(&state, route.routing_key(), payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use messaging::{BrokerConfig, JobMetrics};
    use tower::ServiceExt;

    fn app() -> Router {
        router(BrokerPublisher::new(
            BrokerConfig::default(),
            JobMetrics::default(),
        ))
    }

    async fn post_json(uri: &str, body: &str) -> (StatusCode, Value) {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_publish_without_channel_is_503() {
        let (status, body) = post_json(
            "/publish/otp",
            r#"{"type":"SEND_OTP","to":"a@b.c","otp":"123456"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("channel not ready"));
    }

    #[tokio::test]
    async fn test_unknown_routing_key_is_400() {
        let (status, body) = post_json("/publish/jobs/reports.weekly", "{}").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unknown routing key 'reports.weekly'");
    }

    #[tokio::test]
    async fn test_known_routing_key_reaches_publisher() {
        // Passes validation, then fails on the unconnected channel
        let (status, _) = post_json("/publish/jobs/kb.ingest", r#"{"jobId":"j-1"}"#).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_invalid_json_is_400() {
        let (status, body) = post_json("/publish/log", "{not json").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }
}
