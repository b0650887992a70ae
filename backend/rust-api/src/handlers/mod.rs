use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DuelError;
use crate::metrics;
use crate::services::AppState;

pub mod duels;

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut dependencies = serde_json::Map::new();

    let store = probe(Duration::from_secs(1), state.store.health_check()).await;
    let jobs = probe(Duration::from_millis(500), state.jobs.health_check()).await;
    let all_healthy = store.get("status").and_then(|v| v.as_str()) == Some("healthy")
        && jobs.get("status").and_then(|v| v.as_str()) == Some("healthy");
    dependencies.insert("duel_store".to_string(), json!(store));
    dependencies.insert("job_queue".to_string(), json!(jobs));

    let (status_code, status) = if all_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": "quiz-duel-api",
            "version": env!("CARGO_PKG_VERSION"),
            "dependencies": dependencies
        })),
    )
}

async fn probe<F, E>(limit: Duration, check: F) -> serde_json::Map<String, serde_json::Value>
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut result = serde_json::Map::new();

    match tokio::time::timeout(limit, check).await {
        Ok(Ok(())) => {
            result.insert("status".to_string(), json!("healthy"));
        }
        Ok(Err(e)) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!(e.to_string()));
        }
        Err(_) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert(
                "error".to_string(),
                json!(format!("timeout after {}ms", limit.as_millis())),
            );
        }
    }

    result
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }
}

impl From<DuelError> for ApiError {
    fn from(err: DuelError) -> Self {
        match err {
            DuelError::BadRequest(message) => ApiError::BadRequest(message),
            DuelError::Forbidden(message) => ApiError::Forbidden(message),
            DuelError::NotFound(message) => ApiError::NotFound(message),
            DuelError::Internal(message) => ApiError::Internal(message),
            DuelError::Store(err) => {
                tracing::error!(error = %err, "duel store failure");
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Forbidden(message) => (StatusCode::FORBIDDEN, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (
            status,
            Json(json!({ "message": message, "status": status.as_u16() })),
        )
            .into_response()
    }
}
