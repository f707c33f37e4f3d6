//! Inbound HTTP gateway
//!
//! - `POST /send` - deliver a tenant payload now, or buffer it if the
//!   upstream is temporarily unreachable
//! - `GET /health` - liveness plus queue depth and credential count

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::credentials::CredentialStore;
use crate::delivery::{Deliver, DeliveryOutcome, FailureKind};
use crate::queue::{PersistentQueue, QueueError};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub delivery: Arc<dyn Deliver>,
    /// `None` when buffering is disabled
    pub queue: Option<Arc<PersistentQueue>>,
    pub credentials: CredentialStore,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default, alias = "app_key")]
    pub tenant_key: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SendResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl SendResponse {
    fn ok(message: impl Into<String>, id: Option<i64>) -> Self {
        Self {
            success: true,
            message: message.into(),
            id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub queue_size: usize,
    pub credentials: usize,
}

/// Errors surfaced to gateway callers
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("failed to send and queue message: queue is full")]
    QueueFull,

    #[error("failed to send and queue message")]
    Queue(#[source] QueueError),

    #[error("{0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<QueueError> for GatewayError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full { .. } => GatewayError::QueueFull,
            other => GatewayError::Queue(other),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = SendResponse {
            success: false,
            message: self.to_string(),
            id: None,
        };
        (self.status(), Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/send", post(send_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn send_handler(
    State(state): State<AppState>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SendResponse>), GatewayError> {
    let Json(request) =
        body.map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {}", e.body_text())))?;

    if request.tenant_key.is_empty() {
        return Err(GatewayError::BadRequest("tenant_key is required".to_string()));
    }
    if !request.data.as_object().is_some_and(|data| !data.is_empty()) {
        return Err(GatewayError::BadRequest("data is required".to_string()));
    }
    if state.credentials.lookup(&request.tenant_key).is_none() {
        return Err(GatewayError::BadRequest(
            "unknown tenant_key - not configured in agent".to_string(),
        ));
    }

    let outcome = state.delivery.send(&request.tenant_key, &request.data).await;

    match outcome {
        DeliveryOutcome::Delivered { .. } => Ok((
            StatusCode::OK,
            Json(SendResponse::ok("data sent successfully", None)),
        )),
        DeliveryOutcome::Failed { kind, reason, .. } => {
            if kind.is_retryable() {
                if let Some(queue) = state.queue.clone() {
                    let tenant_key = request.tenant_key.clone();
                    let id = buffer(queue, request).await?;
                    info!(tenant_key = %tenant_key, id, "Delivery deferred to offline queue");
                    return Ok((
                        StatusCode::ACCEPTED,
                        Json(SendResponse::ok(
                            "data queued for delivery (server unavailable)",
                            Some(id),
                        )),
                    ));
                }
            }

            if kind == FailureKind::UnknownCredential {
                return Err(GatewayError::BadRequest(reason));
            }
            Err(GatewayError::Upstream(reason))
        }
    }
}

/// Enqueue on the blocking pool; SQLite writes sync to disk
async fn buffer(queue: Arc<PersistentQueue>, request: SendRequest) -> Result<i64, GatewayError> {
    let tenant_key = request.tenant_key.clone();
    tokio::task::spawn_blocking(move || queue.enqueue(&request.tenant_key, &request.data))
        .await
        .map_err(|e| GatewayError::Internal(format!("queue task failed: {}", e)))?
        .map_err(|e| {
            error!(tenant_key = %tenant_key, "Failed to queue message: {}", e);
            GatewayError::from(e)
        })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue_size = match &state.queue {
        Some(queue) => queue.size().unwrap_or_else(|e| {
            error!("Failed to read queue size: {}", e);
            0
        }),
        None => 0,
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        queue_size,
        credentials: state.credentials.len(),
    })
}
