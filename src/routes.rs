//! HTTP routes for the webhook ingress.
//!
//! One webhook endpoint receives Feishu event subscriptions; health and
//! readiness endpoints support deployment probes. Handler failures answer
//! 4xx/5xx to the platform but never take the server down.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::lark::{EventOutcome, LarkClient, LarkError};
use crate::logging::generate_trace_id;
use crate::message::InboundMessage;

const MAX_EVENT_BODY_BYTES: usize = 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// State
// ============================================================================

/// Shared state for the webhook server.
pub struct AppState {
    /// Platform client used for event parsing/decryption
    pub lark: Arc<LarkClient>,
    /// Channel forwarding inbound messages to the bridge processor
    pub message_tx: mpsc::Sender<InboundMessage>,
}

/// Create the shared state plus the receiving end of the ingress channel.
pub fn create_state(lark: Arc<LarkClient>) -> (Arc<AppState>, mpsc::Receiver<InboundMessage>) {
    let (message_tx, rx) = mpsc::channel(128);
    (Arc::new(AppState { lark, message_tx }), rx)
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct WebhookResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge: Option<String>,
}

impl WebhookResponse {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
            challenge: None,
        }
    }

    fn challenge(challenge: String) -> Self {
        Self {
            success: true,
            message: None,
            challenge: Some(challenge),
        }
    }

    fn error(message: String) -> Self {
        Self {
            success: false,
            message: Some(message),
            challenge: None,
        }
    }
}

// ============================================================================
// Health Routes
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "lark-bridge",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.message_tx.is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "not_ready",
                service: "lark-bridge",
                version: env!("CARGO_PKG_VERSION"),
            }),
        );
    }

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ready",
            service: "lark-bridge",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

// ============================================================================
// Lark Webhook
// ============================================================================

async fn lark_webhook(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    let trace_id = generate_trace_id();

    match state.lark.process_event(&body) {
        Ok(EventOutcome::Challenge(challenge)) => {
            (StatusCode::OK, Json(WebhookResponse::challenge(challenge)))
        }
        Ok(EventOutcome::Message(msg)) => {
            tracing::info!(
                trace_id = %trace_id,
                message_id = %msg.message_id,
                user_id = %msg.user_id,
                chat_kind = ?msg.chat_kind,
                "Inbound message received"
            );

            if let Err(e) = state.message_tx.send(msg).await {
                tracing::error!(trace_id = %trace_id, error = %e, "Failed to forward message");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(WebhookResponse::error(format!(
                        "Failed to forward message: {e}"
                    ))),
                );
            }

            (StatusCode::OK, Json(WebhookResponse::ok()))
        }
        Ok(EventOutcome::Ignored) => (StatusCode::OK, Json(WebhookResponse::ok())),
        Err(e @ LarkError::Auth(_)) => {
            tracing::warn!(trace_id = %trace_id, error = %e, "Rejected webhook event");
            (StatusCode::UNAUTHORIZED, Json(WebhookResponse::error(e.to_string())))
        }
        Err(e) => {
            tracing::error!(trace_id = %trace_id, error = %e, "Webhook event error");
            (StatusCode::BAD_REQUEST, Json(WebhookResponse::error(e.to_string())))
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Build the webhook router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/webhook/lark", post(lark_webhook))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(MAX_EVENT_BODY_BYTES))
        .with_state(state)
}
