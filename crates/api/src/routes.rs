//! HTTP routes
//!
//! The webhook endpoint acknowledges fast: verify the signature over the raw
//! bytes, hand persistence and processing to a detached task, answer 200.
//! The signature gate is the only thing that can reject a request; outcomes
//! land in the stored event row, never in this response.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;

use orderflow_fulfillment::{spawn_detached, FulfillmentError};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(stripe_webhook))
        .with_state(state)
}

async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = match headers.get("Stripe-Signature").and_then(|v| v.to_str().ok()) {
        Some(signature) => signature,
        None => {
            tracing::warn!("Webhook request without Stripe-Signature header");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "missing signature header" })),
            );
        }
    };

    let handler = state.fulfillment.webhooks.clone();

    let event = match handler.verify_event(&body, signature) {
        Ok(event) => event,
        Err(FulfillmentError::SignatureInvalid) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid signature" })),
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "Webhook payload rejected");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid payload" })),
            );
        }
    };

    // Persistence and processing both happen off the request path; once the
    // signature holds, nothing downstream can change the answer.
    spawn_detached(handler, event);

    (StatusCode::OK, Json(serde_json::json!({ "received": true })))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok" })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check database probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "degraded" })),
            )
        }
    }
}
