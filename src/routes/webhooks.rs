use axum::{routing::post, Json, Router};
use chrono::Utc;
use serde_json::json;

use crate::handlers::webhook_handlers;
use crate::state::AppState;

/// Webhook ingress is unauthenticated; the signature check inside the
/// handler is the trust boundary.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/gateway", post(webhook_handlers::gateway_webhook))
        .route(
            "/health",
            axum::routing::get(|| async {
                Json(json!({
                    "status": "ok",
                    "service": "webhooks",
                    "timestamp": Utc::now().to_rfc3339(),
                }))
            }),
        )
}
