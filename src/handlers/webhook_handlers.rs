// handlers/webhook_handlers.rs
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::{AppError, Result};
use crate::models::gateway_event::GatewayEvent;
use crate::state::AppState;

/// Gateway webhook ingress. The raw body is needed for signature
/// verification, so this handler takes `Bytes` and parses afterwards.
///
/// Ack policy: process-then-ack. A state-mutation failure returns 5xx and
/// the gateway redelivers; the payment-intent guard makes the redelivery
/// harmless.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let gateway = state.gateway.as_ref().ok_or(AppError::GatewayUnavailable)?;
    let reconciler = state.reconciler.as_ref().ok_or(AppError::GatewayUnavailable)?;

    let signature = headers
        .get("gateway-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::SignatureInvalid)?;

    if !gateway.verify_webhook_signature(&body, signature)? {
        warn!("Rejected webhook with invalid signature");
        return Err(AppError::SignatureInvalid);
    }

    let event: GatewayEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::invalid_data(format!("unparseable event: {}", e)))?;

    reconciler.process(&event).await?;

    Ok(Json(json!({ "received": true })))
}
