// handlers/checkout_handlers.rs
use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use serde_json::{json, Value};
use std::sync::Arc;
use validator::Validate;

use crate::dtos::checkout_dtos::{CheckoutResponse, CreateCheckoutRequest};
use crate::errors::{AppError, Result};
use crate::models::user::Claims;
use crate::services::checkout_service::CheckoutService;
use crate::state::AppState;

fn checkout_service(state: &AppState) -> Result<Arc<CheckoutService>> {
    state.checkout.clone().ok_or(AppError::GatewayUnavailable)
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutResponse>> {
    payload
        .validate()
        .map_err(|e| AppError::invalid_data(e.to_string()))?;

    let service = checkout_service(&state)?;
    let outcome = service.create_checkout(&claims, payload).await?;
    Ok(Json(outcome))
}

pub async fn verify_checkout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>> {
    let service = checkout_service(&state)?;
    let purchase = service.verify_session(&claims.sub, &session_id).await?;

    Ok(Json(json!({
        "success": true,
        "purchase": purchase,
    })))
}

pub async fn retry_checkout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(purchase_id): Path<String>,
) -> Result<Json<CheckoutResponse>> {
    let service = checkout_service(&state)?;
    let outcome = service.retry(&claims, &purchase_id).await?;
    Ok(Json(outcome))
}

pub async fn cancel_checkout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(purchase_id): Path<String>,
) -> Result<Json<Value>> {
    let service = checkout_service(&state)?;
    let purchase = service.cancel(&claims, &purchase_id).await?;

    Ok(Json(json!({
        "success": true,
        "purchase": purchase,
    })))
}

pub async fn lock_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "checkout_lock": state.locks.stats(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
