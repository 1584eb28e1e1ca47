// handlers/donation_handlers.rs
use axum::{extract::State, response::Json, Extension};
use futures_util::TryStreamExt;
use mongodb::{bson::doc, Collection};
use serde_json::{json, Value};
use validator::Validate;

use crate::dtos::checkout_dtos::{CheckoutResponse, CreateDonationRequest};
use crate::errors::{AppError, Result};
use crate::models::donation::Donation;
use crate::models::user::Claims;
use crate::state::AppState;

pub async fn create_donation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateDonationRequest>,
) -> Result<Json<CheckoutResponse>> {
    payload
        .validate()
        .map_err(|e| AppError::invalid_data(e.to_string()))?;

    let service = state.checkout.clone().ok_or(AppError::GatewayUnavailable)?;
    let outcome = service.create_donation_checkout(&claims, payload).await?;
    Ok(Json(outcome))
}

pub async fn get_my_donations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>> {
    let collection: Collection<Donation> = state.db.collection("donations");

    let cursor = collection.find(doc! { "user_id": &claims.sub }).await?;
    let mut donations: Vec<Donation> = cursor.try_collect().await?;
    donations.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(Json(json!({
        "success": true,
        "donations": donations,
    })))
}
