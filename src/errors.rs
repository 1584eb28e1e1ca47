// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MongoDB error: {0}")]
    MongoDB(#[from] mongodb::error::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Promo code invalid: {0}")]
    PromoInvalid(String),

    #[error("No discounted slots remaining")]
    CapacityExhausted,

    #[error("Final price {price} is below the gateway minimum of {minimum}")]
    PriceBelowMinimum { price: i64, minimum: i64 },

    #[error("Offering already purchased")]
    AlreadyPurchased,

    #[error("Timed out waiting for checkout lock: {0}")]
    LockTimeout(String),

    #[error("Payment gateway error: {0}")]
    GatewayError(String),

    #[error("Payment gateway is not available")]
    GatewayUnavailable,

    #[error("Webhook signature invalid")]
    SignatureInvalid,

    #[error("Document not found")]
    DocumentNotFound,

    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),

    #[error("Service error: {0}")]
    ServiceError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::MongoDB(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string()),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "Validation failed".to_string()),
            AppError::PromoInvalid(_) => (StatusCode::BAD_REQUEST, "Promo code invalid".to_string()),
            AppError::CapacityExhausted => (StatusCode::BAD_REQUEST, "Discounted slots are full".to_string()),
            AppError::PriceBelowMinimum { .. } => (StatusCode::BAD_REQUEST, "Price below chargeable minimum".to_string()),
            AppError::AlreadyPurchased => (StatusCode::CONFLICT, "Already purchased".to_string()),
            AppError::LockTimeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "Checkout busy, retry shortly".to_string()),
            AppError::GatewayError(_) => (StatusCode::BAD_GATEWAY, "Payment gateway error".to_string()),
            AppError::GatewayUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "Payment gateway unavailable".to_string()),
            AppError::SignatureInvalid => (StatusCode::BAD_REQUEST, "Invalid webhook signature".to_string()),
            AppError::DocumentNotFound => (StatusCode::NOT_FOUND, "Document not found".to_string()),
            AppError::InvalidObjectId(_) => (StatusCode::BAD_REQUEST, "Invalid ID format".to_string()),
            AppError::ServiceError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Service error".to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "message": self.to_string(),
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

// Manual From implementations
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ValidationError(format!("JSON parsing error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::GatewayError(format!("HTTP request failed: {}", err))
    }
}

impl From<mongodb::bson::oid::Error> for AppError {
    fn from(err: mongodb::bson::oid::Error) -> Self {
        AppError::InvalidObjectId(err.to_string())
    }
}

// Helper conversion functions
impl AppError {
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into())
    }

    pub fn promo(msg: impl Into<String>) -> Self {
        AppError::PromoInvalid(msg.into())
    }

    pub fn gateway(msg: impl Into<String>) -> Self {
        AppError::GatewayError(msg.into())
    }

    pub fn service(msg: impl Into<String>) -> Self {
        AppError::ServiceError(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
