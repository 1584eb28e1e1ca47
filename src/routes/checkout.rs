use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::handlers::checkout_handlers;
use crate::middleware::auth::auth_middleware;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(checkout_handlers::create_checkout))
        .route("/verify/:session_id", get(checkout_handlers::verify_checkout))
        .route("/:id/retry", post(checkout_handlers::retry_checkout))
        .route("/:id", delete(checkout_handlers::cancel_checkout))
        .route("/stats", get(checkout_handlers::lock_stats))
        .route_layer(middleware::from_fn(auth_middleware))
}
