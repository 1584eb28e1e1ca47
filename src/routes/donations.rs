use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::handlers::donation_handlers;
use crate::middleware::auth::auth_middleware;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(donation_handlers::create_donation))
        .route("/mine", get(donation_handlers::get_my_donations))
        .route_layer(middleware::from_fn(auth_middleware))
}
