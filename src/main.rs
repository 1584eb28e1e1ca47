use axum::extract::State;
use axum::{http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

mod config;
mod database;
mod dtos;
mod errors;
mod handlers;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

use database::connection::{ensure_indexes, get_db_client};
use services::capacity::MongoCapacityStore;
use services::checkout_service::CheckoutService;
use services::gateway_service::GatewayService;
use services::keyed_lock::{DistributedLock, KeyedLock, MongoLock};
use services::notifier::spawn_notification_worker;
use services::reconciler::WebhookReconciler;
use services::store::MongoPaymentStore;
use state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let db = get_db_client().await;
    ensure_indexes(&db).await;

    let app_state = initialize_app_state(db).await;

    let app = build_router(app_state).await;
    start_server(app).await;
}

async fn initialize_app_state(db: mongodb::Database) -> AppState {
    let locks = Arc::new(KeyedLock::new());
    let notifier = spawn_notification_worker(db.clone());

    let mut app_state = AppState::new(db.clone(), locks.clone(), notifier.clone());

    tracing::info!("Attempting to initialize payment gateway service...");

    // Missing gateway credentials disable checkout instead of killing the
    // process; webhook and checkout routes answer 503 until configured.
    let config_result = std::panic::catch_unwind(config::AppConfig::from_env);

    match config_result {
        Ok(config) => {
            tracing::info!("App config loaded successfully");
            tracing::info!("Gateway environment: {}", config.gateway_environment);

            let shared_lock: Option<Arc<dyn DistributedLock>> =
                match std::env::var("LOCK_BACKEND").as_deref() {
                    Ok("shared") => {
                        tracing::info!("Using shared Mongo-backed checkout lock");
                        Some(Arc::new(MongoLock::new(&db)))
                    }
                    _ => None,
                };

            let gateway = Arc::new(GatewayService::new(config));
            let store = Arc::new(MongoPaymentStore::new(&db));
            let capacity = Arc::new(MongoCapacityStore::new(&db));
            let checkout = Arc::new(CheckoutService::new(
                store.clone(),
                gateway.clone(),
                locks,
                shared_lock,
                capacity,
                notifier.clone(),
            ));
            let reconciler = Arc::new(WebhookReconciler::new(
                store,
                gateway.clone(),
                notifier,
            ));

            app_state = app_state.with_gateway(gateway, checkout, reconciler);
            tracing::info!("Payment gateway service initialized and ready");
        }
        Err(_) => {
            tracing::error!("Failed to load app config (panic caught)");
            tracing::warn!("Checkout and webhook processing will be disabled");
        }
    }

    app_state
}

async fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/api/health", get(api_health_check))
        .nest("/api/checkout", routes::checkout::routes())
        .nest("/api/donations", routes::donations::routes())
        .nest("/api/webhooks", routes::webhooks::routes())
        .layer(cors)
        .with_state(app_state)
}

async fn start_server(app: Router) {
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = SocketAddr::from(([0, 0, 0, 0], port.parse().unwrap_or(3000)));

    tracing::info!("Server starting on {}", addr);

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            axum::serve(listener, app).await.unwrap();
        }
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    }
}

async fn root_handler() -> &'static str {
    "Koinonia community platform API"
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_health_check(State(state): State<AppState>) -> Json<Value> {
    use mongodb::bson::doc;

    let db_status = match state.db.run_command(doc! {"ping": 1}).await {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    Json(json!({
        "status": "healthy",
        "database": db_status,
        "gateway": state.gateway.is_some(),
        "checkout_lock": state.locks.stats(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
