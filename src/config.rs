// config.rs
use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gateway_secret_key: String,
    pub gateway_webhook_secret: String,
    pub gateway_environment: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub jwt_secret: String,
    pub database_url: String,
    pub port: u16,
    pub host: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv().ok();

        let gateway_environment =
            env::var("GATEWAY_ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string());

        AppConfig {
            gateway_secret_key: env::var("GATEWAY_SECRET_KEY")
                .expect("GATEWAY_SECRET_KEY must be set"),
            gateway_webhook_secret: env::var("GATEWAY_WEBHOOK_SECRET")
                .expect("GATEWAY_WEBHOOK_SECRET must be set"),
            gateway_environment,
            checkout_success_url: env::var("CHECKOUT_SUCCESS_URL")
                .expect("CHECKOUT_SUCCESS_URL must be set"),
            checkout_cancel_url: env::var("CHECKOUT_CANCEL_URL")
                .expect("CHECKOUT_CANCEL_URL must be set"),
            jwt_secret: env::var("JWT_SECRET").expect("JWT_SECRET must be set"),
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("PORT must be a number"),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
        }
    }

    pub fn gateway_base_url(&self) -> String {
        if self.is_production() {
            env::var("GATEWAY_BASE_URL").unwrap_or_else(|_| "https://api.stripe.com".to_string())
        } else {
            env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://api.sandbox.stripe.com".to_string())
        }
    }

    pub fn is_production(&self) -> bool {
        self.gateway_environment == "production"
    }
}
