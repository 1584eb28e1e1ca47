// services/gateway_service.rs
//
// Hand-rolled client for the hosted-checkout payment gateway. Sessions,
// subscription scheduling and webhook signature verification; everything
// else about payment state comes back through webhooks.
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{header, Client};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::errors::{AppError, Result};

/// Seconds of clock skew tolerated on webhook signatures.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// One-time charge (offering purchase, one-time gift).
    Payment,
    /// Recurring monthly subscription (recurring donation).
    Subscription,
}

impl SessionMode {
    fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Payment => "payment",
            SessionMode::Subscription => "subscription",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

/// Gateway operations the checkout and reconciliation flows depend on.
/// `GatewayService` is the HTTP implementation; tests substitute a fake.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a hosted checkout session. `metadata` rides along on the
    /// session and comes back verbatim in webhook events; it carries the
    /// local ids and the pricing breakdown.
    async fn create_checkout_session(
        &self,
        mode: SessionMode,
        amount_minor: i64,
        product_name: &str,
        customer_email: &str,
        metadata: &[(String, String)],
    ) -> Result<CheckoutSession>;

    /// Expire a session that is being superseded or cancelled. Callers
    /// treat failures as non-fatal; an unexpired session lapses on its own.
    async fn expire_session(&self, session_id: &str) -> Result<()>;

    /// Schedule gateway-side cancellation of a subscription at `cancel_at`
    /// (unix seconds). Used for recurring donations with a configured end
    /// date.
    async fn cancel_subscription_at(&self, subscription_id: &str, cancel_at: i64) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct GatewayService {
    config: AppConfig,
    client: Client,
    base_url: String,
}

impl GatewayService {
    pub fn new(config: AppConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        let base_url = config.gateway_base_url();

        GatewayService {
            config,
            client,
            base_url,
        }
    }

    /// Verify the `t=<unix>,v1=<hex hmac>` signature header against the
    /// raw request body. Timestamps older than the tolerance window are
    /// rejected outright.
    pub fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> Result<bool> {
        let mut timestamp: Option<&str> = None;
        let mut signature: Option<&str> = None;
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => signature = Some(value),
                _ => {}
            }
        }

        let (timestamp, signature) = match (timestamp, signature) {
            (Some(t), Some(s)) => (t, s),
            _ => return Ok(false),
        };

        let ts: i64 = match timestamp.parse() {
            Ok(ts) => ts,
            Err(_) => return Ok(false),
        };
        if (chrono::Utc::now().timestamp() - ts).abs() > SIGNATURE_TOLERANCE_SECS {
            return Ok(false);
        }

        let expected = match hex::decode(signature) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };

        let mut mac = HmacSha256::new_from_slice(self.config.gateway_webhook_secret.as_bytes())
            .map_err(|e| AppError::service(format!("HMAC init failed: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);

        Ok(mac.verify_slice(&expected).is_ok())
    }
}

#[async_trait]
impl PaymentGateway for GatewayService {
    async fn create_checkout_session(
        &self,
        mode: SessionMode,
        amount_minor: i64,
        product_name: &str,
        customer_email: &str,
        metadata: &[(String, String)],
    ) -> Result<CheckoutSession> {
        info!(
            "Opening {} checkout session for '{}' ({} minor units)",
            mode.as_str(),
            product_name,
            amount_minor
        );

        let mut params: Vec<(String, String)> = vec![
            ("mode".into(), mode.as_str().into()),
            ("success_url".into(), self.config.checkout_success_url.clone()),
            ("cancel_url".into(), self.config.checkout_cancel_url.clone()),
            ("customer_email".into(), customer_email.into()),
            ("line_items[0][quantity]".into(), "1".into()),
            ("line_items[0][price_data][currency]".into(), "usd".into()),
            (
                "line_items[0][price_data][unit_amount]".into(),
                amount_minor.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".into(),
                product_name.into(),
            ),
        ];
        if mode == SessionMode::Subscription {
            params.push((
                "line_items[0][price_data][recurring][interval]".into(),
                "month".into(),
            ));
        }
        for (key, value) in metadata {
            params.push((format!("metadata[{}]", key), value.clone()));
        }

        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.config.gateway_secret_key),
            )
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Checkout session create failed: {} - {}", status, body);
            return Err(AppError::gateway(format!(
                "session create failed: {}",
                status
            )));
        }

        let session: CheckoutSession = response.json().await?;
        info!("Checkout session opened: {}", session.id);
        Ok(session)
    }

    async fn expire_session(&self, session_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/v1/checkout/sessions/{}/expire",
                self.base_url, session_id
            ))
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.config.gateway_secret_key),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::gateway(format!(
                "session expire failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn cancel_subscription_at(&self, subscription_id: &str, cancel_at: i64) -> Result<()> {
        let params = [("cancel_at".to_string(), cancel_at.to_string())];
        let response = self
            .client
            .post(format!(
                "{}/v1/subscriptions/{}",
                self.base_url, subscription_id
            ))
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.config.gateway_secret_key),
            )
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::gateway(format!(
                "subscription cancel-at failed: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Records calls instead of talking HTTP, for exercising checkout and
/// reconciliation flows in tests.
#[cfg(test)]
#[derive(Default)]
pub struct FakeGateway {
    pub sessions_opened: std::sync::atomic::AtomicUsize,
    pub expired_sessions: tokio::sync::Mutex<Vec<String>>,
    pub scheduled_cancellations: tokio::sync::Mutex<Vec<(String, i64)>>,
}

#[cfg(test)]
#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        _mode: SessionMode,
        _amount_minor: i64,
        _product_name: &str,
        _customer_email: &str,
        _metadata: &[(String, String)],
    ) -> Result<CheckoutSession> {
        let n = self
            .sessions_opened
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(CheckoutSession {
            id: format!("cs_test_{}", n),
            url: Some("https://gateway.test/session".to_string()),
        })
    }

    async fn expire_session(&self, session_id: &str) -> Result<()> {
        self.expired_sessions
            .lock()
            .await
            .push(session_id.to_string());
        Ok(())
    }

    async fn cancel_subscription_at(&self, subscription_id: &str, cancel_at: i64) -> Result<()> {
        self.scheduled_cancellations
            .lock()
            .await
            .push((subscription_id.to_string(), cancel_at));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> GatewayService {
        let config = AppConfig {
            gateway_secret_key: "sk_test_xxx".to_string(),
            gateway_webhook_secret: "whsec_test123secret456".to_string(),
            gateway_environment: "sandbox".to_string(),
            checkout_success_url: "https://example.org/thanks".to_string(),
            checkout_cancel_url: "https://example.org/cancel".to_string(),
            jwt_secret: "test".to_string(),
            database_url: "mongodb://localhost".to_string(),
            port: 3000,
            host: "127.0.0.1".to_string(),
        };
        GatewayService::new(config)
    }

    fn sign(payload: &[u8], secret: &str, timestamp: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_valid_signature() {
        let svc = test_service();
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let ts = chrono::Utc::now().timestamp().to_string();
        let sig = sign(payload, "whsec_test123secret456", &ts);
        let header = format!("t={},v1={}", ts, sig);

        assert!(svc.verify_webhook_signature(payload, &header).unwrap());
    }

    #[test]
    fn rejects_wrong_secret() {
        let svc = test_service();
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let ts = chrono::Utc::now().timestamp().to_string();
        let sig = sign(payload, "wrong_secret", &ts);
        let header = format!("t={},v1={}", ts, sig);

        assert!(!svc.verify_webhook_signature(payload, &header).unwrap());
    }

    #[test]
    fn rejects_modified_payload() {
        let svc = test_service();
        let ts = chrono::Utc::now().timestamp().to_string();
        let sig = sign(b"{\"a\":1}", "whsec_test123secret456", &ts);
        let header = format!("t={},v1={}", ts, sig);

        assert!(!svc
            .verify_webhook_signature(b"{\"a\":2}", &header)
            .unwrap());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let svc = test_service();
        let payload = b"{}";
        let ts = (chrono::Utc::now().timestamp() - 600).to_string();
        let sig = sign(payload, "whsec_test123secret456", &ts);
        let header = format!("t={},v1={}", ts, sig);

        assert!(!svc.verify_webhook_signature(payload, &header).unwrap());
    }

    #[test]
    fn rejects_malformed_header() {
        let svc = test_service();
        assert!(!svc.verify_webhook_signature(b"{}", "garbage").unwrap());
        assert!(!svc.verify_webhook_signature(b"{}", "t=abc,v1=zz").unwrap());
        assert!(!svc.verify_webhook_signature(b"{}", "v1=deadbeef").unwrap());
    }
}
