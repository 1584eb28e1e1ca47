// models/gateway_event.rs
//
// Serde views over the payment-gateway webhook payloads. Only the fields
// the reconciler reads are modeled; everything else is ignored so vendor
// payload growth never breaks parsing.
use serde::Deserialize;
use std::collections::HashMap;

pub const EVENT_CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const EVENT_INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const EVENT_SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const EVENT_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

#[derive(Debug, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    /// "payment" for one-time purchases, "subscription" for recurring.
    pub mode: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub payment_status: Option<String>,
    pub payment_method_details: Option<CardDetails>,
}

#[derive(Debug, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    pub subscription: Option<String>,
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    pub payment_method_details: Option<CardDetails>,
    pub last_payment_error: Option<PaymentError>,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: Option<String>,
    pub pause_collection: Option<PauseCollection>,
    /// Unix seconds for the end of the current billing period.
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardDetails {
    pub brand: Option<String>,
    pub last4: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PauseCollection {
    pub behavior: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentError {
    pub message: Option<String>,
    pub code: Option<String>,
}

impl GatewayEvent {
    pub fn object_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.object.clone())
    }
}
