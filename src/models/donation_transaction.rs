use chrono::{DateTime, Utc};
use mongodb::bson::{self, oid::ObjectId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethodInfo {
    pub brand: Option<String>,
    pub last4: Option<String>,
}

/// Ledger row for one payment attempt, successful or not.
///
/// `gateway_payment_intent_id` carries a sparse unique index: it is the
/// idempotency key that makes duplicate webhook delivery safe. Rows are
/// never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonationTransaction {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub donation_id: Option<ObjectId>,
    pub user_id: String,
    pub amount: i64,
    pub transaction_type: String, // "one_time" | "recurring" | "purchase"
    pub status: TransactionStatus,

    pub gateway_payment_intent_id: Option<String>,
    pub failure_reason: Option<String>,
    pub payment_method: Option<PaymentMethodInfo>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub gift_date: DateTime<Utc>,
}
