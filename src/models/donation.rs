use chrono::{DateTime, Utc};
use mongodb::bson::{self, oid::ObjectId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    Pending,
    Active,
    Completed,
    Failed,
    OnHold,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationType {
    OneTime,
    Monthly,
}

/// A one-time or recurring contribution. After creation, status changes
/// come exclusively from the webhook reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Donation {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub user_id: String,
    pub amount: i64,
    pub donation_type: DonationType,
    pub status: DonationStatus,

    pub gateway_customer_id: Option<String>,
    pub gateway_subscription_id: Option<String>,

    pub last_gift_date: Option<bson::DateTime>,
    pub next_payment_date: Option<bson::DateTime>,
    pub end_date: Option<bson::DateTime>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}
