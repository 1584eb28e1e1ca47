use chrono::{DateTime, Utc};
use mongodb::bson::{self, oid::ObjectId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    LimitedSlot,
    EarlyBird,
    Promo,
}

/// One itemized fixed discount that was applied to a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub kind: DiscountKind,
    pub amount: i64,
}

/// Name/email captured at purchase time. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingSnapshot {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub user_id: String,
    pub offering_id: ObjectId,
    pub order_number: String,
    pub status: PurchaseStatus,

    // Pricing breakdown, all in minor currency units
    pub full_price: i64,
    pub fixed_discounts: Vec<AppliedDiscount>,
    pub percent_discount: Option<u32>,
    pub final_price: i64,

    pub is_limited_slot_holder: bool,
    pub is_early_bird: bool,
    pub promo_code: Option<String>,

    pub gateway_session_id: Option<String>,
    pub gateway_payment_intent_id: Option<String>,

    pub billing_snapshot: BillingSnapshot,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    pub purchase_date: Option<bson::DateTime>,
}
