// dtos/checkout_dtos.rs
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::donation::DonationType;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCheckoutRequest {
    #[validate(length(min = 1, message = "offering_id is required"))]
    pub offering_id: String,

    #[serde(default)]
    pub limited_slot_requested: bool,

    #[validate(length(min = 1, max = 64))]
    pub promo_code: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDonationRequest {
    #[validate(range(min = 1, message = "amount must be positive"))]
    pub amount: i64,

    pub donation_type: DonationType,

    /// Unix seconds; recurring donations only. The gateway-side
    /// cancellation is scheduled once the subscription exists.
    pub end_date: Option<i64>,
}

/// Result of a checkout attempt: either a gateway session to redirect the
/// client to, or an order completed locally on the zero-cost path.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CheckoutResponse {
    Session {
        session_id: String,
        session_url: String,
    },
    Completed {
        completed_order_id: String,
        order_number: String,
    },
}
