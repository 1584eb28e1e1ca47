use chrono::{DateTime, Utc};
use mongodb::bson::{self, oid::ObjectId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromoCodeType {
    /// Fixed-amount discount granted with a bundle, bound to one owner.
    FixedBundle,
    /// Percentage discount for staff, restricted to an offering allow-list.
    PercentStaff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoCode {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub code: String,
    pub code_type: PromoCodeType,
    pub discount_amount: Option<i64>,
    pub discount_percent: Option<u32>,

    /// None means a general/shared code usable by any account.
    pub owner_user_id: Option<String>,
    /// When present, the code only applies to these offerings.
    pub eligible_offering_ids: Option<Vec<ObjectId>>,

    #[serde(default)]
    pub used: bool,
    pub used_by: Option<String>,
    pub used_at: Option<bson::DateTime>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl PromoCode {
    pub fn is_general(&self) -> bool {
        self.owner_user_id.is_none()
    }

    pub fn applies_to(&self, offering_id: &ObjectId) -> bool {
        match &self.eligible_offering_ids {
            Some(ids) => ids.contains(offering_id),
            None => true,
        }
    }
}
