use chrono::{DateTime, Utc};
use mongodb::bson::{self, oid::ObjectId};
use serde::{Deserialize, Serialize};

/// A purchasable paid program or event.
///
/// `limited_slot_count` is the atomic counter behind the limited-slot
/// discount; it is only ever moved through the guarded `$inc` in
/// `services::capacity`, never through a read-modify-write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offering {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub name: String,
    pub full_price: i64, // minor currency units

    // Limited-slot ("class rep") discount
    pub limited_slot_limit: Option<i64>,
    pub limited_slot_discount: Option<i64>,
    #[serde(default)]
    pub limited_slot_count: i64,

    // Early-bird discount, evaluated against the deadline at pricing time
    pub early_bird_deadline: Option<bson::DateTime>,
    pub early_bird_discount: Option<i64>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl Offering {
    pub fn is_early_bird_open(&self, now: DateTime<Utc>) -> bool {
        match (self.early_bird_deadline, self.early_bird_discount) {
            (Some(deadline), Some(discount)) => discount > 0 && now < deadline.to_chrono(),
            _ => false,
        }
    }
}
