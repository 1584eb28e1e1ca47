use mongodb::bson::{oid::ObjectId, DateTime as BsonDateTime};
use serde::{Deserialize, Serialize};

/// In-app notification document written by the notification worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub user_id: String,
    pub title: String,
    pub body: String,
    pub kind: String,
    #[serde(default)]
    pub read: bool,

    pub created_at: BsonDateTime,
}
