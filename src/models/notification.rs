use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: Uuid, title: impl Into<String>, body: impl Into<String>, payload: Value) -> Self {
        Self {
            user_id,
            title: title.into(),
            body: body.into(),
            payload,
            sent_at: Utc::now(),
        }
    }
}
