use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    System,
    Customer,
    Shop,
    Courier,
    Admin,
}

/// Machine-readable reason codes, suitable for localized display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    ExhaustedRetries,
    NoNewCandidates,
    AllRidersRejected,
    StalePending,
    RequestClosed,
    CustomerCancelled,
    ShopCancelled,
    CourierCancelled,
    AdminCancelled,
}

impl CancellationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationReason::ExhaustedRetries => "exhausted_retries",
            CancellationReason::NoNewCandidates => "no_new_candidates",
            CancellationReason::AllRidersRejected => "all_riders_rejected",
            CancellationReason::StalePending => "stale_pending",
            CancellationReason::RequestClosed => "request_closed",
            CancellationReason::CustomerCancelled => "customer_cancelled",
            CancellationReason::ShopCancelled => "shop_cancelled",
            CancellationReason::CourierCancelled => "courier_cancelled",
            CancellationReason::AdminCancelled => "admin_cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cancellation {
    pub cancelled_by: CancelledBy,
    pub actor_id: Option<Uuid>,
    pub reason: CancellationReason,
    pub note: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

impl Cancellation {
    pub fn system(reason: CancellationReason) -> Self {
        Self {
            cancelled_by: CancelledBy::System,
            actor_id: None,
            reason,
            note: None,
            cancelled_at: Utc::now(),
        }
    }

    pub fn by(
        cancelled_by: CancelledBy,
        actor_id: Option<Uuid>,
        reason: CancellationReason,
        note: Option<String>,
    ) -> Self {
        Self {
            cancelled_by,
            actor_id,
            reason,
            note,
            cancelled_at: Utc::now(),
        }
    }
}
