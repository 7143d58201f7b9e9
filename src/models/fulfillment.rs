use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::cancellation::Cancellation;
use crate::models::courier::GeoPoint;
use crate::models::request::AssignmentMethod;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Assigned,
    PickedUp,
    Delivered,
    Cancelled,
}

/// Set on a fulfillment the assigned courier abandoned, so the job can be
/// handed to someone else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reassignment {
    pub previous_rider_id: Uuid,
    pub reassignment_fee: f64,
    pub reason: String,
}

/// Operational record of an accepted delivery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fulfillment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub request_id: Uuid,
    pub shop_id: Uuid,
    pub customer_id: Uuid,
    pub rider_id: Uuid,
    pub pickup_address: String,
    pub pickup: Option<GeoPoint>,
    pub delivery_address: String,
    pub dropoff: Option<GeoPoint>,
    pub distance_km: f64,
    pub delivery_fee: f64,
    pub rider_fee: f64,
    pub food_cost: f64,
    pub total_price: f64,
    pub status: FulfillmentStatus,
    pub assignment_method: AssignmentMethod,
    pub assigned_at: DateTime<Utc>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub reassignment: Option<Reassignment>,
    pub rating: Option<u8>,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
