use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::cancellation::Cancellation;
use crate::models::courier::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Delivering,
    Completed,
    Cancelled,
}

/// The customer's order. Created elsewhere; dispatch only reads its
/// shop/customer/geo/fee fields and keeps the delivery back-references in sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub customer_id: Uuid,
    pub pickup_address: String,
    pub delivery_address: String,
    pub pickup: Option<GeoPoint>,
    pub dropoff: Option<GeoPoint>,
    pub food_cost: f64,
    /// Stamped at order creation; authoritative over recomputation.
    pub delivery_fee: Option<f64>,
    pub total_price: Option<f64>,
    pub status: OrderStatus,
    pub delivery_request_id: Option<Uuid>,
    pub fulfillment_id: Option<Uuid>,
    pub rider_id: Option<Uuid>,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
