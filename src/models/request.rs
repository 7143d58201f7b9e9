use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::cancellation::Cancellation;
use crate::models::courier::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMethod {
    Auto,
    Manual,
}

/// A shop's ask for courier service on one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub order_id: Uuid,
    pub pickup_address: String,
    pub pickup: Option<GeoPoint>,
    pub delivery_address: String,
    pub dropoff: Option<GeoPoint>,
    pub distance_km: f64,
    pub requested_fee: f64,
    pub rider_fee: f64,
    pub priority: u8,
    pub status: RequestStatus,
    pub rider_id: Option<Uuid>,
    pub rejected_by: BTreeSet<Uuid>,
    pub notified_riders: BTreeSet<Uuid>,
    pub assignment_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub assignment_method: Option<AssignmentMethod>,
    pub assigned_by: Option<Uuid>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRequest {
    pub fn is_open(&self) -> bool {
        self.status == RequestStatus::Pending && self.rider_id.is_none()
    }

    /// Returns the ids that were not already in the notified set.
    pub fn record_notified<I>(&mut self, riders: I) -> Vec<Uuid>
    where
        I: IntoIterator<Item = Uuid>,
    {
        riders
            .into_iter()
            .filter(|id| self.notified_riders.insert(*id))
            .collect()
    }

    /// Returns false when the courier had already rejected.
    pub fn record_rejection(&mut self, courier_id: Uuid) -> bool {
        self.rejected_by.insert(courier_id)
    }

    /// Couriers that must not be offered this request again in a retry round.
    pub fn contacted(&self) -> BTreeSet<Uuid> {
        self.notified_riders
            .union(&self.rejected_by)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{DeliveryRequest, RequestStatus};

    fn request() -> DeliveryRequest {
        DeliveryRequest {
            id: Uuid::new_v4(),
            shop_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            pickup_address: "shop".to_string(),
            pickup: None,
            delivery_address: "home".to_string(),
            dropoff: None,
            distance_km: 1.0,
            requested_fee: 20.0,
            rider_fee: 20.0,
            priority: 10,
            status: RequestStatus::Pending,
            rider_id: None,
            rejected_by: BTreeSet::new(),
            notified_riders: BTreeSet::new(),
            assignment_attempts: 0,
            last_attempt_at: None,
            expires_at: None,
            assignment_method: None,
            assigned_by: None,
            accepted_at: None,
            cancellation: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn notified_set_union_is_idempotent() {
        let mut req = request();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        assert_eq!(req.record_notified([a, b]), vec![a, b]);
        assert_eq!(req.record_notified([b, a]), Vec::<Uuid>::new());
        assert_eq!(req.notified_riders.len(), 2);
    }

    #[test]
    fn rejection_is_recorded_once() {
        let mut req = request();
        let a = Uuid::from_u128(7);

        assert!(req.record_rejection(a));
        assert!(!req.record_rejection(a));
        assert_eq!(req.rejected_by.len(), 1);
    }

    #[test]
    fn contacted_covers_notified_and_rejected() {
        let mut req = request();
        req.record_notified([Uuid::from_u128(1)]);
        req.record_rejection(Uuid::from_u128(2));
        req.record_rejection(Uuid::from_u128(1));

        let contacted = req.contacted();
        assert_eq!(contacted.len(), 2);
    }
}
