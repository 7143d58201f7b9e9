//! Legal status transitions for the entities dispatch touches.
//!
//! Every status write in the engine goes through `ensure_*` so an illegal
//! move surfaces as `InvalidState` instead of corrupting a record.

use crate::error::DispatchError;
use crate::models::fulfillment::FulfillmentStatus;
use crate::models::order::OrderStatus;
use crate::models::request::RequestStatus;

impl RequestStatus {
    pub fn can_transition_to(self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, to),
            (Pending, Accepted)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Accepted, InProgress)
                | (Accepted, Pending)   // courier gave the job back
                | (Accepted, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Pending)
                | (InProgress, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::Expired
        )
    }

    /// A courier is attached in exactly these states.
    pub fn requires_rider(self) -> bool {
        matches!(
            self,
            RequestStatus::Accepted | RequestStatus::InProgress | RequestStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Expired => "expired",
        }
    }
}

impl FulfillmentStatus {
    pub fn can_transition_to(self, to: FulfillmentStatus) -> bool {
        use FulfillmentStatus::*;
        matches!(
            (self, to),
            (Assigned, PickedUp)
                | (Assigned, Cancelled)
                | (PickedUp, Delivered)
                | (PickedUp, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FulfillmentStatus::Delivered | FulfillmentStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FulfillmentStatus::Assigned => "assigned",
            FulfillmentStatus::PickedUp => "picked_up",
            FulfillmentStatus::Delivered => "delivered",
            FulfillmentStatus::Cancelled => "cancelled",
        }
    }
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

pub fn ensure_request_transition(
    from: RequestStatus,
    to: RequestStatus,
) -> Result<(), DispatchError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(DispatchError::InvalidState(format!(
            "delivery request cannot move from {} to {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

pub fn ensure_fulfillment_transition(
    from: FulfillmentStatus,
    to: FulfillmentStatus,
) -> Result<(), DispatchError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(DispatchError::InvalidState(format!(
            "fulfillment cannot move from {} to {}",
            from.as_str(),
            to.as_str()
        )))
    }
}
