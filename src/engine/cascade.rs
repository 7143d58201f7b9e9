use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::engine::state_machine::ensure_fulfillment_transition;
use crate::error::DispatchError;
use crate::models::cancellation::Cancellation;
use crate::models::fulfillment::{Fulfillment, FulfillmentStatus};
use crate::models::notification::Notification;
use crate::models::order::OrderStatus;
use crate::models::request::RequestStatus;
use crate::notify::{fan_out, Notifier};
use crate::observability::metrics::Metrics;
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CascadeReport {
    pub request_cancelled: bool,
    pub fulfillment_cancelled: bool,
    pub order_cancelled: bool,
}

impl CascadeReport {
    pub fn changed_anything(&self) -> bool {
        self.request_cancelled || self.fulfillment_cancelled || self.order_cancelled
    }
}

/// Guard rejections and vanished records mean "nothing to do here".
pub(crate) fn applied<T>(result: Result<T, DispatchError>) -> Result<Option<T>, DispatchError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(DispatchError::InvalidState(_)) | Err(DispatchError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Request -> fulfillment -> order cancellation. Terminal records are left
/// alone, so running it twice is harmless.
#[derive(Clone)]
pub struct CascadeCanceller {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<DispatchSettings>,
    metrics: Metrics,
}

impl CascadeCanceller {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        settings: Arc<DispatchSettings>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            notifier,
            settings,
            metrics,
        }
    }

    pub async fn cancel_request(
        &self,
        request_id: Uuid,
        cancellation: Cancellation,
    ) -> Result<CascadeReport, DispatchError> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("delivery request {request_id} not found")))?;

        self.run(request.order_id, Some(request_id), cancellation, false)
            .await
    }

    /// Like `cancel_request`, but only while nobody holds the request. When a
    /// courier got there first the report comes back empty.
    pub async fn cancel_unassigned_request(
        &self,
        request_id: Uuid,
        cancellation: Cancellation,
    ) -> Result<CascadeReport, DispatchError> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("delivery request {request_id} not found")))?;

        self.run(request.order_id, Some(request_id), cancellation, true)
            .await
    }

    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        cancellation: Cancellation,
    ) -> Result<CascadeReport, DispatchError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("order {order_id} not found")))?;

        self.run(order_id, order.delivery_request_id, cancellation, false)
            .await
    }

    async fn run(
        &self,
        order_id: Uuid,
        request_id: Option<Uuid>,
        cancellation: Cancellation,
        only_if_open: bool,
    ) -> Result<CascadeReport, DispatchError> {
        let mut report = CascadeReport::default();

        if let Some(request_id) = request_id {
            if self.close_request(request_id, &cancellation, only_if_open).await? {
                report.request_cancelled = true;
            } else if only_if_open {
                return Ok(report);
            }
        }

        let mut riders = Vec::new();
        for fulfillment in self.store.fulfillments_for_order(order_id).await? {
            if fulfillment.status.is_terminal() {
                continue;
            }
            if let Some(cancelled) = self.cancel_fulfillment(fulfillment.id, &cancellation).await? {
                report.fulfillment_cancelled = true;
                riders.push(cancelled.rider_id);
                self.release_slot(cancelled.rider_id).await;
            }
        }

        let order_cancellation = cancellation.clone();
        let order = applied(
            self.store
                .update_order(
                    order_id,
                    Box::new(move |order| {
                        if order.status.is_terminal() {
                            return Err(DispatchError::InvalidState(
                                "order already closed".to_string(),
                            ));
                        }
                        order.status = OrderStatus::Cancelled;
                        order.fulfillment_id = None;
                        order.cancellation = Some(order_cancellation);
                        order.updated_at = Utc::now();
                        Ok(())
                    }),
                )
                .await,
        )?;

        // A request linked after the order was first read is only visible
        // here, once the order is closed and cannot take another link.
        if let Some(linked) = order
            .as_ref()
            .and_then(|order| order.delivery_request_id)
            .filter(|linked| Some(*linked) != request_id)
        {
            if self.close_request(linked, &cancellation, false).await? {
                report.request_cancelled = true;
            }
        }

        let reason = cancellation.reason.as_str();
        let payload = json!({
            "type": "delivery_cancelled",
            "order_id": order_id,
            "reason": reason,
        });
        let mut notifications: Vec<Notification> = riders
            .iter()
            .map(|rider| Notification::new(*rider, "Delivery cancelled", reason, payload.clone()))
            .collect();

        if let Some(order) = &order {
            report.order_cancelled = true;
            notifications.push(Notification::new(
                order.customer_id,
                "Order cancelled",
                reason,
                payload.clone(),
            ));
            notifications.push(Notification::new(
                order.shop_id,
                "Order cancelled",
                reason,
                payload.clone(),
            ));
        }
        fan_out(self.notifier.clone(), notifications);

        if report.changed_anything() {
            info!(
                order_id = %order_id,
                reason = cancellation.reason.as_str(),
                request_cancelled = report.request_cancelled,
                fulfillment_cancelled = report.fulfillment_cancelled,
                order_cancelled = report.order_cancelled,
                "cascade cancellation applied"
            );
        }

        Ok(report)
    }

    async fn close_request(
        &self,
        request_id: Uuid,
        cancellation: &Cancellation,
        only_if_open: bool,
    ) -> Result<bool, DispatchError> {
        let request_cancellation = cancellation.clone();
        let cancelled = applied(
            self.store
                .update_request(
                    request_id,
                    Box::new(move |request| {
                        if request.status.is_terminal() {
                            return Err(DispatchError::InvalidState(
                                "delivery request already closed".to_string(),
                            ));
                        }
                        if only_if_open && !request.is_open() {
                            return Err(DispatchError::InvalidState(
                                "delivery request already taken".to_string(),
                            ));
                        }
                        request.status = RequestStatus::Cancelled;
                        request.expires_at = None;
                        request.cancellation = Some(request_cancellation);
                        request.updated_at = Utc::now();
                        Ok(())
                    }),
                )
                .await,
        )?;

        if cancelled.is_some() {
            self.metrics
                .requests_cancelled_total
                .with_label_values(&[cancellation.reason.as_str()])
                .inc();
        }
        Ok(cancelled.is_some())
    }

    async fn cancel_fulfillment(
        &self,
        fulfillment_id: Uuid,
        cancellation: &Cancellation,
    ) -> Result<Option<Fulfillment>, DispatchError> {
        let cancellation = cancellation.clone();
        applied(
            self.store
                .update_fulfillment(
                    fulfillment_id,
                    Box::new(move |fulfillment| {
                        ensure_fulfillment_transition(
                            fulfillment.status,
                            FulfillmentStatus::Cancelled,
                        )?;
                        fulfillment.status = FulfillmentStatus::Cancelled;
                        fulfillment.cancellation = Some(cancellation);
                        fulfillment.updated_at = Utc::now();
                        Ok(())
                    }),
                )
                .await,
        )
    }

    /// Frees one job slot. Logged, not propagated: the cancellation itself
    /// has already been persisted.
    pub async fn release_slot(&self, courier_id: Uuid) {
        let result = self
            .store
            .update_courier(
                courier_id,
                Box::new(|courier| {
                    courier.active_jobs = courier.active_jobs.saturating_sub(1);
                    courier.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await;

        match result {
            Ok(courier) => self.metrics.record_utilization(
                &courier.id.to_string(),
                courier.active_jobs,
                courier.job_cap(self.settings.max_concurrent_deliveries),
            ),
            Err(err) => warn!(courier_id = %courier_id, error = %err, "failed to release courier job slot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::testing::Harness;
    use crate::models::cancellation::{Cancellation, CancellationReason, CancelledBy};
    use crate::models::order::OrderStatus;
    use crate::models::request::RequestStatus;

    fn admin_cancel() -> Cancellation {
        Cancellation::by(
            CancelledBy::Admin,
            None,
            CancellationReason::AdminCancelled,
            Some("duplicate order".to_string()),
        )
    }

    #[tokio::test]
    async fn running_twice_changes_nothing_the_second_time() {
        let h = Harness::new();
        let courier = h.add_courier(1, 0.5, 4.5).await;
        let request = h.open_request().await;
        h.engine.accept_request(request.id, courier).await.unwrap();

        let first = h
            .engine
            .cascade()
            .cancel_order(request.order_id, admin_cancel())
            .await
            .unwrap();
        let second = h
            .engine
            .cascade()
            .cancel_order(request.order_id, admin_cancel())
            .await
            .unwrap();

        assert!(first.request_cancelled && first.fulfillment_cancelled && first.order_cancelled);
        assert!(!second.changed_anything());
        assert_eq!(h.courier(courier).await.active_jobs, 0);
    }

    #[tokio::test]
    async fn unassigned_only_cancel_leaves_accepted_request_alone() {
        let h = Harness::new();
        let courier = h.add_courier(1, 0.5, 4.5).await;
        let request = h.open_request().await;
        h.engine.accept_request(request.id, courier).await.unwrap();

        let report = h
            .engine
            .cascade()
            .cancel_unassigned_request(
                request.id,
                Cancellation::system(CancellationReason::ExhaustedRetries),
            )
            .await
            .unwrap();

        assert!(!report.changed_anything());
        assert_eq!(h.request(request.id).await.status, RequestStatus::Accepted);
        assert_eq!(
            h.order(request.order_id).await.status,
            OrderStatus::Confirmed
        );
        assert_eq!(h.courier(courier).await.active_jobs, 1);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_undo_cancellation() {
        let h = Harness::new();
        let request = h.open_request().await;
        let order = h.order(request.order_id).await;
        h.notifier.fail_for(order.customer_id);

        let report = h
            .engine
            .cascade()
            .cancel_request(request.id, admin_cancel())
            .await
            .unwrap();
        h.settle().await;

        assert!(report.order_cancelled);
        assert_eq!(
            h.order(request.order_id).await.status,
            OrderStatus::Cancelled
        );
        assert_eq!(h.notifier.recipients(), vec![order.shop_id]);
    }
}
