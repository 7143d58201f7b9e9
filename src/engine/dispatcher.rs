//! Drives a delivery request from `pending` to an accepted courier, or to a
//! cancellation once every retry round has run dry.
//!
//! A round searches the courier directory, scores what it finds, offers the
//! job to the top few couriers and schedules a timeout check. The check
//! re-reads the request and either does nothing (someone accepted), starts the
//! next round with couriers not yet contacted, or cancels the whole order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::engine::cascade::{applied, CascadeCanceller, CascadeReport};
use crate::engine::directory::{to_chrono, CourierDirectory};
use crate::engine::queue::{TimeoutCheck, TimeoutScheduler};
use crate::engine::scoring::{self, ScoredCandidate};
use crate::engine::state_machine::{ensure_fulfillment_transition, ensure_request_transition};
use crate::error::DispatchError;
use crate::geo::{haversine_km, priority_from_distance};
use crate::models::cancellation::{Cancellation, CancellationReason, CancelledBy};
use crate::models::courier::{Courier, CourierStatus, GeoPoint};
use crate::models::fulfillment::{Fulfillment, FulfillmentStatus, Reassignment};
use crate::models::notification::Notification;
use crate::models::order::{Order, OrderStatus};
use crate::models::request::{AssignmentMethod, DeliveryRequest, RequestStatus};
use crate::notify::{fan_out, Notifier};
use crate::observability::metrics::Metrics;
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct NewDeliveryRequest {
    pub order_id: Uuid,
    pub pickup: Option<GeoPoint>,
    pub dropoff: Option<GeoPoint>,
    pub pickup_address: Option<String>,
    pub delivery_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Notified {
        attempt: u32,
        riders: Vec<Uuid>,
        expires_at: DateTime<Utc>,
    },
    NoAvailableRiders {
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TimeoutOutcome {
    /// Accepted, cancelled or otherwise settled before the check fired.
    AlreadyResolved,
    /// A newer round owns the request.
    Superseded,
    Retried { attempt: u32, riders: Vec<Uuid> },
    Cancelled { reason: CancellationReason },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RejectOutcome {
    Recorded { remaining_candidates: usize },
    Cancelled { reason: CancellationReason },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CourierCancelOutcome {
    Reassigning { dispatch: DispatchOutcome },
    RequestClosed,
}

struct NotifiedRound {
    attempt: u32,
    riders: Vec<Uuid>,
    expires_at: DateTime<Utc>,
}

fn exhaustion_reason(err: &DispatchError) -> Option<CancellationReason> {
    match err {
        DispatchError::RetriesExhausted(_) => Some(CancellationReason::ExhaustedRetries),
        DispatchError::NoCandidates => Some(CancellationReason::NoNewCandidates),
        _ => None,
    }
}

pub struct DispatchEngine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<DispatchSettings>,
    directory: CourierDirectory,
    cascade: CascadeCanceller,
    scheduler: TimeoutScheduler,
    metrics: Metrics,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        settings: DispatchSettings,
        metrics: Metrics,
        timeout_tx: mpsc::Sender<TimeoutCheck>,
    ) -> Self {
        let settings = Arc::new(settings);

        Self {
            directory: CourierDirectory::new(store.clone(), settings.clone()),
            cascade: CascadeCanceller::new(
                store.clone(),
                notifier.clone(),
                settings.clone(),
                metrics.clone(),
            ),
            scheduler: TimeoutScheduler::new(store.clone(), timeout_tx, metrics.clone()),
            store,
            notifier,
            settings,
            metrics,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cascade(&self) -> &CascadeCanceller {
        &self.cascade
    }

    pub fn delivery_fee(&self, distance_km: f64) -> f64 {
        self.settings.fees.delivery_fee(distance_km)
    }

    async fn load_request(&self, id: Uuid) -> Result<DeliveryRequest, DispatchError> {
        self.store
            .get_request(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("delivery request {id} not found")))
    }

    async fn load_order(&self, id: Uuid) -> Result<Order, DispatchError> {
        self.store
            .get_order(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("order {id} not found")))
    }

    async fn load_courier(&self, id: Uuid) -> Result<Courier, DispatchError> {
        self.store
            .get_courier(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("courier {id} not found")))
    }

    async fn load_fulfillment(&self, id: Uuid) -> Result<Fulfillment, DispatchError> {
        self.store
            .get_fulfillment(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("fulfillment {id} not found")))
    }

    pub async fn create_request(
        &self,
        new: NewDeliveryRequest,
    ) -> Result<DeliveryRequest, DispatchError> {
        let order = self.load_order(new.order_id).await?;
        if order.status.is_terminal() {
            return Err(DispatchError::InvalidState(format!(
                "order {} is already closed",
                order.id
            )));
        }

        if let Some(existing_id) = order.delivery_request_id {
            if let Some(existing) = self.store.get_request(existing_id).await? {
                if !existing.status.is_terminal() {
                    return Err(DispatchError::InvalidState(format!(
                        "order {} already has live delivery request {existing_id}",
                        order.id
                    )));
                }
            }
        }

        let pickup = new.pickup.or(order.pickup);
        let dropoff = new.dropoff.or(order.dropoff);
        let distance_km = match (pickup, dropoff) {
            (Some(from), Some(to)) => haversine_km(&from, &to),
            _ => 0.0,
        };
        let fee = self.settings.fees.order_delivery_fee(&order, distance_km);
        let now = Utc::now();

        let request = DeliveryRequest {
            id: Uuid::new_v4(),
            shop_id: order.shop_id,
            order_id: order.id,
            pickup_address: new.pickup_address.unwrap_or_else(|| order.pickup_address.clone()),
            pickup,
            delivery_address: new
                .delivery_address
                .unwrap_or_else(|| order.delivery_address.clone()),
            dropoff,
            distance_km,
            requested_fee: fee,
            rider_fee: fee,
            priority: priority_from_distance(distance_km),
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
            created_at: now,
            updated_at: now,
        };

        // The request exists before the order points at it, so a cancel that
        // follows the link always finds something to close. Losing the link
        // closes the request again.
        let previous = order.delivery_request_id;
        let request_id = request.id;
        self.store.insert_request(request.clone()).await?;
        let linked = self
            .store
            .update_order(
                order.id,
                Box::new(move |order| {
                    if order.status.is_terminal() || order.delivery_request_id != previous {
                        return Err(DispatchError::InvalidState(format!(
                            "order {} changed while creating its delivery request",
                            order.id
                        )));
                    }
                    order.delivery_request_id = Some(request_id);
                    order.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await;
        if let Err(err) = linked {
            self.discard_unlinked_request(request_id).await;
            return Err(err);
        }

        info!(
            request_id = %request.id,
            order_id = %request.order_id,
            distance_km = request.distance_km,
            fee = request.requested_fee,
            priority = request.priority,
            "delivery request created"
        );

        Ok(request)
    }

    async fn discard_unlinked_request(&self, request_id: Uuid) {
        let result = self
            .store
            .update_request(
                request_id,
                Box::new(|request| {
                    request.status = RequestStatus::Cancelled;
                    request.cancellation =
                        Some(Cancellation::system(CancellationReason::RequestClosed));
                    request.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await;
        if let Err(err) = result {
            warn!(request_id = %request_id, error = %err, "failed to close unlinked delivery request");
        }
    }

    /// Ranked couriers that could take the request now, minus those who
    /// declined it.
    pub async fn find_candidates(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ScoredCandidate>, DispatchError> {
        let request = self.load_request(request_id).await?;
        let found = self.directory.find_candidates(&request).await?;
        let eligible: Vec<_> = found
            .into_iter()
            .filter(|candidate| !request.rejected_by.contains(&candidate.courier.id))
            .collect();
        Ok(scoring::rank(&eligible))
    }

    async fn top_candidates(
        &self,
        request: &DeliveryRequest,
        exclude: &BTreeSet<Uuid>,
    ) -> Result<Vec<ScoredCandidate>, DispatchError> {
        let found = self.directory.find_candidates(request).await?;
        let eligible: Vec<_> = found
            .into_iter()
            .filter(|candidate| !exclude.contains(&candidate.courier.id))
            .collect();

        let mut ranked = scoring::rank(&eligible);
        ranked.truncate(self.settings.notify_riders_count);
        Ok(ranked)
    }

    fn observe_round(&self, outcome: &str, started: Instant) {
        self.metrics
            .dispatch_rounds_total
            .with_label_values(&[outcome])
            .inc();
        self.metrics
            .dispatch_round_latency_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());
    }

    pub async fn auto_assign(&self, request_id: Uuid) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        let now = Utc::now();
        let expires_at = now + to_chrono(self.settings.assignment_timeout);

        // Expiry goes in before the search so a request nobody can take is
        // still revisited later.
        let request = self
            .store
            .update_request(
                request_id,
                Box::new(move |request| {
                    if request.status != RequestStatus::Pending {
                        return Err(DispatchError::InvalidState(format!(
                            "auto assignment needs a pending request, found {}",
                            request.status.as_str()
                        )));
                    }
                    if request.rider_id.is_some() {
                        return Err(DispatchError::AlreadyAssigned(request.id.to_string()));
                    }
                    request.priority = priority_from_distance(request.distance_km);
                    request.expires_at = Some(expires_at);
                    request.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        let candidates = self.top_candidates(&request, &request.rejected_by).await?;
        if candidates.is_empty() {
            self.observe_round("no_candidates", started);
            info!(request_id = %request_id, "no available riders; request left pending");
            return Ok(DispatchOutcome::NoAvailableRiders { expires_at });
        }

        let round = self.notify_round(&request, candidates).await?;
        self.observe_round("notified", started);

        Ok(DispatchOutcome::Notified {
            attempt: round.attempt,
            riders: round.riders,
            expires_at: round.expires_at,
        })
    }

    async fn notify_round(
        &self,
        request: &DeliveryRequest,
        candidates: Vec<ScoredCandidate>,
    ) -> Result<NotifiedRound, DispatchError> {
        let now = Utc::now();
        let expires_at = now + to_chrono(self.settings.assignment_timeout);
        let riders: Vec<Uuid> = candidates.iter().map(|c| c.courier_id).collect();
        let notified = riders.clone();

        let request = self
            .store
            .update_request(
                request.id,
                Box::new(move |request| {
                    if !request.is_open() {
                        return Err(DispatchError::InvalidState(
                            "delivery request resolved before riders were notified".to_string(),
                        ));
                    }
                    request.assignment_attempts += 1;
                    request.last_attempt_at = Some(now);
                    request.expires_at = Some(expires_at);
                    request.record_notified(notified);
                    request.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        let attempt = request.assignment_attempts;

        let notifications = candidates
            .iter()
            .map(|candidate| {
                Notification::new(
                    candidate.courier_id,
                    "New delivery request",
                    format!("{} -> {}", request.pickup_address, request.delivery_address),
                    json!({
                        "type": "delivery_request",
                        "request_id": request.id,
                        "order_id": request.order_id,
                        "distance_km": request.distance_km,
                        "rider_fee": request.rider_fee,
                        "priority": request.priority,
                        "distance_to_pickup_km": candidate.distance_to_origin_km,
                        "expires_at": expires_at,
                    }),
                )
            })
            .collect();
        fan_out(self.notifier.clone(), notifications);

        self.scheduler
            .schedule(TimeoutCheck {
                request_id: request.id,
                attempt,
                due_at: expires_at,
            })
            .await?;

        info!(
            request_id = %request.id,
            attempt,
            riders = riders.len(),
            "riders notified"
        );

        Ok(NotifiedRound {
            attempt,
            riders,
            expires_at,
        })
    }

    /// Runs when round `attempt` has gone unanswered for the full timeout.
    pub async fn handle_timeout(
        &self,
        request_id: Uuid,
        attempt: u32,
    ) -> Result<TimeoutOutcome, DispatchError> {
        let outcome = self.check_round(request_id, attempt).await;
        self.store.remove_timeout_check(request_id, attempt).await?;
        outcome
    }

    async fn check_round(
        &self,
        request_id: Uuid,
        attempt: u32,
    ) -> Result<TimeoutOutcome, DispatchError> {
        let Some(request) = self.store.get_request(request_id).await? else {
            return Ok(TimeoutOutcome::AlreadyResolved);
        };
        if !request.is_open() {
            return Ok(TimeoutOutcome::AlreadyResolved);
        }
        if request.assignment_attempts != attempt {
            return Ok(TimeoutOutcome::Superseded);
        }

        let started = Instant::now();
        let candidates = match self.next_round_candidates(&request, attempt).await {
            Ok(candidates) => candidates,
            Err(err) => {
                let Some(reason) = exhaustion_reason(&err) else {
                    return Err(err);
                };
                self.observe_round("exhausted", started);
                warn!(request_id = %request_id, attempt, reason = reason.as_str(), "dispatch gave up");

                let report = self
                    .cascade
                    .cancel_unassigned_request(request_id, Cancellation::system(reason))
                    .await?;
                return Ok(if report.request_cancelled {
                    TimeoutOutcome::Cancelled { reason }
                } else {
                    TimeoutOutcome::AlreadyResolved
                });
            }
        };

        match self.notify_round(&request, candidates).await {
            Ok(round) => {
                self.observe_round("notified", started);
                Ok(TimeoutOutcome::Retried {
                    attempt: round.attempt,
                    riders: round.riders,
                })
            }
            Err(DispatchError::InvalidState(_)) => Ok(TimeoutOutcome::AlreadyResolved),
            Err(err) => Err(err),
        }
    }

    async fn next_round_candidates(
        &self,
        request: &DeliveryRequest,
        attempt: u32,
    ) -> Result<Vec<ScoredCandidate>, DispatchError> {
        if attempt >= self.settings.max_retry_attempts {
            return Err(DispatchError::RetriesExhausted(attempt));
        }

        let candidates = self.top_candidates(request, &request.contacted()).await?;
        if candidates.is_empty() {
            return Err(DispatchError::NoCandidates);
        }
        Ok(candidates)
    }

    /// A courier takes a request it was offered. Exactly one concurrent
    /// caller wins; the others get `AlreadyAssigned`.
    pub async fn accept_request(
        &self,
        request_id: Uuid,
        courier_id: Uuid,
    ) -> Result<Fulfillment, DispatchError> {
        self.commit_assignment(request_id, courier_id, AssignmentMethod::Auto, None)
            .await
    }

    /// Admin override: skips scoring and the radius check, keeps every other
    /// acceptance rule.
    pub async fn manual_assign(
        &self,
        request_id: Uuid,
        courier_id: Uuid,
        assigned_by: Uuid,
    ) -> Result<Fulfillment, DispatchError> {
        self.commit_assignment(
            request_id,
            courier_id,
            AssignmentMethod::Manual,
            Some(assigned_by),
        )
        .await
    }

    async fn commit_assignment(
        &self,
        request_id: Uuid,
        courier_id: Uuid,
        method: AssignmentMethod,
        assigned_by: Option<Uuid>,
    ) -> Result<Fulfillment, DispatchError> {
        let settings = self.settings.clone();
        let result = self
            .store
            .commit_acceptance(
                request_id,
                courier_id,
                Box::new(move |request, order, courier| {
                    accept_into(request, order, courier, method, assigned_by, &settings)
                }),
            )
            .await;

        let fulfillment = match result {
            Ok(fulfillment) => fulfillment,
            Err(err) => {
                if let DispatchError::AlreadyAssigned(_) = err {
                    info!(request_id = %request_id, courier_id = %courier_id, "lost acceptance race");
                }
                return Err(err);
            }
        };

        let method_label = match method {
            AssignmentMethod::Auto => "auto",
            AssignmentMethod::Manual => "manual",
        };
        self.metrics
            .acceptances_total
            .with_label_values(&[method_label])
            .inc();
        if let Ok(courier) = self.load_courier(courier_id).await {
            self.metrics.record_utilization(
                &courier.id.to_string(),
                courier.active_jobs,
                courier.job_cap(self.settings.max_concurrent_deliveries),
            );
        }

        let payload = json!({
            "type": "rider_assigned",
            "request_id": request_id,
            "order_id": fulfillment.order_id,
            "fulfillment_id": fulfillment.id,
            "rider_id": courier_id,
        });
        let mut notifications = vec![
            Notification::new(
                fulfillment.customer_id,
                "Rider assigned",
                "A rider is on the way to the shop",
                payload.clone(),
            ),
            Notification::new(
                fulfillment.shop_id,
                "Rider assigned",
                "A rider accepted the delivery",
                payload.clone(),
            ),
        ];
        if method == AssignmentMethod::Manual {
            notifications.push(Notification::new(
                courier_id,
                "Delivery assigned",
                format!("{} -> {}", fulfillment.pickup_address, fulfillment.delivery_address),
                payload,
            ));
        }
        fan_out(self.notifier.clone(), notifications);

        info!(
            request_id = %request_id,
            courier_id = %courier_id,
            fulfillment_id = %fulfillment.id,
            method = method_label,
            "delivery request accepted"
        );

        Ok(fulfillment)
    }

    /// Adds the courier to the rejected set. Cancels straight away when that
    /// leaves nobody who could still take the job.
    pub async fn reject_request(
        &self,
        request_id: Uuid,
        courier_id: Uuid,
    ) -> Result<RejectOutcome, DispatchError> {
        self.load_courier(courier_id).await?;

        let request = self
            .store
            .update_request(
                request_id,
                Box::new(move |request| {
                    if !request.is_open() {
                        return Err(DispatchError::InvalidState(
                            "only pending, unassigned requests can be rejected".to_string(),
                        ));
                    }
                    request.record_rejection(courier_id);
                    request.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;

        let remaining_candidates = self
            .directory
            .find_candidates(&request)
            .await?
            .into_iter()
            .filter(|candidate| !request.rejected_by.contains(&candidate.courier.id))
            .count();

        info!(
            request_id = %request_id,
            courier_id = %courier_id,
            remaining_candidates,
            "delivery request rejected"
        );

        if remaining_candidates > 0 {
            return Ok(RejectOutcome::Recorded {
                remaining_candidates,
            });
        }

        let reason = CancellationReason::AllRidersRejected;
        let report = self
            .cascade
            .cancel_unassigned_request(request_id, Cancellation::system(reason))
            .await?;

        Ok(if report.request_cancelled {
            RejectOutcome::Cancelled { reason }
        } else {
            RejectOutcome::Recorded {
                remaining_candidates: 0,
            }
        })
    }

    /// The assigned courier hands an accepted job back. The request re-enters
    /// dispatch unless the order has meanwhile been cancelled.
    pub async fn courier_cancel(
        &self,
        fulfillment_id: Uuid,
        courier_id: Uuid,
        reason: String,
    ) -> Result<CourierCancelOutcome, DispatchError> {
        let fulfillment = self.load_fulfillment(fulfillment_id).await?;
        if fulfillment.rider_id != courier_id {
            return Err(DispatchError::InvalidState(
                "only the assigned courier can cancel this delivery".to_string(),
            ));
        }

        let now = Utc::now();
        let note = reason.clone();
        let cancelled = self
            .store
            .update_fulfillment(
                fulfillment_id,
                Box::new(move |fulfillment| {
                    ensure_fulfillment_transition(fulfillment.status, FulfillmentStatus::Cancelled)?;
                    fulfillment.status = FulfillmentStatus::Cancelled;
                    fulfillment.reassignment = Some(Reassignment {
                        previous_rider_id: courier_id,
                        reassignment_fee: fulfillment.rider_fee,
                        reason: note.clone(),
                    });
                    fulfillment.cancellation = Some(Cancellation::by(
                        CancelledBy::Courier,
                        Some(courier_id),
                        CancellationReason::CourierCancelled,
                        Some(note),
                    ));
                    fulfillment.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        self.cascade.release_slot(courier_id).await;

        let detached = applied(
            self.store
                .update_order(
                    cancelled.order_id,
                    Box::new(move |order| {
                        if order.status.is_terminal() {
                            return Err(DispatchError::InvalidState(format!(
                                "order {} is already closed",
                                order.id
                            )));
                        }
                        if order.fulfillment_id == Some(fulfillment_id) {
                            order.fulfillment_id = None;
                            order.rider_id = None;
                        }
                        if order.status == OrderStatus::Delivering {
                            order.status = OrderStatus::Confirmed;
                        }
                        order.updated_at = now;
                        Ok(())
                    }),
                )
                .await,
        )?;

        let Some(order) = detached else {
            let order = self.load_order(cancelled.order_id).await?;
            let cancellation = order
                .cancellation
                .unwrap_or_else(|| Cancellation::system(CancellationReason::RequestClosed));
            self.cascade
                .cancel_request(cancelled.request_id, cancellation)
                .await?;
            info!(
                fulfillment_id = %fulfillment_id,
                courier_id = %courier_id,
                "courier cancelled on a closed order; request finalized"
            );
            return Ok(CourierCancelOutcome::RequestClosed);
        };

        let reset = applied(
            self.store
                .update_request(
                    cancelled.request_id,
                    Box::new(move |request| {
                        if request.rider_id != Some(courier_id) {
                            return Err(DispatchError::InvalidState(
                                "delivery request is no longer held by this courier".to_string(),
                            ));
                        }
                        ensure_request_transition(request.status, RequestStatus::Pending)?;
                        request.status = RequestStatus::Pending;
                        request.rider_id = None;
                        request.assignment_method = None;
                        request.assigned_by = None;
                        request.accepted_at = None;
                        request.assignment_attempts += 1;
                        request.record_rejection(courier_id);
                        request.updated_at = now;
                        Ok(())
                    }),
                )
                .await,
        )?;
        if reset.is_none() {
            info!(
                fulfillment_id = %fulfillment_id,
                courier_id = %courier_id,
                "delivery request closed while the courier cancelled"
            );
            return Ok(CourierCancelOutcome::RequestClosed);
        }

        warn!(
            fulfillment_id = %fulfillment_id,
            courier_id = %courier_id,
            reason = %reason,
            "courier cancelled delivery; reassigning"
        );

        let payload = json!({
            "type": "rider_reassigning",
            "order_id": order.id,
            "request_id": cancelled.request_id,
        });
        fan_out(
            self.notifier.clone(),
            vec![
                Notification::new(
                    order.customer_id,
                    "Finding a new rider",
                    "Your rider had to cancel",
                    payload.clone(),
                ),
                Notification::new(
                    order.shop_id,
                    "Finding a new rider",
                    "The rider cancelled the delivery",
                    payload,
                ),
            ],
        );

        let dispatch = self.auto_assign(cancelled.request_id).await?;
        Ok(CourierCancelOutcome::Reassigning { dispatch })
    }

    pub async fn courier_pickup(
        &self,
        fulfillment_id: Uuid,
        courier_id: Uuid,
    ) -> Result<Fulfillment, DispatchError> {
        let now = Utc::now();
        let fulfillment = self
            .store
            .update_fulfillment(
                fulfillment_id,
                Box::new(move |fulfillment| {
                    if fulfillment.rider_id != courier_id {
                        return Err(DispatchError::InvalidState(
                            "only the assigned courier can pick up this delivery".to_string(),
                        ));
                    }
                    ensure_fulfillment_transition(fulfillment.status, FulfillmentStatus::PickedUp)?;
                    fulfillment.status = FulfillmentStatus::PickedUp;
                    fulfillment.picked_up_at = Some(now);
                    fulfillment.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        self.store
            .update_request(
                fulfillment.request_id,
                Box::new(move |request| {
                    ensure_request_transition(request.status, RequestStatus::InProgress)?;
                    request.status = RequestStatus::InProgress;
                    request.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        self.store
            .update_order(
                fulfillment.order_id,
                Box::new(move |order| {
                    if order.status.is_terminal() {
                        return Err(DispatchError::InvalidState(format!(
                            "order {} is already closed",
                            order.id
                        )));
                    }
                    order.status = OrderStatus::Delivering;
                    order.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        fan_out(
            self.notifier.clone(),
            vec![Notification::new(
                fulfillment.customer_id,
                "Order picked up",
                "Your food is on the way",
                json!({ "type": "picked_up", "fulfillment_id": fulfillment.id }),
            )],
        );
        info!(fulfillment_id = %fulfillment_id, courier_id = %courier_id, "order picked up");

        Ok(fulfillment)
    }

    pub async fn courier_deliver(
        &self,
        fulfillment_id: Uuid,
        courier_id: Uuid,
    ) -> Result<Fulfillment, DispatchError> {
        let now = Utc::now();
        let fulfillment = self
            .store
            .update_fulfillment(
                fulfillment_id,
                Box::new(move |fulfillment| {
                    if fulfillment.rider_id != courier_id {
                        return Err(DispatchError::InvalidState(
                            "only the assigned courier can complete this delivery".to_string(),
                        ));
                    }
                    ensure_fulfillment_transition(fulfillment.status, FulfillmentStatus::Delivered)?;
                    fulfillment.status = FulfillmentStatus::Delivered;
                    fulfillment.delivered_at = Some(now);
                    fulfillment.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        self.cascade.release_slot(courier_id).await;

        self.store
            .update_request(
                fulfillment.request_id,
                Box::new(move |request| {
                    ensure_request_transition(request.status, RequestStatus::Completed)?;
                    request.status = RequestStatus::Completed;
                    request.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        self.store
            .update_order(
                fulfillment.order_id,
                Box::new(move |order| {
                    if order.status.is_terminal() {
                        return Err(DispatchError::InvalidState(format!(
                            "order {} is already closed",
                            order.id
                        )));
                    }
                    order.status = OrderStatus::Completed;
                    order.fulfillment_id = None;
                    order.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        let payload = json!({ "type": "delivered", "fulfillment_id": fulfillment.id });
        fan_out(
            self.notifier.clone(),
            vec![
                Notification::new(
                    fulfillment.customer_id,
                    "Order delivered",
                    "Enjoy your meal",
                    payload.clone(),
                ),
                Notification::new(
                    fulfillment.shop_id,
                    "Order delivered",
                    "The rider completed the delivery",
                    payload,
                ),
            ],
        );
        info!(fulfillment_id = %fulfillment_id, courier_id = %courier_id, "order delivered");

        Ok(fulfillment)
    }

    pub async fn rate_fulfillment(
        &self,
        fulfillment_id: Uuid,
        rating: u8,
    ) -> Result<Fulfillment, DispatchError> {
        if !(1..=5).contains(&rating) {
            return Err(DispatchError::BadRequest(
                "rating must be between 1 and 5".to_string(),
            ));
        }

        self.store
            .update_fulfillment(
                fulfillment_id,
                Box::new(move |fulfillment| {
                    if fulfillment.status != FulfillmentStatus::Delivered {
                        return Err(DispatchError::InvalidState(
                            "only delivered jobs can be rated".to_string(),
                        ));
                    }
                    if fulfillment.rating.is_some() {
                        return Err(DispatchError::InvalidState(
                            "delivery has already been rated".to_string(),
                        ));
                    }
                    fulfillment.rating = Some(rating);
                    fulfillment.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await
    }

    /// Customer, shop or admin cancels the order and everything hanging off it.
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        cancelled_by: CancelledBy,
        actor_id: Option<Uuid>,
        note: Option<String>,
    ) -> Result<CascadeReport, DispatchError> {
        let order = self.load_order(order_id).await?;
        if order.status == OrderStatus::Completed {
            return Err(DispatchError::InvalidState(format!(
                "order {order_id} is already completed"
            )));
        }

        let reason = match cancelled_by {
            CancelledBy::Customer => CancellationReason::CustomerCancelled,
            CancelledBy::Shop => CancellationReason::ShopCancelled,
            CancelledBy::Admin | CancelledBy::System => CancellationReason::AdminCancelled,
            CancelledBy::Courier => {
                return Err(DispatchError::InvalidState(
                    "couriers hand back a delivery through the fulfillment, not the order"
                        .to_string(),
                ));
            }
        };

        self.cascade
            .cancel_order(order_id, Cancellation::by(cancelled_by, actor_id, reason, note))
            .await
    }

    /// Re-enqueues persisted timeout checks after a restart.
    pub async fn recover_timeout_checks(&self) -> Result<usize, DispatchError> {
        let checks = self.store.list_timeout_checks().await?;
        let count = checks.len();
        for check in checks {
            self.scheduler.enqueue(check).await;
        }
        if count > 0 {
            info!(count, "recovered timeout checks");
        }
        Ok(count)
    }
}

/// Validation and mutation for `pending -> accepted`. Runs inside the store's
/// acceptance lock; every check happens before the first write.
pub(crate) fn accept_into(
    request: &mut DeliveryRequest,
    order: &mut Order,
    courier: &mut Courier,
    method: AssignmentMethod,
    assigned_by: Option<Uuid>,
    settings: &DispatchSettings,
) -> Result<Fulfillment, DispatchError> {
    if request.rider_id.is_some() || request.status.requires_rider() {
        return Err(DispatchError::AlreadyAssigned(request.id.to_string()));
    }
    ensure_request_transition(request.status, RequestStatus::Accepted)?;

    if method == AssignmentMethod::Auto && request.rejected_by.contains(&courier.id) {
        return Err(DispatchError::InvalidState(format!(
            "courier {} already declined this request",
            courier.id
        )));
    }
    if courier.status != CourierStatus::Active || !courier.available {
        return Err(DispatchError::InvalidState(format!(
            "courier {} is not available for deliveries",
            courier.id
        )));
    }
    if !courier.has_free_slot(settings.max_concurrent_deliveries) {
        return Err(DispatchError::CapacityExceeded(courier.id.to_string()));
    }
    if method == AssignmentMethod::Auto {
        if let (Some(location), Some(origin)) = (courier.location, request.pickup) {
            let total_route_km = haversine_km(&location, &origin) + request.distance_km;
            if total_route_km > courier.service_radius_km {
                return Err(DispatchError::OutOfRange(courier.id.to_string()));
            }
        }
    }
    if order.status.is_terminal() {
        return Err(DispatchError::InvalidState(format!(
            "order {} is already closed",
            order.id
        )));
    }
    if order.fulfillment_id.is_some() {
        return Err(DispatchError::InvalidState(format!(
            "order {} already has an active fulfillment",
            order.id
        )));
    }

    let now = Utc::now();
    let fulfillment = Fulfillment {
        id: Uuid::new_v4(),
        order_id: order.id,
        request_id: request.id,
        shop_id: order.shop_id,
        customer_id: order.customer_id,
        rider_id: courier.id,
        pickup_address: request.pickup_address.clone(),
        pickup: request.pickup,
        delivery_address: request.delivery_address.clone(),
        dropoff: request.dropoff,
        distance_km: request.distance_km,
        delivery_fee: request.requested_fee,
        rider_fee: request.rider_fee,
        food_cost: order.food_cost,
        total_price: settings.fees.order_total(order, request.distance_km),
        status: FulfillmentStatus::Assigned,
        assignment_method: method,
        assigned_at: now,
        picked_up_at: None,
        delivered_at: None,
        reassignment: None,
        rating: None,
        cancellation: None,
        created_at: now,
        updated_at: now,
    };

    request.status = RequestStatus::Accepted;
    request.rider_id = Some(courier.id);
    request.assignment_method = Some(method);
    request.assigned_by = assigned_by;
    request.accepted_at = Some(now);
    request.expires_at = None;
    request.updated_at = now;

    order.fulfillment_id = Some(fulfillment.id);
    order.rider_id = Some(courier.id);
    order.updated_at = now;

    courier.active_jobs += 1;
    courier.updated_at = now;

    Ok(fulfillment)
}
