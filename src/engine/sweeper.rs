use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::cascade::applied;
use crate::engine::directory::to_chrono;
use crate::engine::dispatcher::{DispatchEngine, DispatchOutcome};
use crate::error::DispatchError;
use crate::models::cancellation::{Cancellation, CancellationReason, CancelledBy};
use crate::models::request::RequestStatus;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub stale_cancelled: usize,
    pub overdue_redispatched: usize,
    pub exhausted: usize,
    pub orphaned_orders_cancelled: usize,
}

/// Periodic housekeeping for requests the timeout worker cannot reach:
/// rounds that never started, checks lost in a crash, orders left behind by
/// a closed request.
#[derive(Clone)]
pub struct Sweeper {
    engine: Arc<DispatchEngine>,
}

impl Sweeper {
    pub fn new(engine: Arc<DispatchEngine>) -> Self {
        Self { engine }
    }

    /// Cancels unassigned pending requests older than the stale age.
    pub async fn cancel_stale_pending(&self, now: DateTime<Utc>) -> Result<usize, DispatchError> {
        let cutoff = now - to_chrono(self.engine.settings().stale_request_age);
        let mut cancelled = 0;

        for request in self.engine.store().list_requests().await? {
            if !request.is_open() || request.created_at > cutoff {
                continue;
            }

            let report = self
                .engine
                .cascade()
                .cancel_unassigned_request(
                    request.id,
                    Cancellation::system(CancellationReason::StalePending),
                )
                .await?;
            if report.request_cancelled {
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            info!(cancelled, "stale pending requests cancelled");
        }
        Ok(cancelled)
    }

    /// Pending requests past their expiry with no timeout check outstanding.
    /// Returns `(redispatched, exhausted)`.
    pub async fn retry_overdue(&self, now: DateTime<Utc>) -> Result<(usize, usize), DispatchError> {
        let store = self.engine.store();
        let outstanding: HashSet<(Uuid, u32)> = store
            .list_timeout_checks()
            .await?
            .into_iter()
            .map(|check| (check.request_id, check.attempt))
            .collect();
        let max_attempts = self.engine.settings().max_retry_attempts;

        let mut redispatched = 0;
        let mut exhausted = 0;

        for request in store.list_requests().await? {
            let overdue = request.expires_at.is_some_and(|at| at <= now);
            if !request.is_open()
                || !overdue
                || outstanding.contains(&(request.id, request.assignment_attempts))
            {
                continue;
            }

            if request.assignment_attempts >= max_attempts {
                let report = self
                    .engine
                    .cascade()
                    .cancel_unassigned_request(
                        request.id,
                        Cancellation::system(CancellationReason::ExhaustedRetries),
                    )
                    .await?;
                if report.request_cancelled {
                    exhausted += 1;
                    warn!(
                        request_id = %request.id,
                        attempts = request.assignment_attempts,
                        "overdue delivery request out of retries"
                    );
                }
                continue;
            }

            match applied(self.engine.auto_assign(request.id).await)? {
                Some(DispatchOutcome::Notified { attempt, .. }) => {
                    redispatched += 1;
                    debug!(request_id = %request.id, attempt, "overdue request re-dispatched");
                }
                Some(DispatchOutcome::NoAvailableRiders { .. }) | None => {}
            }
        }

        Ok((redispatched, exhausted))
    }

    /// Orders still open although their delivery request was cancelled or
    /// expired. Cancelled on behalf of the system with the request's reason.
    pub async fn cancel_orphaned_orders(&self) -> Result<usize, DispatchError> {
        let store = self.engine.store();
        let mut cancelled = 0;

        for order in store.list_orders().await? {
            if order.status.is_terminal() {
                continue;
            }
            let Some(request_id) = order.delivery_request_id else {
                continue;
            };
            let Some(request) = store.get_request(request_id).await? else {
                continue;
            };
            if !matches!(
                request.status,
                RequestStatus::Cancelled | RequestStatus::Expired
            ) {
                continue;
            }

            let reason = request
                .cancellation
                .map(|c| c.reason)
                .unwrap_or(CancellationReason::RequestClosed);
            let cancellation = Cancellation::by(
                CancelledBy::System,
                None,
                reason,
                Some(format!("delivery request {request_id} closed")),
            );

            let report = self.engine.cascade().cancel_order(order.id, cancellation).await?;
            if report.order_cancelled {
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            info!(cancelled, "orphaned orders cancelled");
        }
        Ok(cancelled)
    }

    pub async fn run_once(&self) -> Result<SweepReport, DispatchError> {
        let now = Utc::now();
        let stale_cancelled = self.cancel_stale_pending(now).await?;
        let (overdue_redispatched, exhausted) = self.retry_overdue(now).await?;
        let orphaned_orders_cancelled = self.cancel_orphaned_orders().await?;

        Ok(SweepReport {
            stale_cancelled,
            overdue_redispatched,
            exhausted,
            orphaned_orders_cancelled,
        })
    }
}

pub async fn run_sweeper(engine: Arc<DispatchEngine>, every: Duration) {
    let sweeper = Sweeper::new(engine);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(interval_secs = every.as_secs(), "sweeper started");

    loop {
        ticker.tick().await;
        match sweeper.run_once().await {
            Ok(report) => debug!(?report, "sweep finished"),
            Err(err) => error!(error = %err, "sweep failed"),
        }
    }
}
