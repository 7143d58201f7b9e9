use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::dispatcher::DispatchEngine;
use crate::error::DispatchError;
use crate::observability::metrics::Metrics;
use crate::store::Store;

/// Deferred re-check of one dispatch round. Persisted so it survives a
/// restart; acting on it always re-reads the request first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutCheck {
    pub request_id: Uuid,
    pub attempt: u32,
    pub due_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TimeoutScheduler {
    store: Arc<dyn Store>,
    tx: mpsc::Sender<TimeoutCheck>,
    metrics: Metrics,
}

impl TimeoutScheduler {
    pub fn new(store: Arc<dyn Store>, tx: mpsc::Sender<TimeoutCheck>, metrics: Metrics) -> Self {
        Self { store, tx, metrics }
    }

    pub async fn schedule(&self, check: TimeoutCheck) -> Result<(), DispatchError> {
        self.store.save_timeout_check(check.clone()).await?;
        self.enqueue(check).await;
        Ok(())
    }

    /// Hands an already-persisted check to the worker. A closed queue is only
    /// logged; the check stays in the store for recovery.
    pub async fn enqueue(&self, check: TimeoutCheck) {
        let request_id = check.request_id;
        match self.tx.send(check).await {
            Ok(()) => self.metrics.timeout_checks_pending.inc(),
            Err(err) => warn!(
                request_id = %request_id,
                error = %err,
                "timeout queue closed; check left for recovery"
            ),
        }
    }
}

pub async fn run_timeout_worker(engine: Arc<DispatchEngine>, mut check_rx: mpsc::Receiver<TimeoutCheck>) {
    info!("timeout worker started");

    while let Some(check) = check_rx.recv().await {
        let engine = engine.clone();

        tokio::spawn(async move {
            let wait = (check.due_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            sleep(wait).await;

            engine.metrics().timeout_checks_pending.dec();

            match engine.handle_timeout(check.request_id, check.attempt).await {
                Ok(outcome) => info!(
                    request_id = %check.request_id,
                    attempt = check.attempt,
                    outcome = ?outcome,
                    "timeout check handled"
                ),
                Err(err) => error!(
                    request_id = %check.request_id,
                    attempt = check.attempt,
                    error = %err,
                    "timeout check failed"
                ),
            }
        });
    }

    warn!("timeout worker stopped: queue channel closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::DispatchSettings;
    use crate::engine::dispatcher::DispatchOutcome;
    use crate::engine::testing::Harness;
    use crate::models::cancellation::CancellationReason;
    use crate::models::order::OrderStatus;
    use crate::models::request::RequestStatus;
    use crate::store::Store;

    #[tokio::test(start_paused = true)]
    async fn worker_cancels_unanswered_round_after_timeout() {
        let mut h = Harness::with_settings(DispatchSettings {
            assignment_timeout: Duration::from_secs(1),
            max_retry_attempts: 1,
            ..DispatchSettings::default()
        });
        h.spawn_timeout_worker();
        h.add_courier(1, 0.5, 4.5).await;
        let request = h.open_request().await;

        let outcome = h.engine.auto_assign(request.id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Notified { attempt: 1, .. }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.engine.metrics().timeout_checks_pending.get(), 1);
        assert_eq!(h.request(request.id).await.status, RequestStatus::Pending);

        tokio::time::sleep(Duration::from_secs(2)).await;

        let stored = h.request(request.id).await;
        assert_eq!(stored.status, RequestStatus::Cancelled);
        assert_eq!(
            stored.cancellation.unwrap().reason,
            CancellationReason::ExhaustedRetries
        );
        assert_eq!(h.order(request.order_id).await.status, OrderStatus::Cancelled);
        assert_eq!(h.engine.metrics().timeout_checks_pending.get(), 0);
        assert!(h.store.list_timeout_checks().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_leaves_accepted_request_alone() {
        let mut h = Harness::with_settings(DispatchSettings {
            assignment_timeout: Duration::from_secs(1),
            max_retry_attempts: 1,
            ..DispatchSettings::default()
        });
        h.spawn_timeout_worker();
        let courier = h.add_courier(1, 0.5, 4.5).await;
        let request = h.open_request().await;

        h.engine.auto_assign(request.id).await.unwrap();
        h.engine.accept_request(request.id, courier).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(h.request(request.id).await.status, RequestStatus::Accepted);
        assert_eq!(h.order(request.order_id).await.status, OrderStatus::Confirmed);
        assert_eq!(h.engine.metrics().timeout_checks_pending.get(), 0);
    }
}
