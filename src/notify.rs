use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::notification::Notification;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no subscribers for notification to {0}")]
    NoSubscribers(Uuid),

    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Push/in-app delivery. Dispatch never waits on or fails because of it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: Uuid,
        title: &str,
        body: &str,
        payload: Value,
    ) -> Result<(), NotifyError>;
}

/// Publishes notifications onto the in-process feed consumed by `/ws`.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<Notification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(
        &self,
        user_id: Uuid,
        title: &str,
        body: &str,
        payload: Value,
    ) -> Result<(), NotifyError> {
        self.tx
            .send(Notification::new(user_id, title, body, payload))
            .map(|_| ())
            .map_err(|_| NotifyError::NoSubscribers(user_id))
    }
}

/// Sends every notification concurrently on a detached task. Failures are
/// logged per recipient and never reach the caller.
pub fn fan_out(notifier: Arc<dyn Notifier>, notifications: Vec<Notification>) {
    if notifications.is_empty() {
        return;
    }

    tokio::spawn(async move {
        let sends = notifications.iter().map(|n| {
            let notifier = notifier.clone();
            async move {
                let result = notifier
                    .notify(n.user_id, &n.title, &n.body, n.payload.clone())
                    .await;
                (n.user_id, result)
            }
        });

        for (user_id, result) in join_all(sends).await {
            match result {
                Ok(()) => debug!(user_id = %user_id, "notification sent"),
                Err(NotifyError::NoSubscribers(_)) => {
                    debug!(user_id = %user_id, "no listeners for notification")
                }
                Err(err) => warn!(user_id = %user_id, error = %err, "notification failed"),
            }
        }
    });
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use super::testing::RecordingNotifier;
    use super::{fan_out, BroadcastNotifier, Notifier};
    use crate::models::notification::Notification;

    #[tokio::test]
    async fn one_failing_recipient_does_not_block_others() {
        let notifier = Arc::new(RecordingNotifier::default());
        let bad = Uuid::from_u128(1);
        let good = Uuid::from_u128(2);
        notifier.fail_for(bad);

        fan_out(
            notifier.clone(),
            vec![
                Notification::new(bad, "t", "b", json!({})),
                Notification::new(good, "t", "b", json!({})),
            ],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(notifier.recipients(), vec![good]);
    }

    #[tokio::test]
    async fn broadcast_notifier_reaches_subscribers() {
        let (tx, mut rx) = broadcast::channel(8);
        let notifier = BroadcastNotifier::new(tx);
        let user = Uuid::new_v4();

        notifier
            .notify(user, "New job", "pickup nearby", json!({ "k": 1 }))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.user_id, user);
        assert_eq!(received.payload["k"], 1);
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_an_error() {
        let (tx, _) = broadcast::channel::<Notification>(8);
        let notifier = BroadcastNotifier::new(tx);

        assert!(notifier
            .notify(Uuid::new_v4(), "t", "b", json!(null))
            .await
            .is_err());
    }
}
