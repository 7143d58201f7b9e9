use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::config::DispatchSettings;
use crate::engine::dispatcher::DispatchEngine;
use crate::engine::queue::TimeoutCheck;
use crate::models::notification::Notification;
use crate::notify::BroadcastNotifier;
use crate::observability::metrics::Metrics;
use crate::store::{InMemoryStore, Store};

pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub store: Arc<dyn Store>,
    pub notification_tx: broadcast::Sender<Notification>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        settings: DispatchSettings,
        timeout_queue_size: usize,
        event_buffer_size: usize,
    ) -> (Self, mpsc::Receiver<TimeoutCheck>) {
        let (timeout_tx, timeout_rx) = mpsc::channel(timeout_queue_size);
        let (notification_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(BroadcastNotifier::new(notification_tx.clone()));
        let metrics = Metrics::new();

        let engine = DispatchEngine::new(
            store.clone(),
            notifier,
            settings,
            metrics.clone(),
            timeout_tx,
        );

        (
            Self {
                engine: Arc::new(engine),
                store,
                notification_tx,
                metrics,
            },
            timeout_rx,
        )
    }
}
