//! Shared fixtures for engine tests: an in-memory store, a recording
//! notifier and a shop with couriers placed at known distances.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::engine::dispatcher::{DispatchEngine, NewDeliveryRequest};
use crate::engine::queue::{run_timeout_worker, TimeoutCheck};
use crate::models::courier::{Courier, CourierStatus, GeoPoint};
use crate::models::order::{Order, OrderStatus};
use crate::models::request::DeliveryRequest;
use crate::notify::testing::RecordingNotifier;
use crate::observability::metrics::Metrics;
use crate::store::{InMemoryStore, Store};

pub const SHOP: GeoPoint = GeoPoint {
    lat: 13.75,
    lng: 100.50,
};

/// Customer drop-off used by every fixture order.
pub const DROPOFF_KM: f64 = 3.4;

pub fn north_of_shop(km: f64) -> GeoPoint {
    GeoPoint {
        lat: SHOP.lat + km / 111.195,
        lng: SHOP.lng,
    }
}

pub struct Harness {
    pub engine: Arc<DispatchEngine>,
    pub store: Arc<InMemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub timeouts: mpsc::Receiver<TimeoutCheck>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(DispatchSettings::default())
    }

    pub fn with_settings(settings: DispatchSettings) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let (tx, timeouts) = mpsc::channel(256);

        let engine = DispatchEngine::new(
            store.clone(),
            notifier.clone(),
            settings,
            Metrics::new(),
            tx,
        );

        Self {
            engine: Arc::new(engine),
            store,
            notifier,
            timeouts,
        }
    }

    /// Hands the timeout queue to a real worker. `timeouts` is left with a
    /// closed receiver.
    pub fn spawn_timeout_worker(&mut self) {
        let (_, closed) = mpsc::channel(1);
        let rx = std::mem::replace(&mut self.timeouts, closed);
        tokio::spawn(run_timeout_worker(self.engine.clone(), rx));
    }

    /// Active, available courier `km_from_shop` north of the shop with a
    /// 20 km service radius.
    pub async fn add_courier(&self, seed: u128, km_from_shop: f64, rating: f64) -> Uuid {
        let courier = Courier {
            id: Uuid::from_u128(seed),
            name: format!("courier-{seed}"),
            status: CourierStatus::Active,
            available: true,
            location: Some(north_of_shop(km_from_shop)),
            last_location_update: Some(Utc::now()),
            service_radius_km: 20.0,
            max_concurrent_jobs: None,
            active_jobs: 0,
            rating,
            updated_at: Utc::now(),
        };
        let id = courier.id;
        self.store.put_courier(courier).await.unwrap();
        id
    }

    pub async fn add_order(&self) -> Order {
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            shop_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            pickup_address: "Noodle House, Silom".to_string(),
            delivery_address: "Condo 12B, Sathorn".to_string(),
            pickup: Some(SHOP),
            dropoff: Some(north_of_shop(DROPOFF_KM)),
            food_cost: 120.0,
            delivery_fee: None,
            total_price: None,
            status: OrderStatus::Confirmed,
            delivery_request_id: None,
            fulfillment_id: None,
            rider_id: None,
            cancellation: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_order(order.clone()).await.unwrap();
        order
    }

    pub async fn open_request(&self) -> DeliveryRequest {
        let order = self.add_order().await;
        self.engine
            .create_request(NewDeliveryRequest {
                order_id: order.id,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    pub async fn request(&self, id: Uuid) -> DeliveryRequest {
        self.store.get_request(id).await.unwrap().unwrap()
    }

    pub async fn order(&self, id: Uuid) -> Order {
        self.store.get_order(id).await.unwrap().unwrap()
    }

    pub async fn courier(&self, id: Uuid) -> Courier {
        self.store.get_courier(id).await.unwrap().unwrap()
    }

    /// Lets detached notification tasks finish.
    pub async fn settle(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
