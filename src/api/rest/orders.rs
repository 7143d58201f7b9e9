use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::cascade::CascadeReport;
use crate::engine::dispatcher::{DispatchOutcome, NewDeliveryRequest};
use crate::error::DispatchError;
use crate::models::cancellation::CancelledBy;
use crate::models::courier::GeoPoint;
use crate::models::order::{Order, OrderStatus};
use crate::models::request::DeliveryRequest;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/delivery-requests", post(create_delivery_request))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub shop_id: Uuid,
    pub customer_id: Uuid,
    pub pickup_address: String,
    pub delivery_address: String,
    pub pickup: Option<GeoPoint>,
    pub dropoff: Option<GeoPoint>,
    pub food_cost: f64,
    pub delivery_fee: Option<f64>,
    pub total_price: Option<f64>,
}

#[derive(Deserialize)]
pub struct CancelOrderRequest {
    pub cancelled_by: CancelledBy,
    pub actor_id: Option<Uuid>,
    pub note: Option<String>,
}

fn default_auto_assign() -> bool {
    true
}

#[derive(Deserialize)]
pub struct CreateDeliveryRequest {
    pub pickup: Option<GeoPoint>,
    pub dropoff: Option<GeoPoint>,
    pub pickup_address: Option<String>,
    pub delivery_address: Option<String>,
    #[serde(default = "default_auto_assign")]
    pub auto_assign: bool,
}

#[derive(Serialize)]
pub struct DeliveryRequestCreated {
    pub request: DeliveryRequest,
    pub dispatch: Option<DispatchOutcome>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, DispatchError> {
    if payload.food_cost < 0.0 {
        return Err(DispatchError::BadRequest("food_cost must be >= 0".to_string()));
    }

    let now = Utc::now();
    let order = Order {
        id: Uuid::new_v4(),
        shop_id: payload.shop_id,
        customer_id: payload.customer_id,
        pickup_address: payload.pickup_address,
        delivery_address: payload.delivery_address,
        pickup: payload.pickup,
        dropoff: payload.dropoff,
        food_cost: payload.food_cost,
        delivery_fee: payload.delivery_fee,
        total_price: payload.total_price,
        status: OrderStatus::Pending,
        delivery_request_id: None,
        fulfillment_id: None,
        rider_id: None,
        cancellation: None,
        created_at: now,
        updated_at: now,
    };

    state.store.insert_order(order.clone()).await?;
    Ok(Json(order))
}

async fn list_orders(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Order>>, DispatchError> {
    Ok(Json(state.store.list_orders().await?))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, DispatchError> {
    let order = state
        .store
        .get_order(id)
        .await?
        .ok_or_else(|| DispatchError::NotFound(format!("order {id} not found")))?;

    Ok(Json(order))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelOrderRequest>,
) -> Result<Json<CascadeReport>, DispatchError> {
    match payload.cancelled_by {
        CancelledBy::System => {
            return Err(DispatchError::BadRequest(
                "system cancellations cannot be requested over http".to_string(),
            ));
        }
        CancelledBy::Courier => {
            return Err(DispatchError::BadRequest(
                "couriers cancel through /fulfillments/:id/cancel".to_string(),
            ));
        }
        CancelledBy::Customer | CancelledBy::Shop | CancelledBy::Admin => {}
    }

    let report = state
        .engine
        .cancel_order(id, payload.cancelled_by, payload.actor_id, payload.note)
        .await?;

    Ok(Json(report))
}

async fn create_delivery_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CreateDeliveryRequest>,
) -> Result<Json<DeliveryRequestCreated>, DispatchError> {
    let request = state
        .engine
        .create_request(NewDeliveryRequest {
            order_id: id,
            pickup: payload.pickup,
            dropoff: payload.dropoff,
            pickup_address: payload.pickup_address,
            delivery_address: payload.delivery_address,
        })
        .await?;

    if !payload.auto_assign {
        return Ok(Json(DeliveryRequestCreated {
            request,
            dispatch: None,
        }));
    }

    let dispatch = state.engine.auto_assign(request.id).await?;
    let request = state
        .store
        .get_request(request.id)
        .await?
        .unwrap_or(request);

    Ok(Json(DeliveryRequestCreated {
        request,
        dispatch: Some(dispatch),
    }))
}
