use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::dispatcher::CourierCancelOutcome;
use crate::error::DispatchError;
use crate::models::fulfillment::Fulfillment;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/fulfillments/:id", get(get_fulfillment))
        .route("/fulfillments/:id/pickup", post(pickup))
        .route("/fulfillments/:id/deliver", post(deliver))
        .route("/fulfillments/:id/cancel", post(cancel))
        .route("/fulfillments/:id/rate", post(rate))
}

#[derive(Deserialize)]
pub struct CourierAction {
    pub courier_id: Uuid,
}

#[derive(Deserialize)]
pub struct CourierCancelRequest {
    pub courier_id: Uuid,
    pub reason: String,
}

#[derive(Deserialize)]
pub struct RateRequest {
    pub rating: u8,
}

async fn get_fulfillment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Fulfillment>, DispatchError> {
    let fulfillment = state
        .store
        .get_fulfillment(id)
        .await?
        .ok_or_else(|| DispatchError::NotFound(format!("fulfillment {id} not found")))?;

    Ok(Json(fulfillment))
}

async fn pickup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierAction>,
) -> Result<Json<Fulfillment>, DispatchError> {
    Ok(Json(state.engine.courier_pickup(id, payload.courier_id).await?))
}

async fn deliver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierAction>,
) -> Result<Json<Fulfillment>, DispatchError> {
    Ok(Json(state.engine.courier_deliver(id, payload.courier_id).await?))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierCancelRequest>,
) -> Result<Json<CourierCancelOutcome>, DispatchError> {
    if payload.reason.trim().is_empty() {
        return Err(DispatchError::BadRequest("reason cannot be empty".to_string()));
    }

    let outcome = state
        .engine
        .courier_cancel(id, payload.courier_id, payload.reason)
        .await?;

    Ok(Json(outcome))
}

async fn rate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RateRequest>,
) -> Result<Json<Fulfillment>, DispatchError> {
    Ok(Json(state.engine.rate_fulfillment(id, payload.rating).await?))
}
