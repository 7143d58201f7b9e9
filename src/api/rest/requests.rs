use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::dispatcher::{DispatchOutcome, RejectOutcome};
use crate::engine::scoring::ScoredCandidate;
use crate::error::DispatchError;
use crate::models::fulfillment::Fulfillment;
use crate::models::request::DeliveryRequest;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/delivery-requests/:id", get(get_request))
        .route("/delivery-requests/:id/candidates", get(list_candidates))
        .route("/delivery-requests/:id/auto-assign", post(auto_assign))
        .route("/delivery-requests/:id/manual-assign", post(manual_assign))
        .route("/delivery-requests/:id/accept", post(accept))
        .route("/delivery-requests/:id/reject", post(reject))
}

#[derive(Deserialize)]
pub struct CourierAction {
    pub courier_id: Uuid,
}

#[derive(Deserialize)]
pub struct ManualAssignRequest {
    pub courier_id: Uuid,
    pub assigned_by: Uuid,
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryRequest>, DispatchError> {
    let request = state
        .store
        .get_request(id)
        .await?
        .ok_or_else(|| DispatchError::NotFound(format!("delivery request {id} not found")))?;

    Ok(Json(request))
}

async fn list_candidates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ScoredCandidate>>, DispatchError> {
    Ok(Json(state.engine.find_candidates(id).await?))
}

async fn auto_assign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchOutcome>, DispatchError> {
    Ok(Json(state.engine.auto_assign(id).await?))
}

async fn manual_assign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ManualAssignRequest>,
) -> Result<Json<Fulfillment>, DispatchError> {
    let fulfillment = state
        .engine
        .manual_assign(id, payload.courier_id, payload.assigned_by)
        .await?;

    Ok(Json(fulfillment))
}

async fn accept(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierAction>,
) -> Result<Json<Fulfillment>, DispatchError> {
    Ok(Json(state.engine.accept_request(id, payload.courier_id).await?))
}

async fn reject(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierAction>,
) -> Result<Json<RejectOutcome>, DispatchError> {
    Ok(Json(state.engine.reject_request(id, payload.courier_id).await?))
}
