use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::models::courier::{Courier, CourierStatus, GeoPoint};
use crate::state::AppState;

const DEFAULT_SERVICE_RADIUS_KM: f64 = 10.0;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/couriers", post(register_courier).get(list_couriers))
        .route("/couriers/:id", get(get_courier))
        .route("/couriers/:id/status", patch(update_courier_status))
        .route("/couriers/:id/location", patch(update_courier_location))
        .route("/couriers/:id/availability", patch(update_courier_availability))
}

#[derive(Deserialize)]
pub struct RegisterCourierRequest {
    pub name: String,
    pub location: Option<GeoPoint>,
    pub service_radius_km: Option<f64>,
    pub max_concurrent_jobs: Option<u32>,
    pub rating: Option<f64>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: CourierStatus,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

#[derive(Deserialize)]
pub struct UpdateAvailabilityRequest {
    pub available: bool,
}

async fn register_courier(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterCourierRequest>,
) -> Result<Json<Courier>, DispatchError> {
    if payload.name.trim().is_empty() {
        return Err(DispatchError::BadRequest("name cannot be empty".to_string()));
    }

    let service_radius_km = payload.service_radius_km.unwrap_or(DEFAULT_SERVICE_RADIUS_KM);
    if service_radius_km <= 0.0 {
        return Err(DispatchError::BadRequest(
            "service_radius_km must be > 0".to_string(),
        ));
    }

    if payload.max_concurrent_jobs == Some(0) {
        return Err(DispatchError::BadRequest(
            "max_concurrent_jobs must be > 0".to_string(),
        ));
    }

    let now = Utc::now();
    let courier = Courier {
        id: Uuid::new_v4(),
        name: payload.name,
        status: CourierStatus::Active,
        available: true,
        location: payload.location,
        last_location_update: payload.location.map(|_| now),
        service_radius_km,
        max_concurrent_jobs: payload.max_concurrent_jobs,
        active_jobs: 0,
        rating: payload.rating.unwrap_or(0.0).clamp(0.0, 5.0),
        updated_at: now,
    };

    state.store.put_courier(courier.clone()).await?;
    Ok(Json(courier))
}

async fn list_couriers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Courier>>, DispatchError> {
    Ok(Json(state.store.list_couriers().await?))
}

async fn get_courier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Courier>, DispatchError> {
    let courier = state
        .store
        .get_courier(id)
        .await?
        .ok_or_else(|| DispatchError::NotFound(format!("courier {id} not found")))?;

    Ok(Json(courier))
}

async fn update_courier_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Courier>, DispatchError> {
    let courier = state
        .store
        .update_courier(
            id,
            Box::new(move |courier| {
                courier.status = payload.status;
                courier.updated_at = Utc::now();
                Ok(())
            }),
        )
        .await?;

    Ok(Json(courier))
}

async fn update_courier_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Courier>, DispatchError> {
    let courier = state
        .store
        .update_courier(
            id,
            Box::new(move |courier| {
                let now = Utc::now();
                courier.location = Some(payload.location);
                courier.last_location_update = Some(now);
                courier.updated_at = now;
                Ok(())
            }),
        )
        .await?;

    Ok(Json(courier))
}

async fn update_courier_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAvailabilityRequest>,
) -> Result<Json<Courier>, DispatchError> {
    let courier = state
        .store
        .update_courier(
            id,
            Box::new(move |courier| {
                courier.available = payload.available;
                courier.updated_at = Utc::now();
                Ok(())
            }),
        )
        .await?;

    Ok(Json(courier))
}
