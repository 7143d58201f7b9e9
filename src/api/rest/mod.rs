pub mod couriers;
pub mod fulfillments;
pub mod orders;
pub mod requests;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::DispatchError;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(couriers::router())
        .merge(orders::router())
        .merge(requests::router())
        .merge(fulfillments::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/delivery-fee", get(delivery_fee))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    couriers: usize,
    orders: usize,
    delivery_requests: usize,
    timeout_checks: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, DispatchError> {
    Ok(Json(HealthResponse {
        status: "ok",
        couriers: state.store.list_couriers().await?.len(),
        orders: state.store.list_orders().await?.len(),
        delivery_requests: state.store.list_requests().await?.len(),
        timeout_checks: state.store.list_timeout_checks().await?.len(),
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}

#[derive(Deserialize)]
pub struct FeeQuery {
    pub distance_km: f64,
}

#[derive(Serialize)]
pub struct FeeResponse {
    pub distance_km: f64,
    pub delivery_fee: f64,
}

async fn delivery_fee(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeeQuery>,
) -> Result<Json<FeeResponse>, DispatchError> {
    if !query.distance_km.is_finite() || query.distance_km < 0.0 {
        return Err(DispatchError::BadRequest(
            "distance_km must be a non-negative number".to_string(),
        ));
    }

    Ok(Json(FeeResponse {
        distance_km: query.distance_km,
        delivery_fee: state.engine.delivery_fee(query.distance_km),
    }))
}
