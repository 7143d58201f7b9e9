use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::DispatchSettings;
use crate::error::DispatchError;
use crate::geo::haversine_km;
use crate::models::courier::Courier;
use crate::models::request::DeliveryRequest;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct CandidateCourier {
    pub courier: Courier,
    pub distance_to_origin_km: f64,
    pub total_route_km: f64,
}

/// Finds couriers able to take a request right now.
#[derive(Clone)]
pub struct CourierDirectory {
    store: Arc<dyn Store>,
    settings: Arc<DispatchSettings>,
}

impl CourierDirectory {
    pub fn new(store: Arc<dyn Store>, settings: Arc<DispatchSettings>) -> Self {
        Self { store, settings }
    }

    pub async fn find_candidates(
        &self,
        request: &DeliveryRequest,
    ) -> Result<Vec<CandidateCourier>, DispatchError> {
        let couriers = self.store.list_couriers().await?;
        Ok(filter_candidates(couriers, request, &self.settings, Utc::now()))
    }
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

/// Missing coordinates on either side exclude the courier; nothing here fails.
pub fn filter_candidates(
    couriers: Vec<Courier>,
    request: &DeliveryRequest,
    settings: &DispatchSettings,
    now: DateTime<Utc>,
) -> Vec<CandidateCourier> {
    let Some(origin) = request.pickup else {
        return Vec::new();
    };
    let freshness = to_chrono(settings.location_freshness);

    couriers
        .into_iter()
        .filter(|courier| courier.can_take_job(settings.max_concurrent_deliveries))
        .filter(|courier| courier.location_is_fresh(now, freshness))
        .filter_map(|courier| {
            let location = courier.location?;
            let distance_to_origin_km = haversine_km(&location, &origin);
            let total_route_km = distance_to_origin_km + request.distance_km;

            if total_route_km > courier.service_radius_km {
                return None;
            }

            Some(CandidateCourier {
                courier,
                distance_to_origin_km,
                total_route_km,
            })
        })
        .collect()
}
