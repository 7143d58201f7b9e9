use serde::{Deserialize, Serialize};

use crate::models::order::Order;

/// Distance-tiered delivery fee tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub minimum_fee: f64,
    pub base_km: f64,
    pub fee_per_km: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            minimum_fee: 20.0,
            base_km: 2.0,
            fee_per_km: 5.0,
        }
    }
}

impl FeeSchedule {
    pub fn delivery_fee(&self, distance_km: f64) -> f64 {
        delivery_fee(distance_km, self.minimum_fee, self.base_km, self.fee_per_km)
    }

    pub fn total_price(&self, food_cost: f64, distance_km: f64) -> f64 {
        food_cost + self.delivery_fee(distance_km)
    }

    /// The order's stamped total wins over a recomputed one.
    pub fn order_total(&self, order: &Order, distance_km: f64) -> f64 {
        order
            .total_price
            .unwrap_or_else(|| self.total_price(order.food_cost, distance_km))
    }

    /// The order's stamped delivery fee wins over a recomputed one.
    pub fn order_delivery_fee(&self, order: &Order, distance_km: f64) -> f64 {
        order
            .delivery_fee
            .unwrap_or_else(|| self.delivery_fee(distance_km))
    }
}

pub fn delivery_fee(distance_km: f64, minimum_fee: f64, base_km: f64, fee_per_km: f64) -> f64 {
    if distance_km <= base_km {
        minimum_fee
    } else {
        minimum_fee + (distance_km - base_km) * fee_per_km
    }
}
