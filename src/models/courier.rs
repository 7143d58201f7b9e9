use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CourierStatus {
    Active,
    Inactive,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Courier {
    pub id: Uuid,
    pub name: String,
    pub status: CourierStatus,
    /// Courier has toggled themselves on for new jobs.
    pub available: bool,
    pub location: Option<GeoPoint>,
    pub last_location_update: Option<DateTime<Utc>>,
    pub service_radius_km: f64,
    /// Per-courier override of the global concurrent delivery cap.
    pub max_concurrent_jobs: Option<u32>,
    pub active_jobs: u32,
    pub rating: f64,
    pub updated_at: DateTime<Utc>,
}

impl Courier {
    pub fn job_cap(&self, default_cap: u32) -> u32 {
        self.max_concurrent_jobs.unwrap_or(default_cap)
    }

    pub fn has_free_slot(&self, default_cap: u32) -> bool {
        self.active_jobs < self.job_cap(default_cap)
    }

    /// Active, switched on, and under its job cap.
    pub fn can_take_job(&self, default_cap: u32) -> bool {
        self.status == CourierStatus::Active && self.available && self.has_free_slot(default_cap)
    }

    pub fn location_is_fresh(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        match self.last_location_update {
            Some(updated) => now - updated <= window,
            None => false,
        }
    }
}
