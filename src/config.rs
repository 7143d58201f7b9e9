use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::DispatchError;
use crate::geo::pricing::FeeSchedule;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub timeout_queue_size: usize,
    pub event_buffer_size: usize,
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, DispatchError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            timeout_queue_size: ensure_positive(
                "TIMEOUT_QUEUE_SIZE",
                parse_or_default("TIMEOUT_QUEUE_SIZE", 1024)?,
            )?,
            event_buffer_size: ensure_positive(
                "EVENT_BUFFER_SIZE",
                parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            )?,
            sweep_interval: Duration::from_secs(parse_or_default("SWEEP_INTERVAL_SECONDS", 60)?),
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, DispatchError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| DispatchError::Config(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

/// Channel capacities must be non-zero; tokio panics on an empty channel.
fn ensure_positive(key: &str, value: usize) -> Result<usize, DispatchError> {
    if value == 0 {
        return Err(DispatchError::Config(format!("{key} must be > 0")));
    }
    Ok(value)
}

/// Source of runtime-tunable dispatch settings.
pub trait ConfigStore: Send + Sync {
    fn get_setting(&self, key: &str) -> Option<String>;
}

/// Reads settings from upper-cased environment variables
/// (`delivery_minimum_fee` -> `DELIVERY_MINIMUM_FEE`).
#[derive(Debug, Default, Clone)]
pub struct EnvConfigStore;

impl ConfigStore for EnvConfigStore {
    fn get_setting(&self, key: &str) -> Option<String> {
        env::var(key.to_uppercase()).ok()
    }
}

#[derive(Debug, Default, Clone)]
pub struct MapConfigStore {
    values: HashMap<String, String>,
}

impl MapConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

impl ConfigStore for MapConfigStore {
    fn get_setting(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

pub const MINIMUM_FEE_KEY: &str = "delivery_minimum_fee";
pub const BASE_KM_KEY: &str = "delivery_distance_base_km";
pub const FEE_PER_KM_KEY: &str = "delivery_fee_per_km";
pub const ASSIGNMENT_TIMEOUT_KEY: &str = "delivery_assignment_timeout";
pub const NOTIFY_RIDERS_COUNT_KEY: &str = "delivery_notify_riders_count";
pub const MAX_RETRY_ATTEMPTS_KEY: &str = "delivery_max_retry_attempts";
pub const MAX_CONCURRENT_DELIVERIES_KEY: &str = "rider_max_concurrent_deliveries";
pub const LOCATION_FRESHNESS_KEY: &str = "rider_location_freshness_seconds";
pub const STALE_REQUEST_KEY: &str = "delivery_stale_request_minutes";

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub fees: FeeSchedule,
    pub assignment_timeout: Duration,
    pub notify_riders_count: usize,
    pub max_retry_attempts: u32,
    pub max_concurrent_deliveries: u32,
    pub location_freshness: Duration,
    pub stale_request_age: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            fees: FeeSchedule::default(),
            assignment_timeout: Duration::from_secs(120),
            notify_riders_count: 3,
            max_retry_attempts: 3,
            max_concurrent_deliveries: 2,
            location_freshness: Duration::from_secs(5 * 60),
            stale_request_age: Duration::from_secs(30 * 60),
        }
    }
}

impl DispatchSettings {
    pub fn load(store: &dyn ConfigStore) -> Result<Self, DispatchError> {
        let defaults = Self::default();

        let settings = Self {
            fees: FeeSchedule {
                minimum_fee: setting_or(store, MINIMUM_FEE_KEY, defaults.fees.minimum_fee)?,
                base_km: setting_or(store, BASE_KM_KEY, defaults.fees.base_km)?,
                fee_per_km: setting_or(store, FEE_PER_KM_KEY, defaults.fees.fee_per_km)?,
            },
            assignment_timeout: Duration::from_secs(setting_or(
                store,
                ASSIGNMENT_TIMEOUT_KEY,
                defaults.assignment_timeout.as_secs(),
            )?),
            notify_riders_count: setting_or(
                store,
                NOTIFY_RIDERS_COUNT_KEY,
                defaults.notify_riders_count,
            )?,
            max_retry_attempts: setting_or(
                store,
                MAX_RETRY_ATTEMPTS_KEY,
                defaults.max_retry_attempts,
            )?,
            max_concurrent_deliveries: setting_or(
                store,
                MAX_CONCURRENT_DELIVERIES_KEY,
                defaults.max_concurrent_deliveries,
            )?,
            location_freshness: Duration::from_secs(setting_or(
                store,
                LOCATION_FRESHNESS_KEY,
                defaults.location_freshness.as_secs(),
            )?),
            stale_request_age: Duration::from_secs(
                setting_or(
                    store,
                    STALE_REQUEST_KEY,
                    defaults.stale_request_age.as_secs() / 60,
                )?
                .checked_mul(60)
                .ok_or_else(|| DispatchError::Config(format!("{STALE_REQUEST_KEY} is too large")))?,
            ),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), DispatchError> {
        if self.fees.minimum_fee < 0.0 || self.fees.base_km < 0.0 || self.fees.fee_per_km < 0.0 {
            return Err(DispatchError::Config(
                "delivery fee settings must not be negative".to_string(),
            ));
        }
        if self.notify_riders_count == 0 {
            return Err(DispatchError::Config(format!(
                "{NOTIFY_RIDERS_COUNT_KEY} must be > 0"
            )));
        }
        if self.max_retry_attempts == 0 {
            return Err(DispatchError::Config(format!(
                "{MAX_RETRY_ATTEMPTS_KEY} must be > 0"
            )));
        }
        Ok(())
    }
}

fn setting_or<T>(store: &dyn ConfigStore, key: &str, default: T) -> Result<T, DispatchError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match store.get_setting(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| DispatchError::Config(format!("invalid {key}: {err}"))),
        None => Ok(default),
    }
}
