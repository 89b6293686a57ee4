use std::env;

use crate::error::AppError;

/// Availability side effects for one order stream. The two streams are
/// deliberately independent: vendor orders tie up the engineer for the
/// duration of the job, standard orders leave the engineer dispatchable.
#[derive(Debug, Clone, Copy)]
pub struct StreamPolicy {
    /// Accept flips the engineer unavailable; completion restores it.
    pub holds_availability: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub default_radius_m: f64,
    pub default_max_results: usize,
    pub offer_response_window_secs: u64,
    pub order_ttl_secs: u64,
    pub reaper_interval_secs: u64,
    pub standard_policy: StreamPolicy,
    pub vendor_policy: StreamPolicy,
    pub vendor_callback_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            default_radius_m: parse_or_default("DEFAULT_RADIUS_M", 25_000.0)?,
            default_max_results: parse_or_default("DEFAULT_MAX_RESULTS", 10)?,
            offer_response_window_secs: parse_or_default("OFFER_RESPONSE_WINDOW_SECS", 120)?,
            order_ttl_secs: parse_or_default("ORDER_TTL_SECS", 900)?,
            reaper_interval_secs: parse_or_default("REAPER_INTERVAL_SECS", 30)?,
            standard_policy: StreamPolicy {
                holds_availability: parse_or_default("STANDARD_HOLDS_AVAILABILITY", false)?,
            },
            vendor_policy: StreamPolicy {
                holds_availability: parse_or_default("VENDOR_HOLDS_AVAILABILITY", true)?,
            },
            vendor_callback_url: env::var("VENDOR_CALLBACK_URL").ok(),
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
