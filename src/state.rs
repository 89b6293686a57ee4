use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::{Config, StreamPolicy};
use crate::fanout::{ChannelSessionRegistry, SessionRegistry};
use crate::models::engineer::Engineer;
use crate::models::order::{OrderStream, ServiceOrder};
use crate::observability::metrics::Metrics;

/// Dispatch knobs snapshotted from config at startup.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub default_radius_m: f64,
    pub default_max_results: usize,
    pub offer_response_window_secs: u64,
    pub order_ttl_secs: u64,
    pub standard_policy: StreamPolicy,
    pub vendor_policy: StreamPolicy,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_radius_m: config.default_radius_m,
            default_max_results: config.default_max_results,
            offer_response_window_secs: config.offer_response_window_secs,
            order_ttl_secs: config.order_ttl_secs,
            standard_policy: config.standard_policy,
            vendor_policy: config.vendor_policy,
        }
    }

    pub fn policy_for(&self, stream: OrderStream) -> StreamPolicy {
        match stream {
            OrderStream::Standard => self.standard_policy,
            OrderStream::Vendor => self.vendor_policy,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_radius_m: 25_000.0,
            default_max_results: 10,
            offer_response_window_secs: 120,
            order_ttl_secs: 900,
            standard_policy: StreamPolicy {
                holds_availability: false,
            },
            vendor_policy: StreamPolicy {
                holds_availability: true,
            },
        }
    }
}

/// Best-effort acceptance callback to the originating vendor system.
pub struct VendorCallback {
    pub client: reqwest::Client,
    pub url: String,
}

pub struct AppState {
    pub engineers: DashMap<Uuid, Engineer>,
    pub orders: DashMap<Uuid, ServiceOrder>,
    /// Idempotency index: (vendor_id, call_id) -> order id.
    pub order_keys: DashMap<(String, String), Uuid>,
    pub sessions: Arc<dyn SessionRegistry>,
    pub metrics: Metrics,
    pub settings: DispatchSettings,
    pub vendor_callback: Option<VendorCallback>,
}

impl AppState {
    pub fn new(settings: DispatchSettings, vendor_callback_url: Option<String>) -> Self {
        Self {
            engineers: DashMap::new(),
            orders: DashMap::new(),
            order_keys: DashMap::new(),
            sessions: Arc::new(ChannelSessionRegistry::new()),
            metrics: Metrics::new(),
            settings,
            vendor_callback: vendor_callback_url.map(|url| VendorCallback {
                client: reqwest::Client::new(),
                url,
            }),
        }
    }
}
