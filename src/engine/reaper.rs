//! Periodic expiry sweep. An order left open past its deadline is moved
//! to EXPIRED through the same conditional update an accept uses, so a
//! racing accept and the sweep cannot both win.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::dispatch::OFFER_EXPIRED;
use crate::fanout;
use crate::models::order::OrderStatus;
use crate::state::AppState;

pub async fn run_expiry_reaper(state: Arc<AppState>, every: Duration) {
    info!(interval_secs = every.as_secs(), "expiry reaper started");
    let mut ticker = interval(every);

    loop {
        ticker.tick().await;
        let swept = sweep_expired(&state);
        if swept > 0 {
            info!(swept, "expired overdue orders");
        }
    }
}

/// One sweep pass. Candidates are collected first, then each is
/// re-checked and transitioned under its own entry lock; an accept that
/// got in between simply wins.
pub fn sweep_expired(state: &AppState) -> usize {
    let now = Utc::now();
    let overdue: Vec<Uuid> = state
        .orders
        .iter()
        .filter(|entry| entry.status.is_open() && entry.expires_at <= now)
        .map(|entry| entry.id)
        .collect();

    let mut swept = 0;
    for order_id in overdue {
        let expired = {
            let Some(mut order) = state.orders.get_mut(&order_id) else {
                continue;
            };
            if !(order.status.is_open() && order.expires_at <= now) {
                continue;
            }
            order.status = OrderStatus::Expired;
            order.failure_reason = Some(OFFER_EXPIRED.to_string());
            true
        };

        if expired {
            state.metrics.orders_expired_total.inc();
            fanout::close(state, order_id);
            warn!(order_id = %order_id, "order expired without acceptance");
            swept += 1;
        }
    }
    swept
}
