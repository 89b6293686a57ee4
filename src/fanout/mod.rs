use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::models::candidate::MatchCandidate;
use crate::models::order::ServiceOrder;
use crate::state::AppState;

/// Events pushed to engineer sessions. Delivery is best-effort; an
/// engineer who never receives a push can still poll and accept.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum PushEvent {
    #[serde(rename = "NEW_ORDER_REQUEST")]
    NewOrderRequest {
        order_id: Uuid,
        distance_m: Option<f64>,
        respond_by: DateTime<Utc>,
    },
    #[serde(rename = "ORDER_CONFIRMED")]
    OrderConfirmed { order_id: Uuid },
    #[serde(rename = "ORDER_CLOSED")]
    OrderClosed { order_id: Uuid },
}

impl PushEvent {
    fn label(&self) -> &'static str {
        match self {
            PushEvent::NewOrderRequest { .. } => "new_order_request",
            PushEvent::OrderConfirmed { .. } => "order_confirmed",
            PushEvent::OrderClosed { .. } => "order_closed",
        }
    }
}

/// Live-session membership and push delivery, abstracted away from the
/// dispatch logic so the transport can be swapped. Membership is never
/// consulted for correctness of accept/reject, only for push efficiency.
pub trait SessionRegistry: Send + Sync {
    fn connect(&self, engineer_id: Uuid, tx: mpsc::UnboundedSender<PushEvent>);
    fn disconnect(&self, engineer_id: Uuid);
    fn is_connected(&self, engineer_id: Uuid) -> bool;
    /// Adds the engineer to the order's ephemeral channel.
    fn subscribe(&self, order_id: Uuid, engineer_id: Uuid);
    /// Delivers to one engineer's session, if connected.
    fn publish_to(&self, engineer_id: Uuid, event: PushEvent) -> bool;
    /// Delivers to every channel subscriber except `except`. Returns the
    /// number of sessions reached.
    fn publish_order(&self, order_id: Uuid, except: Option<Uuid>, event: PushEvent) -> usize;
    /// Tears down the order's ephemeral channel.
    fn unsubscribe_all(&self, order_id: Uuid);
}

/// In-process registry backed by per-engineer unbounded channels. The WS
/// handler registers the sender half on upgrade and drops it on
/// disconnect.
pub struct ChannelSessionRegistry {
    sessions: DashMap<Uuid, mpsc::UnboundedSender<PushEvent>>,
    channels: DashMap<Uuid, HashSet<Uuid>>,
}

impl ChannelSessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            channels: DashMap::new(),
        }
    }
}

impl Default for ChannelSessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry for ChannelSessionRegistry {
    fn connect(&self, engineer_id: Uuid, tx: mpsc::UnboundedSender<PushEvent>) {
        self.sessions.insert(engineer_id, tx);
    }

    fn disconnect(&self, engineer_id: Uuid) {
        self.sessions.remove(&engineer_id);
        for mut channel in self.channels.iter_mut() {
            channel.value_mut().remove(&engineer_id);
        }
    }

    fn is_connected(&self, engineer_id: Uuid) -> bool {
        self.sessions.contains_key(&engineer_id)
    }

    fn subscribe(&self, order_id: Uuid, engineer_id: Uuid) {
        self.channels
            .entry(order_id)
            .or_default()
            .insert(engineer_id);
    }

    fn publish_to(&self, engineer_id: Uuid, event: PushEvent) -> bool {
        match self.sessions.get(&engineer_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn publish_order(&self, order_id: Uuid, except: Option<Uuid>, event: PushEvent) -> usize {
        let Some(members) = self.channels.get(&order_id).map(|m| m.value().clone()) else {
            return 0;
        };

        let mut reached = 0;
        for engineer_id in members {
            if Some(engineer_id) == except {
                continue;
            }
            if self.publish_to(engineer_id, event.clone()) {
                reached += 1;
            }
        }
        reached
    }

    fn unsubscribe_all(&self, order_id: Uuid) {
        self.channels.remove(&order_id);
    }
}

/// Pushes the offer to every matched candidate with a live session.
/// Candidates without one stay matched and may still accept via polling.
pub fn offer(state: &AppState, order: &ServiceOrder, candidates: &[MatchCandidate]) {
    let respond_by = Utc::now() + chrono::Duration::seconds(state.settings.offer_response_window_secs as i64);

    let mut pushed = 0;
    for candidate in candidates {
        if !state.sessions.is_connected(candidate.engineer_id) {
            continue;
        }

        state.sessions.subscribe(order.id, candidate.engineer_id);
        let delivered = state.sessions.publish_to(
            candidate.engineer_id,
            PushEvent::NewOrderRequest {
                order_id: order.id,
                distance_m: candidate.distance_m,
                respond_by,
            },
        );
        if delivered {
            pushed += 1;
            state
                .metrics
                .push_events_total
                .with_label_values(&["new_order_request"])
                .inc();
        }
    }

    debug!(order_id = %order.id, candidates = candidates.len(), pushed, "offer fanout");
}

/// Confirms the winner and withdraws the offer from every other
/// subscriber, then tears down the order's channel.
pub fn resolve(state: &AppState, order_id: Uuid, winner_id: Uuid) {
    let confirmed = PushEvent::OrderConfirmed { order_id };
    if state.sessions.publish_to(winner_id, confirmed.clone()) {
        state
            .metrics
            .push_events_total
            .with_label_values(&[confirmed.label()])
            .inc();
    }

    let closed = PushEvent::OrderClosed { order_id };
    let reached = state
        .sessions
        .publish_order(order_id, Some(winner_id), closed.clone());
    state
        .metrics
        .push_events_total
        .with_label_values(&[closed.label()])
        .inc_by(reached as u64);

    state.sessions.unsubscribe_all(order_id);
}

/// Withdraws the offer from all subscribers (expiry, cancellation) and
/// tears down the channel.
pub fn close(state: &AppState, order_id: Uuid) {
    let closed = PushEvent::OrderClosed { order_id };
    let reached = state.sessions.publish_order(order_id, None, closed.clone());
    state
        .metrics
        .push_events_total
        .with_label_values(&[closed.label()])
        .inc_by(reached as u64);

    state.sessions.unsubscribe_all(order_id);
}
