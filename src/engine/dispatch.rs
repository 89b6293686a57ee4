//! Dispatch coordinator: owns every order-status transition.
//!
//! The store's per-entry exclusive lock is the conditional-update
//! primitive: predicate check and mutation happen in one critical
//! section, so N concurrent accepts for one order are totally ordered and
//! exactly one observes success. Nothing here reads an order, decides,
//! and writes it back in separate store calls.

use std::time::Instant;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::matcher;
use crate::error::AppError;
use crate::fanout;
use crate::geo::cell_of;
use crate::models::engineer::GeoPoint;
use crate::models::order::{OrderStatus, OrderStream, ServiceOrder};
use crate::state::AppState;

pub const NO_ENGINEERS_AVAILABLE: &str = "NO_ENGINEERS_AVAILABLE";
pub const OFFER_EXPIRED: &str = "OFFER_EXPIRED";

fn default_stream() -> OrderStream {
    OrderStream::Vendor
}

/// Validated intake structure. Unknown payload fields are dropped at the
/// boundary instead of being persisted.
#[derive(Debug, Deserialize)]
pub struct OrderSpec {
    pub vendor_id: String,
    pub call_id: String,
    #[serde(default = "default_stream")]
    pub stream: OrderStream,
    pub requester: Option<String>,
    pub location: GeoPoint,
    pub radius_m: Option<f64>,
    pub max_results: Option<usize>,
}

/// Idempotent upsert keyed on (vendor_id, call_id). A duplicate submission
/// returns the already-created order; the second element reports whether
/// this call created it.
pub fn create_order(state: &AppState, spec: OrderSpec) -> Result<(ServiceOrder, bool), AppError> {
    if spec.vendor_id.trim().is_empty() || spec.call_id.trim().is_empty() {
        return Err(AppError::BadRequest(
            "vendor_id and call_id are required".to_string(),
        ));
    }
    if !spec.location.is_valid() {
        return Err(AppError::BadRequest(
            "latitude must be in [-90, 90] and longitude in [-180, 180]".to_string(),
        ));
    }
    if let Some(radius) = spec.radius_m {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(AppError::BadRequest("radius must be positive".to_string()));
        }
    }

    let key = (spec.vendor_id.clone(), spec.call_id.clone());
    match state.order_keys.entry(key) {
        Entry::Occupied(existing) => {
            let order = state
                .orders
                .get(existing.get())
                .map(|o| o.value().clone())
                .ok_or_else(|| {
                    AppError::Internal("order key index points at a missing order".to_string())
                })?;
            Ok((order, false))
        }
        Entry::Vacant(slot) => {
            let now = Utc::now();
            let order = ServiceOrder {
                id: Uuid::new_v4(),
                stream: spec.stream,
                vendor_id: spec.vendor_id,
                call_id: spec.call_id,
                requester: spec.requester,
                cell: cell_of(spec.location.lat, spec.location.lng),
                location: spec.location,
                radius_m: spec.radius_m.unwrap_or(state.settings.default_radius_m),
                status: OrderStatus::Pending,
                assigned_engineer: None,
                notified: Default::default(),
                rejected: Default::default(),
                failure_reason: None,
                match_attempts: 0,
                created_at: now,
                locked_at: None,
                completed_at: None,
                expires_at: now + chrono::Duration::seconds(state.settings.order_ttl_secs as i64),
            };

            state.orders.insert(order.id, order.clone());
            slot.insert(order.id);
            info!(order_id = %order.id, vendor_id = %order.vendor_id, call_id = %order.call_id, "order created");
            Ok((order, true))
        }
    }
}

/// Runs the matcher for a PENDING order. Zero candidates expire the order
/// with a recorded failure reason; otherwise the candidate set is recorded
/// as notified, the order moves to MATCHING, and the offer is fanned out.
/// The fanout is best-effort and never rolls the transition back.
pub fn start_matching(state: &AppState, order_id: Uuid, max_results: Option<usize>) -> Result<ServiceOrder, AppError> {
    let (location, radius_m, rejected) = {
        let order = state
            .orders
            .get(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;
        (order.location, order.radius_m, order.rejected.clone())
    };

    let start = Instant::now();
    let mut candidates = matcher::match_candidates(
        state,
        &location,
        radius_m,
        max_results.unwrap_or(state.settings.default_max_results),
    )?;
    // Engineers who declined stay out until the rejected set is cleared.
    candidates.retain(|c| !rejected.contains(&c.engineer_id));
    for (rank, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = rank;
    }

    let elapsed = start.elapsed().as_secs_f64();
    let outcome = if candidates.is_empty() {
        "no_engineers"
    } else {
        "matched"
    };
    state
        .metrics
        .match_latency_seconds
        .with_label_values(&[outcome])
        .observe(elapsed);
    state
        .metrics
        .matches_total
        .with_label_values(&[outcome])
        .inc();

    let updated = {
        let mut order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if !order.status.is_open() {
            return Err(AppError::conflict(
                "order is no longer open for matching",
                &order,
            ));
        }

        order.match_attempts += 1;
        if candidates.is_empty() {
            order.status = OrderStatus::Expired;
            order.failure_reason = Some(NO_ENGINEERS_AVAILABLE.to_string());
            warn!(order_id = %order.id, "no engineers available; order expired");
        } else {
            order.status = OrderStatus::Matching;
            order.notified.extend(candidates.iter().map(|c| c.engineer_id));
        }
        order.clone()
    };

    if updated.status == OrderStatus::Matching {
        fanout::offer(state, &updated, &candidates);
        info!(
            order_id = %updated.id,
            candidates = candidates.len(),
            attempt = updated.match_attempts,
            "matching started"
        );
    }

    Ok(updated)
}

/// The correctness-critical transition. Succeeds only if the order is
/// still open, unheld, and the engineer is dispatchable and has not
/// declined it; on success the engineer holds the order. Any failed
/// precondition returns Conflict carrying the authoritative snapshot;
/// the caller must not retry-overwrite.
pub fn accept(state: &AppState, order_id: Uuid, engineer_id: Uuid) -> Result<ServiceOrder, AppError> {
    let engineer = state
        .engineers
        .get(&engineer_id)
        .map(|e| e.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("engineer {engineer_id} not found")))?;

    let accepted = {
        let mut order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if let Some(holder) = order.assigned_engineer {
            state
                .metrics
                .accepts_total
                .with_label_values(&["conflict"])
                .inc();
            let reason = if holder == engineer_id {
                "order already accepted by this engineer"
            } else {
                "order already accepted by another engineer"
            };
            return Err(AppError::conflict(reason, &order));
        }
        if !order.status.is_open() {
            state
                .metrics
                .accepts_total
                .with_label_values(&["conflict"])
                .inc();
            return Err(AppError::conflict("order is no longer open", &order));
        }
        if order.rejected.contains(&engineer_id) {
            state
                .metrics
                .accepts_total
                .with_label_values(&["conflict"])
                .inc();
            return Err(AppError::conflict(
                "engineer previously rejected this order",
                &order,
            ));
        }
        if !engineer.is_dispatchable() {
            state
                .metrics
                .accepts_total
                .with_label_values(&["conflict"])
                .inc();
            return Err(AppError::conflict("engineer is not dispatchable", &order));
        }

        order.status = OrderStatus::Accepted;
        order.assigned_engineer = Some(engineer_id);
        order.locked_at = Some(Utc::now());
        order.clone()
    };

    state
        .metrics
        .accepts_total
        .with_label_values(&["won"])
        .inc();

    if let Some(mut holder) = state.engineers.get_mut(&engineer_id) {
        if state.settings.policy_for(accepted.stream).holds_availability {
            holder.available = false;
        }
        holder.total_jobs += 1;
        holder.updated_at = Utc::now();
    }

    // Everything past the state write is best-effort and never reverses
    // the acceptance.
    fanout::resolve(state, accepted.id, engineer_id);
    notify_vendor(state, &accepted);

    info!(order_id = %accepted.id, engineer_id = %engineer_id, "order accepted");
    Ok(accepted)
}

/// Declines an order. Three shapes, resolved under the same entry lock:
/// the holder withdrawing (order reopens to PENDING, holder lands in the
/// rejected set), a non-holder declining an unheld order (idempotent), and
/// a non-holder touching someone else's order (conflict).
pub fn reject(state: &AppState, order_id: Uuid, engineer_id: Uuid) -> Result<ServiceOrder, AppError> {
    let (updated, withdrew) = {
        let mut order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if order.assigned_engineer == Some(engineer_id) {
            if order.status != OrderStatus::Accepted {
                return Err(AppError::conflict("order already resolved", &order));
            }
            order.assigned_engineer = None;
            order.status = OrderStatus::Pending;
            order.locked_at = None;
            order.rejected.insert(engineer_id);
            (order.clone(), true)
        } else if order.assigned_engineer.is_some() {
            return Err(AppError::conflict(
                "order already accepted by another engineer",
                &order,
            ));
        } else {
            if order.status.is_terminal() {
                return Err(AppError::conflict("order is no longer open", &order));
            }
            // Declining twice is a no-op, not an error.
            order.rejected.insert(engineer_id);
            (order.clone(), false)
        }
    };

    if withdrew {
        if state.settings.policy_for(updated.stream).holds_availability {
            if let Some(mut holder) = state.engineers.get_mut(&engineer_id) {
                holder.available = true;
                holder.updated_at = Utc::now();
            }
        }
        info!(order_id = %updated.id, engineer_id = %engineer_id, "holder withdrew; order reopened");
    } else {
        info!(order_id = %updated.id, engineer_id = %engineer_id, "order declined");
    }

    Ok(updated)
}

/// Marks the job done. Only the holder may complete; completing an
/// already-completed order as the holder is idempotent.
pub fn complete(state: &AppState, order_id: Uuid, engineer_id: Uuid) -> Result<ServiceOrder, AppError> {
    let (updated, first_completion) = {
        let mut order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if order.assigned_engineer != Some(engineer_id) {
            return Err(AppError::conflict(
                "engineer is not assigned to this order",
                &order,
            ));
        }
        if order.status == OrderStatus::Completed {
            (order.clone(), false)
        } else {
            order.status = OrderStatus::Completed;
            order.completed_at = Some(Utc::now());
            (order.clone(), true)
        }
    };

    if first_completion {
        if let Some(mut holder) = state.engineers.get_mut(&engineer_id) {
            holder.completed_jobs += 1;
            if state.settings.policy_for(updated.stream).holds_availability {
                holder.available = true;
            }
            holder.updated_at = Utc::now();
        }
        info!(order_id = %updated.id, engineer_id = %engineer_id, "order completed");
    }

    Ok(updated)
}

/// Requester/operator cancellation; allowed from any non-terminal state.
pub fn cancel(state: &AppState, order_id: Uuid) -> Result<ServiceOrder, AppError> {
    let updated = {
        let mut order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if order.status.is_terminal() {
            return Err(AppError::conflict("order already resolved", &order));
        }

        order.status = OrderStatus::Cancelled;
        order.assigned_engineer = None;
        order.locked_at = None;
        order.clone()
    };

    fanout::close(state, updated.id);
    info!(order_id = %updated.id, "order cancelled");
    Ok(updated)
}

/// Operator reset of the rejected set, after which previously declining
/// engineers may be offered the order again.
pub fn clear_rejections(state: &AppState, order_id: Uuid) -> Result<ServiceOrder, AppError> {
    let mut order = state
        .orders
        .get_mut(&order_id)
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

    order.rejected.clear();
    Ok(order.clone())
}

/// Best-effort acceptance callback to the vendor system. Runs detached; a
/// failure is logged and surfaced through the log for out-of-band retry,
/// never reversing the acceptance.
fn notify_vendor(state: &AppState, order: &ServiceOrder) {
    if order.stream != OrderStream::Vendor {
        return;
    }
    let Some(callback) = &state.vendor_callback else {
        return;
    };

    let client = callback.client.clone();
    let url = callback.url.clone();
    let payload = serde_json::json!({
        "order_id": order.id,
        "vendor_id": order.vendor_id,
        "call_id": order.call_id,
        "engineer_id": order.assigned_engineer,
        "status": order.status,
    });
    let order_id = order.id;

    tokio::spawn(async move {
        match client.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                error!(order_id = %order_id, status = %response.status(), "vendor callback rejected");
            }
            Err(err) => {
                error!(order_id = %order_id, error = %err, "vendor callback failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::engine::registry::{register, set_availability, RegisterEngineer};
    use crate::state::{AppState, DispatchSettings};

    const BLR: GeoPoint = GeoPoint {
        lat: 12.9716,
        lng: 77.5946,
    };

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(DispatchSettings::default(), None))
    }

    fn add_engineer(state: &AppState, lat: f64, lng: f64) -> Uuid {
        register(
            state,
            RegisterEngineer {
                name: "eng".to_string(),
                location: Some(GeoPoint { lat, lng }),
                rating: 4.0,
            },
        )
        .unwrap()
        .id
    }

    fn spec(call_id: &str) -> OrderSpec {
        OrderSpec {
            vendor_id: "vendor-1".to_string(),
            call_id: call_id.to_string(),
            stream: OrderStream::Standard,
            requester: None,
            location: BLR,
            radius_m: Some(20_000.0),
            max_results: None,
        }
    }

    #[test]
    fn duplicate_submission_returns_the_existing_order() {
        let state = state();

        let (first, created) = create_order(&state, spec("call-1")).unwrap();
        assert!(created);

        let (second, created) = create_order(&state, spec("call-1")).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(state.orders.len(), 1);
    }

    #[test]
    fn matching_with_no_engineers_expires_the_order() {
        let state = state();
        let (order, _) = create_order(&state, spec("call-1")).unwrap();

        let expired = start_matching(&state, order.id, None).unwrap();
        assert_eq!(expired.status, OrderStatus::Expired);
        assert_eq!(
            expired.failure_reason.as_deref(),
            Some(NO_ENGINEERS_AVAILABLE)
        );
        assert!(expired.assignment_consistent());
    }

    #[test]
    fn matching_records_the_notified_set() {
        let state = state();
        let eng = add_engineer(&state, BLR.lat, BLR.lng);
        let (order, _) = create_order(&state, spec("call-1")).unwrap();

        let matching = start_matching(&state, order.id, None).unwrap();
        assert_eq!(matching.status, OrderStatus::Matching);
        assert!(matching.notified.contains(&eng));
        assert_eq!(matching.match_attempts, 1);
    }

    #[test]
    fn second_accept_conflicts_and_names_the_winner() {
        let state = state();
        let winner = add_engineer(&state, BLR.lat, BLR.lng);
        let loser = add_engineer(&state, BLR.lat, BLR.lng);
        let (order, _) = create_order(&state, spec("call-1")).unwrap();
        start_matching(&state, order.id, None).unwrap();

        let won = accept(&state, order.id, winner).unwrap();
        assert_eq!(won.status, OrderStatus::Accepted);
        assert_eq!(won.assigned_engineer, Some(winner));
        assert!(won.locked_at.is_some());

        let err = accept(&state, order.id, loser).unwrap_err();
        match err {
            AppError::Conflict { current, .. } => {
                assert_eq!(current.assigned_engineer, Some(winner));
                assert_eq!(current.status, OrderStatus::Accepted);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn accept_succeeds_without_any_push_delivery() {
        // The poll-and-accept fallback: no session ever connected.
        let state = state();
        let eng = add_engineer(&state, BLR.lat, BLR.lng);
        let (order, _) = create_order(&state, spec("call-1")).unwrap();

        // Order still PENDING, offer never fanned out.
        let won = accept(&state, order.id, eng).unwrap();
        assert_eq!(won.status, OrderStatus::Accepted);
    }

    #[test]
    fn unavailable_engineer_cannot_accept() {
        let state = state();
        let eng = add_engineer(&state, BLR.lat, BLR.lng);
        set_availability(&state, eng, false).unwrap();
        let (order, _) = create_order(&state, spec("call-1")).unwrap();

        let err = accept(&state, order.id, eng).unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));
    }

    #[test]
    fn holder_withdrawal_reopens_and_blocks_reaccept() {
        let state = state();
        let eng = add_engineer(&state, BLR.lat, BLR.lng);
        let (order, _) = create_order(&state, spec("call-1")).unwrap();
        start_matching(&state, order.id, None).unwrap();
        accept(&state, order.id, eng).unwrap();

        let reopened = reject(&state, order.id, eng).unwrap();
        assert_eq!(reopened.status, OrderStatus::Pending);
        assert_eq!(reopened.assigned_engineer, None);
        assert!(reopened.rejected.contains(&eng));
        assert!(reopened.assignment_consistent());

        let err = accept(&state, order.id, eng).unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));

        clear_rejections(&state, order.id).unwrap();
        let won = accept(&state, order.id, eng).unwrap();
        assert_eq!(won.assigned_engineer, Some(eng));
    }

    #[test]
    fn reject_by_non_holder_on_held_order_conflicts() {
        let state = state();
        let winner = add_engineer(&state, BLR.lat, BLR.lng);
        let other = add_engineer(&state, BLR.lat, BLR.lng);
        let (order, _) = create_order(&state, spec("call-1")).unwrap();
        accept(&state, order.id, winner).unwrap();

        let err = reject(&state, order.id, other).unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));
    }

    #[test]
    fn declining_twice_is_idempotent() {
        let state = state();
        let eng = add_engineer(&state, BLR.lat, BLR.lng);
        let (order, _) = create_order(&state, spec("call-1")).unwrap();

        let once = reject(&state, order.id, eng).unwrap();
        let twice = reject(&state, order.id, eng).unwrap();
        assert_eq!(once.rejected, twice.rejected);
        assert_eq!(twice.rejected.len(), 1);
    }

    #[test]
    fn only_the_holder_completes_and_completion_is_idempotent() {
        let state = state();
        let holder = add_engineer(&state, BLR.lat, BLR.lng);
        let other = add_engineer(&state, BLR.lat, BLR.lng);
        let (order, _) = create_order(&state, spec("call-1")).unwrap();
        accept(&state, order.id, holder).unwrap();

        let err = complete(&state, order.id, other).unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));

        let done = complete(&state, order.id, holder).unwrap();
        assert_eq!(done.status, OrderStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.assignment_consistent());

        let again = complete(&state, order.id, holder).unwrap();
        assert_eq!(again.completed_at, done.completed_at);
        let jobs = state.engineers.get(&holder).unwrap().completed_jobs;
        assert_eq!(jobs, 1);
    }

    #[test]
    fn cancel_clears_the_assignee_and_is_terminal() {
        let state = state();
        let eng = add_engineer(&state, BLR.lat, BLR.lng);
        let (order, _) = create_order(&state, spec("call-1")).unwrap();
        accept(&state, order.id, eng).unwrap();

        let cancelled = cancel(&state, order.id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.assigned_engineer, None);
        assert!(cancelled.assignment_consistent());

        assert!(matches!(
            cancel(&state, order.id).unwrap_err(),
            AppError::Conflict { .. }
        ));
        assert!(matches!(
            accept(&state, order.id, eng).unwrap_err(),
            AppError::Conflict { .. }
        ));
    }

    #[test]
    fn vendor_policy_flips_availability_across_the_lifecycle() {
        let state = state();
        let eng = add_engineer(&state, BLR.lat, BLR.lng);
        let mut vendor_spec = spec("call-1");
        vendor_spec.stream = OrderStream::Vendor;
        let (order, _) = create_order(&state, vendor_spec).unwrap();

        accept(&state, order.id, eng).unwrap();
        assert!(!state.engineers.get(&eng).unwrap().available);

        complete(&state, order.id, eng).unwrap();
        assert!(state.engineers.get(&eng).unwrap().available);
    }

    #[test]
    fn standard_policy_leaves_availability_untouched() {
        let state = state();
        let eng = add_engineer(&state, BLR.lat, BLR.lng);
        let (order, _) = create_order(&state, spec("call-1")).unwrap();

        accept(&state, order.id, eng).unwrap();
        assert!(state.engineers.get(&eng).unwrap().available);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_accepts_have_exactly_one_winner() {
        let state = state();
        let engineers: Vec<Uuid> = (0..16).map(|_| add_engineer(&state, BLR.lat, BLR.lng)).collect();
        let (order, _) = create_order(&state, spec("call-1")).unwrap();
        start_matching(&state, order.id, Some(16)).unwrap();

        let mut handles = Vec::new();
        for eng in engineers {
            let state = state.clone();
            let order_id = order.id;
            handles.push(tokio::spawn(async move { accept(&state, order_id, eng) }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        let mut winner = None;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(order) => {
                    wins += 1;
                    winner = order.assigned_engineer;
                }
                Err(AppError::Conflict { current, .. }) => {
                    conflicts += 1;
                    assert!(current.assigned_engineer.is_some());
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        assert_eq!(wins, 1);
        assert_eq!(conflicts, 15);
        // The winner is stable under repeated inspection.
        let stored = state.orders.get(&order.id).unwrap().clone();
        assert_eq!(stored.assigned_engineer, winner);
        assert_eq!(stored.status, OrderStatus::Accepted);
    }

    #[test]
    fn assignment_invariant_holds_over_random_transition_sequences() {
        let state = state();
        let engineers: Vec<Uuid> = (0..4).map(|_| add_engineer(&state, BLR.lat, BLR.lng)).collect();
        let (order, _) = create_order(&state, spec("call-1")).unwrap();

        // Small deterministic xorshift; no external PRNG needed here.
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..500 {
            let eng = engineers[(next() % 4) as usize];
            let _ = match next() % 5 {
                0 => start_matching(&state, order.id, None),
                1 => accept(&state, order.id, eng),
                2 => reject(&state, order.id, eng),
                3 => complete(&state, order.id, eng),
                _ => clear_rejections(&state, order.id),
            };

            let snapshot = state.orders.get(&order.id).unwrap().clone();
            assert!(
                snapshot.assignment_consistent(),
                "assignee/status drifted apart: {:?} {:?}",
                snapshot.status,
                snapshot.assigned_engineer
            );
        }
    }
}
