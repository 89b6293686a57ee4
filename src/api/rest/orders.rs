use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::dispatch::{self, OrderSpec};
use crate::engine::matcher::{self, ServicePoint, ServiceabilityReport};
use crate::error::AppError;
use crate::models::order::ServiceOrder;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(submit_order))
        .route("/orders/serviceability", post(serviceability))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/accept", post(accept_order))
        .route("/orders/:id/reject", post(reject_order))
        .route("/orders/:id/complete", post(complete_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/clear-rejections", post(clear_rejections))
}

/// Intake: creates the order and immediately runs matching. Idempotent on
/// (vendor_id, call_id); a repeated submission returns the stored order
/// as-is instead of rematching.
async fn submit_order(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<OrderSpec>,
) -> Result<Json<ServiceOrder>, AppError> {
    let max_results = spec.max_results;
    let (order, created) = dispatch::create_order(&state, spec)?;
    if !created {
        return Ok(Json(order));
    }

    let matched = dispatch::start_matching(&state, order.id, max_results)?;
    Ok(Json(matched))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServiceOrder>, AppError> {
    let order = state
        .orders
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("order {id} not found")))?;

    Ok(Json(order.clone()))
}

/// Stands in for the authenticated engineer identity the identity
/// provider would supply.
#[derive(Deserialize)]
struct EngineerAction {
    engineer_id: Uuid,
}

async fn accept_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(action): Json<EngineerAction>,
) -> Result<Json<ServiceOrder>, AppError> {
    let order = dispatch::accept(&state, id, action.engineer_id)?;
    Ok(Json(order))
}

async fn reject_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(action): Json<EngineerAction>,
) -> Result<Json<ServiceOrder>, AppError> {
    let order = dispatch::reject(&state, id, action.engineer_id)?;
    Ok(Json(order))
}

async fn complete_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(action): Json<EngineerAction>,
) -> Result<Json<ServiceOrder>, AppError> {
    let order = dispatch::complete(&state, id, action.engineer_id)?;
    Ok(Json(order))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServiceOrder>, AppError> {
    let order = dispatch::cancel(&state, id)?;
    Ok(Json(order))
}

async fn clear_rejections(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServiceOrder>, AppError> {
    let order = dispatch::clear_rejections(&state, id)?;
    Ok(Json(order))
}

#[derive(Deserialize)]
struct ServiceabilityRequest {
    points: Vec<ServicePoint>,
    radius_m: Option<f64>,
}

async fn serviceability(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ServiceabilityRequest>,
) -> Result<Json<ServiceabilityReport>, AppError> {
    if request.points.is_empty() {
        return Err(AppError::BadRequest(
            "points array is required and cannot be empty".to_string(),
        ));
    }
    let radius_m = request.radius_m.unwrap_or(state.settings.default_radius_m);
    if !(radius_m.is_finite() && radius_m > 0.0) {
        return Err(AppError::BadRequest("radius must be positive".to_string()));
    }

    Ok(Json(matcher::serviceable_batch(
        &state,
        &request.points,
        radius_m,
    )))
}
