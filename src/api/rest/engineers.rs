use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::registry::{self, FlagUpdate, RegisterEngineer};
use crate::error::AppError;
use crate::geo::haversine_m;
use crate::models::engineer::{Engineer, GeoPoint};
use crate::models::order::ServiceOrder;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/engineers", post(create_engineer).get(list_engineers))
        .route("/engineers/:id/availability", patch(update_availability))
        .route("/engineers/:id/flags", patch(update_flags))
        .route("/engineers/:id/location", patch(update_location))
        .route("/engineers/:id/nearby-orders", get(nearby_orders))
}

async fn create_engineer(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<RegisterEngineer>,
) -> Result<Json<Engineer>, AppError> {
    let engineer = registry::register(&state, spec)?;
    Ok(Json(engineer))
}

async fn list_engineers(State(state): State<Arc<AppState>>) -> Json<Vec<Engineer>> {
    let engineers = state
        .engineers
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    Json(engineers)
}

#[derive(Deserialize)]
struct AvailabilityRequest {
    available: bool,
}

async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AvailabilityRequest>,
) -> Result<Json<Engineer>, AppError> {
    let engineer = registry::set_availability(&state, id, payload.available)?;
    Ok(Json(engineer))
}

async fn update_flags(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(update): Json<FlagUpdate>,
) -> Result<Json<Engineer>, AppError> {
    let engineer = registry::set_flags(&state, id, update)?;
    Ok(Json(engineer))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(location): Json<GeoPoint>,
) -> Result<Json<Engineer>, AppError> {
    let engineer = registry::update_location(&state, id, location)?;
    Ok(Json(engineer))
}

#[derive(Deserialize)]
struct NearbyQuery {
    radius_m: Option<f64>,
}

#[derive(Serialize)]
struct NearbyOrder {
    distance_m: f64,
    order: ServiceOrder,
}

/// The poll path: open orders around the engineer's last known location,
/// nearest first, excluding orders the engineer already declined. This is
/// how an engineer without a live session still finds and accepts work.
async fn nearby_orders(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbyOrder>>, AppError> {
    let engineer = state
        .engineers
        .get(&id)
        .map(|e| e.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("engineer {id} not found")))?;

    let Some(location) = engineer.location else {
        return Err(AppError::BadRequest(
            "engineer has no known location; update location first".to_string(),
        ));
    };

    let radius_m = query.radius_m.unwrap_or(50_000.0);
    if !(radius_m.is_finite() && radius_m > 0.0) {
        return Err(AppError::BadRequest("radius must be positive".to_string()));
    }

    let mut nearby: Vec<NearbyOrder> = state
        .orders
        .iter()
        .filter_map(|entry| {
            let order = entry.value();
            if !order.status.is_open() || order.rejected.contains(&id) {
                return None;
            }
            let distance_m = haversine_m(&location, &order.location);
            (distance_m <= radius_m).then(|| NearbyOrder {
                distance_m,
                order: order.clone(),
            })
        })
        .collect();

    nearby.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    Ok(Json(nearby))
}
