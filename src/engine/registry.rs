//! Availability registry: the single source of truth for "is this
//! engineer dispatchable right now", plus location writes that keep the
//! materialized cell column in sync.

use std::collections::HashSet;

use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::{cell_of, CellId};
use crate::models::engineer::{Engineer, GeoPoint};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterEngineer {
    pub name: String,
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub rating: f64,
}

/// Operator-driven flag changes; absent fields are left untouched.
#[derive(Debug, Default, Deserialize)]
pub struct FlagUpdate {
    pub active: Option<bool>,
    pub blocked: Option<bool>,
    pub suspended: Option<bool>,
    pub deleted: Option<bool>,
}

pub fn register(state: &AppState, spec: RegisterEngineer) -> Result<Engineer, AppError> {
    if spec.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    if let Some(location) = &spec.location {
        if !location.is_valid() {
            return Err(AppError::BadRequest("invalid coordinates".to_string()));
        }
    }

    let engineer = Engineer {
        id: Uuid::new_v4(),
        name: spec.name,
        cell: spec.location.map(|p| cell_of(p.lat, p.lng)),
        location: spec.location,
        active: true,
        available: true,
        blocked: false,
        suspended: false,
        deleted: false,
        rating: spec.rating.clamp(0.0, 5.0),
        total_jobs: 0,
        completed_jobs: 0,
        updated_at: Utc::now(),
    };

    state.engineers.insert(engineer.id, engineer.clone());
    info!(engineer_id = %engineer.id, "engineer registered");
    Ok(engineer)
}

pub fn set_availability(
    state: &AppState,
    engineer_id: Uuid,
    available: bool,
) -> Result<Engineer, AppError> {
    let mut engineer = state
        .engineers
        .get_mut(&engineer_id)
        .ok_or_else(|| AppError::NotFound(format!("engineer {engineer_id} not found")))?;

    engineer.available = available;
    engineer.updated_at = Utc::now();
    Ok(engineer.clone())
}

pub fn set_flags(
    state: &AppState,
    engineer_id: Uuid,
    update: FlagUpdate,
) -> Result<Engineer, AppError> {
    let mut engineer = state
        .engineers
        .get_mut(&engineer_id)
        .ok_or_else(|| AppError::NotFound(format!("engineer {engineer_id} not found")))?;

    if let Some(active) = update.active {
        engineer.active = active;
    }
    if let Some(blocked) = update.blocked {
        engineer.blocked = blocked;
    }
    if let Some(suspended) = update.suspended {
        engineer.suspended = suspended;
    }
    if let Some(deleted) = update.deleted {
        engineer.deleted = deleted;
    }
    engineer.updated_at = Utc::now();
    Ok(engineer.clone())
}

/// Writes a new coordinate and recomputes the cell in the same update, so
/// the index column never lags the location it is derived from.
pub fn update_location(
    state: &AppState,
    engineer_id: Uuid,
    location: GeoPoint,
) -> Result<Engineer, AppError> {
    if !location.is_valid() {
        return Err(AppError::BadRequest(
            "latitude must be in [-90, 90] and longitude in [-180, 180]".to_string(),
        ));
    }

    let mut engineer = state
        .engineers
        .get_mut(&engineer_id)
        .ok_or_else(|| AppError::NotFound(format!("engineer {engineer_id} not found")))?;

    engineer.location = Some(location);
    engineer.cell = Some(cell_of(location.lat, location.lng));
    engineer.updated_at = Utc::now();
    Ok(engineer.clone())
}

/// One bulk read of every dispatchable engineer whose cell is in `cells`.
/// With `include_unlocated`, engineers that never reported a location are
/// returned too; the cell filter cannot rule them out and silently losing
/// them would orphan valid engineers.
pub fn dispatchable_in_cells(
    state: &AppState,
    cells: &HashSet<CellId>,
    include_unlocated: bool,
) -> Vec<Engineer> {
    state.metrics.engineer_bulk_fetches_total.inc();

    state
        .engineers
        .iter()
        .filter_map(|entry| {
            let engineer = entry.value();
            if !engineer.is_dispatchable() {
                return None;
            }
            let in_scope = match engineer.cell {
                Some(cell) => cells.contains(&cell),
                None => include_unlocated,
            };
            in_scope.then(|| engineer.clone())
        })
        .collect()
}
