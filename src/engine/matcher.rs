//! Candidate matching: cell-ring pre-filter, exact haversine distance,
//! deterministic ranking, and the auto-batched serviceability check.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::engine::registry;
use crate::error::AppError;
use crate::geo::{covering_cells, haversine_m, CellId};
use crate::models::candidate::MatchCandidate;
use crate::models::engineer::{Engineer, GeoPoint};
use crate::state::AppState;

/// Finds the top dispatchable engineers around `location`, nearest first.
///
/// One bulk engineer read regardless of the ring size. The cell ring only
/// narrows the candidate set; inclusion is decided by exact distance
/// (`<= radius_m`, boundary inclusive). Unlocated engineers survive the
/// fetch and rank after every located candidate.
pub fn match_candidates(
    state: &AppState,
    location: &GeoPoint,
    radius_m: f64,
    max_results: usize,
) -> Result<Vec<MatchCandidate>, AppError> {
    if !location.is_valid() {
        return Err(AppError::BadRequest(
            "latitude must be in [-90, 90] and longitude in [-180, 180]".to_string(),
        ));
    }
    if !(radius_m.is_finite() && radius_m > 0.0) {
        return Err(AppError::BadRequest("radius must be positive".to_string()));
    }

    let cells: HashSet<CellId> = covering_cells(location.lat, location.lng, radius_m)
        .into_iter()
        .collect();
    let engineers = registry::dispatchable_in_cells(state, &cells, true);

    Ok(rank(location, radius_m, max_results, engineers))
}

fn rank(
    location: &GeoPoint,
    radius_m: f64,
    max_results: usize,
    engineers: Vec<Engineer>,
) -> Vec<MatchCandidate> {
    let mut scored: Vec<(Engineer, Option<f64>)> = engineers
        .into_iter()
        .filter_map(|engineer| match engineer.location {
            Some(point) => {
                let distance = haversine_m(location, &point);
                (distance <= radius_m).then_some((engineer, Some(distance)))
            }
            None => Some((engineer, None)),
        })
        .collect();

    scored.sort_by(|(a, da), (b, db)| match (da, db) {
        (Some(x), Some(y)) => x
            .total_cmp(y)
            .then_with(|| b.rating.total_cmp(&a.rating))
            .then_with(|| a.completed_jobs.cmp(&b.completed_jobs))
            .then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => b
            .rating
            .total_cmp(&a.rating)
            .then_with(|| a.id.cmp(&b.id)),
    });

    scored.truncate(max_results);
    scored
        .into_iter()
        .enumerate()
        .map(|(rank, (engineer, distance_m))| MatchCandidate {
            engineer_id: engineer.id,
            distance_m,
            rank,
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct ServicePoint {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Serialize)]
pub struct NonServiceablePoint {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServiceabilityReport {
    pub serviceable: Vec<String>,
    pub non_serviceable: Vec<NonServiceablePoint>,
}

/// Partitions the points into serviceable / non-serviceable.
///
/// The rings of every point are unioned into ONE bulk engineer fetch, then
/// each point is resolved against the pre-fetched set grouped by cell.
/// A point is serviceable as soon as one engineer lies within the radius;
/// the inner search short-circuits there. Unlocated engineers are ignored
/// here: serviceability is a distance claim and they have no distance.
pub fn serviceable_batch(
    state: &AppState,
    points: &[ServicePoint],
    radius_m: f64,
) -> ServiceabilityReport {
    let mut union: HashSet<CellId> = HashSet::new();
    let mut lookups: Vec<Option<Vec<CellId>>> = Vec::with_capacity(points.len());

    for point in points {
        let location = GeoPoint {
            lat: point.lat,
            lng: point.lng,
        };
        if !location.is_valid() {
            lookups.push(None);
            continue;
        }
        let cells = covering_cells(point.lat, point.lng, radius_m);
        union.extend(cells.iter().copied());
        lookups.push(Some(cells));
    }

    let engineers = registry::dispatchable_in_cells(state, &union, false);

    let mut by_cell: HashMap<CellId, Vec<GeoPoint>> = HashMap::new();
    for engineer in engineers {
        if let (Some(cell), Some(location)) = (engineer.cell, engineer.location) {
            by_cell.entry(cell).or_default().push(location);
        }
    }

    let mut serviceable = Vec::new();
    let mut non_serviceable = Vec::new();

    for (point, lookup) in points.iter().zip(lookups) {
        let Some(cells) = lookup else {
            non_serviceable.push(NonServiceablePoint {
                id: point.id.clone(),
                reason: Some("invalid coordinates".to_string()),
            });
            continue;
        };

        let target = GeoPoint {
            lat: point.lat,
            lng: point.lng,
        };
        let found = cells.iter().any(|cell| {
            by_cell
                .get(cell)
                .is_some_and(|locations| {
                    locations
                        .iter()
                        .any(|loc| haversine_m(&target, loc) <= radius_m)
                })
        });

        if found {
            serviceable.push(point.id.clone());
        } else {
            non_serviceable.push(NonServiceablePoint {
                id: point.id.clone(),
                reason: None,
            });
        }
    }

    ServiceabilityReport {
        serviceable,
        non_serviceable,
    }
}
