use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::CellId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A field engineer. Never physically removed; `deleted` is a soft flag.
///
/// `cell` is recomputed from `location` on every location write so the
/// candidate query can filter by cell membership. An engineer that has
/// never reported a location carries neither field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engineer {
    pub id: Uuid,
    pub name: String,
    pub location: Option<GeoPoint>,
    pub cell: Option<CellId>,
    pub active: bool,
    pub available: bool,
    pub blocked: bool,
    pub suspended: bool,
    pub deleted: bool,
    pub rating: f64,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub updated_at: DateTime<Utc>,
}

impl Engineer {
    /// The single eligibility predicate every dispatch path goes through.
    pub fn is_dispatchable(&self) -> bool {
        self.active && self.available && !self.deleted && !self.blocked && !self.suspended
    }
}
