use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::CellId;
use crate::models::engineer::GeoPoint;

/// Which intake path the order arrived on. Acceptance policy (whether
/// winning an order flips the engineer unavailable) is configured per
/// stream, not hard-wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStream {
    Standard,
    Vendor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Matching,
    Accepted,
    Expired,
    Cancelled,
    Completed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Expired | OrderStatus::Cancelled | OrderStatus::Completed
        )
    }

    /// States an accept transition may move out of.
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Matching)
    }
}

/// A service work-order, reduced to its dispatch-relevant fields.
/// `status` is the single authoritative field; every assignment decision
/// is a transition on it, performed under the order's store entry lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOrder {
    pub id: Uuid,
    pub stream: OrderStream,
    pub vendor_id: String,
    pub call_id: String,
    pub requester: Option<String>,
    pub location: GeoPoint,
    pub cell: CellId,
    pub radius_m: f64,
    pub status: OrderStatus,
    pub assigned_engineer: Option<Uuid>,
    pub notified: HashSet<Uuid>,
    pub rejected: HashSet<Uuid>,
    pub failure_reason: Option<String>,
    pub match_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl ServiceOrder {
    /// Invariant: an engineer holds the order iff it is ACCEPTED or
    /// COMPLETED.
    pub fn assignment_consistent(&self) -> bool {
        self.assigned_engineer.is_some()
            == matches!(self.status, OrderStatus::Accepted | OrderStatus::Completed)
    }
}
