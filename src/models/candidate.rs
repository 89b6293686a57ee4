use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One matched engineer for one order. Ephemeral; only the id survives
/// into the order's notified set.
///
/// `distance_m` is `None` for engineers that have never reported a
/// location. They stay candidates (the cell filter cannot exclude what it
/// cannot place) but rank after every located engineer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub engineer_id: Uuid,
    pub distance_m: Option<f64>,
    pub rank: usize,
}
