use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a tracked person. Known and unknown detections come from
/// disjoint id spaces, so the two must never share a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PersonKey {
    Known(i64),
    Unknown(i64),
}

impl PersonKey {
    pub fn new(is_known: bool, id: i64) -> Self {
        if is_known {
            Self::Known(id)
        } else {
            Self::Unknown(id)
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Known(id) | Self::Unknown(id) => *id,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

impl std::fmt::Display for PersonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(id) => write!(f, "{}", id),
            Self::Unknown(id) => write!(f, "U-{}", id),
        }
    }
}

/// One camera sighting of a person in a zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: i64,
    pub zone_id: i64,
    pub creation_time: DateTime<Utc>,
    pub person: PersonKey,
}

/// A stay derived from a batch of detections. `to == None` means the
/// person was still in `zone_id` when the batch ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInterval {
    pub person: PersonKey,
    pub zone_id: i64,
    pub from: DateTime<Utc>,
    pub to: Option<DateTime<Utc>>,
}

/// The persisted open occupancy row for a person, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenInterval {
    pub zone_id: i64,
    pub from: DateTime<Utc>,
}
