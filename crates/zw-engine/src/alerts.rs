use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::PersonKey;

/// The three alert predicates. Stored as single-letter codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    Unknown,
    Unauthorized,
    Overstay,
}

impl AlertKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unknown => "U",
            Self::Unauthorized => "A",
            Self::Overstay => "O",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "U" => Some(Self::Unknown),
            "A" => Some(Self::Unauthorized),
            "O" => Some(Self::Overstay),
            _ => None,
        }
    }
}

/// Per-zone settings owned by the external CRUD surface. Both fields
/// are optional; absent fields disable the matching predicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overstay_limit: Option<String>,
}

/// One open occupancy row joined with its zone's config.
#[derive(Debug, Clone)]
pub struct OccupancyRow {
    pub person: PersonKey,
    pub zone_id: i64,
    pub from: DateTime<Utc>,
    pub config: ZoneConfig,
}

/// An alert that fired and still has to clear the backoff window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertCandidate {
    pub person: PersonKey,
    pub zone_id: i64,
    pub kind: AlertKind,
    pub from: DateTime<Utc>,
}

/// Per-kind counts for the run report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertCounts {
    pub unknown: u64,
    pub unauthorized: u64,
    pub overstay: u64,
}

impl AlertCounts {
    pub fn total(&self) -> u64 {
        self.unknown + self.unauthorized + self.overstay
    }

    pub fn record(&mut self, kind: AlertKind) {
        match kind {
            AlertKind::Unknown => self.unknown += 1,
            AlertKind::Unauthorized => self.unauthorized += 1,
            AlertKind::Overstay => self.overstay += 1,
        }
    }
}

/// Minimum time between two alerts of the same kind for the same
/// person and zone, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub unknown_secs: u64,
    pub unauthorized_secs: u64,
    pub overstay_secs: u64,
}

pub const DEFAULT_BACKOFF_SECS: u64 = 10;

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            unknown_secs: DEFAULT_BACKOFF_SECS,
            unauthorized_secs: DEFAULT_BACKOFF_SECS,
            overstay_secs: DEFAULT_BACKOFF_SECS,
        }
    }
}

impl BackoffConfig {
    pub fn window(&self, kind: AlertKind) -> Duration {
        let secs = match kind {
            AlertKind::Unknown => self.unknown_secs,
            AlertKind::Unauthorized => self.unauthorized_secs,
            AlertKind::Overstay => self.overstay_secs,
        };
        Duration::seconds(secs as i64)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitParseError {
    #[error("overstay limit must be HH:MM, got {0:?}")]
    Malformed(String),
}

/// Parse an `overstay_limit` of the form "HH:MM".
pub fn parse_overstay_limit(raw: &str) -> Result<Duration, LimitParseError> {
    let malformed = || LimitParseError::Malformed(raw.to_string());
    let (h, m) = raw.split_once(':').ok_or_else(malformed)?;
    let hours: u32 = h.trim().parse().map_err(|_| malformed())?;
    let minutes: u32 = m.trim().parse().map_err(|_| malformed())?;
    if minutes > 59 {
        return Err(malformed());
    }
    Ok(Duration::hours(hours as i64) + Duration::minutes(minutes as i64))
}

/// Evaluate the alert predicates against the current occupancy.
///
/// Each row is checked independently and may fire zero or more kinds.
/// A malformed overstay limit skips that check for the row with a
/// warning; it never fails the run.
pub fn evaluate(rows: &[OccupancyRow], now: DateTime<Utc>) -> Vec<AlertCandidate> {
    let mut out = Vec::new();
    for row in rows {
        let mut fire = |kind: AlertKind| {
            out.push(AlertCandidate {
                person: row.person,
                zone_id: row.zone_id,
                kind,
                from: row.from,
            })
        };

        if !row.person.is_known() {
            fire(AlertKind::Unknown);
        }

        // Despite the name, this keys off the zone being inactive,
        // not off any per-person authorization.
        if row.config.is_active == Some(false) {
            fire(AlertKind::Unauthorized);
        }

        if let Some(raw) = &row.config.overstay_limit {
            match parse_overstay_limit(raw) {
                Ok(limit) => {
                    if now - row.from > limit {
                        fire(AlertKind::Overstay);
                    }
                }
                Err(err) => {
                    warn!(zone_id = row.zone_id, %err, "skipping overstay check");
                }
            }
        }
    }
    out
}
