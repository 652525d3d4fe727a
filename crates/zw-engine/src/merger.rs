use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::types::{CandidateInterval, OpenInterval, PersonKey};

/// Closes a person's currently open occupancy row at `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseExisting {
    pub person: PersonKey,
    pub to: DateTime<Utc>,
}

/// Batched writes produced by one reconciliation pass. Applied
/// atomically in the caller's transaction: updates first, then inserts.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub closes: Vec<CloseExisting>,
    pub inserts: Vec<CandidateInterval>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.closes.is_empty() && self.inserts.is_empty()
    }
}

/// Reconcile per-person candidate intervals against the persisted open
/// intervals.
///
/// For each person the first usable candidate is matched against the
/// open row: same zone extends the row, a zone change closes it and
/// opens a new one, and candidates that closed before the open row
/// began are stale and skipped. Candidates after the first are wholly
/// contained in the batch and insert as closed history; the trailing
/// open candidate becomes the person's new open row. A person whose
/// candidates are all stale produces no writes at all.
pub fn reconcile(
    existing: &BTreeMap<PersonKey, OpenInterval>,
    candidates: &BTreeMap<PersonKey, Vec<CandidateInterval>>,
) -> WriteSet {
    let mut ws = WriteSet::default();

    for (person, list) in candidates {
        if list.is_empty() {
            continue;
        }

        let open = match existing.get(person) {
            None => {
                // Never seen before: the whole list inserts as-is.
                ws.inserts.extend(list.iter().cloned());
                continue;
            }
            Some(open) => open,
        };

        // A closed candidate ending at or before the open row's start
        // predates the persisted state (reprocessing or clock skew).
        let mut idx = 0;
        while idx < list.len() {
            match list[idx].to {
                Some(to) if to <= open.from => idx += 1,
                _ => break,
            }
        }
        if idx == list.len() {
            warn!(person = %person, open_from = %open.from, "all candidates stale, skipping person");
            continue;
        }

        let first = &list[idx];
        match first.to {
            None => {
                // The batch never saw this person transition.
                if first.from >= open.from && first.zone_id != open.zone_id {
                    ws.closes.push(CloseExisting {
                        person: *person,
                        to: first.from,
                    });
                    ws.inserts.push(first.clone());
                }
                // Same zone or out-of-order timestamp: the batch agrees
                // with what is already persisted.
            }
            Some(to) => {
                if first.zone_id == open.zone_id {
                    // Never actually left the zone: extend the open row
                    // instead of churning close + insert.
                    ws.closes.push(CloseExisting {
                        person: *person,
                        to,
                    });
                } else {
                    // Close at the batch boundary even when it predates
                    // the stored `from`; the raw value is the one we
                    // trust under clock skew.
                    ws.closes.push(CloseExisting {
                        person: *person,
                        to: first.from,
                    });
                    ws.inserts.push(first.clone());
                }
            }
        }

        // Everything after the first usable candidate is history fully
        // contained in this batch.
        ws.inserts.extend(list[idx + 1..].iter().cloned());
    }

    ws
}
