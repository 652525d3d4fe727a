use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::types::{CandidateInterval, DetectionEvent, PersonKey};

struct Cursor {
    zone_id: i64,
    from: DateTime<Utc>,
}

/// Turn an ordered batch of detections into per-person candidate
/// intervals. Events must be sorted ascending by `creation_time`.
///
/// Each person gets zero or more closed intervals (one per observed
/// zone change) followed by exactly one open interval for the zone
/// they were last seen in. The per-person lists are chronological and
/// must not be reordered downstream.
pub fn build_intervals(
    events: &[DetectionEvent],
) -> BTreeMap<PersonKey, Vec<CandidateInterval>> {
    let mut cursors: BTreeMap<PersonKey, Cursor> = BTreeMap::new();
    let mut out: BTreeMap<PersonKey, Vec<CandidateInterval>> = BTreeMap::new();

    for ev in events {
        match cursors.get_mut(&ev.person) {
            None => {
                cursors.insert(
                    ev.person,
                    Cursor {
                        zone_id: ev.zone_id,
                        from: ev.creation_time,
                    },
                );
            }
            Some(cur) => {
                if cur.zone_id != ev.zone_id {
                    out.entry(ev.person).or_default().push(CandidateInterval {
                        person: ev.person,
                        zone_id: cur.zone_id,
                        from: cur.from,
                        to: Some(ev.creation_time),
                    });
                    cur.zone_id = ev.zone_id;
                    cur.from = ev.creation_time;
                }
            }
        }
    }

    // The last cursor position becomes the person's open interval.
    for (person, cur) in cursors {
        out.entry(person).or_default().push(CandidateInterval {
            person,
            zone_id: cur.zone_id,
            from: cur.from,
            to: None,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 30, 9, min, 0).unwrap()
    }

    fn ev(id: i64, zone_id: i64, min: u32, person: PersonKey) -> DetectionEvent {
        DetectionEvent {
            id,
            zone_id,
            creation_time: ts(min),
            person,
        }
    }

    #[test]
    fn single_sighting_yields_one_open_interval() {
        let events = vec![ev(1, 4, 0, PersonKey::Known(1))];
        let out = build_intervals(&events);
        assert_eq!(
            out[&PersonKey::Known(1)],
            vec![CandidateInterval {
                person: PersonKey::Known(1),
                zone_id: 4,
                from: ts(0),
                to: None,
            }]
        );
    }

    #[test]
    fn repeated_sightings_in_same_zone_do_not_split() {
        let p = PersonKey::Known(1);
        let events = vec![ev(1, 4, 0, p), ev(2, 4, 5, p), ev(3, 4, 10, p)];
        let out = build_intervals(&events);
        let list = &out[&p];
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].from, ts(0));
        assert_eq!(list[0].to, None);
    }

    #[test]
    fn zone_change_closes_at_the_new_sighting() {
        let p = PersonKey::Known(1);
        let events = vec![ev(1, 4, 0, p), ev(2, 5, 30, p), ev(3, 6, 45, p)];
        let out = build_intervals(&events);
        let list = &out[&p];
        assert_eq!(list.len(), 3);
        assert_eq!((list[0].zone_id, list[0].from, list[0].to), (4, ts(0), Some(ts(30))));
        assert_eq!((list[1].zone_id, list[1].from, list[1].to), (5, ts(30), Some(ts(45))));
        assert_eq!((list[2].zone_id, list[2].from, list[2].to), (6, ts(45), None));
    }

    #[test]
    fn known_and_unknown_with_same_id_stay_separate() {
        let events = vec![
            ev(1, 4, 0, PersonKey::Known(9)),
            ev(2, 5, 1, PersonKey::Unknown(9)),
        ];
        let out = build_intervals(&events);
        assert_eq!(out.len(), 2);
        assert_eq!(out[&PersonKey::Known(9)][0].zone_id, 4);
        assert_eq!(out[&PersonKey::Unknown(9)][0].zone_id, 5);
    }

    #[test]
    fn interleaved_people_keep_independent_cursors() {
        let a = PersonKey::Known(1);
        let b = PersonKey::Unknown(2);
        let events = vec![ev(1, 4, 0, a), ev(2, 7, 1, b), ev(3, 5, 2, a), ev(4, 7, 3, b)];
        let out = build_intervals(&events);
        assert_eq!(out[&a].len(), 2);
        assert_eq!(out[&a][0].to, Some(ts(2)));
        assert_eq!(out[&b].len(), 1);
        assert_eq!(out[&b][0].to, None);
    }

    #[test]
    fn input_is_not_consumed() {
        let events = vec![ev(1, 4, 0, PersonKey::Known(1))];
        let _ = build_intervals(&events);
        assert_eq!(events.len(), 1);
    }
}
