use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::models::MachineError;

pub const DEFAULT_WINDOW: TimeDelta = TimeDelta::hours(24);
pub const DEFAULT_MIN_SPAN: TimeDelta = TimeDelta::minutes(60);

/// The same error recurring on one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentError {
    pub machine_id: i64,
    pub location_id: i64,
    pub error_name: String,
    pub occurrences: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Group `errors` (already limited to the window) by machine and error name,
/// keeping groups with two or more occurrences at least `min_span` apart.
/// Most frequent first.
pub fn persistent_errors<'a>(
    errors: impl IntoIterator<Item = &'a MachineError>,
    min_span: TimeDelta,
) -> Vec<PersistentError> {
    let mut groups: BTreeMap<(i64, &str), PersistentError> = BTreeMap::new();
    for e in errors {
        groups
            .entry((e.machine_id, e.error_name.as_str()))
            .and_modify(|g| {
                g.occurrences += 1;
                g.first_seen = g.first_seen.min(e.occurred_at);
                g.last_seen = g.last_seen.max(e.occurred_at);
            })
            .or_insert_with(|| PersistentError {
                machine_id: e.machine_id,
                location_id: e.location_id,
                error_name: e.error_name.clone(),
                occurrences: 1,
                first_seen: e.occurred_at,
                last_seen: e.occurred_at,
            });
    }

    let mut out: Vec<PersistentError> = groups
        .into_values()
        .filter(|g| g.occurrences >= 2 && g.last_seen - g.first_seen >= min_span)
        .collect();
    out.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn error(id: &str, machine_id: i64, name: &str, hour: u32, minute: u32) -> MachineError {
        MachineError {
            external_id: id.to_string(),
            machine_id,
            location_id: 1,
            error_name: name.to_string(),
            error_type: None,
            error_code: None,
            occurred_at: Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap(),
        }
    }

    #[test]
    fn groups_recurring_errors_per_machine() {
        let errors = vec![
            error("a", 1, "DOOR_LOCK", 8, 0),
            error("b", 1, "DOOR_LOCK", 9, 30),
            error("c", 1, "DOOR_LOCK", 12, 0),
            // same name on another machine is a separate group
            error("d", 2, "DOOR_LOCK", 8, 0),
            error("e", 1, "WATER_INLET", 8, 0),
        ];
        let found = persistent_errors(&errors, DEFAULT_MIN_SPAN);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].machine_id, 1);
        assert_eq!(found[0].error_name, "DOOR_LOCK");
        assert_eq!(found[0].occurrences, 3);
        assert_eq!(found[0].first_seen, errors[0].occurred_at);
        assert_eq!(found[0].last_seen, errors[2].occurred_at);
    }

    #[test]
    fn bursts_shorter_than_min_span_are_not_persistent() {
        let errors = vec![
            error("a", 1, "DRAIN", 8, 0),
            error("b", 1, "DRAIN", 8, 20),
            error("c", 1, "DRAIN", 8, 59),
        ];
        assert!(persistent_errors(&errors, DEFAULT_MIN_SPAN).is_empty());
        assert_eq!(persistent_errors(&errors, TimeDelta::minutes(30)).len(), 1);
    }

    #[test]
    fn most_frequent_first() {
        let errors = vec![
            error("a", 1, "DRAIN", 8, 0),
            error("b", 1, "DRAIN", 10, 0),
            error("c", 2, "HEATER", 8, 0),
            error("d", 2, "HEATER", 9, 0),
            error("e", 2, "HEATER", 10, 0),
        ];
        let found = persistent_errors(&errors, DEFAULT_MIN_SPAN);
        assert_eq!(
            found.iter().map(|p| p.error_name.as_str()).collect::<Vec<_>>(),
            vec!["HEATER", "DRAIN"]
        );
    }
}
