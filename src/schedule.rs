use crate::types::ScheduleEvent;
use crate::{Error, Result};

/// Fields a brand-new weekday entry must carry beyond day and start time.
/// Which ones are required depends on the robot's schedule variant; the
/// caller reads them from the bus mirrors before the merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewEntry {
    pub mode: Option<i64>,
    pub boundary_id: Option<String>,
}

/// Validate a schedule start time: `HH:MM` with HH 00-23 and MM 00-59, or
/// the empty string meaning "delete this day".
pub fn check_start_time(value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    let bytes = value.as_bytes();
    let well_formed = bytes.len() == 5
        && bytes[2] == b':'
        && bytes.iter().enumerate().all(|(i, b)| i == 2 || b.is_ascii_digit());
    if well_formed {
        let hours: u8 = value[..2].parse().unwrap_or(99);
        let minutes: u8 = value[3..].parse().unwrap_or(99);
        if hours <= 23 && minutes <= 59 {
            return Ok(());
        }
    }
    Err(Error::InvalidTime(value.to_string()))
}

/// Apply one per-day edit to a fetched weekly schedule:
///
/// - existing entry, empty time: delete the entry
/// - existing entry, non-empty time: update only its start time
/// - no entry, non-empty time: append a new entry built from `new_entry`
/// - no entry, empty time: conflict, there is nothing to delete
///
/// The result is re-sorted ascending by weekday; day uniqueness makes ties
/// impossible.
pub fn apply_start_time_edit(
    mut events: Vec<ScheduleEvent>,
    day: u8,
    start_time: &str,
    new_entry: Option<NewEntry>,
) -> Result<Vec<ScheduleEvent>> {
    match events.iter_mut().find(|e| e.day == day) {
        Some(_) if start_time.is_empty() => {
            events.retain(|e| e.day != day);
        }
        Some(entry) => {
            entry.start_time = start_time.to_string();
        }
        None if start_time.is_empty() => {
            return Err(Error::ScheduleConflict(format!(
                "no schedule entry for day {day} to delete"
            )));
        }
        None => {
            let extra = new_entry.unwrap_or_default();
            events.push(ScheduleEvent {
                day,
                start_time: start_time.to_string(),
                mode: extra.mode,
                boundary_id: extra.boundary_id,
            });
        }
    }
    events.sort_by_key(|e| e.day);
    Ok(events)
}
