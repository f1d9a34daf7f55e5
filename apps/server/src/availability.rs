use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;

use crate::calendar::{BusyInterval, CalendarProvider};
use crate::config::{BUSINESS_CLOSE_HOUR, BUSINESS_OPEN_HOUR, SLOT_STEP_MINUTES};
use crate::zone;

/// Window in which candidate starts are generated.
#[derive(Debug, Clone, Copy)]
pub struct BusinessHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub step: TimeDelta,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(BUSINESS_OPEN_HOUR, 0, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(BUSINESS_CLOSE_HOUR, 0, 0).unwrap_or(NaiveTime::MIN),
            step: TimeDelta::minutes(SLOT_STEP_MINUTES),
        }
    }
}

/// Free start instants for `day`, chronological.
///
/// Candidates run from open to close (exclusive) in `step` increments. A candidate
/// is kept when `[start, start + duration)` overlaps no busy interval. A session
/// starting before close may end after it.
pub fn free_slots(
    tz: Tz,
    hours: BusinessHours,
    day: NaiveDate,
    duration_minutes: i64,
    busy: &[BusyInterval],
) -> Vec<DateTime<Utc>> {
    let duration = TimeDelta::minutes(duration_minutes);
    let close = zone::localize(tz, day.and_time(hours.close));
    let mut cursor = zone::localize(tz, day.and_time(hours.open));
    let mut slots = Vec::new();

    while cursor < close {
        let end = cursor + duration;
        if !busy.iter().any(|b| b.overlaps(cursor, end)) {
            slots.push(cursor);
        }
        cursor += hours.step;
    }

    slots
}

/// Computes bookable slots against live calendar state. Nothing is cached.
pub struct AvailabilityResolver {
    calendar: Arc<dyn CalendarProvider>,
    tz: Tz,
    hours: BusinessHours,
}

impl AvailabilityResolver {
    pub fn new(calendar: Arc<dyn CalendarProvider>, tz: Tz) -> Self {
        Self {
            calendar,
            tz,
            hours: BusinessHours::default(),
        }
    }

    /// Provider failure yields an empty list, same as a fully booked day.
    pub async fn get_available_slots(&self, day: NaiveDate, duration_minutes: i64) -> Vec<DateTime<Utc>> {
        let (day_start, day_end) = zone::day_bounds(self.tz, day);
        match self.calendar.list_busy_intervals(day_start, day_end).await {
            Ok(busy) => free_slots(self.tz, self.hours, day, duration_minutes, &busy),
            Err(e) => {
                tracing::warn!("No availability for {}: calendar unavailable ({})", day, e);
                Vec::new()
            }
        }
    }
}
