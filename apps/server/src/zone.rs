//! Conversions between UTC instants and the single configured local zone.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

/// Attach the configured zone to a naive local time.
///
/// Ambiguous times (DST fall-back) resolve to the earlier instant; times inside a
/// spring-forward gap are pushed past the gap.
pub fn localize(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return dt.with_timezone(&Utc);
    }
    match tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest() {
        Some(dt) => dt.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    }
}

/// `[local midnight, next local midnight)` for a calendar day.
pub fn day_bounds(tz: Tz, day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = localize(tz, day.and_time(NaiveTime::MIN));
    let next = day.succ_opt().unwrap_or(day);
    let end = localize(tz, next.and_time(NaiveTime::MIN));
    (start, end)
}

pub fn local_date(tz: Tz, instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// Render an instant for humans, e.g. `14/03/2026 10:30`.
pub fn format_local(tz: Tz, instant: DateTime<Utc>) -> String {
    instant.with_timezone(&tz).format("%d/%m/%Y %H:%M").to_string()
}

/// Parse `DD/MM/YYYY HH:MM` as local time in the configured zone.
pub fn parse_local(tz: Tz, raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), "%d/%m/%Y %H:%M")
        .ok()
        .map(|naive| localize(tz, naive))
}
