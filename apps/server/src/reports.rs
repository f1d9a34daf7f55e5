//! Read-only views: planning, client stats and notes, analytics, "my sessions".

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db;
use crate::error::BookingError;
use crate::models::{Booking, BookingDetail, BookingStatus, BookingType, Client, Note};
use crate::zone;

const STATS_UPCOMING_LIMIT: usize = 3;
const STATS_NOTES_LIMIT: usize = 3;
const MY_SESSIONS_LIMIT: usize = 5;
const MAX_NOTE_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Today,
    Week,
    Month,
    Quarter,
    All,
}

impl Period {
    pub fn parse(raw: Option<&str>, default: Period) -> Result<Self, BookingError> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") => Ok(default),
            Some("today") => Ok(Self::Today),
            Some("week") => Ok(Self::Week),
            Some("month") => Ok(Self::Month),
            Some("quarter") => Ok(Self::Quarter),
            Some("all") => Ok(Self::All),
            Some(other) => Err(BookingError::Validation(format!("unknown period '{other}'"))),
        }
    }

    fn days(self) -> Option<i64> {
        match self {
            Self::Today => Some(1),
            Self::Week => Some(7),
            Self::Month => Some(30),
            Self::Quarter => Some(90),
            Self::All => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub confirmed: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub no_show: usize,
    pub pending_schedule: usize,
    pub free: usize,
    pub paid: usize,
}

impl StatusCounts {
    pub fn tally<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> Self {
        let mut counts = Self::default();
        for b in bookings {
            match b.status {
                BookingStatus::Confirmed => counts.confirmed += 1,
                BookingStatus::Completed => counts.completed += 1,
                BookingStatus::Cancelled => counts.cancelled += 1,
                BookingStatus::NoShow => counts.no_show += 1,
                BookingStatus::PendingSchedule => counts.pending_schedule += 1,
            }
            match b.booking_type {
                BookingType::Free => counts.free += 1,
                BookingType::Paid => counts.paid += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.free + self.paid
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub client: Client,
    pub counts: StatusCounts,
    pub average_rating: Option<f64>,
    pub upcoming: Vec<Booking>,
    pub note_count: usize,
    pub latest_notes: Vec<Note>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analytics {
    pub period: Period,
    pub counts: StatusCounts,
    pub total: usize,
    pub completion_rate: f64,
    pub no_show_rate: f64,
    pub cancellation_rate: f64,
    pub active_clients: usize,
    pub new_clients: i64,
    pub coached_hours: f64,
    pub average_rating: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MySessions {
    pub upcoming: Vec<Booking>,
    pub pending_to_schedule: usize,
    pub completed: usize,
    pub cancelled: usize,
}

/// Percentage with one decimal; 0 when there is nothing to divide.
fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 * 1000.0 / whole as f64).round() / 10.0
    }
}

async fn client_by_user(pool: &SqlitePool, user_id: i64) -> Result<Client, BookingError> {
    db::find_client_by_user(pool, user_id)
        .await?
        .ok_or_else(|| BookingError::not_found("client", user_id))
}

/// Scheduled sessions from the start of today (local) over the period.
pub async fn planning(
    pool: &SqlitePool,
    tz: Tz,
    period: Period,
    user_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Vec<BookingDetail>, BookingError> {
    let (from, _) = zone::day_bounds(tz, zone::local_date(tz, now));
    let days = period.days().unwrap_or(365);
    let (to, _) = zone::day_bounds(tz, zone::local_date(tz, now) + TimeDelta::days(days));
    Ok(db::scheduled_between(pool, from, to, user_id).await?)
}

pub async fn client_stats(pool: &SqlitePool, user_id: i64, now: DateTime<Utc>) -> Result<ClientStats, BookingError> {
    let client = client_by_user(pool, user_id).await?;
    let bookings = db::bookings_for_client(pool, client.id).await?;
    let notes = db::notes_for_client(pool, client.id).await?;

    let upcoming = bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Confirmed && b.scheduled_at > now)
        .take(STATS_UPCOMING_LIMIT)
        .cloned()
        .collect();

    Ok(ClientStats {
        counts: StatusCounts::tally(&bookings),
        average_rating: db::average_rating_for_client(pool, client.id).await?,
        upcoming,
        note_count: notes.len(),
        latest_notes: notes.into_iter().take(STATS_NOTES_LIMIT).collect(),
        client,
    })
}

pub async fn notes(pool: &SqlitePool, user_id: i64) -> Result<Vec<Note>, BookingError> {
    let client = client_by_user(pool, user_id).await?;
    Ok(db::notes_for_client(pool, client.id).await?)
}

pub async fn add_note(pool: &SqlitePool, user_id: i64, content: &str, author_id: i64) -> Result<Note, BookingError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(BookingError::Validation("note cannot be empty".into()));
    }
    if content.chars().count() > MAX_NOTE_CHARS {
        return Err(BookingError::Validation(format!(
            "note is longer than {MAX_NOTE_CHARS} characters"
        )));
    }
    let client = client_by_user(pool, user_id).await?;
    let note = db::insert_note(pool, client.id, content, author_id, Utc::now()).await?;
    tracing::info!("Note {} added for client {} by {}", note.id, client.id, author_id);
    Ok(note)
}

pub async fn analytics(pool: &SqlitePool, period: Period, now: DateTime<Utc>) -> Result<Analytics, BookingError> {
    let since = period.days().map(|d| now - TimeDelta::days(d));
    let bookings: Vec<Booking> = db::bookings_since(pool, since)
        .await?
        .into_iter()
        .filter(|b| b.scheduled_at <= now)
        .collect();
    let counts = StatusCounts::tally(&bookings);

    let settled = counts.completed + counts.no_show + counts.cancelled;
    let active_clients = bookings
        .iter()
        .filter(|b| b.status != BookingStatus::Cancelled)
        .map(|b| b.client_id)
        .collect::<HashSet<_>>()
        .len();
    let coached_minutes: i64 = bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Completed)
        .map(|b| b.duration_minutes)
        .sum();
    let new_clients = db::count_clients_created_since(pool, since).await?;

    Ok(Analytics {
        period,
        total: counts.total(),
        completion_rate: rate(counts.completed, settled),
        no_show_rate: rate(counts.no_show, settled),
        cancellation_rate: rate(counts.cancelled, settled),
        active_clients,
        new_clients,
        coached_hours: (coached_minutes as f64 / 6.0).round() / 10.0,
        average_rating: db::average_rating_since(pool, since).await?,
        counts,
    })
}

/// A student's own overview. Unknown users get an empty one.
pub async fn my_sessions(pool: &SqlitePool, user_id: i64, now: DateTime<Utc>) -> Result<MySessions, BookingError> {
    let Some(client) = db::find_client_by_user(pool, user_id).await? else {
        return Ok(MySessions::default());
    };
    let bookings = db::bookings_for_client(pool, client.id).await?;
    let counts = StatusCounts::tally(&bookings);
    Ok(MySessions {
        upcoming: bookings
            .into_iter()
            .filter(|b| b.status == BookingStatus::Confirmed && b.scheduled_at > now)
            .take(MY_SESSIONS_LIMIT)
            .collect(),
        pending_to_schedule: counts.pending_schedule,
        completed: counts.completed,
        cancelled: counts.cancelled,
    })
}
