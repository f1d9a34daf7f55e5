use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteExecutor, SqlitePool};

use crate::models::*;

/// Ordered list of schema migrations; each is applied once and recorded in `_migrations`.
const MIGRATIONS: &[(&str, &str)] = &[
    ("001_init", include_str!("../migrations/001_init.sql")),
    ("002_indexes", include_str!("../migrations/002_indexes.sql")),
];

/// Shared SELECT for bookings joined with their owner.
const BOOKING_DETAIL_SELECT: &str =
    "SELECT b.*, c.external_user_id AS client_user_id, c.display_name AS client_name
     FROM bookings b
     JOIN clients c ON c.id = b.client_id";

/// Which reminder flag a claim targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    DayBefore,
    HourBefore,
}

impl ReminderKind {
    fn column(self) -> &'static str {
        match self {
            Self::DayBefore => "reminder_24h_sent",
            Self::HourBefore => "reminder_1h_sent",
        }
    }
}

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    // Enable WAL mode for better concurrent access
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    for (name, sql) in MIGRATIONS {
        let applied: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?")
                .bind(*name)
                .fetch_one(pool)
                .await?;
        if applied {
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&mut *tx).await?;
            }
        }
        sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
            .bind(*name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!("Applied migration: {}", name);
    }

    tracing::info!("Database migrations up to date");
    Ok(())
}

// ── Clients ──

/// Resolve-or-create a client by external user id. The display name is refreshed.
pub async fn upsert_client<'e>(
    db: impl SqliteExecutor<'e>,
    user_id: i64,
    display_name: &str,
    now: DateTime<Utc>,
) -> sqlx::Result<Client> {
    sqlx::query_as::<_, Client>(
        "INSERT INTO clients (external_user_id, display_name, created_at, total_sessions)
         VALUES (?, ?, ?, 0)
         ON CONFLICT(external_user_id) DO UPDATE SET display_name = excluded.display_name
         RETURNING *",
    )
    .bind(user_id)
    .bind(display_name)
    .bind(now)
    .fetch_one(db)
    .await
}

#[cfg(test)]
pub async fn find_client<'e>(db: impl SqliteExecutor<'e>, id: i64) -> sqlx::Result<Option<Client>> {
    sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn find_client_by_user<'e>(
    db: impl SqliteExecutor<'e>,
    user_id: i64,
) -> sqlx::Result<Option<Client>> {
    sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE external_user_id = ?")
        .bind(user_id)
        .fetch_optional(db)
        .await
}

pub async fn increment_total_sessions<'e>(
    db: impl SqliteExecutor<'e>,
    client_id: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE clients SET total_sessions = total_sessions + 1 WHERE id = ?")
        .bind(client_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Clients first seen at or after `since` (`None` = all).
pub async fn count_clients_created_since<'e>(
    db: impl SqliteExecutor<'e>,
    since: Option<DateTime<Utc>>,
) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM clients WHERE (? IS NULL OR created_at >= ?)")
        .bind(since)
        .bind(since)
        .fetch_one(db)
        .await
}

// ── Bookings ──

pub async fn insert_booking<'e>(db: impl SqliteExecutor<'e>, new: &NewBooking) -> sqlx::Result<i64> {
    let id = sqlx::query(
        "INSERT INTO bookings (client_id, external_event_id, booking_type, scheduled_at,
         duration_minutes, status, created_at, ticket_context_id, notes)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.client_id)
    .bind(&new.external_event_id)
    .bind(new.booking_type)
    .bind(new.scheduled_at)
    .bind(new.duration_minutes)
    .bind(new.status)
    .bind(new.created_at)
    .bind(&new.ticket_context_id)
    .bind(&new.notes)
    .execute(db)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn find_booking<'e>(db: impl SqliteExecutor<'e>, id: i64) -> sqlx::Result<Option<Booking>> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn find_booking_detail<'e>(
    db: impl SqliteExecutor<'e>,
    id: i64,
) -> sqlx::Result<Option<BookingDetail>> {
    let query = format!("{BOOKING_DETAIL_SELECT} WHERE b.id = ?");
    sqlx::query_as::<_, BookingDetail>(&query)
        .bind(id)
        .fetch_optional(db)
        .await
}

/// Status-guarded transition. Returns false when the row was not in `from`.
pub async fn transition_status<'e>(
    db: impl SqliteExecutor<'e>,
    id: i64,
    from: BookingStatus,
    to: BookingStatus,
) -> sqlx::Result<bool> {
    let result = sqlx::query("UPDATE bookings SET status = ? WHERE id = ? AND status = ?")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(db)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Move a booking to a new instant and event; reminders are re-armed.
pub async fn reschedule_booking<'e>(
    db: impl SqliteExecutor<'e>,
    id: i64,
    scheduled_at: DateTime<Utc>,
    event_id: &str,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE bookings
         SET scheduled_at = ?, external_event_id = ?, status = 'confirmed',
             reminder_24h_sent = 0, reminder_1h_sent = 0
         WHERE id = ? AND status IN ('confirmed', 'pending_schedule')",
    )
    .bind(scheduled_at)
    .bind(event_id)
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_booking_notes<'e>(
    db: impl SqliteExecutor<'e>,
    id: i64,
    notes: &str,
) -> sqlx::Result<bool> {
    let result = sqlx::query("UPDATE bookings SET notes = ? WHERE id = ?")
        .bind(notes)
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Atomically flip a reminder flag from 0 to 1. Only the caller that wins the flip sends.
pub async fn claim_reminder<'e>(
    db: impl SqliteExecutor<'e>,
    id: i64,
    kind: ReminderKind,
) -> sqlx::Result<bool> {
    let column = kind.column();
    let query = format!(
        "UPDATE bookings SET {column} = 1
         WHERE id = ? AND {column} = 0 AND status = 'confirmed'"
    );
    let result = sqlx::query(&query).bind(id).execute(db).await?;
    Ok(result.rows_affected() == 1)
}

pub async fn upcoming_confirmed<'e>(
    db: impl SqliteExecutor<'e>,
    now: DateTime<Utc>,
) -> sqlx::Result<Vec<BookingDetail>> {
    let query = format!(
        "{BOOKING_DETAIL_SELECT}
         WHERE b.status = 'confirmed' AND b.scheduled_at > ?
         ORDER BY b.scheduled_at ASC"
    );
    sqlx::query_as::<_, BookingDetail>(&query)
        .bind(now)
        .fetch_all(db)
        .await
}

/// Confirmed bookings started in `(since, now)` that have no feedback yet.
pub async fn started_without_feedback<'e>(
    db: impl SqliteExecutor<'e>,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> sqlx::Result<Vec<BookingDetail>> {
    let query = format!(
        "{BOOKING_DETAIL_SELECT}
         LEFT JOIN feedbacks f ON f.booking_id = b.id
         WHERE b.status = 'confirmed' AND b.scheduled_at > ? AND b.scheduled_at < ?
           AND f.id IS NULL
         ORDER BY b.scheduled_at ASC"
    );
    sqlx::query_as::<_, BookingDetail>(&query)
        .bind(since)
        .bind(now)
        .fetch_all(db)
        .await
}

pub async fn pending_created_before<'e>(
    db: impl SqliteExecutor<'e>,
    cutoff: DateTime<Utc>,
) -> sqlx::Result<Vec<BookingDetail>> {
    let query = format!(
        "{BOOKING_DETAIL_SELECT}
         WHERE b.status = 'pending_schedule' AND b.created_at <= ?
         ORDER BY b.created_at ASC"
    );
    sqlx::query_as::<_, BookingDetail>(&query)
        .bind(cutoff)
        .fetch_all(db)
        .await
}

/// Scheduled (non-placeholder, non-cancelled) bookings in `[from, to)`.
pub async fn scheduled_between<'e>(
    db: impl SqliteExecutor<'e>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    user_id: Option<i64>,
) -> sqlx::Result<Vec<BookingDetail>> {
    let query = format!(
        "{BOOKING_DETAIL_SELECT}
         WHERE b.status IN ('confirmed', 'completed', 'no_show')
           AND b.scheduled_at >= ? AND b.scheduled_at < ?
           AND (? IS NULL OR c.external_user_id = ?)
         ORDER BY b.scheduled_at ASC"
    );
    sqlx::query_as::<_, BookingDetail>(&query)
        .bind(from)
        .bind(to)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(db)
        .await
}

pub async fn bookings_for_client<'e>(
    db: impl SqliteExecutor<'e>,
    client_id: i64,
) -> sqlx::Result<Vec<Booking>> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings WHERE client_id = ? ORDER BY scheduled_at ASC, id ASC",
    )
    .bind(client_id)
    .fetch_all(db)
    .await
}

/// Bookings scheduled at or after `since` (`None` = all), for reporting.
pub async fn bookings_since<'e>(
    db: impl SqliteExecutor<'e>,
    since: Option<DateTime<Utc>>,
) -> sqlx::Result<Vec<Booking>> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings WHERE (? IS NULL OR scheduled_at >= ?) ORDER BY scheduled_at ASC",
    )
    .bind(since)
    .bind(since)
    .fetch_all(db)
    .await
}

pub async fn matching_bookings<'e>(
    db: impl SqliteExecutor<'e>,
    user_id: Option<i64>,
    status: Option<BookingStatus>,
) -> sqlx::Result<Vec<BookingDetail>> {
    let query = format!(
        "{BOOKING_DETAIL_SELECT}
         WHERE (? IS NULL OR c.external_user_id = ?)
           AND (? IS NULL OR b.status = ?)
         ORDER BY b.id ASC"
    );
    sqlx::query_as::<_, BookingDetail>(&query)
        .bind(user_id)
        .bind(user_id)
        .bind(status)
        .bind(status)
        .fetch_all(db)
        .await
}

/// Delete a booking; its feedback goes with it (ON DELETE CASCADE).
pub async fn delete_booking<'e>(db: impl SqliteExecutor<'e>, id: i64) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM bookings WHERE id = ?")
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() == 1)
}

// ── Feedback ──

pub async fn insert_feedback<'e>(
    db: impl SqliteExecutor<'e>,
    booking_id: i64,
    rating: i64,
    comment: Option<&str>,
    shared_publicly: bool,
    now: DateTime<Utc>,
) -> sqlx::Result<Feedback> {
    sqlx::query_as::<_, Feedback>(
        "INSERT INTO feedbacks (booking_id, rating, comment, created_at, shared_publicly)
         VALUES (?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(booking_id)
    .bind(rating)
    .bind(comment)
    .bind(now)
    .bind(shared_publicly)
    .fetch_one(db)
    .await
}

#[cfg(test)]
pub async fn find_feedback_for_booking<'e>(
    db: impl SqliteExecutor<'e>,
    booking_id: i64,
) -> sqlx::Result<Option<Feedback>> {
    sqlx::query_as::<_, Feedback>("SELECT * FROM feedbacks WHERE booking_id = ?")
        .bind(booking_id)
        .fetch_optional(db)
        .await
}

pub async fn average_rating_for_client<'e>(
    db: impl SqliteExecutor<'e>,
    client_id: i64,
) -> sqlx::Result<Option<f64>> {
    sqlx::query_scalar(
        "SELECT AVG(f.rating) FROM feedbacks f
         JOIN bookings b ON b.id = f.booking_id
         WHERE b.client_id = ?",
    )
    .bind(client_id)
    .fetch_one(db)
    .await
}

pub async fn average_rating_since<'e>(
    db: impl SqliteExecutor<'e>,
    since: Option<DateTime<Utc>>,
) -> sqlx::Result<Option<f64>> {
    sqlx::query_scalar("SELECT AVG(rating) FROM feedbacks WHERE (? IS NULL OR created_at >= ?)")
        .bind(since)
        .bind(since)
        .fetch_one(db)
        .await
}

// ── Notes ──

pub async fn insert_note<'e>(
    db: impl SqliteExecutor<'e>,
    client_id: i64,
    content: &str,
    author_id: i64,
    now: DateTime<Utc>,
) -> sqlx::Result<Note> {
    sqlx::query_as::<_, Note>(
        "INSERT INTO notes (client_id, content, created_at, author_id)
         VALUES (?, ?, ?, ?)
         RETURNING *",
    )
    .bind(client_id)
    .bind(content)
    .bind(now)
    .bind(author_id)
    .fetch_one(db)
    .await
}

/// Newest first.
pub async fn notes_for_client<'e>(
    db: impl SqliteExecutor<'e>,
    client_id: i64,
) -> sqlx::Result<Vec<Note>> {
    sqlx::query_as::<_, Note>(
        "SELECT * FROM notes WHERE client_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(client_id)
    .fetch_all(db)
    .await
}

/// True for constraint violations on UNIQUE columns (e.g. a second feedback for a booking).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
