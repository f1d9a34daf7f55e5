use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ── Enums stored as TEXT ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookingType {
    Free,
    Paid,
}

impl BookingType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Paid => "PAID",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
    PendingSchedule,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
            Self::PendingSchedule => "pending_schedule",
        }
    }
}

// ── Database models ──

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Client {
    pub id: i64,
    pub external_user_id: i64,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub total_sessions: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: i64,
    pub client_id: i64,
    pub external_event_id: Option<String>,
    pub booking_type: BookingType,
    /// Meaningless for `pending_schedule` rows: it holds the first pack session's time.
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub ticket_context_id: Option<String>,
    pub notes: Option<String>,
    pub reminder_24h_sent: bool,
    pub reminder_1h_sent: bool,
}

impl Booking {
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.scheduled_at + chrono::TimeDelta::minutes(self.duration_minutes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Feedback {
    pub id: i64,
    pub booking_id: i64,
    pub rating: i64,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub shared_publicly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: i64,
    pub client_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub author_id: i64,
}

/// Insert payload for a booking row.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub client_id: i64,
    pub external_event_id: Option<String>,
    pub booking_type: BookingType,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub ticket_context_id: Option<String>,
    pub notes: Option<String>,
}

/// Booking joined with its owner, used by coach views and job notices.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BookingDetail {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub booking: Booking,
    pub client_user_id: i64,
    pub client_name: String,
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    /// Coaches may open a ticket on behalf of a student.
    pub user_id: Option<i64>,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct SelectTypeRequest {
    pub booking_type: BookingType,
}

#[derive(Debug, Deserialize)]
pub struct SelectQuantityRequest {
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
pub struct SelectDateRequest {
    pub date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct SelectSlotRequest {
    pub start: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub booking_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleBookingRequest {
    pub start: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AnnotateBookingRequest {
    pub notes: String,
}

#[derive(Debug, Deserialize)]
pub struct AddSessionsRequest {
    pub user_id: i64,
    pub display_name: String,
    pub booking_type: BookingType,
    pub quantity: u32,
    /// One `DD/MM/YYYY HH:MM` entry per line, in the configured zone.
    pub dates: String,
    pub duration_minutes: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClearBookingsRequest {
    pub user_id: Option<i64>,
    pub status: Option<BookingStatus>,
}

#[derive(Debug, Deserialize)]
pub struct PlanningQuery {
    pub period: Option<String>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub period: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddNoteRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct RatingRequest {
    pub rating: i64,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ShareRequest {
    pub share: bool,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
