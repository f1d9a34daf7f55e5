use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::auth::{require_coach, Actor};
use crate::desk::ClearReport;
use crate::error::BookingError;
use crate::models::*;
use crate::reports::{self, Analytics, ClientStats, Period};
use crate::AppState;

type Reply<T> = Result<Json<ApiResponse<T>>, BookingError>;

// ── Single booking ──

/// GET /api/coach/bookings/{id}
pub async fn view_booking(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<i64>,
) -> Reply<BookingDetail> {
    require_coach(&actor)?;
    Ok(Json(ApiResponse::success(state.desk.view_booking(id).await?)))
}

pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<i64>,
) -> Reply<BookingDetail> {
    require_coach(&actor)?;
    let detail = state.desk.cancel_booking(id, actor.user_id, true).await?;
    Ok(Json(ApiResponse::success(detail)))
}

pub async fn mark_completed(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<i64>,
) -> Reply<BookingDetail> {
    require_coach(&actor)?;
    Ok(Json(ApiResponse::success(state.desk.mark_completed(id).await?)))
}

pub async fn mark_no_show(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<i64>,
) -> Reply<BookingDetail> {
    require_coach(&actor)?;
    Ok(Json(ApiResponse::success(state.desk.mark_no_show(id).await?)))
}

/// POST /api/coach/bookings/{id}/schedule: date a pending pack session.
pub async fn schedule_booking(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<i64>,
    Json(req): Json<ScheduleBookingRequest>,
) -> Reply<BookingDetail> {
    require_coach(&actor)?;
    let detail = state.desk.schedule_booking(id, req.start).await?;
    Ok(Json(ApiResponse::success(detail)))
}

pub async fn annotate_booking(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<i64>,
    Json(req): Json<AnnotateBookingRequest>,
) -> Reply<BookingDetail> {
    require_coach(&actor)?;
    let detail = state.desk.annotate_booking(id, &req.notes).await?;
    Ok(Json(ApiResponse::success(detail)))
}

// ── Bulk ──

/// POST /api/coach/sessions: add dated sessions by hand.
pub async fn add_sessions(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<AddSessionsRequest>,
) -> Reply<Vec<Booking>> {
    require_coach(&actor)?;
    Ok(Json(ApiResponse::success(state.desk.add_sessions(&req).await?)))
}

pub async fn clear_bookings(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<ClearBookingsRequest>,
) -> Reply<ClearReport> {
    require_coach(&actor)?;
    let report = state.desk.clear_bookings(req.user_id, req.status).await?;
    Ok(Json(ApiResponse::success(report)))
}

// ── Reports ──

/// GET /api/coach/planning?period=today|week|month&user_id=
pub async fn planning(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Query(q): Query<PlanningQuery>,
) -> Reply<Vec<BookingDetail>> {
    require_coach(&actor)?;
    let period = Period::parse(q.period.as_deref(), Period::Week)?;
    let bookings =
        reports::planning(&state.pool, state.config.timezone, period, q.user_id, Utc::now()).await?;
    Ok(Json(ApiResponse::success(bookings)))
}

/// GET /api/coach/analytics?period=week|month|quarter|all
pub async fn analytics(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Query(q): Query<AnalyticsQuery>,
) -> Reply<Analytics> {
    require_coach(&actor)?;
    let period = Period::parse(q.period.as_deref(), Period::Month)?;
    Ok(Json(ApiResponse::success(
        reports::analytics(&state.pool, period, Utc::now()).await?,
    )))
}

pub async fn client_stats(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(user_id): Path<i64>,
) -> Reply<ClientStats> {
    require_coach(&actor)?;
    Ok(Json(ApiResponse::success(
        reports::client_stats(&state.pool, user_id, Utc::now()).await?,
    )))
}

// ── Notes ──

pub async fn list_notes(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(user_id): Path<i64>,
) -> Reply<Vec<Note>> {
    require_coach(&actor)?;
    Ok(Json(ApiResponse::success(reports::notes(&state.pool, user_id).await?)))
}

pub async fn add_note(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(user_id): Path<i64>,
    Json(req): Json<AddNoteRequest>,
) -> Reply<Note> {
    require_coach(&actor)?;
    let note = reports::add_note(&state.pool, user_id, &req.content, actor.user_id).await?;
    Ok(Json(ApiResponse::success(note)))
}
