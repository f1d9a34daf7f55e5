use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::auth::Actor;
use crate::error::BookingError;
use crate::models::*;
use crate::reports::{self, MySessions};
use crate::AppState;

/// POST /api/bookings/{id}/cancel: a student cancels one of their bookings.
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<BookingDetail>>, BookingError> {
    let detail = state.desk.cancel_booking(id, actor.user_id, false).await?;
    Ok(Json(ApiResponse::success(detail)))
}

/// GET /api/bookings/mine
pub async fn my_sessions(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<ApiResponse<MySessions>>, BookingError> {
    let sessions = reports::my_sessions(&state.pool, actor.user_id, Utc::now()).await?;
    Ok(Json(ApiResponse::success(sessions)))
}
