use axum::{
    extract::{Path, State},
    Extension, Json,
};
use std::sync::Arc;

use crate::auth::Actor;
use crate::error::BookingError;
use crate::feedback::FeedbackStep;
use crate::models::*;
use crate::AppState;

/// POST /api/feedback/{booking_id}/rating
pub async fn submit_rating(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(booking_id): Path<i64>,
    Json(req): Json<RatingRequest>,
) -> Result<Json<ApiResponse<FeedbackStep>>, BookingError> {
    let step = state
        .feedback
        .submit_rating(booking_id, actor.user_id, req.rating)?;
    Ok(Json(ApiResponse::success(step)))
}

/// POST /api/feedback/{booking_id}/comment: an absent or blank comment skips it.
pub async fn submit_comment(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(booking_id): Path<i64>,
    Json(req): Json<CommentRequest>,
) -> Result<Json<ApiResponse<FeedbackStep>>, BookingError> {
    let step = state
        .feedback
        .submit_comment(booking_id, actor.user_id, req.comment.as_deref())?;
    Ok(Json(ApiResponse::success(step)))
}

pub async fn submit_share(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(booking_id): Path<i64>,
    Json(req): Json<ShareRequest>,
) -> Result<Json<ApiResponse<Feedback>>, BookingError> {
    let saved = state
        .feedback
        .submit_share(booking_id, actor.user_id, req.share)
        .await?;
    Ok(Json(ApiResponse::success(saved)))
}
