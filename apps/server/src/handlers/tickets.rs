use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::auth::{self, Actor};
use crate::error::BookingError;
use crate::models::*;
use crate::session::{SlotOffer, SlotOutcome, WizardStep};
use crate::tickets::TicketInfo;
use crate::AppState;

#[derive(Serialize)]
pub struct TicketOpened {
    pub ticket: TicketInfo,
    pub step: WizardStep,
}

#[derive(Serialize)]
pub struct TicketClosed {
    pub ticket_id: String,
    pub session_discarded: bool,
}

/// POST /api/tickets: open a booking ticket and start its wizard.
pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<Json<ApiResponse<TicketOpened>>, BookingError> {
    let display_name = req.display_name.trim();
    if display_name.is_empty() {
        return Err(BookingError::Validation("display name is required".into()));
    }

    // Opening on behalf of someone else is a coach action and skips the guard.
    let (user_id, on_behalf) = match req.user_id {
        Some(target) if target != actor.user_id => {
            auth::require_coach(&actor)?;
            (target, true)
        }
        _ => (actor.user_id, false),
    };

    let ticket = state
        .guard
        .request_ticket_creation(user_id, display_name, on_behalf)
        .await?;
    let step = state
        .sessions
        .open_session(&ticket.ticket_id, user_id, display_name);

    tracing::info!("Ticket {} opened for user {} by {}", ticket.name, user_id, actor.user_id);
    Ok(Json(ApiResponse::success(TicketOpened { ticket, step })))
}

/// DELETE /api/tickets/{ticket_id}
pub async fn close_ticket(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(ticket_id): Path<String>,
) -> Result<Json<ApiResponse<TicketClosed>>, BookingError> {
    state
        .guard
        .close_ticket(&ticket_id, actor.user_id, actor.privileged)
        .await?;
    let session_discarded = state.sessions.discard(&ticket_id);
    Ok(Json(ApiResponse::success(TicketClosed {
        ticket_id,
        session_discarded,
    })))
}

pub async fn select_type(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(ticket_id): Path<String>,
    Json(req): Json<SelectTypeRequest>,
) -> Result<Json<ApiResponse<WizardStep>>, BookingError> {
    let step = state
        .sessions
        .select_type(&ticket_id, actor.user_id, actor.privileged, req.booking_type)?;
    Ok(Json(ApiResponse::success(step)))
}

pub async fn select_quantity(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(ticket_id): Path<String>,
    Json(req): Json<SelectQuantityRequest>,
) -> Result<Json<ApiResponse<WizardStep>>, BookingError> {
    let step = state
        .sessions
        .select_quantity(&ticket_id, actor.user_id, actor.privileged, req.quantity)?;
    Ok(Json(ApiResponse::success(step)))
}

/// POST /api/tickets/{ticket_id}/date: returns the free slots of that day.
pub async fn select_date(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(ticket_id): Path<String>,
    Json(req): Json<SelectDateRequest>,
) -> Result<Json<ApiResponse<SlotOffer>>, BookingError> {
    let offer = state
        .sessions
        .select_date(&ticket_id, actor.user_id, actor.privileged, req.date)
        .await?;
    Ok(Json(ApiResponse::success(offer)))
}

pub async fn select_slot(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(ticket_id): Path<String>,
    Json(req): Json<SelectSlotRequest>,
) -> Result<Json<ApiResponse<SlotOutcome>>, BookingError> {
    let outcome = state
        .sessions
        .select_slot(&ticket_id, actor.user_id, actor.privileged, req.start)
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn reschedule(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(ticket_id): Path<String>,
    Json(req): Json<RescheduleRequest>,
) -> Result<Json<ApiResponse<WizardStep>>, BookingError> {
    let step = state
        .sessions
        .start_reschedule(&ticket_id, actor.user_id, actor.privileged, req.booking_id)
        .await?;
    Ok(Json(ApiResponse::success(step)))
}
