use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::models::ApiResponse;

/// Failures surfaced by the booking engine to its callers.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("you already have an open ticket: {ticket}")]
    DuplicateTicket { ticket: String },

    #[error("a ticket is already being created for you, please wait")]
    AlreadyInProgress,

    #[error("this booking session has expired, please start again")]
    SessionExpired,

    #[error("could not write to the calendar, please try again")]
    CalendarWriteFailed,

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    InvalidStep(String),

    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid gateway signature")]
    Unauthorized,

    #[error("not allowed")]
    Forbidden,

    #[error("ticket creation failed: {0}")]
    TicketCreationFailed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BookingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(_) | Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DuplicateTicket { .. } | Self::AlreadyInProgress => StatusCode::CONFLICT,
            Self::SessionExpired => StatusCode::GONE,
            Self::CalendarWriteFailed | Self::TicketCreationFailed(_) => StatusCode::BAD_GATEWAY,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidStep(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Database(e) => {
                tracing::error!("Database error: {}", e);
                "Internal error".to_string()
            }
            Self::Configuration(msg) => {
                tracing::error!("Configuration error at request time: {}", msg);
                "Internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ApiResponse::<()>::error(message))).into_response()
    }
}
