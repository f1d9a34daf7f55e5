//! Post-session feedback: rating → optional comment → share decision → saved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db;
use crate::error::BookingError;
use crate::models::{BookingDetail, Feedback};
use crate::notify::{notify_user, Notifier};
use crate::zone;

/// Flows idle longer than this are dropped by the sweeper.
pub const FEEDBACK_FLOW_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Comments are cut to this many characters.
pub const MAX_COMMENT_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStep {
    AwaitingRating,
    AwaitingComment,
    AwaitingShare,
}

#[derive(Debug, Clone)]
struct FeedbackFlow {
    client_user_id: i64,
    client_name: String,
    rating: Option<i64>,
    comment: Option<String>,
    step: FeedbackStep,
    last_activity: Instant,
}

/// Trimmed, empty → `None`, capped at `MAX_COMMENT_CHARS`.
pub fn normalize_comment(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.chars().take(MAX_COMMENT_CHARS).collect())
    }
}

pub fn stars(rating: i64) -> String {
    "⭐".repeat(rating.clamp(0, 5) as usize)
}

/// Live feedback flows keyed by booking id.
pub struct FeedbackFlows {
    flows: DashMap<i64, FeedbackFlow>,
    pool: SqlitePool,
    notifier: Arc<dyn Notifier>,
    feedback_chat_id: Option<i64>,
    tz: Tz,
}

impl FeedbackFlows {
    pub fn new(pool: SqlitePool, notifier: Arc<dyn Notifier>, feedback_chat_id: Option<i64>, tz: Tz) -> Self {
        Self {
            flows: DashMap::new(),
            pool,
            notifier,
            feedback_chat_id,
            tz,
        }
    }

    /// Register a flow for a finished booking and ask the client for a rating.
    /// Returns whether the prompt was delivered.
    pub async fn request(&self, detail: &BookingDetail) -> bool {
        self.flows.insert(
            detail.booking.id,
            FeedbackFlow {
                client_user_id: detail.client_user_id,
                client_name: detail.client_name.clone(),
                rating: None,
                comment: None,
                step: FeedbackStep::AwaitingRating,
                last_activity: Instant::now(),
            },
        );
        let text = format!(
            "🙏 How was your coaching session on {}?\nPlease rate it from 1 to 5.",
            zone::format_local(self.tz, detail.booking.scheduled_at)
        );
        notify_user(self.notifier.as_ref(), detail.client_user_id, &text).await
    }

    pub fn pending_count(&self) -> usize {
        self.flows.len()
    }

    fn advance<T>(
        &self,
        booking_id: i64,
        actor: i64,
        f: impl FnOnce(&mut FeedbackFlow) -> Result<T, BookingError>,
    ) -> Result<T, BookingError> {
        let mut flow = self
            .flows
            .get_mut(&booking_id)
            .ok_or(BookingError::SessionExpired)?;
        if flow.client_user_id != actor {
            return Err(BookingError::Forbidden);
        }
        let result = f(&mut flow)?;
        flow.last_activity = Instant::now();
        Ok(result)
    }

    pub fn submit_rating(&self, booking_id: i64, actor: i64, rating: i64) -> Result<FeedbackStep, BookingError> {
        if !(1..=5).contains(&rating) {
            return Err(BookingError::Validation("rating must be between 1 and 5".into()));
        }
        self.advance(booking_id, actor, |flow| {
            if flow.step != FeedbackStep::AwaitingRating {
                return Err(BookingError::InvalidStep("rating already given".into()));
            }
            flow.rating = Some(rating);
            flow.step = FeedbackStep::AwaitingComment;
            Ok(flow.step)
        })
    }

    pub fn submit_comment(
        &self,
        booking_id: i64,
        actor: i64,
        comment: Option<&str>,
    ) -> Result<FeedbackStep, BookingError> {
        let comment = normalize_comment(comment);
        self.advance(booking_id, actor, |flow| {
            if flow.step != FeedbackStep::AwaitingComment {
                return Err(BookingError::InvalidStep(format!(
                    "cannot comment now (current step: {:?})",
                    flow.step
                )));
            }
            flow.comment = comment;
            flow.step = FeedbackStep::AwaitingShare;
            Ok(flow.step)
        })
    }

    /// Final step: persist the feedback and optionally publish it.
    pub async fn submit_share(&self, booking_id: i64, actor: i64, share: bool) -> Result<Feedback, BookingError> {
        self.advance(booking_id, actor, |flow| {
            if flow.step == FeedbackStep::AwaitingShare {
                Ok(())
            } else {
                Err(BookingError::InvalidStep(format!(
                    "cannot answer sharing now (current step: {:?})",
                    flow.step
                )))
            }
        })?;
        let (_, flow) = self
            .flows
            .remove(&booking_id)
            .ok_or(BookingError::SessionExpired)?;
        let rating = flow
            .rating
            .ok_or_else(|| BookingError::InvalidStep("no rating given".into()))?;

        let feedback = match db::insert_feedback(
            &self.pool,
            booking_id,
            rating,
            flow.comment.as_deref(),
            share,
            Utc::now(),
        )
        .await
        {
            Ok(feedback) => feedback,
            Err(e) if db::is_unique_violation(&e) => {
                return Err(BookingError::Validation(
                    "feedback for this session was already recorded".into(),
                ));
            }
            Err(e) => {
                self.flows.insert(booking_id, flow);
                return Err(e.into());
            }
        };

        tracing::info!("Feedback {} saved for booking {} ({}/5)", feedback.id, booking_id, rating);

        if share {
            if let Some(chat_id) = self.feedback_chat_id {
                let mut text = format!("{} ({rating}/5)", stars(rating));
                if let Some(comment) = &flow.comment {
                    text.push_str(&format!("\n\n“{comment}”"));
                }
                text.push_str(&format!("\n\n- {}", flow.client_name));
                if let Err(e) = self.notifier.send_channel_notice(chat_id, &text).await {
                    tracing::warn!("Shared feedback {} not published: {}", feedback.id, e);
                }
            }
        }

        Ok(feedback)
    }

    /// Drop flows idle past `FEEDBACK_FLOW_TIMEOUT`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.flows.len();
        self.flows
            .retain(|_, flow| now.saturating_duration_since(flow.last_activity) < FEEDBACK_FLOW_TIMEOUT);
        before - self.flows.len()
    }
}
