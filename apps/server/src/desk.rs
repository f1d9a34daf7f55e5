//! Booking commands outside the wizard: cancellation, status changes, manual
//! scheduling, bulk entry and cleanup.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::calendar::{CalendarProvider, EventPatch};
use crate::config::ALLOWED_PACK_SIZES;
use crate::db;
use crate::error::BookingError;
use crate::models::{AddSessionsRequest, Booking, BookingDetail, BookingStatus, BookingStatus::*, NewBooking};
use crate::notify::{notify_operator, notify_user, Notifier};
use crate::session::{event_description, event_title, SessionSettings};
use crate::zone;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub deleted: usize,
    pub calendar_deleted: usize,
    pub calendar_failed: usize,
}

/// Parse one `DD/MM/YYYY HH:MM` per non-empty line; every instant must be after `now`.
pub fn parse_session_lines(tz: Tz, raw: &str, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, BookingError> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let at = zone::parse_local(tz, line).ok_or_else(|| {
                BookingError::Validation(format!("'{line}' is not a DD/MM/YYYY HH:MM date"))
            })?;
            if at <= now {
                return Err(BookingError::Validation(format!("{line} is in the past")));
            }
            Ok(at)
        })
        .collect()
}

pub struct CoachDesk {
    pool: SqlitePool,
    calendar: Arc<dyn CalendarProvider>,
    notifier: Arc<dyn Notifier>,
    settings: SessionSettings,
}

impl CoachDesk {
    pub fn new(
        pool: SqlitePool,
        calendar: Arc<dyn CalendarProvider>,
        notifier: Arc<dyn Notifier>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            pool,
            calendar,
            notifier,
            settings,
        }
    }

    async fn detail(&self, id: i64) -> Result<BookingDetail, BookingError> {
        db::find_booking_detail(&self.pool, id)
            .await?
            .ok_or_else(|| BookingError::not_found("booking", id))
    }

    async fn delete_event_logged(&self, booking: &Booking) {
        if let Some(event_id) = &booking.external_event_id {
            if !self.calendar.delete_event(event_id).await {
                tracing::warn!(
                    "Calendar event {} of booking {} not deleted, manual cleanup needed",
                    event_id,
                    booking.id
                );
            }
        }
    }

    pub async fn view_booking(&self, id: i64) -> Result<BookingDetail, BookingError> {
        self.detail(id).await
    }

    /// Cancel a confirmed or pending booking. Students may only cancel their own.
    pub async fn cancel_booking(&self, id: i64, actor: i64, privileged: bool) -> Result<BookingDetail, BookingError> {
        let mut detail = self.detail(id).await?;
        if !privileged && detail.client_user_id != actor {
            return Err(BookingError::not_found("booking", id));
        }
        let from = detail.booking.status;
        if !matches!(from, Confirmed | PendingSchedule) {
            return Err(BookingError::Validation(format!(
                "a {} booking cannot be cancelled",
                from.as_str()
            )));
        }
        if !db::transition_status(&self.pool, id, from, Cancelled).await? {
            return Err(BookingError::Validation("the booking changed meanwhile, try again".into()));
        }
        detail.booking.status = Cancelled;
        tracing::info!("Booking {} cancelled by {}", id, actor);

        // The local row is authoritative; calendar drift is only logged.
        self.delete_event_logged(&detail.booking).await;

        let when = zone::format_local(self.settings.tz, detail.booking.scheduled_at);
        if privileged {
            notify_user(
                self.notifier.as_ref(),
                detail.client_user_id,
                &format!("❌ Your coaching session of {when} has been cancelled by your coach."),
            )
            .await;
        }
        notify_operator(
            self.notifier.as_ref(),
            &format!(
                "❌ Booking #{} cancelled\n👤 {} ({})\n🕐 {}",
                id, detail.client_name, detail.client_user_id, when
            ),
        )
        .await;

        Ok(detail)
    }

    async fn close_confirmed(&self, id: i64, to: BookingStatus) -> Result<BookingDetail, BookingError> {
        let mut detail = self.detail(id).await?;
        if detail.booking.status != Confirmed {
            return Err(BookingError::Validation(format!(
                "only confirmed bookings can be marked {}, this one is {}",
                to.as_str(),
                detail.booking.status.as_str()
            )));
        }
        if !db::transition_status(&self.pool, id, Confirmed, to).await? {
            return Err(BookingError::Validation("the booking changed meanwhile, try again".into()));
        }
        detail.booking.status = to;
        tracing::info!("Booking {} marked {}", id, to.as_str());
        Ok(detail)
    }

    pub async fn mark_completed(&self, id: i64) -> Result<BookingDetail, BookingError> {
        self.close_confirmed(id, Completed).await
    }

    pub async fn mark_no_show(&self, id: i64) -> Result<BookingDetail, BookingError> {
        self.close_confirmed(id, NoShow).await
    }

    /// Give a pack placeholder its real date.
    pub async fn schedule_booking(&self, id: i64, start: DateTime<Utc>) -> Result<BookingDetail, BookingError> {
        let detail = self.detail(id).await?;
        let booking = &detail.booking;
        if booking.status != PendingSchedule {
            return Err(BookingError::Validation(format!(
                "only pending sessions can be scheduled, this one is {}",
                booking.status.as_str()
            )));
        }
        if start <= Utc::now() {
            return Err(BookingError::Validation("the new date must be in the future".into()));
        }

        let event_id = self
            .calendar
            .create_event(
                &event_title(booking.booking_type, &detail.client_name),
                start,
                booking.duration_minutes,
                &event_description(
                    &detail.client_name,
                    detail.client_user_id,
                    booking.booking_type,
                    booking.notes.as_deref(),
                ),
            )
            .await
            .ok_or(BookingError::CalendarWriteFailed)?;

        if let Err(e) = self.persist_schedule(booking, start, &event_id).await {
            if !self.calendar.delete_event(&event_id).await {
                tracing::error!("Orphan calendar event {} left behind", event_id);
            }
            return Err(e);
        }

        let when = zone::format_local(self.settings.tz, start);
        tracing::info!("Pending booking {} scheduled at {}", id, when);
        notify_user(
            self.notifier.as_ref(),
            detail.client_user_id,
            &format!("📅 Your next pack session is scheduled for {when}."),
        )
        .await;

        self.detail(id).await
    }

    async fn persist_schedule(&self, booking: &Booking, start: DateTime<Utc>, event_id: &str) -> Result<(), BookingError> {
        let mut tx = self.pool.begin().await?;
        if !db::reschedule_booking(&mut *tx, booking.id, start, event_id).await? {
            return Err(BookingError::Validation("the booking changed meanwhile, try again".into()));
        }
        db::increment_total_sessions(&mut *tx, booking.client_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace the coach notes of a booking and mirror them into its event.
    pub async fn annotate_booking(&self, id: i64, notes: &str) -> Result<BookingDetail, BookingError> {
        let notes = notes.trim();
        if notes.is_empty() {
            return Err(BookingError::Validation("notes cannot be empty".into()));
        }
        if !db::set_booking_notes(&self.pool, id, notes).await? {
            return Err(BookingError::not_found("booking", id));
        }
        let detail = self.detail(id).await?;

        if let Some(event_id) = &detail.booking.external_event_id {
            let patch = EventPatch {
                description: Some(event_description(
                    &detail.client_name,
                    detail.client_user_id,
                    detail.booking.booking_type,
                    Some(notes),
                )),
                ..EventPatch::default()
            };
            if !self.calendar.update_event(event_id, &patch).await {
                tracing::warn!("Notes of booking {} not mirrored to event {}", id, event_id);
            }
        }
        Ok(detail)
    }

    /// Enter already-agreed sessions by hand: one event and one confirmed booking per date.
    pub async fn add_sessions(&self, req: &AddSessionsRequest) -> Result<Vec<Booking>, BookingError> {
        if !ALLOWED_PACK_SIZES.contains(&req.quantity) {
            return Err(BookingError::Validation(format!(
                "quantity must be one of {ALLOWED_PACK_SIZES:?}"
            )));
        }
        let name = req.display_name.trim();
        if name.is_empty() {
            return Err(BookingError::Validation("display name is required".into()));
        }
        let duration = req
            .duration_minutes
            .unwrap_or_else(|| self.settings.duration_for(req.booking_type));
        if duration <= 0 {
            return Err(BookingError::Validation("duration must be positive".into()));
        }

        let starts = parse_session_lines(self.settings.tz, &req.dates, Utc::now())?;
        if starts.len() != req.quantity as usize {
            return Err(BookingError::Validation(format!(
                "{} date(s) given for {} session(s)",
                starts.len(),
                req.quantity
            )));
        }

        let notes = req.notes.as_deref().map(str::trim).filter(|n| !n.is_empty());
        let title = event_title(req.booking_type, name);
        let description = event_description(name, req.user_id, req.booking_type, notes);

        let mut events = Vec::with_capacity(starts.len());
        for start in &starts {
            match self.calendar.create_event(&title, *start, duration, &description).await {
                Some(id) => events.push(id),
                None => {
                    self.rollback_events(&events).await;
                    return Err(BookingError::CalendarWriteFailed);
                }
            }
        }

        let ids = match self
            .persist_sessions(req, name, duration, notes, &starts, &events)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                self.rollback_events(&events).await;
                return Err(e);
            }
        };

        tracing::info!("{} session(s) added manually for user {}", ids.len(), req.user_id);

        let list = starts
            .iter()
            .map(|s| format!("• {}", zone::format_local(self.settings.tz, *s)))
            .collect::<Vec<_>>()
            .join("\n");
        notify_user(
            self.notifier.as_ref(),
            req.user_id,
            &format!("📅 Your coach booked {} session(s) for you:\n{list}", ids.len()),
        )
        .await;

        let mut bookings = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(b) = db::find_booking(&self.pool, id).await? {
                bookings.push(b);
            }
        }
        Ok(bookings)
    }

    async fn persist_sessions(
        &self,
        req: &AddSessionsRequest,
        name: &str,
        duration: i64,
        notes: Option<&str>,
        starts: &[DateTime<Utc>],
        events: &[String],
    ) -> Result<Vec<i64>, BookingError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let client = db::upsert_client(&mut *tx, req.user_id, name, now).await?;

        let mut ids = Vec::with_capacity(starts.len());
        for (start, event_id) in starts.iter().zip(events) {
            let row = NewBooking {
                client_id: client.id,
                external_event_id: Some(event_id.clone()),
                booking_type: req.booking_type,
                scheduled_at: *start,
                duration_minutes: duration,
                status: Confirmed,
                created_at: now,
                ticket_context_id: None,
                notes: notes.map(str::to_string),
            };
            ids.push(db::insert_booking(&mut *tx, &row).await?);
            db::increment_total_sessions(&mut *tx, client.id).await?;
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn rollback_events(&self, events: &[String]) {
        for event_id in events {
            if !self.calendar.delete_event(event_id).await {
                tracing::error!("Orphan calendar event {} left behind", event_id);
            }
        }
    }

    /// Delete bookings matching the filters (at least one is required).
    pub async fn clear_bookings(
        &self,
        user_id: Option<i64>,
        status: Option<BookingStatus>,
    ) -> Result<ClearReport, BookingError> {
        if user_id.is_none() && status.is_none() {
            return Err(BookingError::Validation("give a user and/or a status to clear".into()));
        }

        let matching = db::matching_bookings(&self.pool, user_id, status).await?;
        let mut report = ClearReport::default();

        for detail in &matching {
            if let Some(event_id) = &detail.booking.external_event_id {
                if self.calendar.delete_event(event_id).await {
                    report.calendar_deleted += 1;
                } else {
                    report.calendar_failed += 1;
                    tracing::warn!("Calendar event {} not deleted during clear", event_id);
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        for detail in &matching {
            if db::delete_booking(&mut *tx, detail.booking.id).await? {
                report.deleted += 1;
            }
        }
        tx.commit().await?;

        tracing::info!(
            "Cleared {} booking(s) (user {:?}, status {:?}); calendar {} ok / {} failed",
            report.deleted,
            user_id,
            status.map(BookingStatus::as_str),
            report.calendar_deleted,
            report.calendar_failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookingType;
    use crate::testkit::{memory_pool, new_booking, test_settings, ts, FakeCalendar, RecordingNotifier};
    use chrono::TimeDelta;
    use chrono_tz::Europe::Paris;

    struct Harness {
        pool: SqlitePool,
        calendar: Arc<FakeCalendar>,
        notifier: Arc<RecordingNotifier>,
        desk: CoachDesk,
    }

    async fn harness() -> Harness {
        let pool = memory_pool().await;
        let calendar = Arc::new(FakeCalendar::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let desk = CoachDesk::new(pool.clone(), calendar.clone(), notifier.clone(), test_settings());
        Harness {
            pool,
            calendar,
            notifier,
            desk,
        }
    }

    async fn seed(h: &Harness, user: i64, at: DateTime<Utc>, status: BookingStatus) -> i64 {
        let client = db::upsert_client(&h.pool, user, "Anna", ts("2026-01-01T00:00:00Z")).await.unwrap();
        let mut row = new_booking(client.id, at, status);
        if status == Confirmed {
            row.external_event_id = h.calendar.create_event("x", at, 60, "").await;
        }
        db::insert_booking(&h.pool, &row).await.unwrap()
    }

    fn future(days: i64) -> DateTime<Utc> {
        let day = zone::local_date(Paris, Utc::now()) + TimeDelta::days(days);
        zone::parse_local(Paris, &format!("{} 10:00", day.format("%d/%m/%Y"))).unwrap()
    }

    fn add_request(quantity: u32, dates: &str) -> AddSessionsRequest {
        AddSessionsRequest {
            user_id: 5,
            display_name: "Anna".into(),
            booking_type: BookingType::Paid,
            quantity,
            dates: dates.into(),
            duration_minutes: None,
            notes: Some("Intro pack".into()),
        }
    }

    #[test]
    fn test_parse_session_lines() {
        let now = ts("2026-03-01T00:00:00Z");
        let parsed = parse_session_lines(Paris, "02/03/2026 10:00\n\n  03/03/2026 14:30 \n", now).unwrap();
        assert_eq!(parsed, vec![ts("2026-03-02T09:00:00Z"), ts("2026-03-03T13:30:00Z")]);

        assert!(matches!(
            parse_session_lines(Paris, "2026-03-02 10:00", now),
            Err(BookingError::Validation(_))
        ));
        assert!(matches!(
            parse_session_lines(Paris, "28/02/2026 10:00", now),
            Err(BookingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_student_cancels_own_booking() {
        let h = harness().await;
        let id = seed(&h, 5, future(2), Confirmed).await;

        let err = h.desk.cancel_booking(id, 6, false).await.unwrap_err();
        assert!(matches!(err, BookingError::NotFound { .. }));

        let cancelled = h.desk.cancel_booking(id, 5, false).await.unwrap();
        assert_eq!(cancelled.booking.status, Cancelled);
        assert_eq!(h.calendar.live_events(), 0);
        assert_eq!(h.notifier.operator().len(), 1);
        // Student-initiated: no notice back to the student.
        assert!(h.notifier.direct_to(5).is_empty());

        let again = h.desk.cancel_booking(id, 5, false).await.unwrap_err();
        assert!(matches!(again, BookingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_coach_cancel_survives_calendar_failure() {
        let h = harness().await;
        let id = seed(&h, 5, future(2), Confirmed).await;
        h.calendar.set_fail_delete(true);

        let cancelled = h.desk.cancel_booking(id, 99, true).await.unwrap();
        assert_eq!(cancelled.booking.status, Cancelled);
        assert_eq!(h.notifier.direct_to(5).len(), 1);
        let row = db::find_booking(&h.pool, id).await.unwrap().unwrap();
        assert_eq!(row.status, Cancelled);
    }

    #[tokio::test]
    async fn test_complete_and_no_show_require_confirmed() {
        let h = harness().await;
        let a = seed(&h, 5, future(1), Confirmed).await;
        let b = seed(&h, 5, future(1), Confirmed).await;
        let pending = seed(&h, 5, future(1), PendingSchedule).await;

        assert_eq!(h.desk.mark_completed(a).await.unwrap().booking.status, Completed);
        assert_eq!(h.desk.mark_no_show(b).await.unwrap().booking.status, NoShow);
        assert!(matches!(h.desk.mark_completed(a).await, Err(BookingError::Validation(_))));
        assert!(matches!(h.desk.mark_no_show(pending).await, Err(BookingError::Validation(_))));
        assert!(matches!(h.desk.view_booking(999).await, Err(BookingError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_schedule_pending_booking() {
        let h = harness().await;
        let id = seed(&h, 5, future(1), PendingSchedule).await;
        let start = future(4);

        let scheduled = h.desk.schedule_booking(id, start).await.unwrap();
        assert_eq!(scheduled.booking.status, Confirmed);
        assert_eq!(scheduled.booking.scheduled_at, start);
        assert!(scheduled.booking.external_event_id.is_some());
        let client = db::find_client_by_user(&h.pool, 5).await.unwrap().unwrap();
        assert_eq!(client.total_sessions, 1);
        assert_eq!(h.notifier.direct_to(5).len(), 1);

        // Only placeholders can be scheduled this way.
        assert!(matches!(
            h.desk.schedule_booking(id, future(5)).await,
            Err(BookingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_schedule_calendar_failure_leaves_row() {
        let h = harness().await;
        let id = seed(&h, 5, future(1), PendingSchedule).await;
        h.calendar.set_fail_create(true);

        let err = h.desk.schedule_booking(id, future(3)).await.unwrap_err();
        assert!(matches!(err, BookingError::CalendarWriteFailed));
        let row = db::find_booking(&h.pool, id).await.unwrap().unwrap();
        assert_eq!(row.status, PendingSchedule);
        assert!(row.external_event_id.is_none());
    }

    #[tokio::test]
    async fn test_annotate_mirrors_to_event() {
        let h = harness().await;
        let id = seed(&h, 5, future(2), Confirmed).await;
        let detail = h.desk.annotate_booking(id, "  Work on posture ").await.unwrap();
        assert_eq!(detail.booking.notes.as_deref(), Some("Work on posture"));

        let updates = h.calendar.updated();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].1.description.as_deref().unwrap().contains("Work on posture"));
        assert!(matches!(h.desk.annotate_booking(999, "x").await, Err(BookingError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_add_sessions_creates_confirmed_rows() {
        let h = harness().await;
        let lines = format!(
            "{}\n{}",
            zone::format_local(Paris, future(2)),
            zone::format_local(Paris, future(9))
        );
        let rows = h.desk.add_sessions(&add_request(2, &lines)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|b| b.status == Confirmed && b.external_event_id.is_some()));
        assert!(rows.iter().all(|b| b.notes.as_deref() == Some("Intro pack")));
        let client = db::find_client_by_user(&h.pool, 5).await.unwrap().unwrap();
        assert_eq!(client.total_sessions, 2);
        assert_eq!(h.calendar.live_events(), 2);
    }

    #[tokio::test]
    async fn test_add_sessions_validation() {
        let h = harness().await;
        let line = zone::format_local(Paris, future(2));
        assert!(matches!(
            h.desk.add_sessions(&add_request(2, &line)).await,
            Err(BookingError::Validation(_))
        ));
        assert!(matches!(
            h.desk.add_sessions(&add_request(6, &line)).await,
            Err(BookingError::Validation(_))
        ));
        assert_eq!(h.calendar.created_count(), 0);
    }

    #[tokio::test]
    async fn test_add_sessions_calendar_failure_rolls_back_events() {
        let h = harness().await;
        let lines = format!(
            "{}\n{}",
            zone::format_local(Paris, future(2)),
            zone::format_local(Paris, future(3))
        );
        h.calendar.set_fail_create_after(1);
        let err = h.desk.add_sessions(&add_request(2, &lines)).await.unwrap_err();
        assert!(matches!(err, BookingError::CalendarWriteFailed));
        assert_eq!(h.calendar.live_events(), 0);
        assert_eq!(h.calendar.deleted().len(), 1);
        assert!(db::find_client_by_user(&h.pool, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_bookings_by_user() {
        let h = harness().await;
        let a = seed(&h, 5, future(1), Confirmed).await;
        seed(&h, 5, future(1), PendingSchedule).await;
        let other = seed(&h, 6, future(1), Confirmed).await;
        db::insert_feedback(&h.pool, a, 4, None, false, Utc::now()).await.unwrap();

        assert!(matches!(
            h.desk.clear_bookings(None, None).await,
            Err(BookingError::Validation(_))
        ));

        let report = h.desk.clear_bookings(Some(5), None).await.unwrap();
        assert_eq!(
            report,
            ClearReport {
                deleted: 2,
                calendar_deleted: 1,
                calendar_failed: 0
            }
        );
        assert!(db::find_feedback_for_booking(&h.pool, a).await.unwrap().is_none());
        assert!(db::find_booking(&h.pool, other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_counts_calendar_failures() {
        let h = harness().await;
        seed(&h, 5, future(1), Confirmed).await;
        h.calendar.set_fail_delete(true);
        let report = h.desk.clear_bookings(None, Some(Confirmed)).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.calendar_failed, 1);
    }
}
