//! Booking wizard: type → quantity → date → slot, one live session per ticket.
//!
//! `TicketSession` holds the state and pure transitions. `BookingSessionManager`
//! owns the live sessions and performs the committing side effects (calendar
//! event, booking rows, operator notice).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::availability::AvailabilityResolver;
use crate::calendar::CalendarProvider;
use crate::config::{Config, ALLOWED_PACK_SIZES};
use crate::db;
use crate::error::BookingError;
use crate::models::{BookingStatus, BookingType, NewBooking};
use crate::notify::{notify_operator, Notifier};
use crate::zone;

// ── State ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStep {
    AwaitingType,
    AwaitingQuantity,
    AwaitingDate,
    AwaitingSlot,
}

/// Target of a reschedule wizard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleTarget {
    pub booking_id: i64,
    pub previous_scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TicketSession {
    pub ticket_id: String,
    pub client_user_id: i64,
    pub client_name: String,
    pub booking_type: Option<BookingType>,
    pub quantity: u32,
    pub duration_minutes: i64,
    pub selected_date: Option<NaiveDate>,
    pub offered_slots: Vec<DateTime<Utc>>,
    pub reschedule: Option<RescheduleTarget>,
    pub step: WizardStep,
    last_activity: Instant,
}

impl TicketSession {
    pub fn new(ticket_id: &str, client_user_id: i64, client_name: &str, now: Instant) -> Self {
        Self {
            ticket_id: ticket_id.to_string(),
            client_user_id,
            client_name: client_name.to_string(),
            booking_type: None,
            quantity: 1,
            duration_minutes: 0,
            selected_date: None,
            offered_slots: Vec::new(),
            reschedule: None,
            step: WizardStep::AwaitingType,
            last_activity: now,
        }
    }

    /// Seeded at `AwaitingDate` for an existing booking.
    pub fn for_reschedule(
        ticket_id: &str,
        client_user_id: i64,
        client_name: &str,
        booking_type: BookingType,
        duration_minutes: i64,
        target: RescheduleTarget,
        now: Instant,
    ) -> Self {
        Self {
            booking_type: Some(booking_type),
            duration_minutes,
            reschedule: Some(target),
            step: WizardStep::AwaitingDate,
            ..Self::new(ticket_id, client_user_id, client_name, now)
        }
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    fn expect_step(&self, allowed: &[WizardStep], action: &str) -> Result<(), BookingError> {
        if allowed.contains(&self.step) {
            Ok(())
        } else {
            Err(BookingError::InvalidStep(format!(
                "cannot {action} now (current step: {:?})",
                self.step
            )))
        }
    }

    pub fn select_type(&mut self, booking_type: BookingType, duration_minutes: i64) -> Result<WizardStep, BookingError> {
        self.expect_step(&[WizardStep::AwaitingType], "choose a coaching type")?;
        self.booking_type = Some(booking_type);
        self.duration_minutes = duration_minutes;
        self.step = match booking_type {
            BookingType::Free => {
                self.quantity = 1;
                WizardStep::AwaitingDate
            }
            BookingType::Paid => WizardStep::AwaitingQuantity,
        };
        Ok(self.step)
    }

    pub fn select_quantity(&mut self, quantity: u32) -> Result<WizardStep, BookingError> {
        self.expect_step(&[WizardStep::AwaitingQuantity], "choose a quantity")?;
        if !ALLOWED_PACK_SIZES.contains(&quantity) {
            return Err(BookingError::Validation(format!(
                "quantity must be one of {ALLOWED_PACK_SIZES:?}"
            )));
        }
        self.quantity = quantity;
        self.step = WizardStep::AwaitingDate;
        Ok(self.step)
    }

    /// A new date may be picked while waiting for a date or after slots were shown.
    pub fn ensure_can_pick_date(&self) -> Result<(), BookingError> {
        self.expect_step(&[WizardStep::AwaitingDate, WizardStep::AwaitingSlot], "choose a date")
    }

    /// Record the slots shown for `day`. With no slots the wizard stays on date selection.
    pub fn offer_slots(&mut self, day: NaiveDate, slots: Vec<DateTime<Utc>>) -> WizardStep {
        if slots.is_empty() {
            self.selected_date = None;
            self.offered_slots.clear();
            self.step = WizardStep::AwaitingDate;
        } else {
            self.selected_date = Some(day);
            self.offered_slots = slots;
            self.step = WizardStep::AwaitingSlot;
        }
        self.step
    }

    /// Only a slot from the last offer can be taken.
    pub fn ensure_slot_offered(&self, start: DateTime<Utc>) -> Result<(), BookingError> {
        self.expect_step(&[WizardStep::AwaitingSlot], "choose a slot")?;
        if self.offered_slots.contains(&start) {
            Ok(())
        } else {
            Err(BookingError::Validation("this slot is not available, pick another one".into()))
        }
    }
}

// ── Results ──

#[derive(Debug, Clone, Serialize)]
pub struct SlotOffer {
    pub date: NaiveDate,
    pub slots: Vec<DateTime<Utc>>,
    pub step: WizardStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SlotOutcome {
    Booked {
        booking_id: i64,
        pending_booking_ids: Vec<i64>,
        scheduled_at: DateTime<Utc>,
        quantity: u32,
        message: String,
    },
    Rescheduled {
        booking_id: i64,
        previous_scheduled_at: DateTime<Utc>,
        scheduled_at: DateTime<Utc>,
        message: String,
    },
}

// ── Helpers ──

pub fn event_title(booking_type: BookingType, client_name: &str) -> String {
    format!("[{}] Coaching - {}", booking_type.label(), client_name)
}

pub fn event_description(client_name: &str, user_id: i64, booking_type: BookingType, extra: Option<&str>) -> String {
    let mut text = format!(
        "Client: {client_name}\nUser ID: {user_id}\nType: {}\nBooked via coachdesk",
        booking_type.label().to_lowercase()
    );
    if let Some(extra) = extra {
        text.push('\n');
        text.push_str(extra);
    }
    text
}

pub fn pack_note(index: u32, total: u32) -> String {
    if index == 1 {
        format!("Pack of {total} sessions - session 1/{total}")
    } else {
        format!("Pack of {total} sessions - session {index}/{total} (to schedule)")
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub tz: Tz,
    pub free_duration_minutes: i64,
    pub paid_duration_minutes: i64,
    pub timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tz: config.timezone,
            free_duration_minutes: config.free_duration_minutes,
            paid_duration_minutes: config.paid_duration_minutes,
            timeout: config.session_timeout,
        }
    }

    pub fn duration_for(&self, booking_type: BookingType) -> i64 {
        match booking_type {
            BookingType::Free => self.free_duration_minutes,
            BookingType::Paid => self.paid_duration_minutes,
        }
    }
}

// ── Manager ──

pub struct BookingSessionManager {
    sessions: DashMap<String, TicketSession>,
    pool: SqlitePool,
    resolver: AvailabilityResolver,
    calendar: Arc<dyn CalendarProvider>,
    notifier: Arc<dyn Notifier>,
    settings: SessionSettings,
    /// Serializes slot commits so two tickets cannot take the same slot.
    commit_lock: Mutex<()>,
}

impl BookingSessionManager {
    pub fn new(
        pool: SqlitePool,
        calendar: Arc<dyn CalendarProvider>,
        notifier: Arc<dyn Notifier>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            pool,
            resolver: AvailabilityResolver::new(calendar.clone(), settings.tz),
            calendar,
            notifier,
            settings,
            commit_lock: Mutex::new(()),
        }
    }

    /// Start (or restart) the wizard for a freshly opened ticket.
    pub fn open_session(&self, ticket_id: &str, client_user_id: i64, client_name: &str) -> WizardStep {
        let session = TicketSession::new(ticket_id, client_user_id, client_name, Instant::now());
        self.sessions.insert(ticket_id.to_string(), session);
        WizardStep::AwaitingType
    }

    pub fn discard(&self, ticket_id: &str) -> bool {
        self.sessions.remove(ticket_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions idle past the timeout; returns their ticket ids.
    pub fn sweep_expired(&self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        self.sessions.retain(|ticket_id, session| {
            if session.is_expired(now, self.settings.timeout) {
                expired.push(ticket_id.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Run a pure transition on the live session, enforcing expiry and ownership.
    fn with_session<T>(
        &self,
        ticket_id: &str,
        actor: i64,
        privileged: bool,
        f: impl FnOnce(&mut TicketSession) -> Result<T, BookingError>,
    ) -> Result<T, BookingError> {
        let now = Instant::now();
        let expired = {
            let mut entry = self
                .sessions
                .get_mut(ticket_id)
                .ok_or(BookingError::SessionExpired)?;
            if entry.is_expired(now, self.settings.timeout) {
                true
            } else {
                if !privileged && entry.client_user_id != actor {
                    return Err(BookingError::Forbidden);
                }
                let result = f(&mut entry)?;
                entry.last_activity = now;
                return Ok(result);
            }
        };
        if expired {
            self.sessions.remove(ticket_id);
        }
        Err(BookingError::SessionExpired)
    }

    fn snapshot(&self, ticket_id: &str, actor: i64, privileged: bool) -> Result<TicketSession, BookingError> {
        self.with_session(ticket_id, actor, privileged, |s| Ok(s.clone()))
    }

    pub fn select_type(
        &self,
        ticket_id: &str,
        actor: i64,
        privileged: bool,
        booking_type: BookingType,
    ) -> Result<WizardStep, BookingError> {
        let duration = self.settings.duration_for(booking_type);
        self.with_session(ticket_id, actor, privileged, |s| s.select_type(booking_type, duration))
    }

    pub fn select_quantity(
        &self,
        ticket_id: &str,
        actor: i64,
        privileged: bool,
        quantity: u32,
    ) -> Result<WizardStep, BookingError> {
        self.with_session(ticket_id, actor, privileged, |s| s.select_quantity(quantity))
    }

    pub async fn select_date(
        &self,
        ticket_id: &str,
        actor: i64,
        privileged: bool,
        day: NaiveDate,
    ) -> Result<SlotOffer, BookingError> {
        let session = self.snapshot(ticket_id, actor, privileged)?;
        session.ensure_can_pick_date()?;

        let now = Utc::now();
        if day < zone::local_date(self.settings.tz, now) {
            return Err(BookingError::Validation("pick today or a later date".into()));
        }

        let slots: Vec<DateTime<Utc>> = self
            .resolver
            .get_available_slots(day, session.duration_minutes)
            .await
            .into_iter()
            .filter(|slot| *slot > now)
            .collect();

        let step = self.with_session(ticket_id, actor, privileged, |s| {
            s.ensure_can_pick_date()?;
            Ok(s.offer_slots(day, slots.clone()))
        })?;

        let message = slots
            .is_empty()
            .then(|| "No free slots on this day, please choose another date.".to_string());
        Ok(SlotOffer {
            date: day,
            slots,
            step,
            message,
        })
    }

    /// Terminal wizard action: books (or moves) the session at `start`.
    ///
    /// The session is taken out of the map for the duration of the commit so a
    /// second submission cannot book twice; it is put back if the commit fails.
    pub async fn select_slot(
        &self,
        ticket_id: &str,
        actor: i64,
        privileged: bool,
        start: DateTime<Utc>,
    ) -> Result<SlotOutcome, BookingError> {
        self.snapshot(ticket_id, actor, privileged)?;
        let (_, mut session) = self
            .sessions
            .remove(ticket_id)
            .ok_or(BookingError::SessionExpired)?;

        let result = match session.ensure_slot_offered(start) {
            Err(e) => Err(e),
            Ok(()) => {
                let _commit = self.commit_lock.lock().await;
                match self.recheck_slot(&mut session, start).await {
                    Err(e) => Err(e),
                    Ok(()) => match &session.reschedule {
                        Some(target) => self.commit_reschedule(&session, target, start).await,
                        None => self.commit_new_booking(&session, start).await,
                    },
                }
            }
        };

        if result.is_err() {
            session.last_activity = Instant::now();
            self.sessions.insert(ticket_id.to_string(), session);
        }
        result
    }

    /// The offer may be stale: another ticket can have taken the slot since.
    /// On a miss the session gets the day's current free slots instead.
    async fn recheck_slot(&self, session: &mut TicketSession, start: DateTime<Utc>) -> Result<(), BookingError> {
        let day = session
            .selected_date
            .ok_or_else(|| BookingError::InvalidStep("no date selected".into()))?;
        let now = Utc::now();
        let fresh: Vec<DateTime<Utc>> = self
            .resolver
            .get_available_slots(day, session.duration_minutes)
            .await
            .into_iter()
            .filter(|slot| *slot > now)
            .collect();
        if fresh.contains(&start) {
            return Ok(());
        }

        tracing::info!(
            "Slot {} on ticket {} is no longer free, {} slot(s) re-offered",
            start,
            session.ticket_id,
            fresh.len()
        );
        session.offer_slots(day, fresh);
        Err(BookingError::Validation("this slot was just taken, pick another one".into()))
    }

    /// Owner check against whatever session already lives on `ticket_id`.
    fn ensure_may_replace(&self, ticket_id: &str, actor: i64, privileged: bool) -> Result<(), BookingError> {
        match self.sessions.get(ticket_id) {
            Some(existing)
                if !privileged
                    && existing.client_user_id != actor
                    && !existing.is_expired(Instant::now(), self.settings.timeout) =>
            {
                Err(BookingError::Forbidden)
            }
            _ => Ok(()),
        }
    }

    /// Seed a reschedule wizard on `ticket_id` for an existing booking.
    pub async fn start_reschedule(
        &self,
        ticket_id: &str,
        actor: i64,
        privileged: bool,
        booking_id: i64,
    ) -> Result<WizardStep, BookingError> {
        self.ensure_may_replace(ticket_id, actor, privileged)?;
        let detail = db::find_booking_detail(&self.pool, booking_id)
            .await?
            .filter(|d| privileged || d.client_user_id == actor)
            .ok_or_else(|| BookingError::not_found("booking", booking_id))?;

        if matches!(
            detail.booking.status,
            BookingStatus::Cancelled | BookingStatus::Completed | BookingStatus::NoShow
        ) {
            return Err(BookingError::Validation(format!(
                "a {} booking cannot be rescheduled",
                detail.booking.status.as_str()
            )));
        }

        let session = TicketSession::for_reschedule(
            ticket_id,
            detail.client_user_id,
            &detail.client_name,
            detail.booking.booking_type,
            detail.booking.duration_minutes,
            RescheduleTarget {
                booking_id,
                previous_scheduled_at: detail.booking.scheduled_at,
            },
            Instant::now(),
        );
        // The map may have changed during the lookup.
        self.ensure_may_replace(ticket_id, actor, privileged)?;
        self.sessions.insert(ticket_id.to_string(), session);
        tracing::info!("Reschedule of booking {} started on ticket {}", booking_id, ticket_id);
        Ok(WizardStep::AwaitingDate)
    }

    async fn commit_new_booking(
        &self,
        session: &TicketSession,
        start: DateTime<Utc>,
    ) -> Result<SlotOutcome, BookingError> {
        let booking_type = session
            .booking_type
            .ok_or_else(|| BookingError::InvalidStep("no coaching type selected".into()))?;
        let quantity = session.quantity;
        let pack = (quantity > 1).then(|| pack_note(1, quantity));

        let event_id = self
            .calendar
            .create_event(
                &event_title(booking_type, &session.client_name),
                start,
                session.duration_minutes,
                &event_description(&session.client_name, session.client_user_id, booking_type, pack.as_deref()),
            )
            .await
            .ok_or(BookingError::CalendarWriteFailed)?;

        let ids = match self
            .persist_new_booking(session, booking_type, start, &event_id, pack)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!("Booking commit for ticket {} failed: {}", session.ticket_id, e);
                if !self.calendar.delete_event(&event_id).await {
                    tracing::error!("Orphan calendar event {} left behind", event_id);
                }
                return Err(e);
            }
        };

        let when = zone::format_local(self.settings.tz, start);
        tracing::info!(
            "Booking {} committed for user {} at {} (quantity {})",
            ids[0],
            session.client_user_id,
            when,
            quantity
        );

        let mut operator_text = format!(
            "📅 New booking\n👤 {} ({})\n🏷 {}\n🕐 {}",
            session.client_name,
            session.client_user_id,
            booking_type.label(),
            when
        );
        if quantity > 1 {
            operator_text.push_str(&format!("\n📦 Pack of {quantity}: {} session(s) to schedule", quantity - 1));
        }
        notify_operator(self.notifier.as_ref(), &operator_text).await;

        let mut message = format!("✅ Your session is booked for {when}.");
        if quantity > 1 {
            message.push_str(&format!(
                " The other {} session(s) of your pack will be scheduled with your coach.",
                quantity - 1
            ));
        }

        Ok(SlotOutcome::Booked {
            booking_id: ids[0],
            pending_booking_ids: ids[1..].to_vec(),
            scheduled_at: start,
            quantity,
            message,
        })
    }

    /// All rows in one transaction: the client, the confirmed booking, the placeholders.
    async fn persist_new_booking(
        &self,
        session: &TicketSession,
        booking_type: BookingType,
        start: DateTime<Utc>,
        event_id: &str,
        pack: Option<String>,
    ) -> Result<Vec<i64>, BookingError> {
        let now = Utc::now();
        let quantity = session.quantity;
        let mut tx = self.pool.begin().await?;

        let client = db::upsert_client(&mut *tx, session.client_user_id, &session.client_name, now).await?;

        let mut ids = Vec::with_capacity(quantity as usize);
        let first = NewBooking {
            client_id: client.id,
            external_event_id: Some(event_id.to_string()),
            booking_type,
            scheduled_at: start,
            duration_minutes: session.duration_minutes,
            status: BookingStatus::Confirmed,
            created_at: now,
            ticket_context_id: Some(session.ticket_id.clone()),
            notes: pack,
        };
        ids.push(db::insert_booking(&mut *tx, &first).await?);

        for index in 2..=quantity {
            let placeholder = NewBooking {
                external_event_id: None,
                status: BookingStatus::PendingSchedule,
                notes: Some(pack_note(index, quantity)),
                ..first.clone()
            };
            ids.push(db::insert_booking(&mut *tx, &placeholder).await?);
        }

        db::increment_total_sessions(&mut *tx, client.id).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn commit_reschedule(
        &self,
        session: &TicketSession,
        target: &RescheduleTarget,
        start: DateTime<Utc>,
    ) -> Result<SlotOutcome, BookingError> {
        let booking = db::find_booking(&self.pool, target.booking_id)
            .await?
            .ok_or_else(|| BookingError::not_found("booking", target.booking_id))?;
        if !matches!(booking.status, BookingStatus::Confirmed | BookingStatus::PendingSchedule) {
            return Err(BookingError::Validation(format!(
                "a {} booking cannot be rescheduled",
                booking.status.as_str()
            )));
        }

        // New event first: if it fails, the old one is still in place.
        let new_event = self
            .calendar
            .create_event(
                &event_title(booking.booking_type, &session.client_name),
                start,
                booking.duration_minutes,
                &event_description(
                    &session.client_name,
                    session.client_user_id,
                    booking.booking_type,
                    booking.notes.as_deref(),
                ),
            )
            .await
            .ok_or(BookingError::CalendarWriteFailed)?;

        let was_pending = booking.status == BookingStatus::PendingSchedule;
        if let Err(e) = self.persist_reschedule(booking.id, booking.client_id, start, &new_event, was_pending).await {
            if !self.calendar.delete_event(&new_event).await {
                tracing::error!("Orphan calendar event {} left behind", new_event);
            }
            return Err(e);
        }

        // Only once the row points at the new event.
        if let Some(old_event) = &booking.external_event_id {
            if !self.calendar.delete_event(old_event).await {
                tracing::warn!(
                    "Old calendar event {} of booking {} not deleted, continuing",
                    old_event,
                    booking.id
                );
            }
        }

        let previous = zone::format_local(self.settings.tz, target.previous_scheduled_at);
        let when = zone::format_local(self.settings.tz, start);
        tracing::info!("Booking {} moved from {} to {}", booking.id, previous, when);
        notify_operator(
            self.notifier.as_ref(),
            &format!(
                "🔄 Booking rescheduled\n👤 {} ({})\n🕐 {} → {}",
                session.client_name, session.client_user_id, previous, when
            ),
        )
        .await;

        Ok(SlotOutcome::Rescheduled {
            booking_id: booking.id,
            previous_scheduled_at: target.previous_scheduled_at,
            scheduled_at: start,
            message: format!("✅ Your session has been moved to {when}."),
        })
    }

    async fn persist_reschedule(
        &self,
        booking_id: i64,
        client_id: i64,
        start: DateTime<Utc>,
        event_id: &str,
        was_pending: bool,
    ) -> Result<(), BookingError> {
        let mut tx = self.pool.begin().await?;
        if !db::reschedule_booking(&mut *tx, booking_id, start, event_id).await? {
            return Err(BookingError::Validation(
                "the booking changed meanwhile and can no longer be rescheduled".into(),
            ));
        }
        if was_pending {
            db::increment_total_sessions(&mut *tx, client_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
