//! Periodic reconciliation: reminders, completion, pack expiry, daily summary
//! and the idle-session sweeper.
//!
//! Every job selects bookings through status-guarded predicates, so running it
//! next to user actions (or twice) is harmless. A failure on one booking is
//! logged and the tick moves on to the next.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::{self, ReminderKind};
use crate::error::BookingError;
use crate::feedback::FeedbackFlows;
use crate::models::{BookingDetail, BookingStatus};
use crate::notify::{notify_operator, notify_user, Notifier};
use crate::session::BookingSessionManager;
use crate::tickets::TicketGateway;
use crate::zone;

pub const REMINDER_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const COMPLETION_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const PACK_EXPIRY_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
pub const DAILY_SUMMARY_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// `[min, max]` minutes before start for the 24 h reminder.
const DAY_BEFORE_WINDOW: (i64, i64) = (23 * 60 + 45, 24 * 60 + 15);
/// `[min, max]` minutes before start for the 1 h reminder.
const HOUR_BEFORE_WINDOW: (i64, i64) = (45, 75);
/// Sessions that ended longer ago than this are no longer auto-completed.
const COMPLETION_LOOKBACK_MINUTES: i64 = 60;
/// Local hour at which the daily summary goes out.
const DAILY_SUMMARY_HOUR: u32 = 8;

pub const SESSION_EXPIRED_NOTICE: &str =
    "⌛ This booking session expired after inactivity. Start again whenever you are ready.";

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub tz: Tz,
    pub reminder_24h_enabled: bool,
    pub reminder_1h_enabled: bool,
    pub pack_expiry_days: i64,
}

impl JobSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tz: config.timezone,
            reminder_24h_enabled: config.reminder_24h_enabled,
            reminder_1h_enabled: config.reminder_1h_enabled,
            pack_expiry_days: config.pack_expiry_days,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    pub day_before: usize,
    pub hour_before: usize,
    pub undelivered: usize,
}

fn in_window(until: TimeDelta, window: (i64, i64)) -> bool {
    until >= TimeDelta::minutes(window.0) && until <= TimeDelta::minutes(window.1)
}

/// Next occurrence of `hour:00` local time strictly after `now`.
pub fn next_local_time(tz: Tz, now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    let today = zone::local_date(tz, now);
    let candidate = zone::localize(tz, today.and_time(at));
    if candidate > now {
        candidate
    } else {
        zone::localize(tz, (today + TimeDelta::days(1)).and_time(at))
    }
}

pub struct LifecycleJobs {
    pool: SqlitePool,
    notifier: Arc<dyn Notifier>,
    feedback: Arc<FeedbackFlows>,
    sessions: Arc<BookingSessionManager>,
    tickets: Arc<dyn TicketGateway>,
    settings: JobSettings,
}

impl LifecycleJobs {
    pub fn new(
        pool: SqlitePool,
        notifier: Arc<dyn Notifier>,
        feedback: Arc<FeedbackFlows>,
        sessions: Arc<BookingSessionManager>,
        tickets: Arc<dyn TicketGateway>,
        settings: JobSettings,
    ) -> Self {
        Self {
            pool,
            notifier,
            feedback,
            sessions,
            tickets,
            settings,
        }
    }

    // ── Reminders ──

    /// Send the 24 h / 1 h notices whose window contains `now`.
    ///
    /// The flag is claimed before sending, so a notice goes out at most once even
    /// when delivery fails or two ticks overlap.
    pub async fn run_reminders(&self, now: DateTime<Utc>) -> Result<ReminderReport, BookingError> {
        let mut report = ReminderReport::default();
        if !self.settings.reminder_24h_enabled && !self.settings.reminder_1h_enabled {
            return Ok(report);
        }

        for detail in db::upcoming_confirmed(&self.pool, now).await? {
            let booking = &detail.booking;
            let until = booking.scheduled_at - now;

            let kind = if self.settings.reminder_24h_enabled
                && !booking.reminder_24h_sent
                && in_window(until, DAY_BEFORE_WINDOW)
            {
                ReminderKind::DayBefore
            } else if self.settings.reminder_1h_enabled
                && !booking.reminder_1h_sent
                && in_window(until, HOUR_BEFORE_WINDOW)
            {
                ReminderKind::HourBefore
            } else {
                continue;
            };

            match db::claim_reminder(&self.pool, booking.id, kind).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!("Reminder claim for booking {} failed: {}", booking.id, e);
                    continue;
                }
            }

            let when = zone::format_local(self.settings.tz, booking.scheduled_at);
            let text = match kind {
                ReminderKind::DayBefore => {
                    report.day_before += 1;
                    format!("⏰ Reminder: your coaching session is tomorrow, {when}.")
                }
                ReminderKind::HourBefore => {
                    report.hour_before += 1;
                    format!("⏰ Your coaching session starts in about one hour ({when}).")
                }
            };
            if !notify_user(self.notifier.as_ref(), detail.client_user_id, &text).await {
                report.undelivered += 1;
            }
        }

        Ok(report)
    }

    // ── Completion ──

    /// Mark freshly ended sessions as completed and ask for feedback.
    pub async fn run_completion(&self, now: DateTime<Utc>) -> Result<usize, BookingError> {
        let lookback = TimeDelta::minutes(COMPLETION_LOOKBACK_MINUTES);
        let candidates = db::started_without_feedback(&self.pool, now - TimeDelta::days(1), now).await?;

        let mut completed = 0;
        for detail in candidates {
            let ended = detail.booking.ends_at();
            if ended > now || ended <= now - lookback {
                continue;
            }
            match db::transition_status(
                &self.pool,
                detail.booking.id,
                BookingStatus::Confirmed,
                BookingStatus::Completed,
            )
            .await
            {
                Ok(true) => {
                    completed += 1;
                    tracing::info!("Booking {} completed", detail.booking.id);
                    self.feedback.request(&detail).await;
                }
                Ok(false) => {}
                Err(e) => tracing::error!("Completing booking {} failed: {}", detail.booking.id, e),
            }
        }
        Ok(completed)
    }

    // ── Pack expiry ──

    /// Cancel pack placeholders nobody scheduled within the expiry period.
    pub async fn run_pack_expiry(&self, now: DateTime<Utc>) -> Result<usize, BookingError> {
        let cutoff = now - TimeDelta::days(self.settings.pack_expiry_days);
        let mut expired = 0;

        for detail in db::pending_created_before(&self.pool, cutoff).await? {
            match db::transition_status(
                &self.pool,
                detail.booking.id,
                BookingStatus::PendingSchedule,
                BookingStatus::Cancelled,
            )
            .await
            {
                Ok(true) => {
                    expired += 1;
                    notify_operator(
                        self.notifier.as_ref(),
                        &format!(
                            "📦 Pack session expired\n👤 {} ({})\n#{} created {}, never scheduled",
                            detail.client_name,
                            detail.client_user_id,
                            detail.booking.id,
                            zone::format_local(self.settings.tz, detail.booking.created_at)
                        ),
                    )
                    .await;
                }
                Ok(false) => {}
                Err(e) => tracing::error!("Expiring booking {} failed: {}", detail.booking.id, e),
            }
        }
        Ok(expired)
    }

    // ── Daily summary ──

    /// One operator notice listing today's confirmed sessions. Nothing on an empty day.
    pub async fn run_daily_summary(&self, now: DateTime<Utc>) -> Result<usize, BookingError> {
        let today = zone::local_date(self.settings.tz, now);
        let (start, end) = zone::day_bounds(self.settings.tz, today);
        let sessions: Vec<BookingDetail> = db::scheduled_between(&self.pool, start, end, None)
            .await?
            .into_iter()
            .filter(|d| d.booking.status == BookingStatus::Confirmed)
            .collect();
        if sessions.is_empty() {
            return Ok(0);
        }

        let mut text = format!("📋 Today's sessions ({})\n", today.format("%d/%m/%Y"));
        for d in &sessions {
            text.push_str(&format!(
                "\n• {} - {} ({}, {} min)",
                d.booking.scheduled_at.with_timezone(&self.settings.tz).format("%H:%M"),
                d.client_name,
                d.booking.booking_type.label(),
                d.booking.duration_minutes
            ));
        }
        notify_operator(self.notifier.as_ref(), &text).await;
        Ok(sessions.len())
    }

    // ── Idle sweeper ──

    /// Drop idle wizard sessions (telling their ticket) and stale feedback flows.
    pub async fn sweep_idle(&self, now: Instant) -> usize {
        let expired = self.sessions.sweep_expired(now);
        for ticket_id in &expired {
            if let Err(e) = self.tickets.post_to_ticket(ticket_id, SESSION_EXPIRED_NOTICE).await {
                tracing::warn!("Expiry notice for ticket {} not posted: {}", ticket_id, e);
            }
        }
        let flows = self.feedback.sweep_expired(now);
        if !expired.is_empty() || flows > 0 {
            tracing::info!("Swept {} idle session(s), {} feedback flow(s)", expired.len(), flows);
        }
        expired.len()
    }

    // ── Scheduling ──

    /// Start every loop. They stop when `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let summary_delay = (next_local_time(self.settings.tz, Utc::now(), DAILY_SUMMARY_HOUR) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let jobs = self.clone();
        let reminders = spawn_loop("reminders", Duration::ZERO, REMINDER_INTERVAL, cancel.clone(), move || {
            let jobs = jobs.clone();
            async move {
                match jobs.run_reminders(Utc::now()).await {
                    Ok(r) if r.day_before + r.hour_before > 0 => tracing::info!(
                        "Reminders: {} day-before, {} hour-before, {} undelivered",
                        r.day_before,
                        r.hour_before,
                        r.undelivered
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!("Reminder job failed: {}", e),
                }
            }
        });

        let jobs = self.clone();
        let completion = spawn_loop("completion", Duration::ZERO, COMPLETION_INTERVAL, cancel.clone(), move || {
            let jobs = jobs.clone();
            async move {
                match jobs.run_completion(Utc::now()).await {
                    Ok(n) if n > 0 => tracing::info!("Completion: {} booking(s) completed", n),
                    Ok(_) => {}
                    Err(e) => tracing::error!("Completion job failed: {}", e),
                }
            }
        });

        let jobs = self.clone();
        let expiry = spawn_loop("pack-expiry", Duration::ZERO, PACK_EXPIRY_INTERVAL, cancel.clone(), move || {
            let jobs = jobs.clone();
            async move {
                match jobs.run_pack_expiry(Utc::now()).await {
                    Ok(n) if n > 0 => tracing::info!("Pack expiry: {} placeholder(s) cancelled", n),
                    Ok(_) => {}
                    Err(e) => tracing::error!("Pack expiry job failed: {}", e),
                }
            }
        });

        let jobs = self.clone();
        let summary = spawn_loop("daily-summary", summary_delay, DAILY_SUMMARY_INTERVAL, cancel.clone(), move || {
            let jobs = jobs.clone();
            async move {
                if let Err(e) = jobs.run_daily_summary(Utc::now()).await {
                    tracing::error!("Daily summary failed: {}", e);
                }
            }
        });

        let jobs = self;
        let sweeper = spawn_loop("sweeper", SWEEP_INTERVAL, SWEEP_INTERVAL, cancel, move || {
            let jobs = jobs.clone();
            async move {
                jobs.sweep_idle(Instant::now()).await;
            }
        });

        vec![reminders, completion, expiry, summary, sweeper]
    }
}

/// Run `tick` every `period` (first run after `delay`) until cancelled.
fn spawn_loop<F, Fut>(
    name: &'static str,
    delay: Duration,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + delay;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("Job {} started (every {}s)", name, period.as_secs());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Job {} stopping", name);
                    break;
                }
                _ = interval.tick() => tick().await,
            }
        }
    })
}
