//! In-memory fakes and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Notify;

use crate::calendar::{BusyInterval, CalendarError, CalendarProvider, EventPatch};
use crate::config::Config;
use crate::db;
use crate::models::{BookingStatus, BookingType, NewBooking};
use crate::notify::{NotifyError, Notifier};
use crate::session::SessionSettings;
use crate::tickets::{ticket_name, GatewayError, TicketGateway, TicketInfo};

// ── Fixtures ──

/// Single-connection in-memory database with the schema applied.
pub async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
}

/// A one-hour paid booking with no calendar event.
pub fn new_booking(client_id: i64, at: DateTime<Utc>, status: BookingStatus) -> NewBooking {
    NewBooking {
        client_id,
        external_event_id: None,
        booking_type: BookingType::Paid,
        scheduled_at: at,
        duration_minutes: 60,
        status,
        created_at: at - TimeDelta::days(1),
        ticket_context_id: None,
        notes: None,
    }
}

pub fn test_settings() -> SessionSettings {
    SessionSettings {
        tz: chrono_tz::Europe::Paris,
        free_duration_minutes: 60,
        paid_duration_minutes: 60,
        timeout: Duration::from_secs(300),
    }
}

pub fn test_config() -> Config {
    let values: HashMap<&str, &str> = [
        ("BOT_TOKEN", "T"),
        ("OPERATOR_CHAT_ID", "-500"),
        ("TICKET_CHAT_ID", "-100"),
        ("FEEDBACK_CHAT_ID", "-700"),
        ("GATEWAY_SECRET", "gateway-secret"),
        ("COACH_IDS", "99"),
        ("GOOGLE_CALENDAR_ID", "primary"),
        ("GOOGLE_CALENDAR_TOKEN", "token"),
    ]
    .into_iter()
    .collect();
    Config::from_lookup(|key| values.get(key).map(|v| v.to_string())).unwrap()
}

// ── Calendar ──

#[derive(Default)]
pub struct FakeCalendar {
    busy: Mutex<Vec<BusyInterval>>,
    events: Mutex<HashMap<String, BusyInterval>>,
    deleted: Mutex<Vec<String>>,
    updated: Mutex<Vec<(String, EventPatch)>>,
    sequence: AtomicU64,
    unreachable: AtomicBool,
    fail_create: AtomicBool,
    fail_create_after: Mutex<Option<usize>>,
    fail_delete: AtomicBool,
    fail_update: AtomicBool,
}

impl FakeCalendar {
    pub fn add_busy(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.busy.lock().unwrap().push(BusyInterval { start, end });
    }

    pub fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, value: bool) {
        self.fail_create.store(value, Ordering::SeqCst);
    }

    /// Let `n` more creations succeed, then fail the rest.
    pub fn set_fail_create_after(&self, n: usize) {
        *self.fail_create_after.lock().unwrap() = Some(self.created_count() + n);
    }

    pub fn set_fail_delete(&self, value: bool) {
        self.fail_delete.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_update(&self, value: bool) {
        self.fail_update.store(value, Ordering::SeqCst);
    }

    /// Events created so far, deleted ones included.
    pub fn created_count(&self) -> usize {
        self.sequence.load(Ordering::SeqCst) as usize
    }

    pub fn live_events(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn updated(&self) -> Vec<(String, EventPatch)> {
        self.updated.lock().unwrap().clone()
    }
}

#[async_trait]
impl CalendarProvider for FakeCalendar {
    async fn list_busy_intervals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, CalendarError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CalendarError::Status(503));
        }
        let mut all = self.busy.lock().unwrap().clone();
        all.extend(self.events.lock().unwrap().values().copied());
        Ok(all.into_iter().filter(|b| b.overlaps(start, end)).collect())
    }

    async fn create_event(
        &self,
        _title: &str,
        start: DateTime<Utc>,
        duration_minutes: i64,
        _description: &str,
    ) -> Option<String> {
        if self.fail_create.load(Ordering::SeqCst) || self.unreachable.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(limit) = *self.fail_create_after.lock().unwrap() {
            if self.created_count() >= limit {
                return None;
            }
        }
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("evt-{n}");
        self.events.lock().unwrap().insert(
            id.clone(),
            BusyInterval {
                start,
                end: start + TimeDelta::minutes(duration_minutes),
            },
        );
        Some(id)
    }

    async fn delete_event(&self, event_id: &str) -> bool {
        if self.fail_delete.load(Ordering::SeqCst) {
            return false;
        }
        self.events.lock().unwrap().remove(event_id);
        self.deleted.lock().unwrap().push(event_id.to_string());
        true
    }

    async fn update_event(&self, event_id: &str, patch: &EventPatch) -> bool {
        if self.fail_update.load(Ordering::SeqCst) {
            return false;
        }
        if let Some((start, minutes)) = patch.timing {
            if let Some(event) = self.events.lock().unwrap().get_mut(event_id) {
                *event = BusyInterval {
                    start,
                    end: start + TimeDelta::minutes(minutes),
                };
            }
        }
        self.updated
            .lock()
            .unwrap()
            .push((event_id.to_string(), patch.clone()));
        true
    }
}

// ── Notifier ──

#[derive(Default)]
pub struct RecordingNotifier {
    direct: Mutex<Vec<(i64, String)>>,
    operator: Mutex<Vec<String>>,
    channel: Mutex<Vec<(i64, String)>>,
    blocked: Mutex<Vec<i64>>,
}

impl RecordingNotifier {
    /// Direct notices to this user fail from now on.
    pub fn block_user(&self, user_id: i64) {
        self.blocked.lock().unwrap().push(user_id);
    }

    pub fn direct_to(&self, user_id: i64) -> Vec<String> {
        self.direct
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == user_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn direct_count(&self) -> usize {
        self.direct.lock().unwrap().len()
    }

    pub fn operator(&self) -> Vec<String> {
        self.operator.lock().unwrap().clone()
    }

    pub fn channel(&self) -> Vec<(i64, String)> {
        self.channel.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_direct_notice(&self, user_id: i64, content: &str) -> Result<(), NotifyError> {
        if self.blocked.lock().unwrap().contains(&user_id) {
            return Err(NotifyError::Delivery(format!("user {user_id} blocked the bot")));
        }
        self.direct.lock().unwrap().push((user_id, content.to_string()));
        Ok(())
    }

    async fn send_operator_notice(&self, content: &str) -> Result<(), NotifyError> {
        self.operator.lock().unwrap().push(content.to_string());
        Ok(())
    }

    async fn send_channel_notice(&self, chat_id: i64, content: &str) -> Result<(), NotifyError> {
        self.channel.lock().unwrap().push((chat_id, content.to_string()));
        Ok(())
    }
}

// ── Ticket gateway ──

#[derive(Default)]
pub struct FakeGateway {
    tickets: Mutex<Vec<TicketInfo>>,
    closed: Mutex<Vec<String>>,
    posted: Mutex<Vec<(String, String)>>,
    created: AtomicUsize,
    sequence: AtomicU64,
    fail_open: AtomicBool,
    hold: AtomicBool,
    creating: Notify,
    release: Notify,
}

impl FakeGateway {
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Block `open_ticket` until `release_creation` is called.
    pub fn hold_creation(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub async fn wait_until_creating(&self) {
        self.creating.notified().await;
    }

    pub fn release_creation(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    pub fn set_fail_open(&self, value: bool) {
        self.fail_open.store(value, Ordering::SeqCst);
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn posted_to(&self, ticket_id: &str) -> Vec<String> {
        self.posted
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == ticket_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl TicketGateway for FakeGateway {
    async fn list_open_tickets(&self) -> Result<Vec<TicketInfo>, GatewayError> {
        tokio::task::yield_now().await;
        Ok(self.tickets.lock().unwrap().clone())
    }

    async fn open_ticket(&self, owner_user_id: i64, owner_name: &str) -> Result<TicketInfo, GatewayError> {
        if self.hold.load(Ordering::SeqCst) {
            // notify_one stores a permit, so the waiter wakes even if it subscribes late.
            self.creating.notify_one();
            self.release.notified().await;
        }
        tokio::task::yield_now().await;
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected("topic creation refused".into()));
        }
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let ticket = TicketInfo {
            ticket_id: format!("t{n}"),
            name: ticket_name(owner_name, n),
            owner_user_id,
        };
        self.tickets.lock().unwrap().push(ticket.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ticket)
    }

    async fn close_ticket(&self, ticket_id: &str) -> Result<(), GatewayError> {
        let mut tickets = self.tickets.lock().unwrap();
        let before = tickets.len();
        tickets.retain(|t| t.ticket_id != ticket_id);
        if tickets.len() == before {
            return Err(GatewayError::Rejected(format!("unknown ticket '{ticket_id}'")));
        }
        self.closed.lock().unwrap().push(ticket_id.to_string());
        Ok(())
    }

    async fn post_to_ticket(&self, ticket_id: &str, text: &str) -> Result<(), GatewayError> {
        self.posted
            .lock()
            .unwrap()
            .push((ticket_id.to_string(), text.to_string()));
        Ok(())
    }
}
