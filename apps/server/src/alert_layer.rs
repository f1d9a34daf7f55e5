//! Tracing layer that forwards ERROR events to the operator chat.
//!
//! - at most one alert per `MIN_INTERVAL` (10 s)
//! - identical messages suppressed for `DEDUP_WINDOW` (60 s)
//! - delivery is spawned on the runtime; the emitting task never waits

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::telegram::{escape_html, TelegramApi};

/// Minimum interval between two alerts.
const MIN_INTERVAL: Duration = Duration::from_secs(10);
/// Window during which an identical message is not repeated.
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

// ── Gate ──

/// Rate limit + dedup bookkeeping.
struct AlertGate {
    last_sent: Option<Instant>,
    /// (message hash, sent at)
    recent: Vec<(u64, Instant)>,
}

impl AlertGate {
    fn new() -> Self {
        Self {
            last_sent: None,
            recent: Vec::new(),
        }
    }

    /// Whether an alert with `hash` may go out at `now`; records it if so.
    fn admit(&mut self, hash: u64, now: Instant) -> bool {
        self.recent
            .retain(|(_, at)| now.saturating_duration_since(*at) < DEDUP_WINDOW);

        let duplicate = self.recent.iter().any(|(h, _)| *h == hash);
        let too_soon = self
            .last_sent
            .is_some_and(|last| now.saturating_duration_since(last) < MIN_INTERVAL);
        if duplicate || too_soon {
            return false;
        }
        self.last_sent = Some(now);
        self.recent.push((hash, now));
        true
    }
}

fn message_hash(message: &str) -> u64 {
    let mut h = DefaultHasher::new();
    message.hash(&mut h);
    h.finish()
}

fn format_alert(message: &str, target: &str, file: &str, line: &str) -> String {
    format!(
        "🚨 <b>coachdesk error</b>\n<code>{}</code>\n📍 {} ({}:{})\n🕐 {}",
        escape_html(message),
        escape_html(target),
        escape_html(file),
        line,
        chrono::Utc::now().format("%H:%M:%S UTC")
    )
}

// ── Layer ──

pub struct OperatorAlertLayer {
    api: TelegramApi,
    chat_id: i64,
    gate: Mutex<AlertGate>,
}

impl OperatorAlertLayer {
    pub fn new(api: TelegramApi, chat_id: i64) -> Self {
        Self {
            api,
            chat_id,
            gate: Mutex::new(AlertGate::new()),
        }
    }
}

impl<S: Subscriber> Layer<S> for OperatorAlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message();

        let admitted = match self.gate.lock() {
            Ok(mut gate) => gate.admit(message_hash(&message), Instant::now()),
            Err(_) => false,
        };
        if !admitted {
            return;
        }

        let meta = event.metadata();
        let line = meta.line().map(|l| l.to_string()).unwrap_or_else(|| "?".into());
        let text = format_alert(&message, meta.target(), meta.file().unwrap_or("?"), &line);

        // Outside a runtime (e.g. during shutdown) the alert is dropped.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let api = self.api.clone();
        let chat_id = self.chat_id;
        handle.spawn(async move {
            // A failure here must not log at ERROR or it would alert about itself.
            if let Err(e) = api.send_html(chat_id, &text).await {
                eprintln!("operator alert not delivered: {e}");
            }
        });
    }
}

// ── Field visitor ──

/// Collects the `message` field plus any structured fields of an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn message(&self) -> String {
        if self.fields.is_empty() {
            return self.message.clone();
        }
        let extras = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        if self.message.is_empty() {
            extras
        } else {
            format!("{} ({extras})", self.message)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let value = format!("{value:?}");
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }
}
