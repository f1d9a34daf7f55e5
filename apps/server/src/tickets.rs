//! Tickets: one private conversation per booking wizard.
//!
//! Tickets are Telegram forum topics in one supergroup. `TicketAdmissionGuard`
//! makes sure a student never holds two of them at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::BookingError;
use crate::telegram::{TelegramApi, TelegramError};

/// Upper bound for a whole gateway operation (topic creation + welcome message).
const TICKET_CALL_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketInfo {
    pub ticket_id: String,
    pub name: String,
    pub owner_user_id: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Telegram(#[from] TelegramError),
    #[error("{0}")]
    Rejected(String),
}

#[async_trait]
pub trait TicketGateway: Send + Sync {
    /// Live view of open tickets with their owners.
    async fn list_open_tickets(&self) -> Result<Vec<TicketInfo>, GatewayError>;

    /// Create the ticket resource and post the first wizard prompt into it.
    async fn open_ticket(&self, owner_user_id: i64, owner_name: &str) -> Result<TicketInfo, GatewayError>;

    async fn close_ticket(&self, ticket_id: &str) -> Result<(), GatewayError>;

    async fn post_to_ticket(&self, ticket_id: &str, text: &str) -> Result<(), GatewayError>;
}

/// `ticket-{name}-{n}` with the name reduced to lowercase ascii words.
pub fn ticket_name(display_name: &str, number: u64) -> String {
    let slug: String = display_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug = if slug.is_empty() { "client".to_string() } else { slug };
    format!("ticket-{slug}-{number}")
}

pub const WELCOME_PROMPT: &str =
    "👋 Welcome! Which coaching would you like to book?\n\n• Free session\n• Paid session (single or pack)";

// ── Telegram forum topics ──

#[derive(Debug, Deserialize)]
struct ForumTopic {
    message_thread_id: i64,
    name: String,
}

pub struct TelegramTopics {
    api: TelegramApi,
    chat_id: i64,
    open: DashMap<String, TicketInfo>,
    sequence: AtomicU64,
}

impl TelegramTopics {
    pub fn new(api: TelegramApi, chat_id: i64) -> Self {
        Self {
            api,
            chat_id,
            open: DashMap::new(),
            sequence: AtomicU64::new(1),
        }
    }

    fn thread_id(ticket_id: &str) -> Result<i64, GatewayError> {
        ticket_id
            .parse::<i64>()
            .map_err(|_| GatewayError::Rejected(format!("unknown ticket '{ticket_id}'")))
    }
}

#[async_trait]
impl TicketGateway for TelegramTopics {
    async fn list_open_tickets(&self) -> Result<Vec<TicketInfo>, GatewayError> {
        Ok(self.open.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn open_ticket(&self, owner_user_id: i64, owner_name: &str) -> Result<TicketInfo, GatewayError> {
        let number = self.sequence.fetch_add(1, Ordering::Relaxed);
        let topic: ForumTopic = self
            .api
            .call(
                "createForumTopic",
                &serde_json::json!({
                    "chat_id": self.chat_id,
                    "name": ticket_name(owner_name, number),
                }),
            )
            .await?;

        let ticket = TicketInfo {
            ticket_id: topic.message_thread_id.to_string(),
            name: topic.name,
            owner_user_id,
        };
        self.open.insert(ticket.ticket_id.clone(), ticket.clone());

        if let Err(e) = self
            .api
            .send_message(self.chat_id, Some(topic.message_thread_id), WELCOME_PROMPT)
            .await
        {
            tracing::warn!("Welcome prompt for ticket {} not posted: {}", ticket.name, e);
        }

        tracing::info!("Ticket {} opened for user {}", ticket.name, owner_user_id);
        Ok(ticket)
    }

    async fn close_ticket(&self, ticket_id: &str) -> Result<(), GatewayError> {
        let thread_id = Self::thread_id(ticket_id)?;
        self.api
            .call::<bool>(
                "closeForumTopic",
                &serde_json::json!({
                    "chat_id": self.chat_id,
                    "message_thread_id": thread_id,
                }),
            )
            .await?;
        self.open.remove(ticket_id);
        Ok(())
    }

    async fn post_to_ticket(&self, ticket_id: &str, text: &str) -> Result<(), GatewayError> {
        let thread_id = Self::thread_id(ticket_id)?;
        self.api.send_message(self.chat_id, Some(thread_id), text).await?;
        Ok(())
    }
}

// ── Admission guard ──

/// Removes the user from the "creating" set on every exit path.
struct CreatingMark<'a> {
    creating: &'a DashSet<i64>,
    user_id: i64,
}

impl Drop for CreatingMark<'_> {
    fn drop(&mut self) {
        self.creating.remove(&self.user_id);
    }
}

pub struct TicketAdmissionGuard {
    gateway: Arc<dyn TicketGateway>,
    /// Serializes the whole check-then-create sequence.
    admission: Mutex<()>,
    creating: DashSet<i64>,
}

impl TicketAdmissionGuard {
    pub fn new(gateway: Arc<dyn TicketGateway>) -> Self {
        Self {
            gateway,
            admission: Mutex::new(()),
            creating: DashSet::new(),
        }
    }

    /// Open a ticket for `user_id`. Privileged callers skip every check.
    pub async fn request_ticket_creation(
        &self,
        user_id: i64,
        display_name: &str,
        privileged: bool,
    ) -> Result<TicketInfo, BookingError> {
        if privileged {
            return self.open(user_id, display_name).await;
        }

        if self.creating.contains(&user_id) {
            return Err(BookingError::AlreadyInProgress);
        }

        let _admission = self.admission.lock().await;

        let open = tokio::time::timeout(TICKET_CALL_TIMEOUT, self.gateway.list_open_tickets())
            .await
            .map_err(|_| BookingError::TicketCreationFailed("ticket list timed out".into()))?
            .map_err(|e| BookingError::TicketCreationFailed(e.to_string()))?;
        if let Some(existing) = open.into_iter().find(|t| t.owner_user_id == user_id) {
            return Err(BookingError::DuplicateTicket {
                ticket: existing.name,
            });
        }

        // Declared after the lock guard so it is dropped first.
        self.creating.insert(user_id);
        let _mark = CreatingMark {
            creating: &self.creating,
            user_id,
        };

        self.open(user_id, display_name).await
    }

    async fn open(&self, user_id: i64, display_name: &str) -> Result<TicketInfo, BookingError> {
        match tokio::time::timeout(TICKET_CALL_TIMEOUT, self.gateway.open_ticket(user_id, display_name)).await {
            Ok(Ok(ticket)) => Ok(ticket),
            Ok(Err(e)) => {
                tracing::error!("Ticket creation for user {} failed: {}", user_id, e);
                Err(BookingError::TicketCreationFailed(e.to_string()))
            }
            Err(_) => {
                tracing::error!("Ticket creation for user {} timed out", user_id);
                Err(BookingError::TicketCreationFailed("timed out".into()))
            }
        }
    }

    /// Close a ticket. Students may only close their own.
    pub async fn close_ticket(&self, ticket_id: &str, actor: i64, privileged: bool) -> Result<(), BookingError> {
        let open = self
            .gateway
            .list_open_tickets()
            .await
            .map_err(|e| BookingError::TicketCreationFailed(e.to_string()))?;
        let ticket = open
            .into_iter()
            .find(|t| t.ticket_id == ticket_id)
            .ok_or_else(|| BookingError::not_found("ticket", ticket_id))?;
        if !privileged && ticket.owner_user_id != actor {
            return Err(BookingError::Forbidden);
        }

        self.gateway.close_ticket(ticket_id).await.map_err(|e| {
            tracing::error!("Closing ticket {} failed: {}", ticket.name, e);
            BookingError::TicketCreationFailed(e.to_string())
        })?;
        tracing::info!("Ticket {} closed by {}", ticket.name, actor);
        Ok(())
    }
}
