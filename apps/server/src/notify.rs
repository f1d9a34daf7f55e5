//! Outbound notices. Delivery is best-effort: callers log failures and move on.

use async_trait::async_trait;

use crate::telegram::TelegramApi;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notice delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_direct_notice(&self, user_id: i64, content: &str) -> Result<(), NotifyError>;
    async fn send_operator_notice(&self, content: &str) -> Result<(), NotifyError>;
    async fn send_channel_notice(&self, chat_id: i64, content: &str) -> Result<(), NotifyError>;
}

/// Fire-and-forget direct notice.
pub async fn notify_user(notifier: &dyn Notifier, user_id: i64, content: &str) -> bool {
    match notifier.send_direct_notice(user_id, content).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Notice to user {} not delivered: {}", user_id, e);
            false
        }
    }
}

/// Fire-and-forget operator notice.
pub async fn notify_operator(notifier: &dyn Notifier, content: &str) {
    if let Err(e) = notifier.send_operator_notice(content).await {
        tracing::warn!("Operator notice not delivered: {}", e);
    }
}

pub struct TelegramNotifier {
    api: TelegramApi,
    operator_chat_id: i64,
}

impl TelegramNotifier {
    pub fn new(api: TelegramApi, operator_chat_id: i64) -> Self {
        Self {
            api,
            operator_chat_id,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_direct_notice(&self, user_id: i64, content: &str) -> Result<(), NotifyError> {
        // Private chat id == user id.
        self.api
            .send_message(user_id, None, content)
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))
    }

    async fn send_operator_notice(&self, content: &str) -> Result<(), NotifyError> {
        self.api
            .send_message(self.operator_chat_id, None, content)
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))
    }

    async fn send_channel_notice(&self, chat_id: i64, content: &str) -> Result<(), NotifyError> {
        self.api
            .send_message(chat_id, None, content)
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))
    }
}
