//! Minimal Telegram Bot API client over reqwest.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::EXTERNAL_CALL_TIMEOUT;

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("telegram request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram rejected {method}: {description}")]
    Api { method: String, description: String },
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramApi {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramApi {
    pub fn new(api_base: &str, bot_token: &str) -> Result<Self, TelegramError> {
        let http = reqwest::Client::builder()
            .timeout(EXTERNAL_CALL_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
        })
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, TelegramError> {
        let url = format!("{}/{}", self.base_url, method);
        let envelope: Envelope<T> = self.http.post(&url).json(body).send().await?.json().await?;
        match (envelope.ok, envelope.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(TelegramError::Api {
                method: method.to_string(),
                description: envelope
                    .description
                    .unwrap_or_else(|| "no description".into()),
            }),
        }
    }

    /// Plain-text message, optionally into a forum topic.
    pub async fn send_message(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        text: &str,
    ) -> Result<(), TelegramError> {
        let mut body = serde_json::json!({ "chat_id": chat_id, "text": text });
        if let Some(thread) = thread_id {
            body["message_thread_id"] = thread.into();
        }
        self.call::<serde_json::Value>("sendMessage", &body).await?;
        Ok(())
    }

    pub async fn send_html(&self, chat_id: i64, html: &str) -> Result<(), TelegramError> {
        let body = serde_json::json!({ "chat_id": chat_id, "text": html, "parse_mode": "HTML" });
        self.call::<serde_json::Value>("sendMessage", &body).await?;
        Ok(())
    }

    pub async fn get_me(&self) -> Result<BotUser, TelegramError> {
        self.call("getMe", &serde_json::json!({})).await
    }
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
