// src/services/messenger.rs

//! Message delivery to entity owners.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::TelegramConfig;
use crate::utils::http::with_trailing_slash;

/// Outbound messaging channel.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver `text` to `target`. One attempt, no retry.
    async fn send(&self, target: &str, text: &str) -> Result<()>;
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Messenger speaking the Telegram Bot API.
pub struct TelegramMessenger {
    client: Client,
    endpoint: Url,
}

impl TelegramMessenger {
    pub fn new(config: &TelegramConfig, client: Client) -> Result<Self> {
        if config.bot_token.trim().is_empty() {
            return Err(AppError::config("telegram.bot_token is empty"));
        }
        // Tokens contain ':' so they cannot go through Url::join
        let base = with_trailing_slash(&config.api_base)?;
        let endpoint = Url::parse(&format!(
            "{base}bot{}/sendMessage",
            config.bot_token.trim()
        ))?;
        Ok(Self { client, endpoint })
    }

    /// Pull a readable reason out of an API error body.
    fn describe_failure(body: &Value) -> String {
        body.get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string())
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(&self, target: &str, text: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&SendMessage {
                chat_id: target,
                text,
            })
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let ok = body.get("ok").and_then(Value::as_bool).unwrap_or(false);

        if !status.is_success() || !ok {
            return Err(AppError::messaging(
                target,
                format!("{status}: {}", Self::describe_failure(&body)),
            ));
        }
        Ok(())
    }
}
