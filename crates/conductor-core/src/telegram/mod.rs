//! Telegram chat transport
//!
//! The rest of the crate talks to the chat surface through the
//! [`ChatTransport`] trait; [`TelegramBot`] is the production
//! implementation over the Bot API. Tests substitute mock transports.

pub mod format;
pub mod keyboards;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Errors surfaced by the transport. The notifier absorbs all of them.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("platform unreachable: {0}")]
    Unreachable(String),
    #[error("throttled by platform")]
    Throttled { retry_after: Option<u64> },
    #[error("credentials rejected")]
    AuthDenied,
}

/// One row-major inline keyboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Keyboard {
    inline_keyboard: Vec<Vec<InlineButton>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl Keyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(mut self, buttons: Vec<InlineButton>) -> Self {
        self.inline_keyboard.push(buttons);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inline_keyboard.is_empty()
    }
}

pub fn button(text: &str, callback_data: &str) -> InlineButton {
    InlineButton {
        text: text.to_string(),
        callback_data: callback_data.to_string(),
    }
}

/// Outbound surface the notifier and handlers depend on.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a message to the authorized chat; returns the platform
    /// message id.
    async fn send_message(
        &self,
        text: &str,
        keyboard: Option<&Keyboard>,
        silent: bool,
    ) -> Result<i64, TransportError>;

    /// Cheap liveness probe ("who am I").
    async fn check_alive(&self) -> Result<(), TransportError>;
}

// ============ Incoming update types ============

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<ChatUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: ChatUser,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatUser {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

// ============ TelegramBot ============

/// Bot API client bound to the single authorized chat.
pub struct TelegramBot {
    http: reqwest::Client,
    base_url: String,
    chat_id: i64,
}

impl TelegramBot {
    pub fn new(token: &str, chat_id: i64) -> Self {
        Self::with_base_url(&format!("https://api.telegram.org/bot{token}"), chat_id)
    }

    /// Used by tests to point the client at a local stub.
    pub fn with_base_url(base_url: &str, chat_id: i64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.to_string(),
            chat_id,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        self.call_with_timeout(method, body, None).await
    }

    async fn call_with_timeout<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<T, TransportError> {
        let url = format!("{}/{}", self.base_url, method);
        let mut request = self.http.post(&url).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let status = response.status();
        let parsed: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TransportError::AuthDenied);
        }
        if status.as_u16() == 429 {
            return Err(TransportError::Throttled {
                retry_after: parsed.parameters.and_then(|p| p.retry_after),
            });
        }
        if !parsed.ok {
            return Err(TransportError::Unreachable(
                parsed.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        parsed
            .result
            .ok_or_else(|| TransportError::Unreachable("empty result".to_string()))
    }

    /// Long-poll for updates (messages + callback queries only). The
    /// HTTP timeout is widened past the server-side long-poll window.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError> {
        self.call_with_timeout(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }),
            Some(Duration::from_secs(timeout_secs + 10)),
        )
        .await
    }

    /// Acknowledge a button tap, optionally with a toast.
    pub async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", body).await?;
        Ok(())
    }

    /// Register the command menu with the platform. Non-fatal on error.
    pub async fn set_commands(&self, commands: &[(&str, &str)]) -> Result<(), TransportError> {
        let commands: Vec<_> = commands
            .iter()
            .map(|(name, description)| json!({ "command": name, "description": description }))
            .collect();
        let _: bool = self
            .call("setMyCommands", json!({ "commands": commands }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for TelegramBot {
    async fn send_message(
        &self,
        text: &str,
        keyboard: Option<&Keyboard>,
        silent: bool,
    ) -> Result<i64, TransportError> {
        let mut body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_notification": silent,
        });
        if let Some(keyboard) = keyboard {
            body["reply_markup"] = serde_json::to_value(keyboard)
                .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        }
        let sent: SentMessage = self.call("sendMessage", body).await?;
        debug!(message_id = sent.message_id, "Message sent");
        Ok(sent.message_id)
    }

    async fn check_alive(&self) -> Result<(), TransportError> {
        let _: serde_json::Value = self.call("getMe", json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyboard_serialization() {
        let keyboard = Keyboard::new()
            .row(vec![button("✅ Yes", "perm:yes:s1"), button("❌ No", "perm:no:s1")])
            .row(vec![button("👀 Context", "perm:ctx:s1")]);
        let value = serde_json::to_value(&keyboard).unwrap();
        assert_eq!(value["inline_keyboard"][0][0]["text"], "✅ Yes");
        assert_eq!(value["inline_keyboard"][0][1]["callback_data"], "perm:no:s1");
        assert_eq!(value["inline_keyboard"][1].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_update_deserialization() {
        let raw = r#"{
            "update_id": 10,
            "message": {"message_id": 5, "from": {"id": 42}, "text": "/status"}
        }"#;
        let update: Update = serde_json::from_str(raw).unwrap();
        assert_eq!(update.update_id, 10);
        let message = update.message.unwrap();
        assert_eq!(message.from.unwrap().id, 42);
        assert_eq!(message.text.as_deref(), Some("/status"));
        assert!(update.callback_query.is_none());
    }

    #[test]
    fn test_callback_query_deserialization() {
        let raw = r#"{
            "update_id": 11,
            "callback_query": {"id": "cb1", "from": {"id": 42}, "data": "perm:yes:s1"}
        }"#;
        let update: Update = serde_json::from_str(raw).unwrap();
        let callback = update.callback_query.unwrap();
        assert_eq!(callback.data.as_deref(), Some("perm:yes:s1"));
        assert_eq!(callback.from.id, 42);
    }
}
