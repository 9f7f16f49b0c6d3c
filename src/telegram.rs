//! Telegram Bot API client: long polling plus the outbound calls the bot makes.

use crate::chat::{ChatChannel, ChatError, ChatId, InlineKeyboard, MessageRef};
use async_trait::async_trait;
use reqwest::{
    Client, RequestBuilder,
    multipart::{Form, Part},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub forward_origin: Option<MessageOrigin>,
    /// Older clients still send the legacy field.
    #[serde(default)]
    pub forward_from: Option<User>,
}

impl Message {
    /// Sender of a forwarded message, when the platform reveals it.
    pub fn forwarded_sender(&self) -> Option<&User> {
        match &self.forward_origin {
            Some(MessageOrigin::User { sender_user }) => Some(sender_user),
            _ => self.forward_from.as_ref(),
        }
    }

    pub fn is_forward(&self) -> bool {
        self.forward_origin.is_some() || self.forward_from.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl User {
    pub fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageOrigin {
    User { sender_user: User },
    HiddenUser { sender_user_name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, ChatError> {
        if let Some(retry_after) = self.parameters.and_then(|p| p.retry_after) {
            return Err(ChatError::RetryAfter(Duration::from_secs(retry_after)));
        }
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(ChatError::Api {
                code: self.error_code.unwrap_or_default(),
                description: self.description.unwrap_or_else(|| "no result".into()),
            }),
        }
    }
}

#[derive(Clone)]
pub struct TelegramClient {
    http: Client,
    upload: Client,
    base: String,
}

impl TelegramClient {
    /// `http` serves short calls; `upload` must have no global timeout since
    /// photo uploads carry their own escalating deadline.
    pub fn new(token: &str, http: Client, upload: Client) -> Self {
        Self {
            http,
            upload,
            base: format!("{API_BASE}/bot{token}"),
        }
    }

    fn method(&self, name: &str) -> String {
        format!("{}/{name}", self.base)
    }

    /// One long-poll round. `offset` is the last seen update id plus one.
    pub async fn get_updates(&self, offset: i64, wait: Duration) -> Result<Vec<Update>, ChatError> {
        let request = self
            .http
            .post(self.method("getUpdates"))
            .timeout(wait + Duration::from_secs(10))
            .json(&json!({
                "offset": offset,
                "timeout": wait.as_secs(),
                "allowed_updates": ["message", "callback_query"],
            }));
        call(request).await
    }
}

async fn call<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ChatError> {
    let response = request
        .send()
        .await
        .map_err(|err| ChatError::Transport(err.to_string()))?;
    let status = response.status();
    let body: ApiResponse<T> = response
        .json()
        .await
        .map_err(|err| ChatError::Transport(format!("HTTP {status}: {err}")))?;
    body.into_result()
}

async fn photo_part(path: &Path) -> Result<Part, ChatError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| ChatError::Transport(format!("{}: {err}", path.display())))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "photo.png".into());
    Ok(Part::bytes(bytes).file_name(name))
}

fn media_manifest(count: usize) -> Value {
    Value::Array(
        (0..count)
            .map(|i| json!({ "type": "photo", "media": format!("attach://photo{i}") }))
            .collect(),
    )
}

#[async_trait]
impl ChatChannel for TelegramClient {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef, ChatError> {
        let mut body = json!({
            "chat_id": chat,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Some(keyboard) = keyboard {
            body["reply_markup"] = json!(keyboard);
        }
        let message: Message = call(self.http.post(self.method("sendMessage")).json(&body)).await?;
        Ok(MessageRef {
            chat_id: message.chat.id,
            message_id: message.message_id,
        })
    }

    async fn edit_text(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<(), ChatError> {
        let mut body = json!({
            "chat_id": message.chat_id,
            "message_id": message.message_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if let Some(keyboard) = keyboard {
            body["reply_markup"] = json!(keyboard);
        }
        match call::<Value>(self.http.post(self.method("editMessageText")).json(&body)).await {
            Err(ChatError::Api { description, .. }) if description.contains("message is not modified") => {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), ChatError> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        call::<Value>(self.http.post(self.method("answerCallbackQuery")).json(&body))
            .await
            .map(|_| ())
    }

    async fn send_photo_batch(
        &self,
        chat: ChatId,
        photos: &[PathBuf],
        timeout: Duration,
    ) -> Result<(), ChatError> {
        let mut form = Form::new()
            .text("chat_id", chat.to_string())
            .text("media", media_manifest(photos.len()).to_string());
        for (i, path) in photos.iter().enumerate() {
            form = form.part(format!("photo{i}"), photo_part(path).await?);
        }
        debug!(target = "listing_bot.telegram", chat, count = photos.len(), timeout_s = timeout.as_secs(), "send_media_group");
        call::<Value>(
            self.upload
                .post(self.method("sendMediaGroup"))
                .timeout(timeout)
                .multipart(form),
        )
        .await
        .map(|_| ())
    }

    async fn send_photo(&self, chat: ChatId, photo: &Path, timeout: Duration) -> Result<(), ChatError> {
        let form = Form::new()
            .text("chat_id", chat.to_string())
            .part("photo", photo_part(photo).await?);
        call::<Value>(
            self.upload
                .post(self.method("sendPhoto"))
                .timeout(timeout)
                .multipart(form),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_response_carries_delay() {
        let body: ApiResponse<Value> = serde_json::from_value(json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 3",
            "parameters": { "retry_after": 3 }
        }))
        .unwrap();
        assert!(matches!(
            body.into_result(),
            Err(ChatError::RetryAfter(d)) if d == Duration::from_secs(3)
        ));
    }

    #[test]
    fn api_error_keeps_code_and_description() {
        let body: ApiResponse<Value> = serde_json::from_value(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: chat not found"
        }))
        .unwrap();
        match body.into_result() {
            Err(ChatError::Api { code, description }) => {
                assert_eq!(code, 400);
                assert!(description.contains("chat not found"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_message_and_callback_updates() {
        let updates: Vec<Update> = serde_json::from_value(json!([
            {
                "update_id": 10,
                "message": {
                    "message_id": 5,
                    "chat": { "id": 42, "type": "private" },
                    "from": { "id": 42, "is_bot": false, "first_name": "Olena", "username": "olena" },
                    "text": "https://www.olx.ua/d/uk/obyavlenie/flat-ID1.html"
                }
            },
            {
                "update_id": 11,
                "callback_query": {
                    "id": "cb1",
                    "from": { "id": 42, "is_bot": false, "first_name": "Olena" },
                    "data": "set_crop:10",
                    "chat_instance": "x"
                }
            }
        ]))
        .unwrap();
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.chat.id, 42);
        assert_eq!(message.from.as_ref().unwrap().username.as_deref(), Some("olena"));
        assert_eq!(
            updates[1].callback_query.as_ref().unwrap().data.as_deref(),
            Some("set_crop:10")
        );
    }

    #[test]
    fn forwarded_sender_prefers_origin() {
        let message: Message = serde_json::from_value(json!({
            "message_id": 1,
            "chat": { "id": 7 },
            "forward_origin": {
                "type": "user",
                "date": 0,
                "sender_user": { "id": 99, "is_bot": false, "first_name": "Ivan", "last_name": "P" }
            }
        }))
        .unwrap();
        let sender = message.forwarded_sender().unwrap();
        assert_eq!(sender.id, 99);
        assert_eq!(sender.full_name(), "Ivan P");

        let hidden: Message = serde_json::from_value(json!({
            "message_id": 2,
            "chat": { "id": 7 },
            "forward_origin": { "type": "hidden_user", "date": 0, "sender_user_name": "Anon" }
        }))
        .unwrap();
        assert!(hidden.is_forward());
        assert!(hidden.forwarded_sender().is_none());
    }

    #[test]
    fn media_manifest_references_attachments() {
        let manifest = media_manifest(2);
        assert_eq!(manifest[1]["media"], "attach://photo1");
        assert_eq!(manifest.as_array().unwrap().len(), 2);
    }
}
