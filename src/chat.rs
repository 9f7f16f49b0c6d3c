use async_trait::async_trait;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub type ChatId = i64;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("rate limited; retry after {0:?}")]
    RetryAfter(Duration),
    #[error("chat transport error: {0}")]
    Transport(String),
    #[error("chat api error {code}: {description}")]
    Api { code: u16, description: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct InlineKeyboard {
    pub inline_keyboard: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    pub fn row(buttons: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            inline_keyboard: vec![
                buttons
                    .into_iter()
                    .map(|(text, callback_data)| InlineButton {
                        text,
                        callback_data,
                    })
                    .collect(),
            ],
        }
    }
}

/// Outbound surface of the chat platform.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageRef, ChatError>;

    async fn edit_text(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<(), ChatError>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>)
    -> Result<(), ChatError>;

    /// Sends 2..=10 photos as one album.
    async fn send_photo_batch(
        &self,
        chat: ChatId,
        photos: &[PathBuf],
        timeout: Duration,
    ) -> Result<(), ChatError>;

    async fn send_photo(&self, chat: ChatId, photo: &Path, timeout: Duration)
    -> Result<(), ChatError>;
}

/// Minimal escaping for HTML parse mode.
pub fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
