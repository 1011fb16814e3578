//! Outbound chat surface
//!
//! The coordinators talk to the chat through [`ChatTransport`] only. The
//! Telegram adapter implements it for the running bot, tests use a recorder.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{callback::Callback, jobs::MediaKind};

pub type ChatId = i64;
pub type MessageId = i32;

/// A message that can be edited in place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatTarget {
    pub chat: ChatId,
    pub message: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub callback: Callback,
}

impl Button {
    pub fn new(label: impl Into<String>, callback: Callback) -> Self {
        Self {
            label: label.into(),
            callback,
        }
    }
}

/// Rows of inline buttons
pub type Keyboard = Vec<Vec<Button>>;

/// Bytes pushed so far by a media transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub sent: u64,
    pub total: u64,
}

#[derive(Debug, Error)]
pub enum ChatError {
    /// The edit would not change the message
    #[error("message is not modified")]
    NotModified,
    #[error("chat API error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a new text message, returning its id
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageId, ChatError>;

    /// Replace the text (and buttons) of an existing message
    async fn edit_text(
        &self,
        target: ChatTarget,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChatError>;

    /// Send a local file as `kind`, reporting bytes sent through `progress`
    async fn send_media(
        &self,
        chat: ChatId,
        kind: MediaKind,
        path: &Path,
        progress: watch::Sender<Transfer>,
    ) -> Result<(), ChatError>;

    /// Download a file the user sent into `dest`, returning the byte count
    async fn fetch_file(&self, file_id: &str, dest: &Path) -> Result<u64, ChatError>;

    /// Acknowledge a button press
    async fn answer_callback(&self, callback_id: &str) -> Result<(), ChatError>;
}

/// Edit a message, swallowing no-op edits and logging anything else
///
/// Returns whether the message was actually changed.
pub async fn edit_best_effort(
    transport: &dyn ChatTransport,
    target: ChatTarget,
    text: &str,
    keyboard: Option<&Keyboard>,
) -> bool {
    match transport.edit_text(target, text, keyboard).await {
        Ok(()) => true,
        Err(ChatError::NotModified) => {
            debug!(chat = target.chat, message = target.message, "Edit was a no-op");
            false
        }
        Err(e) => {
            warn!(chat = target.chat, message = target.message, error = %e, "Failed to edit message");
            false
        }
    }
}
