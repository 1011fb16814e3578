//! Telegram Bot API adapter
//!
//! Implements [`ChatTransport`] over plain HTTPS calls and long-polls
//! `getUpdates` for inbound events. Only the handful of methods the bot uses
//! are modelled.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{
    Body, Client,
    multipart::{Form, Part},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{path::Path, time::Duration};
use tokio::{fs::File, io::AsyncWriteExt, sync::watch};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, trace};

use crate::{
    bot::{Command, Event},
    jobs::{FileMeta, MediaKind},
    transport::{ChatError, ChatId, ChatTarget, ChatTransport, Keyboard, MessageId, Transfer},
};

const NOT_MODIFIED: &str = "message is not modified";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    message: Option<Message>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: MessageId,
    chat: Chat,
    from: Option<User>,
    text: Option<String>,
    document: Option<Attachment>,
    video: Option<Attachment>,
    audio: Option<Attachment>,
    /// Sizes of one photo, smallest first
    photo: Option<Vec<PhotoSize>>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: ChatId,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    file_id: String,
    file_unique_id: Option<String>,
    file_name: Option<String>,
    mime_type: Option<String>,
    file_size: Option<u64>,
}

impl Attachment {
    /// Name and type for media Telegram sends without a file name
    fn into_file(self, prefix: &str, extension: &str, mime: &str) -> (String, FileMeta) {
        let stem = self.file_unique_id.as_deref().unwrap_or(&self.file_id);
        let name = self
            .file_name
            .unwrap_or_else(|| format!("{prefix}_{stem}.{extension}"));
        let meta = FileMeta {
            name,
            size: self.file_size,
            mime: Some(self.mime_type.unwrap_or_else(|| mime.to_string())),
        };
        (self.file_id, meta)
    }
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    file_unique_id: Option<String>,
    file_size: Option<u64>,
    width: u32,
    height: u32,
}

impl PhotoSize {
    fn rank(&self) -> (u64, u64) {
        (
            self.file_size.unwrap_or_default(),
            u64::from(self.width) * u64::from(self.height),
        )
    }
}

impl Message {
    /// The file this message carries, with the largest size of a photo
    fn take_file(&mut self) -> Option<(String, FileMeta)> {
        if let Some(document) = self.document.take() {
            let meta = FileMeta {
                name: document
                    .file_name
                    .unwrap_or_else(|| document.file_id.clone()),
                size: document.file_size,
                mime: document.mime_type,
            };
            return Some((document.file_id, meta));
        }
        if let Some(video) = self.video.take() {
            return Some(video.into_file("video", "mp4", "video/mp4"));
        }
        if let Some(audio) = self.audio.take() {
            return Some(audio.into_file("audio", "mp3", "audio/mpeg"));
        }
        let photo = self
            .photo
            .take()?
            .into_iter()
            .max_by_key(PhotoSize::rank)?;
        let attachment = Attachment {
            file_id: photo.file_id,
            file_unique_id: photo.file_unique_id,
            file_name: None,
            mime_type: None,
            file_size: photo.file_size,
        };
        Some(attachment.into_file("photo", "jpg", "image/jpeg"))
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    from: User,
    message: Option<Message>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

impl Update {
    /// The event this update carries, if the bot cares about it
    pub fn into_event(self) -> Option<Event> {
        if let Some(query) = self.callback_query {
            let message = query.message?;
            return Some(Event::Callback {
                id: query.id,
                chat: message.chat.id,
                user: query.from.id,
                message: message.message_id,
                data: query.data?,
            });
        }

        let mut message = self.message?;
        let chat = message.chat.id;
        let user = message.from.as_ref().map(|u| u.id).unwrap_or(chat);
        if let Some((file_id, meta)) = message.take_file() {
            return Some(Event::Document {
                chat,
                user,
                file_id,
                meta,
            });
        }

        let text = message.text?;
        match Command::parse(&text) {
            Some(command) => Some(Event::Command {
                chat,
                user,
                command,
            }),
            None => Some(Event::Text { chat, user, text }),
        }
    }
}

fn keyboard_markup(keyboard: &Keyboard) -> Value {
    let rows: Vec<Vec<Value>> = keyboard
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| {
                    json!({
                        "text": button.label,
                        "callback_data": button.callback.to_string(),
                    })
                })
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

fn media_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Image => ("sendPhoto", "photo"),
        MediaKind::Generic => ("sendDocument", "document"),
    }
}

fn api_error(code: Option<i64>, description: Option<String>) -> ChatError {
    let description = description.unwrap_or_else(|| "no description".to_string());
    if description.contains(NOT_MODIFIED) {
        ChatError::NotModified
    } else {
        ChatError::Api {
            code: code.unwrap_or_default(),
            description,
        }
    }
}

pub struct TelegramTransport {
    client: Client,
    api: String,
    files: String,
}

impl std::fmt::Debug for TelegramTransport {
    // The URLs embed the bot token
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramTransport").finish_non_exhaustive()
    }
}

impl TelegramTransport {
    pub fn new(api_base: &str, token: &str) -> Self {
        let base = api_base.trim_end_matches('/');
        Self {
            client: Client::new(),
            api: format!("{base}/bot{token}"),
            files: format!("{base}/file/bot{token}"),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{method}", self.api)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ChatError> {
        let bytes = response.bytes().await?;
        let decoded: ApiResponse<T> = serde_json::from_slice(&bytes)?;
        match decoded {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse {
                error_code,
                description,
                ..
            } => Err(api_error(error_code, description)),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, ChatError> {
        trace!(method, "Bot API call");
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<Update>, ChatError> {
        let response = self
            .client
            .post(self.method_url("getUpdates"))
            .timeout(timeout + Duration::from_secs(10))
            .json(&json!({
                "offset": offset,
                "timeout": timeout.as_secs(),
                "allowed_updates": ["message", "callback_query"],
            }))
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageId, ChatError> {
        let mut body = json!({ "chat_id": chat, "text": text });
        if let Some(keyboard) = keyboard {
            body["reply_markup"] = keyboard_markup(keyboard);
        }
        let message: Message = self.call("sendMessage", body).await?;
        Ok(message.message_id)
    }

    async fn edit_text(
        &self,
        target: ChatTarget,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChatError> {
        let mut body = json!({
            "chat_id": target.chat,
            "message_id": target.message,
            "text": text,
        });
        if let Some(keyboard) = keyboard {
            body["reply_markup"] = keyboard_markup(keyboard);
        }
        let _: Value = self.call("editMessageText", body).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, progress))]
    async fn send_media(
        &self,
        chat: ChatId,
        kind: MediaKind,
        path: &Path,
        progress: watch::Sender<Transfer>,
    ) -> Result<(), ChatError> {
        let (method, field) = media_method(kind);
        let file = File::open(path).await?;
        let total = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let mut sent = 0u64;
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(chunk) = &chunk {
                sent += chunk.len() as u64;
                progress.send_replace(Transfer { sent, total });
            }
            chunk
        });
        let part = Part::stream_with_length(Body::wrap_stream(stream), total).file_name(name);
        let form = Form::new().text("chat_id", chat.to_string()).part(field, part);

        debug!(method, total, "Uploading media");
        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await?;
        let _: Value = Self::decode(response).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn fetch_file(&self, file_id: &str, dest: &Path) -> Result<u64, ChatError> {
        let info: FileInfo = self.call("getFile", json!({ "file_id": file_id })).await?;
        let file_path = info.file_path.ok_or_else(|| ChatError::Api {
            code: 0,
            description: "file is not available for download".to_string(),
        })?;

        let response = self
            .client
            .get(format!("{}/{file_path}", self.files))
            .send()
            .await?
            .error_for_status()?;
        let mut out = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        debug!(written, "Fetched file");
        Ok(written)
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), ChatError> {
        let _: Value = self
            .call(
                "answerCallbackQuery",
                json!({ "callback_query_id": callback_id }),
            )
            .await?;
        Ok(())
    }
}
