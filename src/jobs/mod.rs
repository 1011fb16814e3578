//! Job data model
//!
//! A job is one tracked download or upload attempt. It is keyed by the chat
//! message that reports on it, so every follow-up action (destination choice,
//! cancellation) carries the key back in its callback payload.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::{ChatId, ChatTarget, MessageId};

pub mod registry;

pub use registry::{JobError, JobRegistry};

pub type UserId = i64;

/// Correlation key of a job: the chat and message id of its status message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub chat: ChatId,
    pub message: MessageId,
}

impl JobKey {
    pub fn new(chat: ChatId, message: MessageId) -> Self {
        Self { chat, message }
    }

    /// The message that renders this job's progress
    pub fn target(&self) -> ChatTarget {
        ChatTarget {
            chat: self.chat,
            message: self.message,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.chat, self.message)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid job key: {0}")]
pub struct InvalidJobKey(pub String);

impl FromStr for JobKey {
    type Err = InvalidJobKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Chat ids can be negative, so split on the last dot
        let (chat, message) = s
            .rsplit_once('.')
            .ok_or_else(|| InvalidJobKey(s.to_string()))?;
        let chat = chat.parse().map_err(|_| InvalidJobKey(s.to_string()))?;
        let message = message.parse().map_err(|_| InvalidJobKey(s.to_string()))?;
        Ok(Self { chat, message })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Fetched by a download backend from a URL
    Download,
    /// Received through the chat transport, waiting to be pushed elsewhere
    Upload,
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Registered, backend not yet accepted the job
    Pending,
    /// Backend is transferring
    Running,
    /// Local file is ready, waiting for the user to choose a destination
    AwaitingUpload,
    /// An upload task owns the local file
    Uploading,
    Stalled,
    Cancelled,
    Failed,
    Completed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stalled | Self::Cancelled | Self::Failed | Self::Completed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::AwaitingUpload => write!(f, "awaiting upload"),
            Self::Uploading => write!(f, "uploading"),
            Self::Stalled => write!(f, "stalled"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// What the job is currently driving on the backend side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendHandle {
    /// Job id on a download backend (aria2 gid, extractor ulid)
    Download(String),
    /// Child process id of a sync-tool invocation
    Process(u32),
}

/// Media kind used to pick the chat transfer method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    Generic,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Self {
        match mime.split('/').next() {
            Some("video") => Self::Video,
            Some("audio") => Self::Audio,
            Some("image") => Self::Image,
            _ => Self::Generic,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Image => write!(f, "image"),
            Self::Generic => write!(f, "document"),
        }
    }
}

/// Metadata of the file a job produced
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    /// Declared size in bytes, if known
    pub size: Option<u64>,
    /// Declared mime type, if the source provided one
    pub mime: Option<String>,
}

impl FileMeta {
    pub fn from_path(path: &Path, size: Option<u64>) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            size,
            mime: None,
        }
    }

    /// Declared type first, then a guess from the file name
    pub fn media_kind(&self) -> MediaKind {
        if let Some(mime) = &self.mime {
            let kind = MediaKind::from_mime(mime);
            if kind != MediaKind::Generic {
                return kind;
            }
        }
        mime_guess::from_path(&self.name)
            .first()
            .map(|m| MediaKind::from_mime(m.essence_str()))
            .unwrap_or(MediaKind::Generic)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub key: JobKey,
    pub kind: JobKind,
    pub user: UserId,
    pub handle: Option<BackendHandle>,
    pub state: JobState,
    /// Set once the file is complete on disk
    pub local_path: Option<PathBuf>,
    pub file: Option<FileMeta>,
    /// Cooperative cancellation flag, observed by the owning task
    pub cancel: CancellationToken,
}

impl Job {
    pub fn new(key: JobKey, kind: JobKind, user: UserId) -> Self {
        Self {
            key,
            kind,
            user,
            handle: None,
            state: JobState::Pending,
            local_path: None,
            file: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Terminal classification of a job that did not complete
///
/// The `Display` impl is the user-facing terminal message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Outcome {
    #[error("❌ Operation cancelled")]
    Cancelled,
    #[error("❌ Download failed: {0}")]
    BackendFailure(String),
    #[error("❌ Download stalled: no progress for {0} checks")]
    Stalled(u32),
    #[error("❌ Download aborted: too many errors while checking its status")]
    TooManyErrors,
    #[error("❌ Download finished but the file could not be found")]
    DestinationMissing,
    #[error("❌ Upload failed: {0}")]
    UploadFailure(String),
    #[error("❌ Upload to cloud storage failed: {0}")]
    SyncProcessFailure(String),
}

impl Outcome {
    /// Registry state recorded for this outcome
    pub fn state(&self) -> JobState {
        match self {
            Self::Cancelled => JobState::Cancelled,
            Self::Stalled(_) => JobState::Stalled,
            _ => JobState::Failed,
        }
    }
}

/// Delete a job's local file, returning whether it was removed
///
/// A failure is logged as a local IO failure and never changes the job's
/// outcome. A file that is already gone counts as not removed.
pub async fn discard_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = ?path, "Deleted local file");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = ?path, "Local file already gone");
            false
        }
        Err(e) => {
            warn!(path = ?path, error = %e, "local-io-failure: could not delete file");
            false
        }
    }
}
