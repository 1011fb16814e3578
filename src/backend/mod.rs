//! Download backends
//!
//! A backend accepts URIs, hands back an opaque handle and answers status
//! queries for that handle until it is removed. The aria2 daemon is the bulk
//! downloader; yt-dlp is wrapped to expose the same surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};
use thiserror::Error;

pub mod aria2;
pub mod extractor;

pub use aria2::Aria2Backend;
pub use extractor::ExtractorBackend;

/// Where a submitted download should land
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub dir: PathBuf,
    /// Overrides the file name the backend would pick
    pub out: Option<String>,
}

impl SubmitOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            out: None,
        }
    }

    /// Name the downloaded file `out` instead of the backend's choice
    pub fn with_out(mut self, out: Option<String>) -> Self {
        self.out = out.filter(|name| !name.is_empty());
        self
    }
}

/// Backend-side state of a download
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemoteState {
    Active,
    #[default]
    Waiting,
    Paused,
    Error,
    Complete,
    Removed,
}

impl RemoteState {
    pub fn parse(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "paused" => Self::Paused,
            "error" => Self::Error,
            "complete" => Self::Complete,
            "removed" => Self::Removed,
            _ => Self::Waiting,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendStatus {
    pub state: RemoteState,
    pub completed: u64,
    /// Zero while the backend does not know the size yet
    pub total: u64,
    /// Bytes per second as reported by the backend
    pub speed: u64,
    pub error: Option<String>,
    pub files: Vec<PathBuf>,
}

impl BackendStatus {
    pub fn is_complete(&self) -> bool {
        self.state == RemoteState::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.state == RemoteState::Error
    }

    /// First produced file, if the backend reported one
    pub fn primary_file(&self) -> Option<&PathBuf> {
        self.files.iter().find(|p| !p.as_os_str().is_empty())
    }
}

/// Why a backend refused a new download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    AuthorizationDenied,
    MalformedRequest,
    Other,
}

impl SubmitRejection {
    /// Classify a backend error message
    pub fn classify(message: &str) -> Self {
        let message = message.to_lowercase();
        if message.contains("unauthorized")
            || message.contains("forbidden")
            || message.contains("secret")
        {
            Self::AuthorizationDenied
        } else if message.contains("no uri")
            || message.contains("invalid")
            || message.contains("malformed")
            || message.contains("unsupported url")
            || message.contains("parameter")
        {
            Self::MalformedRequest
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for SubmitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthorizationDenied => write!(f, "authorization denied"),
            Self::MalformedRequest => write!(f, "malformed request"),
            Self::Other => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("download {kind}: {message}")]
    Rejected {
        kind: SubmitRejection,
        message: String,
    },
    #[error("status query failed: {0}")]
    Query(String),
    #[error("unknown download handle {0}")]
    UnknownHandle(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Rejected {
            kind: SubmitRejection::classify(&message),
            message,
        }
    }
}

#[async_trait]
pub trait DownloadBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Start downloading `uris`, returning the backend's handle
    async fn add_uris(&self, uris: &[String], options: &SubmitOptions)
    -> Result<String, BackendError>;

    async fn tell_status(&self, handle: &str) -> Result<BackendStatus, BackendError>;

    /// Stop the download and drop it from the backend
    async fn remove(&self, handle: &str) -> Result<(), BackendError>;

    /// Drop the bookkeeping of a download that already finished
    async fn forget(&self, handle: &str) -> Result<(), BackendError> {
        let _ = handle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rejections() {
        assert_eq!(
            SubmitRejection::classify("Unauthorized"),
            SubmitRejection::AuthorizationDenied
        );
        assert_eq!(
            SubmitRejection::classify("No URI to download."),
            SubmitRejection::MalformedRequest
        );
        assert_eq!(
            SubmitRejection::classify("ERROR: Unsupported URL: https://x"),
            SubmitRejection::MalformedRequest
        );
        assert_eq!(
            SubmitRejection::classify("connection refused"),
            SubmitRejection::Other
        );
    }

    #[test]
    fn test_status_helpers() {
        let status = BackendStatus {
            state: RemoteState::Active,
            completed: 250,
            total: 1000,
            speed: 50,
            ..Default::default()
        };
        assert!(!status.is_complete());
        assert!(!status.is_failed());
        assert!(BackendStatus::default().primary_file().is_none());
        assert_eq!(RemoteState::parse("complete"), RemoteState::Complete);
        assert_eq!(RemoteState::parse("???"), RemoteState::Waiting);
    }
}
