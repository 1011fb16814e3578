//! Fakes shared by the unit tests

use async_trait::async_trait;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicI32, AtomicUsize, Ordering},
    },
};
use tokio::sync::{Notify, watch};

use crate::{
    backend::{BackendError, BackendStatus, DownloadBackend, RemoteState, SubmitOptions},
    jobs::MediaKind,
    transport::{ChatError, ChatId, ChatTarget, ChatTransport, Keyboard, MessageId, Transfer},
};

/// Write an executable shell script into `dir`
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[derive(Debug, Clone)]
pub struct Edit {
    pub target: ChatTarget,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

#[derive(Debug, Default)]
struct TransportLog {
    not_modified: bool,
    failing_kinds: Vec<MediaKind>,
    fetch_body: Vec<u8>,
    sent: Vec<(ChatId, String)>,
    edits: Vec<Edit>,
    media: Vec<(MediaKind, PathBuf)>,
    answered: Vec<String>,
}

/// Chat transport that records everything and never touches the network
#[derive(Debug)]
pub struct RecordingTransport {
    log: Mutex<TransportLog>,
    next_message: AtomicI32,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            log: Mutex::default(),
            next_message: AtomicI32::new(100),
        }
    }
}

impl RecordingTransport {
    pub fn fail_edits_with_not_modified(&self, fail: bool) {
        self.log.lock().unwrap().not_modified = fail;
    }

    pub fn fail_media(&self, kind: MediaKind) {
        self.log.lock().unwrap().failing_kinds.push(kind);
    }

    pub fn set_fetch_body(&self, body: &[u8]) {
        self.log.lock().unwrap().fetch_body = body.to_vec();
    }

    pub fn edits_for(&self, target: ChatTarget) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .edits
            .iter()
            .filter(|e| e.target == target)
            .map(|e| e.text.clone())
            .collect()
    }

    pub fn last_edit(&self, target: ChatTarget) -> Option<Edit> {
        self.log
            .lock()
            .unwrap()
            .edits
            .iter()
            .rev()
            .find(|e| e.target == target)
            .cloned()
    }

    pub fn sent_texts(&self, chat: ChatId) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(c, _)| *c == chat)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn media_attempts(&self) -> Vec<MediaKind> {
        self.log.lock().unwrap().media.iter().map(|(k, _)| *k).collect()
    }

    pub fn answered(&self) -> Vec<String> {
        self.log.lock().unwrap().answered.clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<MessageId, ChatError> {
        self.log.lock().unwrap().sent.push((chat, text.to_string()));
        Ok(self.next_message.fetch_add(1, Ordering::SeqCst))
    }

    async fn edit_text(
        &self,
        target: ChatTarget,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), ChatError> {
        let mut log = self.log.lock().unwrap();
        if log.not_modified {
            return Err(ChatError::NotModified);
        }
        log.edits.push(Edit {
            target,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        Ok(())
    }

    async fn send_media(
        &self,
        _chat: ChatId,
        kind: MediaKind,
        path: &Path,
        progress: watch::Sender<Transfer>,
    ) -> Result<(), ChatError> {
        let failing = {
            let mut log = self.log.lock().unwrap();
            log.media.push((kind, path.to_path_buf()));
            log.failing_kinds.contains(&kind)
        };
        if failing {
            return Err(ChatError::Api {
                code: 400,
                description: format!("Bad Request: wrong file type for {kind}"),
            });
        }
        let total = tokio::fs::metadata(path).await?.len();
        progress.send_replace(Transfer {
            sent: total / 2,
            total,
        });
        tokio::task::yield_now().await;
        progress.send_replace(Transfer { sent: total, total });
        Ok(())
    }

    async fn fetch_file(&self, _file_id: &str, dest: &Path) -> Result<u64, ChatError> {
        let body = self.log.lock().unwrap().fetch_body.clone();
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), ChatError> {
        self.log.lock().unwrap().answered.push(callback_id.to_string());
        Ok(())
    }
}

pub fn active(completed: u64, total: u64) -> BackendStatus {
    BackendStatus {
        state: RemoteState::Active,
        completed,
        total,
        ..Default::default()
    }
}

/// An active download that already reported its file
pub fn partial(path: &Path, completed: u64, total: u64) -> BackendStatus {
    BackendStatus {
        files: vec![path.to_path_buf()],
        ..active(completed, total)
    }
}

pub fn complete(path: &Path, total: u64) -> BackendStatus {
    BackendStatus {
        state: RemoteState::Complete,
        completed: total,
        total,
        files: vec![path.to_path_buf()],
        ..Default::default()
    }
}

/// Scripted download backend
///
/// `tell_status` pops the next scripted answer and keeps repeating the last
/// status once the script runs out.
#[derive(Debug, Default)]
pub struct FakeBackend {
    script: Mutex<VecDeque<Result<BackendStatus, String>>>,
    last: Mutex<Option<BackendStatus>>,
    reject: Mutex<Option<String>>,
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    submitted: Mutex<Vec<(Vec<String>, Option<String>)>>,
    adds: AtomicUsize,
    tells: AtomicUsize,
    removes: AtomicUsize,
    forgets: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, status: BackendStatus) {
        self.script.lock().unwrap().push_back(Ok(status));
    }

    pub fn push_error(&self, message: &str) {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn reject_with(&self, message: &str) {
        *self.reject.lock().unwrap() = Some(message.to_string());
    }

    /// Hold the next `tell_status` call until `release` is notified
    ///
    /// Returns `(entered, release)`.
    pub fn gate_next_query(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    /// Uris and output names passed to `add_uris`, oldest first
    pub fn submitted(&self) -> Vec<(Vec<String>, Option<String>)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn tells(&self) -> usize {
        self.tells.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn forgets(&self) -> usize {
        self.forgets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownloadBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn add_uris(
        &self,
        uris: &[String],
        options: &SubmitOptions,
    ) -> Result<String, BackendError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.submitted
            .lock()
            .unwrap()
            .push((uris.to_vec(), options.out.clone()));
        if let Some(message) = self.reject.lock().unwrap().clone() {
            return Err(BackendError::rejected(message));
        }
        Ok("gid-1".to_string())
    }

    async fn tell_status(&self, _handle: &str) -> Result<BackendStatus, BackendError> {
        self.tells.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(status)) => {
                *self.last.lock().unwrap() = Some(status.clone());
                Ok(status)
            }
            Some(Err(message)) => Err(BackendError::Query(message)),
            None => Ok(self.last.lock().unwrap().clone().unwrap_or_default()),
        }
    }

    async fn remove(&self, _handle: &str) -> Result<(), BackendError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn forget(&self, _handle: &str) -> Result<(), BackendError> {
        self.forgets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
