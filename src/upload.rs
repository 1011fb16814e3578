//! Upload orchestration
//!
//! A file waiting for a destination is claimed by exactly one upload through
//! a compare-and-set on its state. The chat path tries the media-specific
//! send first and falls back to a plain document once. The cloud path runs
//! `rclone copy` and relays its progress lines.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    callback::{cancel_keyboard, destination_keyboard},
    jobs::{
        BackendHandle, FileMeta, Job, JobError, JobKey, JobRegistry, JobState, MediaKind, Outcome,
        discard_file,
    },
    progress::{ProgressReporter, UPLOAD_HEADING, format_size},
    remote::NavigationState,
    sync::{Rclone, clean_line, is_progress_line},
    transport::{ChatError, ChatTransport, Transfer, edit_best_effort},
    user_config::{ConfigError, ConfigStore},
};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no job found for {0}")]
    NotFound(JobKey),
    #[error("job {key} is already {state}")]
    Busy { key: JobKey, state: JobState },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Outcome(#[from] Outcome),
}

impl From<JobError> for UploadError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::WrongState { key, actual, .. } => Self::Busy { key, state: actual },
            JobError::NotFound(key) | JobError::DuplicateKey(key) => Self::NotFound(key),
        }
    }
}

enum SendFailure {
    Cancelled,
    Chat(ChatError),
}

#[derive(Clone)]
pub struct UploadCoordinator {
    registry: JobRegistry,
    transport: Arc<dyn ChatTransport>,
    rclone: Rclone,
    configs: ConfigStore,
    throttle: Duration,
    upload_limit: Option<u64>,
}

impl UploadCoordinator {
    pub fn new(
        registry: JobRegistry,
        transport: Arc<dyn ChatTransport>,
        rclone: Rclone,
        configs: ConfigStore,
        throttle: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            rclone,
            configs,
            throttle,
            upload_limit: None,
        }
    }

    /// Refuse chat uploads of files larger than `limit` bytes
    pub fn with_upload_limit(mut self, limit: Option<u64>) -> Self {
        self.upload_limit = limit;
        self
    }

    /// Take ownership of a job that is waiting for a destination
    fn claim(&self, key: JobKey) -> Result<(Job, PathBuf), UploadError> {
        let job = self
            .registry
            .transition(&key, JobState::AwaitingUpload, JobState::Uploading)?;
        match job.local_path.clone() {
            Some(path) => Ok((job, path)),
            None => {
                warn!(key = %key, "Job awaiting upload has no local file");
                self.registry
                    .transition(&key, JobState::Uploading, JobState::AwaitingUpload)?;
                Err(UploadError::NotFound(key))
            }
        }
    }

    /// Cancel a job in whatever phase it is
    ///
    /// A job waiting for a destination has no task to observe the flag, so it
    /// is cleaned up here. Returns whether a job existed.
    pub async fn cancel(&self, key: JobKey) -> bool {
        if !self.registry.request_cancel(&key) {
            return false;
        }
        if let Ok(job) = self
            .registry
            .transition(&key, JobState::AwaitingUpload, JobState::Cancelled)
        {
            self.conclude(&job, job.local_path.as_deref(), Err(Outcome::Cancelled))
                .await;
        }
        true
    }

    /// Delete the file, report the result once and drop the job
    async fn conclude(&self, job: &Job, path: Option<&Path>, result: Result<String, Outcome>) {
        if let Some(path) = path {
            discard_file(path).await;
        }
        let text = match &result {
            Ok(text) => {
                info!(key = %job.key, "Upload finished");
                self.registry
                    .update(&job.key, |job| job.state = JobState::Completed);
                text.clone()
            }
            Err(outcome) => {
                match outcome {
                    Outcome::Cancelled => info!(key = %job.key, "Upload cancelled"),
                    _ => warn!(key = %job.key, outcome = %outcome, "Upload failed"),
                }
                self.registry
                    .update(&job.key, |job| job.state = outcome.state());
                outcome.to_string()
            }
        };
        edit_best_effort(self.transport.as_ref(), job.key.target(), &text, None).await;
        self.registry.remove(&job.key);
    }

    /// Send the job's file into its chat
    ///
    /// If both the media-specific and the document send fail, the job goes
    /// back to waiting for a destination so the user can retry.
    pub async fn upload_to_chat(&self, key: JobKey) -> Result<(), UploadError> {
        let (job, path) = self.claim(key)?;
        let span = info_span!("chat_upload", key = %key, path = ?path);
        self.send_to_chat(job, path).instrument(span).await
    }

    async fn send_to_chat(&self, job: Job, path: PathBuf) -> Result<(), UploadError> {
        let meta = job
            .file
            .clone()
            .unwrap_or_else(|| FileMeta::from_path(&path, None));
        let kind = meta.media_kind();
        let mut attempts = vec![kind];
        if kind != MediaKind::Generic {
            attempts.push(MediaKind::Generic);
        }

        let mut last_error = String::new();
        if let Some(limit) = self.upload_limit {
            let size = match meta.size {
                Some(size) => size,
                None => tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0),
            };
            if size > limit {
                last_error = format!(
                    "{} is over the {} chat upload limit",
                    format_size(size),
                    format_size(limit)
                );
                attempts.clear();
            }
        }

        let mut reporter = ProgressReporter::new(UPLOAD_HEADING, self.throttle);
        for kind in attempts {
            match self.send_with_progress(&job, &path, kind, &mut reporter).await {
                Ok(()) => {
                    let text = format!("✅ Sent {}", meta.name);
                    self.conclude(&job, Some(path.as_path()), Ok(text)).await;
                    return Ok(());
                }
                Err(SendFailure::Cancelled) => {
                    self.conclude(&job, Some(path.as_path()), Err(Outcome::Cancelled)).await;
                    return Err(Outcome::Cancelled.into());
                }
                Err(SendFailure::Chat(e)) => {
                    warn!(kind = %kind, error = %e, "Chat upload attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        let outcome = Outcome::UploadFailure(last_error);
        let reverted = self.registry.update(&job.key, |job| {
            if job.is_cancelled() || job.state != JobState::Uploading {
                return false;
            }
            job.state = JobState::AwaitingUpload;
            true
        });
        if reverted != Some(true) {
            self.conclude(&job, Some(path.as_path()), Err(Outcome::Cancelled)).await;
            return Err(Outcome::Cancelled.into());
        }
        warn!(key = %job.key, outcome = %outcome, "Chat upload gave up, file kept");
        let text = format!("{outcome}\nChoose where to upload it:");
        edit_best_effort(
            self.transport.as_ref(),
            job.key.target(),
            &text,
            Some(&destination_keyboard(job.key)),
        )
        .await;
        Err(outcome.into())
    }

    async fn send_with_progress(
        &self,
        job: &Job,
        path: &Path,
        kind: MediaKind,
        reporter: &mut ProgressReporter,
    ) -> Result<(), SendFailure> {
        if job.is_cancelled() {
            return Err(SendFailure::Cancelled);
        }
        debug!(kind = %kind, "Sending file to chat");
        let (tx, mut rx) = watch::channel(Transfer::default());
        let send = self.transport.send_media(job.key.chat, kind, path, tx);
        tokio::pin!(send);
        let mut progress_open = true;

        loop {
            tokio::select! {
                biased;
                _ = job.cancel.cancelled() => return Err(SendFailure::Cancelled),
                result = &mut send => return result.map_err(SendFailure::Chat),
                changed = rx.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                        continue;
                    }
                    let transfer = *rx.borrow_and_update();
                    let total = (transfer.total > 0).then_some(transfer.total);
                    if let Some(text) = reporter.offer(Instant::now(), transfer.sent, total) {
                        edit_best_effort(
                            self.transport.as_ref(),
                            job.key.target(),
                            &text,
                            Some(&cancel_keyboard(job.key)),
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Copy the job's file into `at` on one of the user's remotes
    ///
    /// The local file is deleted and the job dropped however the copy ends.
    pub async fn upload_to_remote(
        &self,
        key: JobKey,
        at: &NavigationState,
    ) -> Result<(), UploadError> {
        let user = self
            .registry
            .get(&key)
            .ok_or(UploadError::NotFound(key))?
            .user;
        let config = self.configs.config_path(user).await?;
        let (job, path) = self.claim(key)?;

        let span = info_span!("remote_upload", key = %key, destination = %at);
        let result = self
            .copy_to_remote(&job, &config, &path, at)
            .instrument(span)
            .await;
        let outcome = result.clone().err();
        self.conclude(&job, Some(path.as_path()), result).await;
        match outcome {
            Some(outcome) => Err(outcome.into()),
            None => Ok(()),
        }
    }

    async fn copy_to_remote(
        &self,
        job: &Job,
        config: &Path,
        path: &Path,
        at: &NavigationState,
    ) -> Result<String, Outcome> {
        if job.is_cancelled() {
            return Err(Outcome::Cancelled);
        }
        let mut process = self
            .rclone
            .spawn_copy(config, path, &at.remote, &at.path)
            .map_err(|e| Outcome::SyncProcessFailure(e.to_string()))?;
        if let Some(pid) = process.id() {
            self.registry.update(&job.key, |job| {
                job.handle = Some(BackendHandle::Process(pid));
            });
        }

        let heading = format!("☁️ Uploading to {at}");
        let mut reporter = ProgressReporter::new(heading.clone(), self.throttle);
        let mut last_line: Option<String> = None;

        let cancelled = loop {
            tokio::select! {
                biased;
                _ = job.cancel.cancelled() => break true,
                line = process.next_line() => match line {
                    Some(line) => {
                        let line = clean_line(&line);
                        if is_progress_line(&line) {
                            let text = format!("{heading}:\n{line}");
                            if let Some(text) = reporter.offer_text(Instant::now(), text) {
                                edit_best_effort(
                                    self.transport.as_ref(),
                                    job.key.target(),
                                    &text,
                                    Some(&cancel_keyboard(job.key)),
                                )
                                .await;
                            }
                        } else if !line.is_empty() {
                            debug!(line = %line, "rclone output");
                            last_line = Some(line);
                        }
                    }
                    None => break false,
                }
            }
        };

        let status = if cancelled {
            None
        } else {
            tokio::select! {
                biased;
                _ = job.cancel.cancelled() => None,
                status = process.wait() => Some(status),
            }
        };
        let Some(status) = status else {
            process.terminate().await;
            return Err(Outcome::Cancelled);
        };

        match status {
            Ok(status) if status.success() => Ok(format!("✅ Uploaded to {at}")),
            Ok(status) => {
                let detail = last_line.unwrap_or_default();
                Err(Outcome::SyncProcessFailure(
                    format!("rclone exited with {status} {detail}")
                        .trim_end()
                        .to_string(),
                ))
            }
            Err(e) => Err(Outcome::SyncProcessFailure(e.to_string())),
        }
    }
}
