//! Download orchestration
//!
//! [`DownloadCoordinator::submit`] registers a job, hands the URL to a
//! backend and spawns one poll task per job. The task owns the job until the
//! file is on disk and the destination buttons are shown, or until the job
//! reaches a terminal outcome.

use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use url::Url;

use crate::{
    backend::{BackendError, BackendStatus, DownloadBackend, RemoteState, SubmitOptions},
    callback::{cancel_keyboard, destination_keyboard},
    jobs::{
        BackendHandle, FileMeta, Job, JobError, JobKey, JobKind, JobRegistry, JobState, Outcome,
        UserId, discard_file,
    },
    progress::{DEFAULT_THROTTLE, DOWNLOAD_HEADING, FETCH_HEADING, ProgressReporter, format_size},
    transport::{ChatTransport, edit_best_effort},
};

const ACCEPTED_SCHEMES: [&str; 5] = ["http", "https", "ftp", "sftp", "magnet"];

/// Files a backend keeps next to an unfinished download: the aria2 control
/// file and yt-dlp's in-progress data
const SIDECAR_SUFFIXES: [&str; 2] = [".aria2", ".part"];

/// Timing knobs of the poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub poll_interval: Duration,
    pub throttle: Duration,
    /// Consecutive unchanged ticks before a download counts as stalled
    pub stall_ticks: u32,
    /// Consecutive failed status queries before giving up
    pub max_errors: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            throttle: DEFAULT_THROTTLE,
            stall_ticks: 30,
            max_errors: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("not a downloadable URL: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Registry(#[from] JobError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result of a poll task: the local file on success
pub type DownloadResult = Result<PathBuf, Outcome>;

fn validate_url(raw: &str) -> Result<Url, SubmitError> {
    let url = Url::parse(raw.trim()).map_err(|e| SubmitError::InvalidUrl(format!("{raw}: {e}")))?;
    if !ACCEPTED_SCHEMES.contains(&url.scheme()) {
        return Err(SubmitError::InvalidUrl(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    Ok(url)
}

/// Per-job counters, owned by the poll task
#[derive(Debug, Default)]
struct PollCounters {
    last_completed: Option<u64>,
    stalled: u32,
    errors: u32,
}

impl PollCounters {
    /// Record a successful observation, returning the stall count
    fn observe(&mut self, completed: u64) -> u32 {
        self.errors = 0;
        if self.last_completed == Some(completed) {
            self.stalled += 1;
        } else {
            self.stalled = 0;
            self.last_completed = Some(completed);
        }
        self.stalled
    }

    /// Record a successful observation of a queued or paused download
    ///
    /// Nothing is expected to move while the backend holds the job back, so
    /// the stall count starts over.
    fn idle(&mut self) {
        self.errors = 0;
        self.stalled = 0;
        self.last_completed = None;
    }

    /// Record a failed status query, returning the consecutive error count
    fn error(&mut self) -> u32 {
        self.errors += 1;
        self.errors
    }
}

#[derive(Clone)]
pub struct DownloadCoordinator {
    registry: JobRegistry,
    transport: Arc<dyn ChatTransport>,
    tuning: Tuning,
}

impl DownloadCoordinator {
    pub fn new(registry: JobRegistry, transport: Arc<dyn ChatTransport>, tuning: Tuning) -> Self {
        Self {
            registry,
            transport,
            tuning,
        }
    }

    /// Start downloading `url` and track it under `key`
    ///
    /// A rejected submission leaves no job behind.
    pub async fn submit(
        &self,
        backend: Arc<dyn DownloadBackend>,
        key: JobKey,
        user: UserId,
        url: &str,
        options: SubmitOptions,
    ) -> Result<JoinHandle<DownloadResult>, SubmitError> {
        let url = validate_url(url)?;
        self.registry
            .register(Job::new(key, JobKind::Download, user))?;

        let handle = match backend.add_uris(&[url.to_string()], &options).await {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.remove(&key);
                warn!(key = %key, backend = backend.name(), error = %e, "Download rejected");
                return Err(e.into());
            }
        };

        let cancel = self
            .registry
            .update(&key, |job| {
                job.handle = Some(BackendHandle::Download(handle.clone()));
                job.state = JobState::Running;
                job.cancel.clone()
            })
            .ok_or(JobError::NotFound(key))?;
        info!(key = %key, backend = backend.name(), handle = %handle, url = %url, "Download submitted");

        let task = PollTask {
            key,
            handle: handle.clone(),
            backend: backend.clone(),
            registry: self.registry.clone(),
            transport: self.transport.clone(),
            tuning: self.tuning,
            cancel,
            partial: None,
        };
        let span = info_span!("download_task", key = %key, backend = backend.name(), handle = %handle);
        Ok(tokio::spawn(task.run().instrument(span)))
    }

    /// Receive a file the user sent and offer it for upload
    pub fn ingest(
        &self,
        key: JobKey,
        user: UserId,
        file_id: String,
        meta: FileMeta,
        dir: PathBuf,
    ) -> Result<JoinHandle<DownloadResult>, SubmitError> {
        let mut job = Job::new(key, JobKind::Upload, user);
        job.state = JobState::Running;
        job.file = Some(meta.clone());
        let cancel = job.cancel.clone();
        self.registry.register(job)?;

        let registry = self.registry.clone();
        let transport = self.transport.clone();
        let span = info_span!("ingest_task", key = %key, file = %meta.name);
        Ok(tokio::spawn(
            async move {
                let target = key.target();
                let heading = format!("{FETCH_HEADING}: {}", meta.name);
                edit_best_effort(transport.as_ref(), target, &heading, Some(&cancel_keyboard(key)))
                    .await;

                if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                    warn!(dir = ?dir, error = %e, "Failed to create download directory");
                }
                let name = sanitize_file_name(&meta.name, &file_id);
                let dest = dir.join(&name);
                let fetched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Outcome::Cancelled),
                    fetched = transport.fetch_file(&file_id, &dest) => {
                        fetched.map_err(|e| Outcome::BackendFailure(e.to_string()))
                    }
                };

                let result = match fetched {
                    Ok(size) => offer_destinations(
                        &registry,
                        transport.as_ref(),
                        key,
                        dest.clone(),
                        FileMeta {
                            size: Some(size),
                            ..meta
                        },
                    )
                    .await,
                    Err(outcome) => Err(outcome),
                };
                if let Err(outcome) = &result {
                    finish(&registry, transport.as_ref(), key, outcome, Some(&dest)).await;
                }
                result
            }
            .instrument(span),
        ))
    }
}

/// Keep only the final path component of a user-supplied name
pub(crate) fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let name = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if name.is_empty() || name == "." || name == ".." {
        fallback.to_string()
    } else {
        name.to_string()
    }
}

/// Move a job whose file is complete to the destination choice
///
/// Fails with [`Outcome::Cancelled`] if the job was cancelled meanwhile.
async fn offer_destinations(
    registry: &JobRegistry,
    transport: &dyn ChatTransport,
    key: JobKey,
    path: PathBuf,
    meta: FileMeta,
) -> DownloadResult {
    let text = match meta.size {
        Some(size) => format!(
            "✅ Ready: {} ({})\nChoose where to upload it:",
            meta.name,
            format_size(size)
        ),
        None => format!("✅ Ready: {}\nChoose where to upload it:", meta.name),
    };
    let moved = registry.update(&key, |job| {
        if job.is_cancelled() {
            return false;
        }
        job.state = JobState::AwaitingUpload;
        job.local_path = Some(path.clone());
        job.file = Some(meta);
        true
    });
    if moved != Some(true) {
        return Err(Outcome::Cancelled);
    }
    info!(key = %key, path = ?path, "File ready for upload");
    edit_best_effort(transport, key.target(), &text, Some(&destination_keyboard(key))).await;
    Ok(path)
}

/// Report a terminal outcome once and drop the job
async fn finish(
    registry: &JobRegistry,
    transport: &dyn ChatTransport,
    key: JobKey,
    outcome: &Outcome,
    partial: Option<&PathBuf>,
) {
    match outcome {
        Outcome::Cancelled => info!(key = %key, "Job cancelled"),
        _ => warn!(key = %key, outcome = %outcome, "Job failed"),
    }
    if let Some(path) = partial {
        discard_file(path).await;
    }
    registry.update(&key, |job| job.state = outcome.state());
    edit_best_effort(transport, key.target(), &outcome.to_string(), None).await;
    registry.remove(&key);
}

struct PollTask {
    key: JobKey,
    handle: String,
    backend: Arc<dyn DownloadBackend>,
    registry: JobRegistry,
    transport: Arc<dyn ChatTransport>,
    tuning: Tuning,
    cancel: CancellationToken,
    /// File the backend reported, deleted if the job does not complete
    partial: Option<PathBuf>,
}

impl PollTask {
    async fn run(mut self) -> DownloadResult {
        let result = self.poll().await;
        if let Err(outcome) = &result {
            if let Some(partial) = &self.partial {
                for sidecar in SIDECAR_SUFFIXES {
                    let mut path = partial.clone().into_os_string();
                    path.push(sidecar);
                    discard_file(&PathBuf::from(path)).await;
                }
            }
            finish(
                &self.registry,
                self.transport.as_ref(),
                self.key,
                outcome,
                self.partial.as_ref(),
            )
            .await;
        }
        result
    }

    async fn poll(&mut self) -> DownloadResult {
        let mut ticker = interval(self.tuning.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut counters = PollCounters::default();
        let mut reporter = ProgressReporter::new(DOWNLOAD_HEADING, self.tuning.throttle);

        loop {
            ticker.tick().await;

            if self.cancel.is_cancelled() {
                if self.partial.is_none() {
                    // Learn what to delete before the backend forgets the job
                    if let Ok(status) = self.backend.tell_status(&self.handle).await {
                        self.note_file(&status);
                    }
                }
                self.remove_from_backend().await;
                return Err(Outcome::Cancelled);
            }

            let result = self.backend.tell_status(&self.handle).await;
            if self.cancel.is_cancelled() {
                // The next tick reports the cancellation, the file is still
                // needed for cleanup
                if let Ok(status) = &result {
                    self.note_file(status);
                }
                debug!("Discarding status that arrived after cancellation");
                continue;
            }

            let status = match result {
                Ok(status) => status,
                Err(e) => {
                    let errors = counters.error();
                    warn!(error = %e, errors, "Status query failed");
                    if errors >= self.tuning.max_errors {
                        self.remove_from_backend().await;
                        return Err(Outcome::TooManyErrors);
                    }
                    continue;
                }
            };

            trace!(
                state = ?status.state,
                completed = status.completed,
                total = status.total,
                speed = status.speed,
                "Polled status"
            );
            self.note_file(&status);

            if status.is_complete() {
                return self.complete(&status).await;
            }
            if status.is_failed() {
                self.forget_on_backend().await;
                return Err(Outcome::BackendFailure(
                    status
                        .error
                        .unwrap_or_else(|| "the downloader reported an error".to_string()),
                ));
            }
            if status.state == RemoteState::Removed {
                return Err(Outcome::BackendFailure(
                    "the download was removed from the downloader".to_string(),
                ));
            }

            if status.state != RemoteState::Active {
                counters.idle();
                continue;
            }

            let stalled = counters.observe(status.completed);
            if stalled >= self.tuning.stall_ticks {
                self.remove_from_backend().await;
                return Err(Outcome::Stalled(stalled));
            }
            if stalled > 0 {
                debug!(stalled, completed = status.completed, "No progress this tick");
            }

            let total = (status.total > 0).then_some(status.total);
            if let Some(text) = reporter.offer(Instant::now(), status.completed, total) {
                edit_best_effort(
                    self.transport.as_ref(),
                    self.key.target(),
                    &text,
                    Some(&cancel_keyboard(self.key)),
                )
                .await;
            }
        }
    }

    fn note_file(&mut self, status: &BackendStatus) {
        if let Some(file) = status.primary_file() {
            self.partial = Some(file.clone());
        }
    }

    async fn complete(&mut self, status: &BackendStatus) -> DownloadResult {
        self.forget_on_backend().await;
        let Some(path) = status.primary_file().cloned() else {
            warn!("Download completed without a reported file");
            return Err(Outcome::DestinationMissing);
        };
        let size = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            Ok(_) => {
                warn!(path = ?path, "Download result is not a regular file");
                return Err(Outcome::DestinationMissing);
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Downloaded file not found");
                return Err(Outcome::DestinationMissing);
            }
        };

        let meta = FileMeta::from_path(&path, Some(size));
        match offer_destinations(
            &self.registry,
            self.transport.as_ref(),
            self.key,
            path,
            meta,
        )
        .await
        {
            Ok(path) => {
                self.partial = None;
                Ok(path)
            }
            Err(outcome) => Err(outcome),
        }
    }

    async fn remove_from_backend(&self) {
        match self.backend.remove(&self.handle).await {
            Ok(()) => debug!("Removed download from backend"),
            Err(e) => error!(error = %e, "Failed to remove download from backend"),
        }
    }

    async fn forget_on_backend(&self) {
        if let Err(e) = self.backend.forget(&self.handle).await {
            debug!(error = %e, "Failed to drop finished download from backend");
        }
    }
}
