//! yt-dlp behind the download backend surface
//!
//! Each submitted URL runs as its own `yt-dlp --newline` child. A watcher
//! task reads the merged output and folds it into a [`BackendStatus`] that
//! `tell_status` hands out, so the coordinator polls it exactly like aria2.

use async_trait::async_trait;
use bytesize::ByteSize;
use regex::Regex;
use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, LazyLock, Mutex, PoisonError},
};
use tokio::{
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, info, instrument, span, warn};
use ulid::Ulid;

use super::{BackendError, BackendStatus, DownloadBackend, RemoteState, SubmitOptions};
use crate::sync::forward_lines;

const DEFAULT_TEMPLATE: &str = "%(title)s.%(ext)s";

static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[download\]\s+(?P<pct>\d+(?:\.\d+)?)%\s+of\s+~?\s*(?P<total>[\d.]+\s*[KMGTP]?i?B)(?:\s+at\s+(?P<speed>[\d.]+\s*[KMGTP]?i?B)/s)?",
    )
    .expect("valid regex")
});
static DESTINATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[(?:download|ExtractAudio)\] Destination: (?P<path>.+)$"#).expect("valid regex")
});
static MERGED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[Merger\] Merging formats into "(?P<path>.+)"$"#).expect("valid regex")
});
static ALREADY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\] (?P<path>.+) has already been downloaded").expect("valid regex")
});

/// What one output line of yt-dlp tells us
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExtractorLine {
    Progress {
        percent: f64,
        total: Option<u64>,
        speed: Option<u64>,
    },
    Destination(PathBuf),
    Error(String),
    Other,
}

fn parse_size(text: &str) -> Option<u64> {
    text.trim().parse::<ByteSize>().ok().map(|size| size.as_u64())
}

pub(crate) fn parse_line(line: &str) -> ExtractorLine {
    let line = line.trim();
    if let Some(message) = line.strip_prefix("ERROR:") {
        return ExtractorLine::Error(message.trim().to_string());
    }
    if let Some(caps) = PROGRESS.captures(line) {
        return ExtractorLine::Progress {
            percent: caps["pct"].parse().unwrap_or(0.0),
            total: parse_size(&caps["total"]),
            speed: caps.name("speed").and_then(|m| parse_size(m.as_str())),
        };
    }
    for pattern in [&*MERGED, &*DESTINATION, &*ALREADY] {
        if let Some(caps) = pattern.captures(line) {
            return ExtractorLine::Destination(PathBuf::from(&caps["path"]));
        }
    }
    ExtractorLine::Other
}

/// Folds output lines into a status
#[derive(Debug, Default)]
struct StatusTracker {
    status: BackendStatus,
    destination: Option<PathBuf>,
    last_error: Option<String>,
}

impl StatusTracker {
    fn apply(&mut self, line: ExtractorLine) {
        match line {
            ExtractorLine::Progress {
                percent,
                total,
                speed,
            } => {
                self.status.state = RemoteState::Active;
                if let Some(total) = total {
                    self.status.total = total;
                    self.status.completed = (total as f64 * percent / 100.0) as u64;
                }
                self.status.speed = speed.unwrap_or(0);
            }
            ExtractorLine::Destination(path) => {
                self.destination = Some(path.clone());
                self.status.files = vec![path];
            }
            ExtractorLine::Error(message) => self.last_error = Some(message),
            ExtractorLine::Other => {}
        }
    }

    fn finish(&mut self, success: bool, exit: &str) {
        self.status.speed = 0;
        if success {
            self.status.state = RemoteState::Complete;
            self.status.completed = self.status.total;
        } else {
            self.status.state = RemoteState::Error;
            self.status.error = Some(
                self.last_error
                    .clone()
                    .unwrap_or_else(|| format!("yt-dlp exited with {exit}")),
            );
        }
    }
}

struct ExtractorJob {
    status: Arc<Mutex<StatusTracker>>,
    stop: CancellationToken,
    watcher: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ExtractorBackend {
    binary: PathBuf,
    jobs: Arc<Mutex<HashMap<String, ExtractorJob>>>,
}

impl std::fmt::Debug for ExtractorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorBackend")
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

impl Default for ExtractorBackend {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl ExtractorBackend {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            jobs: Arc::default(),
        }
    }

    fn spawn(&self, url: &str, options: &SubmitOptions) -> Result<Child, BackendError> {
        let template = match options.out.as_deref() {
            // yt-dlp picks the extension after format selection
            Some(name) if !name.contains('.') => format!("{name}.%(ext)s"),
            Some(name) => name.to_string(),
            None => DEFAULT_TEMPLATE.to_string(),
        };
        Command::new(&self.binary)
            .arg("--newline")
            .arg("--no-playlist")
            .arg("-P")
            .arg(&options.dir)
            .arg("-o")
            .arg(&template)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::rejected(format!("failed to start yt-dlp: {e}")))
    }
}

async fn watch_child(mut child: Child, status: Arc<Mutex<StatusTracker>>, stop: CancellationToken) {
    let (tx, mut lines) = mpsc::channel(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx));
    }

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "yt-dlp already exited");
                }
                let _ = child.wait().await;
                status.lock().unwrap_or_else(PoisonError::into_inner).status.state =
                    RemoteState::Removed;
                debug!("yt-dlp stopped");
                return;
            }
            line = lines.recv() => match line {
                Some(line) => {
                    let parsed = parse_line(&line);
                    status.lock().unwrap_or_else(PoisonError::into_inner).apply(parsed);
                }
                None => break,
            }
        }
    }

    let exit = child.wait().await;
    let mut tracker = status.lock().unwrap_or_else(PoisonError::into_inner);
    match exit {
        Ok(code) => {
            tracker.finish(code.success(), &code.to_string());
            info!(status = %code, destination = ?tracker.destination, "yt-dlp finished");
        }
        Err(e) => {
            warn!(error = %e, "Failed to reap yt-dlp");
            tracker.finish(false, &e.to_string());
        }
    }
}

#[async_trait]
impl DownloadBackend for ExtractorBackend {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    #[instrument(level = "debug", skip(self))]
    async fn add_uris(
        &self,
        uris: &[String],
        options: &SubmitOptions,
    ) -> Result<String, BackendError> {
        let url = match uris {
            [url] => url,
            [] => return Err(BackendError::rejected("no URI to download")),
            _ => return Err(BackendError::rejected("invalid parameter: one URL per job")),
        };
        tokio::fs::create_dir_all(&options.dir).await?;
        let child = self.spawn(url, options)?;

        let handle = Ulid::new().to_string();
        let status = Arc::new(Mutex::new(StatusTracker::default()));
        let stop = CancellationToken::new();
        let span = span!(Level::DEBUG, "extractor", handle = %handle, pid = ?child.id());
        let watcher = tokio::spawn(watch_child(child, status.clone(), stop.clone()).instrument(span));

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                handle.clone(),
                ExtractorJob {
                    status,
                    stop,
                    watcher,
                },
            );
        info!(handle = %handle, url = %url, "Started yt-dlp");
        Ok(handle)
    }

    async fn tell_status(&self, handle: &str) -> Result<BackendStatus, BackendError> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .get(handle)
            .ok_or_else(|| BackendError::UnknownHandle(handle.to_string()))?;
        let status = job
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
            .clone();
        Ok(status)
    }

    #[instrument(level = "debug", skip(self))]
    async fn remove(&self, handle: &str) -> Result<(), BackendError> {
        let job = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle)
            .ok_or_else(|| BackendError::UnknownHandle(handle.to_string()))?;
        job.stop.cancel();
        if let Err(e) = job.watcher.await {
            warn!(handle = %handle, error = %e, "yt-dlp watcher panicked");
        }
        Ok(())
    }

    async fn forget(&self, handle: &str) -> Result<(), BackendError> {
        // The child has exited, so stopping it again is a no-op
        self.remove(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        let line = "[download]  42.0% of ~ 10.00MiB at  1.50MiB/s ETA 00:05 (frag 3/10)";
        assert_eq!(
            parse_line(line),
            ExtractorLine::Progress {
                percent: 42.0,
                total: Some(10 * 1024 * 1024),
                speed: Some(1024 * 1024 * 3 / 2),
            }
        );

        let line = "[download] 100% of 512.00KiB in 00:00:01";
        assert!(matches!(
            parse_line(line),
            ExtractorLine::Progress {
                total: Some(524288),
                speed: None,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_destinations_and_errors() {
        assert_eq!(
            parse_line("[download] Destination: Downloads/clip.f137.mp4"),
            ExtractorLine::Destination("Downloads/clip.f137.mp4".into())
        );
        assert_eq!(
            parse_line(r#"[Merger] Merging formats into "Downloads/clip.mp4""#),
            ExtractorLine::Destination("Downloads/clip.mp4".into())
        );
        assert_eq!(
            parse_line("[download] Downloads/clip.mp4 has already been downloaded"),
            ExtractorLine::Destination("Downloads/clip.mp4".into())
        );
        assert_eq!(
            parse_line("ERROR: Unsupported URL: https://example.com"),
            ExtractorLine::Error("Unsupported URL: https://example.com".into())
        );
        assert_eq!(parse_line("[youtube] abc: Downloading webpage"), ExtractorLine::Other);
    }

    #[test]
    fn test_tracker_keeps_last_destination() {
        let mut tracker = StatusTracker::default();
        for line in [
            "[download] Destination: d/clip.f137.mp4",
            "[download]  50.0% of 2.00MiB at 1.00MiB/s ETA 00:01",
            "[Merger] Merging formats into \"d/clip.mp4\"",
        ] {
            tracker.apply(parse_line(line));
        }
        assert_eq!(tracker.status.completed, 1024 * 1024);
        tracker.finish(true, "exit status: 0");
        assert!(tracker.status.is_complete());
        assert_eq!(tracker.status.completed, tracker.status.total);
        assert_eq!(tracker.status.primary_file(), Some(&PathBuf::from("d/clip.mp4")));
    }

    #[test]
    fn test_tracker_failure_uses_last_error() {
        let mut tracker = StatusTracker::default();
        tracker.apply(parse_line("ERROR: Video unavailable"));
        tracker.finish(false, "exit status: 1");
        assert!(tracker.status.is_failed());
        assert_eq!(tracker.status.error.as_deref(), Some("Video unavailable"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_child_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let script = crate::testing::write_script(
            dir.path(),
            "yt-dlp",
            r#"echo "[download] Destination: $4/clip.mp4"
echo "[download] 100% of 1.00KiB"
"#,
        );
        let backend = ExtractorBackend::new(script);
        let out = dir.path().join("out");
        let handle = backend
            .add_uris(&["https://example.com/v".into()], &SubmitOptions::new(&out))
            .await
            .unwrap();

        let status = loop {
            let status = backend.tell_status(&handle).await.unwrap();
            if status.is_complete() || status.is_failed() {
                break status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        assert!(status.is_complete());
        assert_eq!(status.total, 1024);
        assert_eq!(status.primary_file(), Some(&out.join("clip.mp4")));

        backend.forget(&handle).await.unwrap();
        assert!(matches!(
            backend.tell_status(&handle).await,
            Err(BackendError::UnknownHandle(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_name_reaches_template() {
        let dir = tempfile::tempdir().unwrap();
        let script = crate::testing::write_script(
            dir.path(),
            "yt-dlp",
            r#"echo "[download] Destination: $4/$6"
"#,
        );
        let backend = ExtractorBackend::new(script);
        let out = dir.path().join("out");
        let options = SubmitOptions::new(&out).with_out(Some("talk".into()));
        let handle = backend
            .add_uris(&["https://example.com/v".into()], &options)
            .await
            .unwrap();

        let status = loop {
            let status = backend.tell_status(&handle).await.unwrap();
            if status.is_complete() || status.is_failed() {
                break status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        assert_eq!(status.primary_file(), Some(&out.join("talk.%(ext)s")));
    }
}
