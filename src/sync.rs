//! rclone invocations
//!
//! `copy` runs as a long-lived child whose merged stdout/stderr is read line by
//! line; `lsf` runs to completion and its output is returned. Progress lines
//! are display-only: the only decision taken on their content is whether they
//! carry the transfer marker.

use regex::Regex;
use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::LazyLock,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::mpsc,
};
use tracing::{debug, info, instrument, trace, warn};

/// Marker that identifies a transfer-progress line
pub const PROGRESS_MARKER: &str = "Transferred:";

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("rclone {command} exited with {status}: {stderr}")]
    Failed {
        command: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn is_progress_line(line: &str) -> bool {
    line.contains(PROGRESS_MARKER)
}

/// Strip terminal control sequences so a line can be shown in a chat
pub fn clean_line(line: &str) -> String {
    ANSI_ESCAPE
        .replace_all(line, "")
        .trim_matches(|c: char| c.is_control() || c.is_whitespace())
        .to_string()
}

/// `remote:path` argument
pub fn remote_spec(remote: &str, path: &str) -> String {
    format!("{remote}:{path}")
}

#[derive(Debug, Clone)]
pub struct Rclone {
    binary: PathBuf,
}

impl Default for Rclone {
    fn default() -> Self {
        Self::new("rclone")
    }
}

impl Rclone {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    fn spawn_error(&self, source: std::io::Error) -> SyncError {
        SyncError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        }
    }

    /// Start copying `source` into `remote:path`
    #[instrument(level = "debug", skip(self, config))]
    pub fn spawn_copy(
        &self,
        config: &Path,
        source: &Path,
        remote: &str,
        path: &str,
    ) -> Result<CopyProcess, SyncError> {
        let mut command = self.command();
        command
            .arg("copy")
            .arg("--progress")
            .args(["--stats", "1s"])
            .arg("--config")
            .arg(config)
            .arg(source)
            .arg(remote_spec(remote, path))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| self.spawn_error(e))?;
        info!(pid = ?child.id(), remote = %remote, path = %path, "Started rclone copy");

        // Both pipes feed one channel so the reader sees a single stream
        let (tx, lines) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(CopyProcess { child, lines })
    }

    /// List folders under `remote:path`, one relative path per entry
    #[instrument(level = "debug", skip(self, config))]
    pub async fn list_dirs(
        &self,
        config: &Path,
        remote: &str,
        path: &str,
    ) -> Result<Vec<String>, SyncError> {
        let output = self
            .command()
            .arg("lsf")
            .arg("--config")
            .arg(config)
            .arg(remote_spec(remote, path))
            .arg("-R")
            .arg("--dirs-only")
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = %output.status, stderr = %stderr, "rclone lsf failed");
            return Err(SyncError::Failed {
                command: "lsf",
                status: output.status,
                stderr,
            });
        }

        let listing: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(entries = listing.len(), "rclone lsf finished");
        Ok(listing)
    }
}

pub(crate) async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    // rclone redraws its progress block with carriage returns
    let mut chunks = BufReader::new(reader).split(b'\n');
    while let Ok(Some(chunk)) = chunks.next_segment().await {
        for part in String::from_utf8_lossy(&chunk).split('\r') {
            if part.trim().is_empty() {
                continue;
            }
            if tx.send(part.to_string()).await.is_err() {
                return;
            }
        }
    }
    trace!("Child output closed");
}

/// A running `rclone copy`, exclusively owned by its upload task
#[derive(Debug)]
pub struct CopyProcess {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl CopyProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next output line, or `None` once both pipes are closed
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, SyncError> {
        Ok(self.child.wait().await?)
    }

    /// Kill the child and reap it
    pub async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "rclone already exited");
        }
        match self.child.wait().await {
            Ok(status) => info!(status = %status, "rclone terminated"),
            Err(e) => warn!(error = %e, "Failed to reap rclone"),
        }
    }
}
