//! Per-user rclone credentials
//!
//! A user's `rclone.conf` lives at `<configs root>/<user id>/rclone.conf`.
//! Uploads are staged in a temporary file next to the target and renamed into
//! place, so readers only ever see a complete file.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::jobs::UserId;

const CONFIG_FILE_NAME: &str = "rclone.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no rclone config uploaded yet")]
    NotConfigured,
    #[error("config file is not valid text")]
    Encoding,
    #[error("config file failed to parse at line {line}: {reason}")]
    Parse { line: usize, reason: &'static str },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Section names of an rclone config, in file order
pub fn parse_remotes(text: &str) -> Result<Vec<String>, ConfigError> {
    let mut remotes: Vec<String> = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        let line_no = index + 1;
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or(ConfigError::Parse {
                line: line_no,
                reason: "unterminated section header",
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::Parse {
                    line: line_no,
                    reason: "empty section name",
                });
            }
            if !remotes.iter().any(|r| r == name) {
                remotes.push(name.to_string());
            }
        } else if remotes.is_empty() {
            return Err(ConfigError::Parse {
                line: line_no,
                reason: "entry outside of any section",
            });
        } else if !line.contains('=') {
            return Err(ConfigError::Parse {
                line: line_no,
                reason: "expected key = value",
            });
        }
    }
    Ok(remotes)
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
    awaiting: Arc<Mutex<HashSet<UserId>>>,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            awaiting: Arc::default(),
        }
    }

    fn user_dir(&self, user: UserId) -> PathBuf {
        self.root.join(user.to_string())
    }

    pub fn path_for(&self, user: UserId) -> PathBuf {
        self.user_dir(user).join(CONFIG_FILE_NAME)
    }

    /// Path of the user's config, if one has been stored
    pub async fn config_path(&self, user: UserId) -> Result<PathBuf, ConfigError> {
        let path = self.path_for(user);
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(ConfigError::NotConfigured)
        }
    }

    /// Mark `user` as expecting to send a config file
    pub fn await_config(&self, user: UserId) {
        debug!(user, "Awaiting rclone config upload");
        self.awaiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user);
    }

    pub fn is_awaiting(&self, user: UserId) -> bool {
        self.awaiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&user)
    }

    /// Whether an incoming document should be taken as `user`'s config
    pub fn accepts(&self, user: UserId, file_name: Option<&str>) -> bool {
        file_name.is_some_and(|name| name.ends_with(".conf")) && self.is_awaiting(user)
    }

    /// Create an empty staging file in the user's directory
    pub async fn stage(&self, user: UserId) -> Result<NamedTempFile, ConfigError> {
        let dir = self.user_dir(user);
        tokio::fs::create_dir_all(&dir).await?;
        let staged = tokio::task::spawn_blocking(move || NamedTempFile::new_in(dir))
            .await
            .map_err(std::io::Error::other)??;
        Ok(staged)
    }

    /// Move a fully written staging file into place and list its remotes
    ///
    /// An empty list means the file parsed but defines no remotes.
    pub async fn commit(
        &self,
        user: UserId,
        staged: NamedTempFile,
    ) -> Result<Vec<String>, ConfigError> {
        let path = self.path_for(user);
        let target = path.clone();
        tokio::task::spawn_blocking(move || staged.persist(target))
            .await
            .map_err(std::io::Error::other)?
            .map_err(|e| e.error)?;

        self.awaiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user);
        info!(user, path = ?path, "Stored rclone config");

        let remotes = read_remotes(&path).await?;
        if remotes.is_empty() {
            warn!(user, "Stored rclone config defines no remotes");
        }
        Ok(remotes)
    }

    /// Persist `contents` as the user's config
    pub async fn store(&self, user: UserId, contents: &[u8]) -> Result<Vec<String>, ConfigError> {
        let staged = self.stage(user).await?;
        tokio::fs::write(staged.path(), contents).await?;
        self.commit(user, staged).await
    }

    /// Remote names of the user's config, read fresh from disk
    pub async fn remotes(&self, user: UserId) -> Result<Vec<String>, ConfigError> {
        let path = self.config_path(user).await?;
        read_remotes(&path).await
    }
}

async fn read_remotes(path: &Path) -> Result<Vec<String>, ConfigError> {
    let bytes = tokio::fs::read(path).await?;
    let text = String::from_utf8(bytes).map_err(|_| ConfigError::Encoding)?;
    parse_remotes(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# personal remotes
[gdrive]
type = drive
scope = drive

[b2 backup]
type = b2
";

    #[test]
    fn test_parse_remotes() {
        assert_eq!(parse_remotes(SAMPLE).unwrap(), vec!["gdrive", "b2 backup"]);
        assert!(parse_remotes("").unwrap().is_empty());
        assert!(parse_remotes("# only comments\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors_are_distinct_from_empty() {
        assert!(matches!(
            parse_remotes("type = drive\n[gdrive]\n"),
            Err(ConfigError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            parse_remotes("[gdrive\n"),
            Err(ConfigError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            parse_remotes("[gdrive]\nnonsense\n"),
            Err(ConfigError::Parse { line: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        assert!(matches!(
            store.remotes(42).await,
            Err(ConfigError::NotConfigured)
        ));
        assert!(!store.accepts(42, Some("rclone.conf")));

        store.await_config(42);
        assert!(store.accepts(42, Some("rclone.conf")));
        assert!(!store.accepts(42, Some("notes.txt")));
        assert!(!store.accepts(42, None));

        let remotes = store.store(42, SAMPLE.as_bytes()).await.unwrap();
        assert_eq!(remotes, vec!["gdrive", "b2 backup"]);
        assert!(!store.is_awaiting(42));
        assert_eq!(store.config_path(42).await.unwrap(), store.path_for(42));

        // Only the committed file is left in the user's directory
        let entries = std::fs::read_dir(dir.path().join("42")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_store_reports_empty_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        assert!(store.store(1, b"# nothing here\n").await.unwrap().is_empty());
        assert!(matches!(
            store.store(1, &[0xff, 0xfe, 0x00]).await,
            Err(ConfigError::Encoding)
        ));
    }
}
