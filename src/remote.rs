//! Remote folder browsing
//!
//! Every view is built from a fresh `rclone lsf`, the tree may change between
//! two button presses.

use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::{
    jobs::UserId,
    sync::{Rclone, SyncError},
    user_config::{ConfigError, ConfigStore},
};

/// A position in a remote's folder tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NavigationState {
    pub remote: String,
    /// Slash-delimited, empty at the remote root
    pub path: String,
}

impl NavigationState {
    pub fn new(remote: impl Into<String>, path: impl AsRef<str>) -> Self {
        let path = path
            .as_ref()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self {
            remote: remote.into(),
            path,
        }
    }

    pub fn root(remote: impl Into<String>) -> Self {
        Self::new(remote, "")
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    pub fn child(&self, name: &str) -> Self {
        if self.is_root() {
            Self::new(&self.remote, name)
        } else {
            Self::new(&self.remote, format!("{}/{}", self.path, name))
        }
    }

    /// The path with its last segment removed, `None` at the root
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let segments: Vec<&str> = self.segments().collect();
        Some(Self::new(
            &self.remote,
            segments[..segments.len() - 1].join("/"),
        ))
    }

    /// Last path segment, or the remote name at the root
    pub fn name(&self) -> &str {
        self.segments().last().unwrap_or(self.remote.as_str())
    }
}

impl fmt::Display for NavigationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.remote, self.path)
    }
}

#[derive(Debug, Error)]
pub enum BrowseError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to list folders: {0}")]
    Sync(#[from] SyncError),
}

/// What to show for one position in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserView {
    pub at: NavigationState,
    pub children: Vec<NavigationState>,
    pub back: Option<NavigationState>,
}

/// Immediate subfolders from a recursive `lsf --dirs-only` listing
pub fn immediate_children(listing: &[String]) -> Vec<String> {
    let mut names: Vec<String> = listing
        .iter()
        .map(|entry| entry.trim().trim_end_matches('/'))
        .filter(|entry| !entry.is_empty() && !entry.contains('/'))
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}

#[derive(Debug, Clone)]
pub struct RemoteBrowser {
    rclone: Rclone,
    configs: ConfigStore,
}

impl RemoteBrowser {
    pub fn new(rclone: Rclone, configs: ConfigStore) -> Self {
        Self { rclone, configs }
    }

    /// Ordered names of the folders directly under `remote:path`
    pub async fn list_children(
        &self,
        user: UserId,
        remote: &str,
        path: &str,
    ) -> Result<Vec<String>, BrowseError> {
        let config = self.configs.config_path(user).await?;
        let listing = self.rclone.list_dirs(&config, remote, path).await?;
        let children = immediate_children(&listing);
        debug!(user, remote = %remote, path = %path, count = children.len(), "Listed remote folders");
        Ok(children)
    }

    pub async fn view(&self, user: UserId, at: &NavigationState) -> Result<BrowserView, BrowseError> {
        let children = self
            .list_children(user, &at.remote, &at.path)
            .await?
            .iter()
            .map(|name| at.child(name))
            .collect();
        Ok(BrowserView {
            at: at.clone(),
            children,
            back: at.parent(),
        })
    }
}
