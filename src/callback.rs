//! Inline button payloads
//!
//! Every button carries the job key it acts on. Browsing buttons also carry
//! the `{remote, path}` they lead to, with the path last so it may contain
//! any character except a newline.

use std::{fmt, str::FromStr};
use thiserror::Error;

use crate::{
    jobs::JobKey,
    remote::NavigationState,
    transport::{Button, Keyboard},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Cancel(JobKey),
    /// Upload the finished file through the chat
    ToChat(JobKey),
    /// Start choosing a cloud remote
    ToCloud(JobKey),
    /// Show the folders under `at`
    Browse { key: JobKey, at: NavigationState },
    /// Upload the finished file into `at`
    UploadHere { key: JobKey, at: NavigationState },
}

impl Callback {
    pub fn key(&self) -> JobKey {
        match self {
            Self::Cancel(key) | Self::ToChat(key) | Self::ToCloud(key) => *key,
            Self::Browse { key, .. } | Self::UploadHere { key, .. } => *key,
        }
    }
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancel(key) => write!(f, "cancel|{key}"),
            Self::ToChat(key) => write!(f, "chat|{key}"),
            Self::ToCloud(key) => write!(f, "cloud|{key}"),
            Self::Browse { key, at } => write!(f, "nav|{key}|{}|{}", at.remote, at.path),
            Self::UploadHere { key, at } => write!(f, "here|{key}|{}|{}", at.remote, at.path),
        }
    }
}

/// A single cancel button, shown under progress messages
pub fn cancel_keyboard(key: JobKey) -> Keyboard {
    vec![vec![Button::new("❌ Cancel", Callback::Cancel(key))]]
}

/// Upload destinations offered once a file is ready
pub fn destination_keyboard(key: JobKey) -> Keyboard {
    vec![
        vec![
            Button::new("📤 Telegram", Callback::ToChat(key)),
            Button::new("☁️ Cloud", Callback::ToCloud(key)),
        ],
        vec![Button::new("❌ Cancel", Callback::Cancel(key))],
    ]
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognised callback payload: {0}")]
pub struct CallbackParseError(pub String);

impl FromStr for Callback {
    type Err = CallbackParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || CallbackParseError(s.to_string());
        let mut parts = s.splitn(4, '|');
        let action = parts.next().ok_or_else(bad)?;
        let key: JobKey = parts
            .next()
            .ok_or_else(bad)?
            .parse()
            .map_err(|_| bad())?;

        let mut location = || -> Result<NavigationState, CallbackParseError> {
            let remote = parts.next().filter(|r| !r.is_empty()).ok_or_else(bad)?;
            let path = parts.next().unwrap_or_default();
            Ok(NavigationState::new(remote, path))
        };

        match action {
            "cancel" => Ok(Self::Cancel(key)),
            "chat" => Ok(Self::ToChat(key)),
            "cloud" => Ok(Self::ToCloud(key)),
            "nav" => Ok(Self::Browse {
                key,
                at: location()?,
            }),
            "here" => Ok(Self::UploadHere {
                key,
                at: location()?,
            }),
            _ => Err(bad()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payloads_decode_to_what_they_encode() {
        let key = JobKey::new(-100, 7);
        let cases = [
            Callback::Cancel(key),
            Callback::ToChat(key),
            Callback::ToCloud(key),
            Callback::Browse {
                key,
                at: NavigationState::new("gdrive", ""),
            },
            Callback::UploadHere {
                key,
                at: NavigationState::new("gdrive", "Movies/Old Films"),
            },
        ];
        for callback in cases {
            let encoded = callback.to_string();
            assert_eq!(encoded.parse::<Callback>(), Ok(callback.clone()), "{encoded}");
            assert_eq!(callback.key(), key);
        }
    }

    #[test]
    fn test_rejects_unknown_payloads() {
        assert!("bogus|1.2".parse::<Callback>().is_err());
        assert!("cancel".parse::<Callback>().is_err());
        assert!("nav|1.2".parse::<Callback>().is_err());
        assert!("nav|1.2||Movies".parse::<Callback>().is_err());
    }
}
