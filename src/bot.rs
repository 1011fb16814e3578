//! Inbound event dispatch
//!
//! Turns chat events into coordinator calls. Anything long-running is
//! spawned so the update loop keeps draining events.

use color_eyre::Result;
use regex::Regex;
use std::{
    path::PathBuf,
    sync::{Arc, LazyLock},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{DownloadBackend, SubmitOptions},
    callback::Callback,
    download::{DownloadCoordinator, sanitize_file_name},
    jobs::{FileMeta, JobKey, JobRegistry, UserId},
    remote::{BrowseError, BrowserView, NavigationState, RemoteBrowser},
    telegram::TelegramTransport,
    transport::{Button, ChatId, ChatTransport, Keyboard, MessageId, edit_best_effort},
    upload::{UploadCoordinator, UploadError},
    user_config::{ConfigError, ConfigStore},
};

const HELP: &str = "Send me a link and I will download it. \
Text after the link names the file.\n\n\
/ytdl <url> - fetch a video page with yt-dlp\n\
/config - upload your rclone.conf for cloud uploads\n\
/jobs - list transfers in this chat\n\n\
You can also send me a file to forward it to your cloud storage.";

static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:(?:https?|s?ftp)://|magnet:\?)\S+").expect("valid regex")
});

/// A download request found in free text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub url: String,
    /// File name given after the link
    pub out: Option<String>,
}

impl LinkRequest {
    /// Take the first link in `text`; whatever follows it names the file
    pub fn find(text: &str) -> Option<Self> {
        let found = LINK.find(text)?;
        let out = sanitize_file_name(&text[found.end()..], "");
        Some(Self {
            url: found.as_str().to_string(),
            out: (!out.is_empty()).then_some(out),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Config,
    Jobs,
    /// Download through the media extractor
    Ytdl(String),
    Unknown(String),
}

impl Command {
    /// Parse a `/command args` message, `None` for plain text
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        // Group chats address commands as /name@botname
        let name = name.split('@').next().unwrap_or_default();
        Some(match name {
            "start" | "help" => Self::Help,
            "config" => Self::Config,
            "jobs" => Self::Jobs,
            "ytdl" => Self::Ytdl(args.trim().to_string()),
            other => Self::Unknown(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Command {
        chat: ChatId,
        user: UserId,
        command: Command,
    },
    Text {
        chat: ChatId,
        user: UserId,
        text: String,
    },
    Document {
        chat: ChatId,
        user: UserId,
        file_id: String,
        meta: FileMeta,
    },
    Callback {
        id: String,
        chat: ChatId,
        user: UserId,
        message: MessageId,
        data: String,
    },
}

/// Buttons for one folder of a remote
pub fn render_browser(key: JobKey, view: &BrowserView) -> (String, Keyboard) {
    let mut keyboard: Keyboard = view
        .children
        .iter()
        .map(|child| {
            vec![Button::new(
                format!("📁 {}", child.name()),
                Callback::Browse {
                    key,
                    at: child.clone(),
                },
            )]
        })
        .collect();

    let mut actions = vec![Button::new(
        "✅ Upload here",
        Callback::UploadHere {
            key,
            at: view.at.clone(),
        },
    )];
    if let Some(back) = &view.back {
        actions.push(Button::new(
            "⬅️ Back",
            Callback::Browse {
                key,
                at: back.clone(),
            },
        ));
    }
    keyboard.push(actions);
    keyboard.push(vec![Button::new("❌ Cancel", Callback::Cancel(key))]);

    let text = if view.children.is_empty() {
        format!("📂 {}\nNo subfolders.", view.at)
    } else {
        format!("📂 {}\nChoose a folder:", view.at)
    };
    (text, keyboard)
}

fn remotes_keyboard(key: JobKey, remotes: &[String]) -> Keyboard {
    let mut keyboard: Keyboard = remotes
        .iter()
        .map(|remote| {
            vec![Button::new(
                format!("☁️ {remote}"),
                Callback::Browse {
                    key,
                    at: NavigationState::root(remote),
                },
            )]
        })
        .collect();
    keyboard.push(vec![Button::new("❌ Cancel", Callback::Cancel(key))]);
    keyboard
}

fn config_error_text(error: &ConfigError) -> String {
    match error {
        ConfigError::NotConfigured => {
            "No rclone config yet. Send /config and then your rclone.conf.".to_string()
        }
        other => format!("❌ {other}"),
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn ChatTransport>,
    registry: JobRegistry,
    downloads: DownloadCoordinator,
    uploads: UploadCoordinator,
    browser: RemoteBrowser,
    configs: ConfigStore,
    aria2: Arc<dyn DownloadBackend>,
    extractor: Arc<dyn DownloadBackend>,
    download_dir: PathBuf,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        registry: JobRegistry,
        downloads: DownloadCoordinator,
        uploads: UploadCoordinator,
        browser: RemoteBrowser,
        configs: ConfigStore,
        aria2: Arc<dyn DownloadBackend>,
        extractor: Arc<dyn DownloadBackend>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            transport,
            registry,
            downloads,
            uploads,
            browser,
            configs,
            aria2,
            extractor,
            download_dir,
        }
    }

    pub async fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::Command {
                chat,
                user,
                command,
            } => self.on_command(chat, user, command).await,
            Event::Text { chat, user, text } => match LinkRequest::find(&text) {
                Some(request) => {
                    self.start_download(chat, user, request, self.aria2.clone())
                        .await
                }
                None => {
                    self.transport.send_text(chat, HELP, None).await?;
                    Ok(())
                }
            },
            Event::Document {
                chat,
                user,
                file_id,
                meta,
            } => self.on_document(chat, user, file_id, meta).await,
            Event::Callback {
                id,
                chat,
                user,
                message,
                data,
            } => {
                if let Err(e) = self.transport.answer_callback(&id).await {
                    debug!(error = %e, "Failed to answer callback");
                }
                match data.parse::<Callback>() {
                    Ok(callback) => self.on_callback(chat, user, message, callback).await,
                    Err(e) => {
                        warn!(chat, error = %e, "Ignoring callback");
                        Ok(())
                    }
                }
            }
        }
    }

    async fn on_command(&self, chat: ChatId, user: UserId, command: Command) -> Result<()> {
        match command {
            Command::Help => {
                self.transport.send_text(chat, HELP, None).await?;
            }
            Command::Config => {
                self.configs.await_config(user);
                self.transport
                    .send_text(chat, "Send your rclone.conf file now.", None)
                    .await?;
            }
            Command::Jobs => {
                let keys: Vec<String> = self
                    .registry
                    .active()
                    .into_iter()
                    .filter(|key| key.chat == chat)
                    .filter_map(|key| self.registry.get(&key))
                    .map(|job| format!("• {} ({:?}): {}", job.key, job.kind, job.state))
                    .collect();
                let text = if keys.is_empty() {
                    "No active transfers.".to_string()
                } else {
                    keys.join("\n")
                };
                self.transport.send_text(chat, &text, None).await?;
            }
            Command::Ytdl(args) => match LinkRequest::find(&args) {
                Some(request) => {
                    self.start_download(chat, user, request, self.extractor.clone())
                        .await?;
                }
                None => {
                    self.transport
                        .send_text(chat, "Usage: /ytdl <url> [name]", None)
                        .await?;
                }
            },
            Command::Unknown(name) => {
                debug!(chat, command = %name, "Unknown command");
                self.transport.send_text(chat, HELP, None).await?;
            }
        }
        Ok(())
    }

    async fn start_download(
        &self,
        chat: ChatId,
        user: UserId,
        request: LinkRequest,
        backend: Arc<dyn DownloadBackend>,
    ) -> Result<()> {
        let message = self.transport.send_text(chat, "⏳ Submitting…", None).await?;
        let key = JobKey::new(chat, message);
        let options = SubmitOptions::new(&self.download_dir).with_out(request.out);
        if let Err(e) = self
            .downloads
            .submit(backend, key, user, &request.url, options)
            .await
        {
            edit_best_effort(self.transport.as_ref(), key.target(), &format!("❌ {e}"), None)
                .await;
        }
        Ok(())
    }

    async fn on_document(
        &self,
        chat: ChatId,
        user: UserId,
        file_id: String,
        meta: FileMeta,
    ) -> Result<()> {
        if self.configs.accepts(user, Some(&meta.name)) {
            let staged = self.configs.stage(user).await?;
            self.transport.fetch_file(&file_id, staged.path()).await?;
            let text = match self.configs.commit(user, staged).await {
                Ok(remotes) if remotes.is_empty() => {
                    "⚠️ Config saved, but it defines no remotes.".to_string()
                }
                Ok(remotes) => format!("✅ Config saved. Remotes: {}", remotes.join(", ")),
                Err(e) => config_error_text(&e),
            };
            self.transport.send_text(chat, &text, None).await?;
            return Ok(());
        }

        let message = self
            .transport
            .send_text(chat, &format!("⏳ Receiving {}", meta.name), None)
            .await?;
        let key = JobKey::new(chat, message);
        if let Err(e) = self
            .downloads
            .ingest(key, user, file_id, meta, self.download_dir.clone())
        {
            edit_best_effort(self.transport.as_ref(), key.target(), &format!("❌ {e}"), None)
                .await;
        }
        Ok(())
    }

    async fn on_callback(
        &self,
        chat: ChatId,
        user: UserId,
        message: MessageId,
        callback: Callback,
    ) -> Result<()> {
        let key = callback.key();
        if key != JobKey::new(chat, message) {
            warn!(chat, message, key = %key, "Callback does not belong to its message");
            return Ok(());
        }
        // Remotes are listed from the config of whoever owns the job
        let owner = match self.registry.get(&key) {
            Some(job) => job.user,
            None if matches!(callback, Callback::Cancel(_)) => user,
            None => {
                edit_best_effort(
                    self.transport.as_ref(),
                    key.target(),
                    "This transfer no longer exists.",
                    None,
                )
                .await;
                return Ok(());
            }
        };

        match callback {
            Callback::Cancel(key) => {
                if !self.uploads.cancel(key).await {
                    debug!(key = %key, "Cancel for unknown job");
                }
            }
            Callback::ToChat(key) => {
                let uploads = self.uploads.clone();
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = uploads.upload_to_chat(key).await {
                        report_claim_failure(transport.as_ref(), key, &e).await;
                    }
                });
            }
            Callback::ToCloud(key) => match self.configs.remotes(owner).await {
                Ok(remotes) if remotes.is_empty() => {
                    self.transport
                        .send_text(chat, "Your rclone config defines no remotes.", None)
                        .await?;
                }
                Ok(remotes) => {
                    edit_best_effort(
                        self.transport.as_ref(),
                        key.target(),
                        "Choose a remote:",
                        Some(&remotes_keyboard(key, &remotes)),
                    )
                    .await;
                }
                Err(e) => {
                    self.transport
                        .send_text(chat, &config_error_text(&e), None)
                        .await?;
                }
            },
            Callback::Browse { key, at } => match self.browser.view(owner, &at).await {
                Ok(view) => {
                    let (text, keyboard) = render_browser(key, &view);
                    edit_best_effort(self.transport.as_ref(), key.target(), &text, Some(&keyboard))
                        .await;
                }
                Err(BrowseError::Config(e)) => {
                    self.transport
                        .send_text(chat, &config_error_text(&e), None)
                        .await?;
                }
                Err(e) => {
                    warn!(key = %key, at = %at, error = %e, "Browsing failed");
                    self.transport.send_text(chat, &format!("❌ {e}"), None).await?;
                }
            },
            Callback::UploadHere { key, at } => {
                let uploads = self.uploads.clone();
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = uploads.upload_to_remote(key, &at).await {
                        report_claim_failure(transport.as_ref(), key, &e).await;
                    }
                });
            }
        }
        Ok(())
    }

    /// Long-poll Telegram until `shutdown` fires
    pub async fn run(&self, telegram: &TelegramTransport, shutdown: CancellationToken) {
        const POLL_TIMEOUT: Duration = Duration::from_secs(30);
        const RETRY_DELAY: Duration = Duration::from_secs(5);

        let mut offset = 0;
        info!("Listening for updates");
        loop {
            let updates = tokio::select! {
                _ = shutdown.cancelled() => break,
                updates = telegram.get_updates(offset, POLL_TIMEOUT) => updates,
            };
            let updates = match updates {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "Failed to fetch updates");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    }
                }
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(event) = update.into_event() else {
                    continue;
                };
                if let Err(e) = self.handle(event).await {
                    error!(error = ?e, "Failed to handle event");
                }
            }
        }
        info!("Update loop stopped");
    }
}

/// Tell the user why an upload could not start
///
/// Terminal outcomes are already reported by the coordinator.
async fn report_claim_failure(transport: &dyn ChatTransport, key: JobKey, error: &UploadError) {
    let text = match error {
        UploadError::Outcome(_) => return,
        UploadError::Busy { .. } => "⏳ This file is already being uploaded.".to_string(),
        UploadError::NotFound(_) => "This transfer no longer exists.".to_string(),
        UploadError::Config(e) => config_error_text(e),
    };
    if let Err(e) = transport.send_text(key.chat, &text, None).await {
        warn!(key = %key, error = %e, "Failed to report upload problem");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        download::Tuning,
        jobs::{Job, JobKind, JobState},
        progress::DEFAULT_THROTTLE,
        sync::Rclone,
        testing::{FakeBackend, RecordingTransport},
    };

    struct Fixture {
        dir: tempfile::TempDir,
        transport: Arc<RecordingTransport>,
        registry: JobRegistry,
        backend: Arc<FakeBackend>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let registry = JobRegistry::new();
        let configs = ConfigStore::new(dir.path().join("configs"));
        let rclone = Rclone::default();
        let backend = FakeBackend::new();
        let dispatcher = Dispatcher::new(
            transport.clone(),
            registry.clone(),
            DownloadCoordinator::new(registry.clone(), transport.clone(), Tuning::default()),
            UploadCoordinator::new(
                registry.clone(),
                transport.clone(),
                rclone.clone(),
                configs.clone(),
                DEFAULT_THROTTLE,
            ),
            RemoteBrowser::new(rclone, configs.clone()),
            configs,
            backend.clone(),
            backend.clone(),
            dir.path().join("downloads"),
        );
        Fixture {
            dir,
            transport,
            registry,
            backend,
            dispatcher,
        }
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse("hello"), None);
        assert_eq!(Command::parse("/start"), Some(Command::Help));
        assert_eq!(Command::parse("/config@ferry_bot"), Some(Command::Config));
        assert_eq!(
            Command::parse("/ytdl  https://example.com/v "),
            Some(Command::Ytdl("https://example.com/v".into()))
        );
        assert_eq!(Command::parse("/ytdl"), Some(Command::Ytdl(String::new())));
        assert_eq!(Command::parse("/nope"), Some(Command::Unknown("nope".into())));
    }

    #[test]
    fn test_link_request_takes_first_link() {
        assert_eq!(LinkRequest::find("nothing to fetch here"), None);
        assert_eq!(
            LinkRequest::find("grab this https://example.com/a.iso please"),
            Some(LinkRequest {
                url: "https://example.com/a.iso".into(),
                out: Some("please".into()),
            })
        );
        assert_eq!(
            LinkRequest::find("see FTP://example.com/a and http://example.com/b")
                .map(|request| request.url),
            Some("FTP://example.com/a".into())
        );
        assert_eq!(
            LinkRequest::find("magnet:?xt=urn:btih:abc"),
            Some(LinkRequest {
                url: "magnet:?xt=urn:btih:abc".into(),
                out: None,
            })
        );
        assert_eq!(
            LinkRequest::find("https://example.com/a.iso ../../etc/debian.iso")
                .and_then(|request| request.out),
            Some("debian.iso".into())
        );
    }

    #[test]
    fn test_render_browser() {
        let key = JobKey::new(1, 2);
        let view = BrowserView {
            at: NavigationState::new("gdrive", "Movies"),
            children: vec![NavigationState::new("gdrive", "Movies/2020")],
            back: Some(NavigationState::root("gdrive")),
        };
        let (text, keyboard) = render_browser(key, &view);
        assert!(text.starts_with("📂 gdrive:/Movies"));
        assert_eq!(keyboard.len(), 3);
        assert_eq!(keyboard[0][0].label, "📁 2020");
        assert_eq!(
            keyboard[1][0].callback,
            Callback::UploadHere {
                key,
                at: view.at.clone()
            }
        );
        assert_eq!(
            keyboard[1][1].callback,
            Callback::Browse {
                key,
                at: NavigationState::root("gdrive")
            }
        );
    }

    #[tokio::test]
    async fn test_config_upload_flow() {
        let f = fixture();
        f.transport.set_fetch_body(b"[gdrive]\ntype = drive\n");

        let document = Event::Document {
            chat: 3,
            user: 4,
            file_id: "f".into(),
            meta: FileMeta {
                name: "rclone.conf".into(),
                size: None,
                mime: None,
            },
        };
        f.dispatcher
            .handle(Event::Command {
                chat: 3,
                user: 4,
                command: Command::Config,
            })
            .await
            .unwrap();
        f.dispatcher.handle(document).await.unwrap();

        let sent = f.transport.sent_texts(3);
        assert_eq!(sent.last().unwrap(), "✅ Config saved. Remotes: gdrive");
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_url_is_reported_on_status_message() {
        let f = fixture();
        f.backend.reject_with("No URI to download.");
        f.dispatcher
            .handle(Event::Text {
                chat: 3,
                user: 4,
                text: "https://example.com/a".into(),
            })
            .await
            .unwrap();

        let target = JobKey::new(3, 100).target();
        let edit = f.transport.last_edit(target).unwrap();
        assert!(edit.text.starts_with("❌ download malformed request"), "{}", edit.text);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_text_around_link_is_not_submitted() {
        let f = fixture();
        f.backend.reject_with("stop here");
        f.dispatcher
            .handle(Event::Text {
                chat: 3,
                user: 4,
                text: "please get https://example.com/a.iso debian.iso".into(),
            })
            .await
            .unwrap();
        f.dispatcher
            .handle(Event::Command {
                chat: 3,
                user: 4,
                command: Command::Ytdl("https://example.com/v".into()),
            })
            .await
            .unwrap();

        assert_eq!(
            f.backend.submitted(),
            vec![
                (
                    vec!["https://example.com/a.iso".to_string()],
                    Some("debian.iso".to_string())
                ),
                (vec!["https://example.com/v".to_string()], None),
            ]
        );
    }

    #[tokio::test]
    async fn test_ytdl_without_link_shows_usage() {
        let f = fixture();
        f.dispatcher
            .handle(Event::Command {
                chat: 3,
                user: 4,
                command: Command::Ytdl("not a link".into()),
            })
            .await
            .unwrap();
        assert_eq!(f.backend.adds(), 0);
        assert_eq!(f.transport.sent_texts(3), vec!["Usage: /ytdl <url> [name]"]);
    }

    #[tokio::test]
    async fn test_cancel_callback_discards_ready_file() {
        let f = fixture();
        let path = f.dir.path().join("a.bin");
        std::fs::write(&path, b"x").unwrap();
        let key = JobKey::new(3, 9);
        let mut job = Job::new(key, JobKind::Download, 4);
        job.state = JobState::AwaitingUpload;
        job.local_path = Some(path.clone());
        f.registry.register(job).unwrap();

        f.dispatcher
            .handle(Event::Callback {
                id: "cb".into(),
                chat: 3,
                user: 4,
                message: 9,
                data: Callback::Cancel(key).to_string(),
            })
            .await
            .unwrap();

        assert_eq!(f.transport.answered(), vec!["cb".to_string()]);
        assert!(!path.exists());
        assert!(f.registry.get(&key).is_none());
    }
}
