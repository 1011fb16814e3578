//! Config module for ferry

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::download::Tuning;

#[derive(Parser, Debug, Clone)]
pub struct TelegramConfig {
    /// Bot token issued by @BotFather
    #[clap(long, env = "FERRY_BOT_TOKEN", hide_env_values = true)]
    pub bot_token: String,

    /// Bot API server; a local one lifts the upload limit
    #[clap(long, env = "FERRY_TELEGRAM_API", default_value = "https://api.telegram.org")]
    pub telegram_api: String,

    /// Largest file sent into a chat, in MB. 0 disables the check
    #[clap(long, env = "FERRY_UPLOAD_LIMIT_MB", default_value_t = 50)]
    pub upload_limit_mb: u64,
}

impl TelegramConfig {
    pub fn upload_limit(&self) -> Option<u64> {
        (self.upload_limit_mb > 0).then(|| self.upload_limit_mb * 1_000_000)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct Aria2Config {
    #[clap(long, env = "FERRY_ARIA2_RPC", default_value = "http://localhost:6800/jsonrpc")]
    pub aria2_rpc: String,

    /// RPC secret, sent as `token:<secret>`
    #[clap(long, env = "FERRY_ARIA2_SECRET", default_value = "", hide_env_values = true)]
    pub aria2_secret: String,

    /// Start a local `aria2c --enable-rpc` and stop it on exit
    #[clap(long, env = "FERRY_SPAWN_ARIA2", default_value = "false")]
    pub spawn_aria2: bool,
}

impl Aria2Config {
    pub fn secret(&self) -> Option<String> {
        Some(self.aria2_secret.clone()).filter(|s| !s.is_empty())
    }

    /// Port of the RPC URL, for a spawned daemon
    pub fn rpc_port(&self) -> u16 {
        url::Url::parse(&self.aria2_rpc)
            .ok()
            .and_then(|url| url.port_or_known_default())
            .unwrap_or(6800)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct StorageConfig {
    /// Where downloads land before they are uploaded
    #[clap(long, env = "FERRY_DOWNLOAD_DIR", default_value = "Downloads")]
    pub download_dir: PathBuf,

    /// Root of the per-user rclone configs
    #[clap(long, env = "FERRY_CONFIGS_DIR", default_value = "UserConfigs")]
    pub configs_dir: PathBuf,

    #[clap(long, env = "FERRY_RCLONE_BIN", default_value = "rclone")]
    pub rclone_bin: PathBuf,

    #[clap(long, env = "FERRY_YTDLP_BIN", default_value = "yt-dlp")]
    pub ytdlp_bin: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct TuningConfig {
    /// Minimum seconds between two progress edits of one message
    #[clap(long, env = "FERRY_THROTTLE_SECS", default_value_t = 3)]
    pub throttle_secs: u64,

    #[clap(long, env = "FERRY_POLL_MS", default_value_t = 1000)]
    pub poll_ms: u64,

    /// Unchanged polls before a download is declared stalled
    #[clap(long, env = "FERRY_STALL_TICKS", default_value_t = 30)]
    pub stall_ticks: u32,

    /// Consecutive failed status queries before a download is aborted
    #[clap(long, env = "FERRY_MAX_ERRORS", default_value_t = 5)]
    pub max_errors: u32,
}

#[derive(Parser, Debug, Clone)]
#[clap(name = "ferry", about = "Chat-driven download and upload bot")]
pub struct Config {
    #[clap(flatten)]
    pub telegram: TelegramConfig,

    #[clap(flatten)]
    pub aria2: Aria2Config,

    #[clap(flatten)]
    pub storage: StorageConfig,

    #[clap(flatten)]
    pub tuning: TuningConfig,
}

impl Config {
    pub fn tuning(&self) -> Tuning {
        Tuning {
            poll_interval: Duration::from_millis(self.tuning.poll_ms.max(1)),
            throttle: Duration::from_secs(self.tuning.throttle_secs),
            stall_ticks: self.tuning.stall_ticks.max(1),
            max_errors: self.tuning.max_errors.max(1),
        }
    }
}

pub fn config() -> Config {
    Config::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_tuning() {
        let config = Config::parse_from(["ferry", "--bot-token", "123:abc"]);
        assert_eq!(config.tuning(), Tuning::default());
        assert_eq!(config.storage.download_dir, PathBuf::from("Downloads"));
        assert_eq!(config.aria2.secret(), None);
        assert_eq!(config.aria2.rpc_port(), 6800);
        assert!(!config.aria2.spawn_aria2);
        assert_eq!(config.telegram.upload_limit(), Some(50_000_000));
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse_from([
            "ferry",
            "--bot-token",
            "123:abc",
            "--aria2-secret",
            "s3cret",
            "--aria2-rpc",
            "http://127.0.0.1:6900/jsonrpc",
            "--stall-ticks",
            "10",
            "--upload-limit-mb",
            "0",
        ]);
        assert_eq!(config.aria2.secret().as_deref(), Some("s3cret"));
        assert_eq!(config.aria2.rpc_port(), 6900);
        assert_eq!(config.tuning().stall_ticks, 10);
        assert_eq!(config.telegram.upload_limit(), None);
    }
}
