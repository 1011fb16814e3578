mod backend;
mod bot;
mod callback;
mod config;
mod download;
mod jobs;
mod progress;
mod remote;
mod sync;
mod telegram;
#[cfg(test)]
mod testing;
mod transport;
mod upload;
mod user_config;

use std::{process::Stdio, sync::Arc, time::Duration};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use backend::{Aria2Backend, DownloadBackend, ExtractorBackend};
use bot::Dispatcher;
use download::DownloadCoordinator;
use jobs::{JobRegistry, JobState};
use remote::RemoteBrowser;
use sync::Rclone;
use telegram::TelegramTransport;
use transport::ChatTransport;
use upload::UploadCoordinator;
use user_config::ConfigStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Start a private aria2 daemon listening on the configured RPC port
fn spawn_aria2(config: &config::Config) -> std::io::Result<Child> {
    let mut command = Command::new("aria2c");
    command
        .arg("--enable-rpc")
        .arg(format!("--rpc-listen-port={}", config.aria2.rpc_port()))
        .arg("--dir")
        .arg(&config.storage.download_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true);
    if let Some(secret) = config.aria2.secret() {
        command.arg(format!("--rpc-secret={secret}"));
    }
    let child = command.spawn()?;
    tracing::info!(pid = ?child.id(), port = config.aria2.rpc_port(), "Started aria2c");
    Ok(child)
}

/// Flag every job and give the owning tasks time to clean up
async fn drain_jobs(registry: &JobRegistry) {
    let flagged = registry.cancel_all();
    if flagged == 0 {
        return;
    }
    tracing::info!(jobs = flagged, "Cancelling jobs before exit");
    // Files waiting for a destination have no task to wait for
    let running = || {
        registry
            .active()
            .into_iter()
            .filter_map(|key| registry.get(&key))
            .filter(|job| job.state != JobState::AwaitingUpload)
            .count()
    };
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while running() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let left = running();
    if left > 0 {
        tracing::warn!(jobs = left, "Exiting with jobs still running");
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ferry=info")),
        )
        .init();
    color_eyre::install()?;

    let config = config::config();
    tokio::fs::create_dir_all(&config.storage.download_dir).await?;
    tokio::fs::create_dir_all(&config.storage.configs_dir).await?;
    tracing::info!(
        downloads = ?config.storage.download_dir,
        configs = ?config.storage.configs_dir,
        "Storage ready"
    );

    let mut aria2_daemon = if config.aria2.spawn_aria2 {
        Some(spawn_aria2(&config)?)
    } else {
        None
    };

    let telegram = Arc::new(TelegramTransport::new(
        &config.telegram.telegram_api,
        &config.telegram.bot_token,
    ));
    let transport: Arc<dyn ChatTransport> = telegram.clone();
    let registry = JobRegistry::new();
    let configs = ConfigStore::new(&config.storage.configs_dir);
    let rclone = Rclone::new(&config.storage.rclone_bin);
    let tuning = config.tuning();

    let aria2: Arc<dyn DownloadBackend> =
        Arc::new(Aria2Backend::new(&config.aria2.aria2_rpc, config.aria2.secret()));
    let extractor: Arc<dyn DownloadBackend> =
        Arc::new(ExtractorBackend::new(&config.storage.ytdlp_bin));

    let dispatcher = Dispatcher::new(
        transport.clone(),
        registry.clone(),
        DownloadCoordinator::new(registry.clone(), transport.clone(), tuning),
        UploadCoordinator::new(
            registry.clone(),
            transport.clone(),
            rclone.clone(),
            configs.clone(),
            tuning.throttle,
        )
        .with_upload_limit(config.telegram.upload_limit()),
        RemoteBrowser::new(rclone, configs.clone()),
        configs,
        aria2,
        extractor,
        config.storage.download_dir.clone(),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received ctrl-c, shutting down"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                return;
            }
        }
        signal.cancel();
    });

    dispatcher.run(&telegram, shutdown).await;
    drain_jobs(&registry).await;

    if let Some(daemon) = aria2_daemon.as_mut() {
        if let Err(e) = daemon.start_kill() {
            tracing::debug!(error = %e, "aria2c already exited");
        }
        let status = daemon.wait().await?;
        tracing::info!(status = %status, "aria2c stopped");
    }

    Ok(())
}
