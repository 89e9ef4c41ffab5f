//! fleetops - Entry Point
//!
//! Runs remote operations on inventory hosts and rolls releases out to
//! deployed instances.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use fleetops::app::options::AppOptions;
use fleetops::app::run::run;
use fleetops::app::state::AppState;
use fleetops::logs::init_logging;
use fleetops::storage::layout::StorageLayout;
use fleetops::storage::settings::Settings;
use fleetops::utils::version_info;

#[derive(Debug, Parser)]
#[command(name = "fleetops", about, disable_version_flag = true)]
struct Cli {
    /// Settings file, defaults to settings.json in the data directory
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Data directory holding inventory, state, artifacts and logs
    #[arg(long, value_name = "DIR", default_value = "/var/lib/fleetops")]
    data_dir: PathBuf,

    /// Print version information and exit
    #[arg(long)]
    version: bool,

    /// Load and validate configuration and inventory, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let version = version_info();
    if cli.version {
        println!("{}", serde_json::to_string_pretty(&version)?);
        return Ok(());
    }

    let layout = StorageLayout::new(&cli.data_dir);
    let settings = load_settings(cli.config.as_ref(), &layout).await?;
    let options = AppOptions::from_settings(&settings, layout);

    if cli.check {
        let state = AppState::init(&options)
            .await
            .context("configuration check failed")?;
        println!("Configuration OK: {}", state.summary().await);
        return Ok(());
    }

    // Held until exit so buffered file logs are flushed
    let _log_guard = match init_logging(options.logging.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    info!(version = %version.version, git_hash = %version.git_hash, "Running fleetops");
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Engine stopped with an error: {e}");
        return Err(e.into());
    }
    Ok(())
}

async fn load_settings(
    config: Option<&PathBuf>,
    layout: &StorageLayout,
) -> anyhow::Result<Settings> {
    let file = match config {
        Some(path) => fleetops::filesys::file::File::new(path),
        None => layout.settings_file(),
    };

    if !file.exists().await {
        if config.is_some() {
            anyhow::bail!("settings file {} does not exist", file.path().display());
        }
        return Ok(Settings::default());
    }

    file.read_json::<Settings>()
        .await
        .with_context(|| format!("unable to read settings file {}", file.path().display()))
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                _ => {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Ctrl+C received, shutting down...");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
