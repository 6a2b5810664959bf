use anyhow::{bail, Context, Result};
use channel_updater::{
    BuildDescriptor, BuildInfo, ChannelPreference, HttpTransferEngine, JsonSettingsStore,
    SettingsStore, Updater, UpdaterConfig, UpdaterState,
};
use chrono::{NaiveDate, Utc};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Update channel selectable on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChannelArg {
    Stable,
    Beta,
    Nightly,
}

impl From<ChannelArg> for ChannelPreference {
    fn from(value: ChannelArg) -> Self {
        match value {
            ChannelArg::Stable => ChannelPreference::Stable,
            ChannelArg::Beta => ChannelPreference::Beta,
            ChannelArg::Nightly => ChannelPreference::Nightly,
        }
    }
}

/// Command-line arguments for a single update cycle
#[derive(Parser, Debug)]
#[command(version, about = "Check for, download and verify application updates", long_about = None)]
struct Args {
    /// Host serving update.php
    #[arg(long)]
    host: String,

    /// Version of the running build
    #[arg(long = "current-version", default_value = env!("CARGO_PKG_VERSION"))]
    current_version: String,

    /// Build date of the running build (YYYY-MM-DD), needed for nightlies
    #[arg(long)]
    build_date: Option<NaiveDate>,

    /// Override the persisted channel preference
    #[arg(long, value_enum)]
    channel: Option<ChannelArg>,

    /// Directory verified downloads are placed in
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Settings file (JSON)
    #[arg(long, default_value = "updater.json")]
    settings: PathBuf,

    /// PEM root certificate trusted for the version check only
    #[arg(long)]
    trust_anchor: Option<PathBuf>,

    /// Check even if the configured interval has not elapsed
    #[arg(short, long)]
    force: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut store = JsonSettingsStore::open(&args.settings)
        .with_context(|| format!("loading settings from {}", args.settings.display()))?;
    if let Some(channel) = args.channel {
        let mut settings = store.settings().clone();
        settings.channel = channel.into();
        store.persist(settings)?;
    }

    let mut config = UpdaterConfig::new(&args.host);
    if let Some(dir) = &args.download_dir {
        config = config.with_download_dir(dir);
    }

    let (mut engine, mut notifications) = HttpTransferEngine::new()?;
    if let Some(path) = &args.trust_anchor {
        let pem = std::fs::read(path)
            .with_context(|| format!("reading trust anchor {}", path.display()))?;
        engine = engine.with_trust_anchor(&pem)?;
    }

    let build = BuildInfo::new(&args.current_version, args.build_date);
    let mut updater = Updater::new(engine, store, config, build);
    updater.subscribe(|state: UpdaterState, build: &BuildDescriptor| {
        if build.is_empty() {
            println!("{state:?}");
        } else {
            println!("{state:?}: {}", build.version);
        }
    });
    updater.init();

    let started = if args.force {
        updater.run()
    } else {
        updater.run_if_needed(Utc::now())
    };
    if !started {
        if updater.state() == UpdaterState::Failed {
            bail!("could not start update check");
        }
        info!("no check due");
        return Ok(());
    }

    while updater.is_busy() {
        let Some(notification) = notifications.recv().await else {
            warn!("transfer engine went away");
            break;
        };
        updater.on_notification(notification);
    }

    match updater.state() {
        UpdaterState::Failed => bail!("update check failed"),
        UpdaterState::NewVersionReady => {
            if let Some(path) = updater.downloaded_file() {
                println!("ready to install: {}", path.display());
            }
        }
        UpdaterState::NewVersion => {
            println!("new version {} available", updater.available_build().version);
        }
        _ => {}
    }
    if !updater.changelog().is_empty() {
        println!("\n{}", updater.changelog());
    }

    Ok(())
}
