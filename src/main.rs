use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

mod builder;
mod config;
mod conversation;
mod downloader;
mod request;
mod status;
mod telegram;

use builder::Builder;
use config::BotConfig;
use conversation::Controller;
use downloader::{BasePackage, FetchOutcome};
use request::{TargetUrl, UserId};
use status::{format_bytes, Diagnostics};

#[derive(Parser)]
#[command(name = "magnet-bot")]
#[command(about = "A chat bot that personalizes and re-signs an Android package per user", long_about = None)]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file (default: search for magnet.json upwards)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat bot
    Run,
    /// Download or verify the base package
    Fetch,
    /// Show environment readiness
    Status,
    /// Personalize the base package locally without the chat bot
    Build {
        /// User identifier to embed
        #[arg(long)]
        id: u64,
        /// URL to embed (must start with http:// or https://)
        #[arg(long)]
        url: String,
        /// Directory to place the signed package in
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Write a template configuration file
    Init {
        /// Path to create the configuration file (default: current directory)
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::new();
    logger.filter_level(log::LevelFilter::Info);
    if !matches!(cli.command, Commands::Run) {
        logger.format_timestamp(None);
    }
    logger.parse_default_env().init();

    if let Commands::Init { path } = &cli.command {
        return init_config(path.clone()).await;
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Fetch => fetch(&config).await?,
        Commands::Status => Diagnostics::new(&config).report().await.print(),
        Commands::Build { id, url, output } => build(config, id, &url, output).await?,
        Commands::Init { .. } => {}
    }

    Ok(())
}

fn load_config(explicit: Option<&std::path::Path>) -> Result<BotConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => config::find_config_file(std::env::current_dir()?),
    };
    if let Some(path) = &path {
        info!("→ Using configuration: {}", path.display());
    }
    Ok(BotConfig::load(path.as_deref())?)
}

async fn init_config(path: PathBuf) -> Result<()> {
    info!("Initializing magnet-bot configuration...");

    let config_path = if path.is_dir() {
        path.join(config::CONFIG_FILE_NAME)
    } else {
        path
    };

    if config_path.exists() {
        warn!("Configuration file already exists!");
        return Ok(());
    }

    let config_json = serde_json::to_string_pretty(&BotConfig::template())?;
    tokio::fs::write(&config_path, config_json).await?;

    info!("✓ Created configuration file: {}", config_path.display());
    Ok(())
}

async fn run(config: BotConfig) -> Result<()> {
    let token = config.require_token()?.to_string();

    let base = Arc::new(BasePackage::new(&config));
    if let Err(e) = base.ensure().await {
        error!("Failed to get base APK: {e}");
        warn!("The bot will retry the download before the next personalization");
    }

    let diagnostics = Diagnostics::new(&config);
    let controller = Arc::new(Controller::new(Builder::new(config, base), diagnostics));
    telegram::run_bot(&token, controller).await;

    info!("Bot stopped");
    Ok(())
}

async fn fetch(config: &BotConfig) -> Result<()> {
    let base = BasePackage::new(config);
    let outcome = base
        .ensure()
        .await
        .context("Failed to get base APK")?;

    match outcome {
        FetchOutcome::AlreadyPresent => info!("✓ Base APK already exists: {}", base.path().display()),
        FetchOutcome::Downloaded { bytes } => info!(
            "✓ Base APK downloaded successfully ({})",
            format_bytes(bytes)
        ),
        FetchOutcome::Replaced { bytes } => info!(
            "✓ Invalid base APK replaced ({})",
            format_bytes(bytes)
        ),
    }
    Ok(())
}

async fn build(config: BotConfig, id: u64, url: &str, output: PathBuf) -> Result<()> {
    let url = TargetUrl::parse(url).with_context(|| format!("Rejected URL: {url}"))?;

    let base = Arc::new(BasePackage::new(&config));
    let builder = Builder::new(config, base);
    let artifact = builder.personalize(UserId(id), &url).await?;

    tokio::fs::create_dir_all(&output).await?;
    let destination = output.join(artifact.file_name());
    let copied = tokio::fs::copy(artifact.path(), &destination).await;
    artifact.discard();
    copied.with_context(|| format!("Failed to copy APK to {}", destination.display()))?;

    info!("✓ Successfully built: {}", destination.display());
    Ok(())
}
