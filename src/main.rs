use anyhow::{Context, Result};
use clap::Parser;
use serverset_core::{AppConfig, LogFormat, LoggingConfig};
use serverset_discovery::{DiscoveryCoordinator, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// serverset-sd - Serverset service discovery, one JSON target group per line
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// YAML fixture to seed the in-memory coordination store with
    #[arg(short, long, env = "SERVERSET_SD_SEED")]
    seed: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_config_builder(&args.config)
        .with_context(|| format!("Failed to load config file: {:?}", args.config))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging)?;
    info!("Configuration loaded from {:?}", args.config);

    let store = MemoryStore::new();
    if let Some(seed) = &args.seed {
        let fixture = std::fs::read_to_string(seed)
            .with_context(|| format!("Failed to read seed file: {:?}", seed))?;
        let members = store
            .seed_from_yaml(&fixture, &config.serverset.member_prefix)
            .context("Failed to seed coordination store")?;
        info!(members, "Seeded coordination store from {:?}", seed);
    }

    let coordinator = DiscoveryCoordinator::new(config.serverset.clone(), Arc::new(store))?;
    let (tx, rx) = async_channel::bounded(config.serverset.queue_depth);
    let done = CancellationToken::new();
    let mut discovery = coordinator.start(tx, done.clone())?;

    let printer = tokio::spawn(async move {
        while let Ok(group) = rx.recv().await {
            match serde_json::to_string(&group) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to encode target group for {}: {}", group.source, e),
            }
        }
    });

    let result = tokio::select! {
        result = &mut discovery => result.context("Discovery task failed")?,
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping discovery...");
            done.cancel();
            discovery.await.context("Discovery task failed")?
        }
    };
    printer.await.context("Output task failed")?;

    if let Err(e) = result {
        error!("Discovery error: {}", e);
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let level = logging.parse_level()?;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    // stdout carries the target groups
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
    Ok(())
}
