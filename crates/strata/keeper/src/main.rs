use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use strata_keeper::{log_events, Keeper, KeeperConfig};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "stratad", version, about = "Strata vault keeper")]
struct Cli {
    /// TOML config file; defaults apply when it does not exist.
    #[arg(long, default_value = "strata.toml", env = "STRATA_CONFIG")]
    config: PathBuf,
    /// Seconds between rebalance checks. Overrides `interval_secs`.
    #[arg(long, env = "STRATA_INTERVAL_SECS")]
    interval_secs: Option<u64>,
    /// Snapshot file. Overrides `snapshot_path`.
    #[arg(long, env = "STRATA_SNAPSHOT")]
    snapshot: Option<PathBuf>,
    /// Run a single tick and exit.
    #[arg(long, default_value_t = false, env = "STRATA_ONCE")]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "strata_keeper=info,strata_core=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = KeeperConfig::load(&cli.config)?;
    if let Some(interval_secs) = cli.interval_secs {
        config.interval_secs = interval_secs;
    }
    if let Some(snapshot) = cli.snapshot {
        config.snapshot_path = Some(snapshot);
    }
    let interval = Duration::from_secs(config.interval_secs);

    let keeper = Keeper::bootstrap(config).await?;
    let logger = tokio::spawn(log_events(keeper.engine().subscribe()));

    if cli.once {
        keeper.tick().await?;
        tokio::task::yield_now().await;
        logger.abort();
        return Ok(());
    }

    info!(interval_secs = interval.as_secs(), "stratad keeper running");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = keeper.tick().await {
                    error!(error = %err, "Keeper tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    keeper.persist_snapshot().await?;
    logger.abort();
    Ok(())
}
