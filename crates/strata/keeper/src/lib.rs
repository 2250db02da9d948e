//! Keeper for the Strata vault: wires feeds and venues into the engine, runs
//! rebalance passes when drift crosses the threshold and persists snapshots.

#![deny(unsafe_code)]

pub mod config;

pub use config::{FeedConfig, KeeperConfig, VenueConfig};

use std::path::PathBuf;
use std::sync::Arc;
use strata_adapters::{
    AdapterError, FeedFilePriceSource, JsonFileSnapshotSink, RecordingCustody, SimulatedVenue,
};
use strata_core::{Clock, RebalanceAction, SystemClock, VaultEngine, VaultError, VaultEvent};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// What a single keeper tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Paused,
    /// Drift below threshold; nothing applied.
    Steady { max_drift_bps: u128 },
    Rebalanced { actions: Vec<RebalanceAction> },
    Aborted {
        applied: usize,
        action: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub snapshot_persisted: bool,
}

pub struct Keeper {
    engine: Arc<VaultEngine>,
    sink: Option<JsonFileSnapshotSink>,
    venues: Vec<Arc<SimulatedVenue>>,
}

impl Keeper {
    pub async fn bootstrap(config: KeeperConfig) -> Result<Self, KeeperError> {
        Self::bootstrap_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Build the engine, restoring from the snapshot file when one exists.
    pub async fn bootstrap_with_clock(
        config: KeeperConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KeeperError> {
        config.validate()?;
        let KeeperConfig {
            snapshot_path,
            engine: engine_config,
            feeds,
            venues,
            ..
        } = config;

        let custody = Arc::new(RecordingCustody::new());
        let sink = snapshot_path.map(JsonFileSnapshotSink::new);
        let restored = match &sink {
            Some(sink) => sink.load().await?,
            None => None,
        };
        let engine = match restored {
            Some(snapshot) => {
                info!(taken_at = %snapshot.taken_at, "Restoring engine from snapshot");
                VaultEngine::restore(engine_config, snapshot, custody)?
            }
            None => VaultEngine::new(engine_config, custody)?,
        }
        .with_clock(clock);

        for feed in feeds {
            engine.register_price_source(Arc::new(FeedFilePriceSource::new(
                feed.source,
                feed.path,
            )))?;
        }

        let mut simulated = Vec::with_capacity(venues.len());
        for venue in venues {
            let mut sim = SimulatedVenue::new(venue.venue, venue.apy_bps, venue.risk_score);
            if let Some(capacity) = venue.capacity {
                sim = sim.with_capacity(capacity);
            }
            let sim = Arc::new(sim);
            engine.register_venue(sim.clone())?;
            simulated.push(sim);
        }

        Ok(Self {
            engine: Arc::new(engine),
            sink,
            venues: simulated,
        })
    }

    pub fn engine(&self) -> &Arc<VaultEngine> {
        &self.engine
    }

    pub fn venues(&self) -> &[Arc<SimulatedVenue>] {
        &self.venues
    }

    /// Preview, rebalance if due, then persist a snapshot when a sink is configured.
    pub async fn tick(&self) -> Result<TickReport, KeeperError> {
        let outcome = self.run_rebalance().await?;
        match &outcome {
            TickOutcome::Paused => info!("Vault paused; skipping rebalance"),
            TickOutcome::Steady { max_drift_bps } => {
                info!(max_drift_bps = *max_drift_bps, "Allocations within drift threshold")
            }
            TickOutcome::Rebalanced { actions } => {
                for action in actions {
                    info!(action = %action, "Rebalance action applied");
                }
            }
            TickOutcome::Aborted {
                applied,
                action,
                reason,
            } => warn!(applied = *applied, action = %action, reason = %reason, "Rebalance aborted"),
        }

        let snapshot_persisted = self.persist_snapshot().await?;
        Ok(TickReport {
            outcome,
            snapshot_persisted,
        })
    }

    async fn run_rebalance(&self) -> Result<TickOutcome, KeeperError> {
        if self.engine.is_paused()? {
            return Ok(TickOutcome::Paused);
        }
        let plan = self.engine.preview_rebalance().await?;
        if !self.engine.is_due(&plan) {
            return Ok(TickOutcome::Steady {
                max_drift_bps: plan.max_drift_bps,
            });
        }

        match self.engine.rebalance().await {
            Ok(actions) => Ok(TickOutcome::Rebalanced { actions }),
            Err(VaultError::ContractPaused) => Ok(TickOutcome::Paused),
            Err(VaultError::RebalanceAborted {
                applied,
                action,
                source,
            }) => Ok(TickOutcome::Aborted {
                applied,
                action,
                reason: source.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns whether a snapshot was written.
    pub async fn persist_snapshot(&self) -> Result<bool, KeeperError> {
        let Some(sink) = &self.sink else {
            return Ok(false);
        };
        self.engine.persist_snapshot(sink).await?;
        Ok(true)
    }
}

/// Log every vault event until the bus closes.
pub async fn log_events(mut events: broadcast::Receiver<VaultEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(detail) => info!(event = event.name(), detail = %detail, "Vault event"),
                Err(err) => error!(event = event.name(), error = %err, "Unserializable vault event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event logger lagged behind the bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::path::Path;
    use strata_adapters::FeedEntry;
    use strata_core::risk::BALANCED;
    use strata_core::{
        Address, AppliedChange, AssetType, ManualClock, ProposalPayload, StrategySpec,
        VoteDirection,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 12, 0, 0).unwrap()
    }

    fn write_feed(path: &Path, observed_at: DateTime<Utc>) {
        let entries: Vec<FeedEntry> = [AssetType::Native, AssetType::Usdc]
            .into_iter()
            .map(|asset| FeedEntry {
                asset,
                price: "1.0".into(),
                observed_at,
            })
            .collect();
        std::fs::write(path, serde_json::to_string(&entries).unwrap()).unwrap();
    }

    fn config(dir: &Path) -> KeeperConfig {
        let raw = format!(
            r#"
interval_secs = 5
snapshot_path = "{snapshot}"

[engine]
emergency_admin = "ops"

[engine.oracle]
min_sources = 1

[[feeds]]
source = "feed-a"
path = "{feed}"

[[venues]]
venue = "lend-usdc"
apy_bps = 450
risk_score = 20
"#,
            snapshot = dir.join("snapshot.json").display(),
            feed = dir.join("feed.json").display(),
        );
        KeeperConfig::from_toml_str(&raw).unwrap()
    }

    async fn add_lend_strategy(keeper: &Keeper, clock: &ManualClock) {
        let engine = keeper.engine();
        let whale = Address::new("whale");
        engine
            .deposit(&whale, AssetType::Native, 1_000_000, BALANCED)
            .await
            .unwrap();
        let id = engine
            .create_proposal(
                &whale,
                "list lend-usdc",
                ProposalPayload::AddStrategy(StrategySpec {
                    name: "usdc lending".into(),
                    venue: "lend-usdc".into(),
                    asset: AssetType::Usdc,
                    max_allocation: 100_000,
                    risk_score: 20,
                    apy_bps: 450,
                }),
                60,
            )
            .await
            .unwrap();
        engine
            .vote(&whale, id, VoteDirection::For, 1_000_000)
            .await
            .unwrap();
        clock.advance(Duration::seconds(61));
        let change = engine.execute_proposal(&whale, id).await.unwrap();
        assert!(matches!(change, AppliedChange::StrategyAdded(_)));
    }

    #[tokio::test]
    async fn tick_rebalances_then_settles_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        write_feed(&dir.path().join("feed.json"), t0());
        let clock = Arc::new(ManualClock::new(t0()));

        let keeper = Keeper::bootstrap_with_clock(config(dir.path()), clock.clone())
            .await
            .unwrap();
        add_lend_strategy(&keeper, &clock).await;
        keeper
            .engine()
            .deposit(&Address::new("alice"), AssetType::Usdc, 10_000, BALANCED)
            .await
            .unwrap();

        let first = keeper.tick().await.unwrap();
        match first.outcome {
            TickOutcome::Rebalanced { ref actions } => assert_eq!(actions.len(), 1),
            ref other => panic!("unexpected outcome {other:?}"),
        }
        assert!(first.snapshot_persisted);
        assert_eq!(keeper.venues()[0].deployed().unwrap(), 3_500);

        let second = keeper.tick().await.unwrap();
        assert!(matches!(second.outcome, TickOutcome::Steady { .. }));

        let restarted = Keeper::bootstrap_with_clock(config(dir.path()), clock.clone())
            .await
            .unwrap();
        let engine = restarted.engine();
        assert_eq!(
            engine
                .balance_of(&Address::new("alice"), AssetType::Usdc)
                .unwrap(),
            10_000
        );
        assert_eq!(engine.idle_liquidity(AssetType::Usdc).unwrap(), 6_500);
    }

    #[tokio::test]
    async fn paused_vault_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_feed(&dir.path().join("feed.json"), t0());
        let clock = Arc::new(ManualClock::new(t0()));
        let keeper = Keeper::bootstrap_with_clock(config(dir.path()), clock)
            .await
            .unwrap();
        keeper
            .engine()
            .emergency_pause(&Address::new("ops"))
            .unwrap();

        let report = keeper.tick().await.unwrap();
        assert_eq!(report.outcome, TickOutcome::Paused);
    }

    #[tokio::test]
    async fn missing_feed_keeps_funds_liquid() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let keeper = Keeper::bootstrap_with_clock(config(dir.path()), clock.clone())
            .await
            .unwrap();
        write_feed(&dir.path().join("feed.json"), t0());
        add_lend_strategy(&keeper, &clock).await;
        keeper
            .engine()
            .deposit(&Address::new("alice"), AssetType::Usdc, 10_000, BALANCED)
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("feed.json")).unwrap();

        let report = keeper.tick().await.unwrap();
        assert_eq!(report.outcome, TickOutcome::Steady { max_drift_bps: 0 });
        assert_eq!(
            keeper.engine().idle_liquidity(AssetType::Usdc).unwrap(),
            10_000
        );
    }
}
