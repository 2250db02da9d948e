//! Multi-source price aggregation with stale/outlier rejection.
//!
//! Sources are fetched concurrently and the readings are evaluated in a
//! synchronous step afterwards, so no engine lock is ever held across a fetch.

use crate::config::OracleConfig;
use crate::error::VaultError;
use crate::math;
use crate::types::{AssetType, Price};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleReading {
    pub asset: AssetType,
    pub price: Price,
    pub observed_at: DateTime<Utc>,
    pub source_id: String,
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, asset: AssetType) -> Result<OracleReading, VaultError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: Price,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedReading {
    pub source_id: String,
    pub reason: String,
}

/// Accepted consensus for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPrice {
    pub asset: AssetType,
    pub price: Price,
    /// Newest timestamp among the accepted readings.
    pub observed_at: DateTime<Utc>,
    pub sources_used: usize,
    pub rejected: Vec<RejectedReading>,
    /// Rolling average the readings were checked against, if any history existed.
    pub reference_average: Option<Price>,
    /// Deviation of the consensus from the updated rolling average.
    pub volatility_bps: u128,
}

/// Bounded per-asset history of accepted consensus prices.
#[derive(Debug, Clone, Default)]
struct PriceHistory {
    window: usize,
    points: BTreeMap<AssetType, VecDeque<PricePoint>>,
}

impl PriceHistory {
    fn new(window: usize) -> Self {
        Self {
            window,
            points: BTreeMap::new(),
        }
    }

    fn average(&self, asset: AssetType) -> Result<Option<Price>, VaultError> {
        let Some(points) = self.points.get(&asset).filter(|p| !p.is_empty()) else {
            return Ok(None);
        };
        let total = math::sum(points.iter().map(|p| p.price.raw()), "price average")?;
        Ok(Some(Price::from_raw(total / points.len() as u128)))
    }

    /// Append unless the point is not newer than the last one recorded.
    fn record(&mut self, asset: AssetType, point: PricePoint) -> bool {
        let points = self.points.entry(asset).or_default();
        if points
            .back()
            .is_some_and(|last| point.observed_at <= last.observed_at)
        {
            return false;
        }
        points.push_back(point);
        while points.len() > self.window {
            points.pop_front();
        }
        true
    }
}

pub struct OracleAggregator {
    config: OracleConfig,
    sources: RwLock<Vec<Arc<dyn PriceSource>>>,
    history: Mutex<PriceHistory>,
}

impl OracleAggregator {
    pub fn new(config: OracleConfig) -> Self {
        let window = config.history_window;
        Self {
            config,
            sources: RwLock::new(Vec::new()),
            history: Mutex::new(PriceHistory::new(window)),
        }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn register_source(&self, source: Arc<dyn PriceSource>) -> Result<(), VaultError> {
        let mut sources = self
            .sources
            .write()
            .map_err(|_| VaultError::LockPoisoned("oracle sources"))?;
        sources.retain(|existing| existing.source_id() != source.source_id());
        sources.push(source);
        Ok(())
    }

    pub fn source_count(&self) -> usize {
        self.sources.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Fetch every source concurrently and reduce the readings to a consensus.
    pub async fn consensus_price(
        &self,
        asset: AssetType,
        now: DateTime<Utc>,
    ) -> Result<ConsensusPrice, VaultError> {
        let sources: Vec<Arc<dyn PriceSource>> = self
            .sources
            .read()
            .map_err(|_| VaultError::LockPoisoned("oracle sources"))?
            .clone();

        let results = join_all(sources.iter().map(|source| async move {
            (source.source_id().to_string(), source.fetch(asset).await)
        }))
        .await;

        self.evaluate(asset, results, now)
    }

    /// Filter fetched readings and take the lower median of the survivors.
    pub fn evaluate(
        &self,
        asset: AssetType,
        results: Vec<(String, Result<OracleReading, VaultError>)>,
        now: DateTime<Utc>,
    ) -> Result<ConsensusPrice, VaultError> {
        let mut history = self
            .history
            .lock()
            .map_err(|_| VaultError::LockPoisoned("price history"))?;
        let reference = history.average(asset)?;

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for (source_id, result) in results {
            match self.screen(asset, &source_id, result, reference, now) {
                Ok(reading) => accepted.push(reading),
                Err(err) if err.is_reading_rejection() => {
                    warn!(asset = %asset, source = %source_id, error = %err, "Oracle reading dropped");
                    rejected.push(RejectedReading {
                        source_id,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        if accepted.len() < self.config.min_sources {
            return Err(VaultError::InsufficientOracleSources {
                asset,
                available: accepted.len(),
                required: self.config.min_sources,
            });
        }

        accepted.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.source_id.cmp(&b.source_id)));
        let price = accepted[(accepted.len() - 1) / 2].price;
        let observed_at = accepted
            .iter()
            .map(|reading| reading.observed_at)
            .max()
            .unwrap_or(now);

        history.record(asset, PricePoint { price, observed_at });
        let volatility_bps = history
            .average(asset)?
            .map(|average| price.deviation_bps(average))
            .unwrap_or(0);

        debug!(
            asset = %asset,
            price = %price,
            sources = accepted.len(),
            rejected = rejected.len(),
            volatility_bps,
            "Consensus price accepted"
        );
        Ok(ConsensusPrice {
            asset,
            price,
            observed_at,
            sources_used: accepted.len(),
            rejected,
            reference_average: reference,
            volatility_bps,
        })
    }

    fn screen(
        &self,
        asset: AssetType,
        source_id: &str,
        result: Result<OracleReading, VaultError>,
        reference: Option<Price>,
        now: DateTime<Utc>,
    ) -> Result<OracleReading, VaultError> {
        let reading = result.map_err(|err| match err {
            err @ VaultError::OracleSource { .. } => err,
            other => VaultError::OracleSource {
                source_id: source_id.to_string(),
                message: other.to_string(),
            },
        })?;
        if reading.asset != asset {
            return Err(VaultError::OracleSource {
                source_id: source_id.to_string(),
                message: format!("returned {} for a {asset} request", reading.asset),
            });
        }

        let age_secs = (now - reading.observed_at).num_seconds().max(0);
        if age_secs > self.config.max_data_age_secs {
            return Err(VaultError::StaleOracleData {
                asset,
                source_id: source_id.to_string(),
                age_secs,
                max_age_secs: self.config.max_data_age_secs,
            });
        }

        if let Some(reference) = reference {
            let deviation_bps = reading.price.deviation_bps(reference);
            if deviation_bps > self.config.max_deviation_bps {
                return Err(VaultError::PriceDeviationTooHigh {
                    asset,
                    source_id: source_id.to_string(),
                    deviation_bps,
                    max_deviation_bps: self.config.max_deviation_bps,
                });
            }
        }
        Ok(reading)
    }

    pub fn rolling_average(&self, asset: AssetType) -> Result<Option<Price>, VaultError> {
        self.history
            .lock()
            .map_err(|_| VaultError::LockPoisoned("price history"))?
            .average(asset)
    }

    /// Warm-start the history, e.g. from a snapshot. Keeps the newest `history_window` points.
    pub fn seed_history(
        &self,
        asset: AssetType,
        points: impl IntoIterator<Item = PricePoint>,
    ) -> Result<(), VaultError> {
        let mut history = self
            .history
            .lock()
            .map_err(|_| VaultError::LockPoisoned("price history"))?;
        let mut points: Vec<PricePoint> = points.into_iter().collect();
        points.sort_by_key(|point| point.observed_at);
        history.points.remove(&asset);
        for point in points {
            history.record(asset, point);
        }
        Ok(())
    }

    pub fn history(&self, asset: AssetType) -> Vec<PricePoint> {
        self.history
            .lock()
            .map(|history| {
                history
                    .points
                    .get(&asset)
                    .map(|points| points.iter().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn history_snapshot(&self) -> Result<BTreeMap<AssetType, Vec<PricePoint>>, VaultError> {
        let history = self
            .history
            .lock()
            .map_err(|_| VaultError::LockPoisoned("price history"))?;
        Ok(history
            .points
            .iter()
            .map(|(asset, points)| (*asset, points.iter().copied().collect()))
            .collect())
    }
}
