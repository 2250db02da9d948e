//! Price sources: a fixed in-memory table and a JSON feed file.

use crate::error::AdapterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use strata_core::{AssetType, Clock, OracleReading, Price, PriceSource, VaultError};
use tracing::debug;

/// Quotes a configured price per asset, stamped with the current clock time.
pub struct StaticPriceSource {
    id: String,
    prices: RwLock<BTreeMap<AssetType, Price>>,
    clock: Arc<dyn Clock>,
}

impl StaticPriceSource {
    pub fn new(id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: id.into(),
            prices: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    pub fn with_price(self, asset: AssetType, price: Price) -> Self {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(asset, price);
        }
        self
    }

    pub fn set_price(&self, asset: AssetType, price: Price) -> Result<(), VaultError> {
        self.prices
            .write()
            .map_err(|_| VaultError::LockPoisoned("static prices"))?
            .insert(asset, price);
        Ok(())
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, asset: AssetType) -> Result<OracleReading, VaultError> {
        let price = self
            .prices
            .read()
            .map_err(|_| VaultError::LockPoisoned("static prices"))?
            .get(&asset)
            .copied()
            .ok_or(AdapterError::MissingReading { asset })
            .map_err(|e| e.into_oracle(&self.id))?;
        Ok(OracleReading {
            asset,
            price,
            observed_at: self.clock.now(),
            source_id: self.id.clone(),
        })
    }
}

/// One line of a feed file. Prices are decimal strings, e.g. `"101.25"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub asset: AssetType,
    pub price: String,
    pub observed_at: DateTime<Utc>,
}

/// Reads a JSON array of [`FeedEntry`] from disk on every fetch and reports
/// the newest entry for the requested asset.
///
/// An external publisher owns the file; stale files surface through the
/// aggregator's age check rather than here.
#[derive(Debug, Clone)]
pub struct FeedFilePriceSource {
    id: String,
    path: PathBuf,
}

impl FeedFilePriceSource {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn latest(&self, asset: AssetType) -> Result<(Price, DateTime<Utc>), AdapterError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AdapterError::io(&self.path, e))?;
        let entries: Vec<FeedEntry> =
            serde_json::from_str(&raw).map_err(|e| AdapterError::MalformedFeed {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

        let entry = entries
            .into_iter()
            .filter(|entry| entry.asset == asset)
            .max_by_key(|entry| entry.observed_at)
            .ok_or(AdapterError::MissingReading { asset })?;
        let price = entry
            .price
            .parse::<Price>()
            .map_err(|message| AdapterError::MalformedFeed {
                path: self.path.clone(),
                message,
            })?;
        Ok((price, entry.observed_at))
    }
}

#[async_trait]
impl PriceSource for FeedFilePriceSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, asset: AssetType) -> Result<OracleReading, VaultError> {
        let (price, observed_at) = self
            .latest(asset)
            .await
            .map_err(|e| e.into_oracle(&self.id))?;
        debug!(source = %self.id, asset = %asset, price = %price, "Feed file read");
        Ok(OracleReading {
            asset,
            price,
            observed_at,
            source_id: self.id.clone(),
        })
    }
}
