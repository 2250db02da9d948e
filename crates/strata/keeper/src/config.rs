use crate::KeeperError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use strata_core::{Amount, EngineConfig, MAX_RISK_SCORE};
use tracing::warn;

/// Keeper daemon configuration. The engine section is nested under `[engine]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub interval_secs: u64,
    pub snapshot_path: Option<PathBuf>,
    pub engine: EngineConfig,
    pub feeds: Vec<FeedConfig>,
    pub venues: Vec<VenueConfig>,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            snapshot_path: None,
            engine: EngineConfig::default(),
            feeds: Vec::new(),
            venues: Vec::new(),
        }
    }
}

/// A JSON feed file registered as one price source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub source: String,
    pub path: PathBuf,
}

/// A simulated venue made available to governance by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueConfig {
    pub venue: String,
    pub apy_bps: u32,
    pub risk_score: u8,
    #[serde(default)]
    pub capacity: Option<Amount>,
}

impl KeeperConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, KeeperError> {
        let config: KeeperConfig =
            toml::from_str(raw).map_err(|e| KeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeeperError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found; using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| KeeperError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), KeeperError> {
        if self.interval_secs == 0 {
            return Err(KeeperError::Config("interval_secs must be positive".into()));
        }
        self.engine.validate()?;

        let mut sources = BTreeSet::new();
        for feed in &self.feeds {
            if !sources.insert(feed.source.as_str()) {
                return Err(KeeperError::Config(format!(
                    "duplicate feed source '{}'",
                    feed.source
                )));
            }
        }
        let mut venues = BTreeSet::new();
        for venue in &self.venues {
            if !venues.insert(venue.venue.as_str()) {
                return Err(KeeperError::Config(format!(
                    "duplicate venue '{}'",
                    venue.venue
                )));
            }
            if venue.risk_score > MAX_RISK_SCORE {
                return Err(KeeperError::Config(format!(
                    "venue '{}' risk score {} above {MAX_RISK_SCORE}",
                    venue.venue, venue.risk_score
                )));
            }
        }
        Ok(())
    }
}
