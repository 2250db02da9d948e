use crate::error::VaultError;
use crate::types::{Address, Amount, AssetType};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity allowed to pause and unpause the vault.
    pub emergency_admin: Address,
    /// Asset whose ledger balance is an account's voting power.
    pub governance_asset: AssetType,
    pub ledger: LedgerConfig,
    pub oracle: OracleConfig,
    pub governance: GovernanceConfig,
    pub rebalance: RebalanceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            emergency_admin: Address::new("admin"),
            governance_asset: AssetType::Native,
            ledger: LedgerConfig::default(),
            oracle: OracleConfig::default(),
            governance: GovernanceConfig::default(),
            rebalance: RebalanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Per-account, per-asset withdrawal cap within one window.
    pub daily_withdrawal_cap: Amount,
    pub withdrawal_window_secs: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            daily_withdrawal_cap: 1_000_000_000,
            withdrawal_window_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub max_data_age_secs: i64,
    /// Maximum deviation from the rolling average before a reading is dropped.
    pub max_deviation_bps: u128,
    pub min_sources: usize,
    /// Number of consensus periods kept for the rolling average.
    pub history_window: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            max_data_age_secs: 300,
            max_deviation_bps: 1_000,
            min_sources: 3,
            history_window: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Voting power required to submit a proposal.
    pub min_proposal_power: Amount,
    pub quorum_required: Amount,
    /// Zero makes new proposals Active immediately.
    pub voting_delay_secs: i64,
    pub min_voting_window_secs: i64,
    pub max_voting_window_secs: i64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            min_proposal_power: 1,
            quorum_required: 500_000,
            voting_delay_secs: 0,
            min_voting_window_secs: 60,
            max_voting_window_secs: 30 * 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Drift (bps of an asset's deposits) that makes a pass due.
    pub drift_threshold_bps: u128,
    /// Deltas smaller than this are not worth an action.
    pub min_action_amount: Amount,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            drift_threshold_bps: 100,
            min_action_amount: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, VaultError> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| VaultError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, falling back to defaults when the file is absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| VaultError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if self.emergency_admin.as_str().is_empty() {
            return Err(VaultError::Config("emergency_admin must be set".into()));
        }
        if self.ledger.withdrawal_window_secs <= 0 {
            return Err(VaultError::Config(
                "ledger.withdrawal_window_secs must be positive".into(),
            ));
        }
        if self.oracle.min_sources == 0 {
            return Err(VaultError::Config("oracle.min_sources must be at least 1".into()));
        }
        if self.oracle.history_window == 0 {
            return Err(VaultError::Config(
                "oracle.history_window must be at least 1".into(),
            ));
        }
        if self.oracle.max_data_age_secs <= 0 {
            return Err(VaultError::Config(
                "oracle.max_data_age_secs must be positive".into(),
            ));
        }
        if self.governance.voting_delay_secs < 0 {
            return Err(VaultError::Config(
                "governance.voting_delay_secs cannot be negative".into(),
            ));
        }
        if self.governance.min_voting_window_secs <= 0
            || self.governance.min_voting_window_secs > self.governance.max_voting_window_secs
        {
            return Err(VaultError::Config(
                "governance voting window bounds are inconsistent".into(),
            ));
        }
        Ok(())
    }
}
