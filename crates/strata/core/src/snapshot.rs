//! Persisted form of the protocol state, handed to a durable-storage collaborator.

use crate::error::VaultError;
use crate::events::JournalEntry;
use crate::governance::Proposal;
use crate::ledger::{Account, VaultState};
use crate::oracle::PricePoint;
use crate::risk::RiskProfile;
use crate::strategy::StrategyRecord;
use crate::types::AssetType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub taken_at: DateTime<Utc>,
    pub accounts: Vec<Account>,
    pub vault: VaultState,
    pub strategies: Vec<StrategyRecord>,
    pub risk_profiles: Vec<RiskProfile>,
    pub proposals: Vec<Proposal>,
    pub next_proposal_id: u64,
    #[serde(default)]
    pub oracle_history: BTreeMap<AssetType, Vec<PricePoint>>,
    /// Event journal; a restored engine keeps appending to this chain.
    #[serde(default)]
    pub journal: Vec<JournalEntry>,
}

impl VaultSnapshot {
    pub fn to_json(&self) -> Result<String, VaultError> {
        serde_json::to_string_pretty(self).map_err(|e| VaultError::Serialization(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, VaultError> {
        serde_json::from_str(raw).map_err(|e| VaultError::Serialization(e.to_string()))
    }
}

#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn persist(&self, snapshot: &VaultSnapshot) -> Result<(), VaultError>;
}
