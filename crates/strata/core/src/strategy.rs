//! Strategy registry and the venue interface strategies implement.
//!
//! Records are arena-style: keyed by [`StrategyId`], referring to their venue
//! by name. Membership changes (`register`, `deactivate`, `update_limits`) are
//! crate-private and reachable only from governance execution.

use crate::error::VaultError;
use crate::math;
use crate::risk::MAX_RISK_SCORE;
use crate::types::{Amount, AssetType, StrategyId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// A yield venue the vault can deploy funds into.
///
/// New strategy kinds implement this trait; the core never special-cases a venue type.
#[async_trait]
pub trait YieldStrategy: Send + Sync {
    /// Registry key governance proposals refer to.
    fn venue(&self) -> &str;

    async fn allocate(&self, amount: Amount) -> Result<(), VaultError>;

    /// Withdraw `amount` from the venue, returning what was freed.
    async fn deallocate(&self, amount: Amount) -> Result<Amount, VaultError>;

    async fn apy_bps(&self) -> Result<u32, VaultError>;

    async fn risk_score(&self) -> Result<u8, VaultError>;

    async fn tvl(&self) -> Result<Amount, VaultError>;
}

/// Operator-registered venue implementations.
#[derive(Default)]
pub struct VenueRegistry {
    venues: HashMap<String, Arc<dyn YieldStrategy>>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self {
            venues: HashMap::new(),
        }
    }

    pub fn register(&mut self, venue: Arc<dyn YieldStrategy>) {
        self.venues.insert(venue.venue().to_string(), venue);
    }

    pub fn get(&self, venue: &str) -> Option<Arc<dyn YieldStrategy>> {
        self.venues.get(venue).cloned()
    }

    pub fn has(&self, venue: &str) -> bool {
        self.venues.contains_key(venue)
    }
}

/// Parameters of a strategy addition proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub name: String,
    pub venue: String,
    pub asset: AssetType,
    pub max_allocation: Amount,
    pub risk_score: u8,
    #[serde(default)]
    pub apy_bps: u32,
}

impl StrategySpec {
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.name.trim().is_empty() || self.venue.trim().is_empty() {
            return Err(VaultError::InvalidParameter(
                "strategy name and venue are required".into(),
            ));
        }
        validate_risk_score(self.risk_score)
    }
}

fn validate_risk_score(risk_score: u8) -> Result<(), VaultError> {
    if risk_score > MAX_RISK_SCORE {
        return Err(VaultError::InvalidParameter(format!(
            "risk score {risk_score} exceeds {MAX_RISK_SCORE}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: StrategyId,
    pub name: String,
    pub venue: String,
    pub asset: AssetType,
    pub active: bool,
    pub max_allocation: Amount,
    /// Governance-set score. Only proposal execution writes it.
    pub risk_score: u8,
    pub apy_bps: u32,
    pub allocated: Amount,
    /// Last score the venue reported about itself.
    #[serde(default)]
    pub reported_risk_score: Option<u8>,
}

impl StrategyRecord {
    pub fn headroom(&self) -> Amount {
        self.max_allocation.saturating_sub(self.allocated)
    }

    /// Score used for ceilings and weighting. A venue report can raise the
    /// governance score but never lower it.
    pub fn effective_risk_score(&self) -> u8 {
        self.reported_risk_score
            .map_or(self.risk_score, |reported| reported.max(self.risk_score))
    }
}

/// Live metrics read from a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyQuote {
    pub apy_bps: u32,
    pub risk_score: u8,
    pub tvl: Amount,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyRegistry {
    records: BTreeMap<StrategyId, StrategyRecord>,
    next_id: u64,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Rebuild from persisted records, checking `allocated <= max_allocation`.
    pub fn from_records(records: impl IntoIterator<Item = StrategyRecord>) -> Result<Self, VaultError> {
        let records: BTreeMap<StrategyId, StrategyRecord> = records
            .into_iter()
            .map(|record| (record.id, record))
            .collect();
        if let Some(record) = records.values().find(|r| r.allocated > r.max_allocation) {
            return Err(VaultError::InvariantViolation(format!(
                "{} allocated {} above max {}",
                record.id, record.allocated, record.max_allocation
            )));
        }
        let next_id = records.keys().map(|id| id.0).max().unwrap_or(0) + 1;
        Ok(Self { records, next_id })
    }

    pub fn get(&self, id: StrategyId) -> Option<&StrategyRecord> {
        self.records.get(&id)
    }

    pub fn require(&self, id: StrategyId) -> Result<&StrategyRecord, VaultError> {
        self.records.get(&id).ok_or(VaultError::UnknownStrategy(id))
    }

    pub fn records(&self) -> impl Iterator<Item = &StrategyRecord> {
        self.records.values()
    }

    /// Σ allocated across strategies of `asset`, active or not.
    pub fn allocated_total(&self, asset: AssetType) -> Result<Amount, VaultError> {
        math::sum(
            self.records
                .values()
                .filter(|record| record.asset == asset)
                .map(|record| record.allocated),
            "allocated total",
        )
    }

    pub(crate) fn register(&mut self, spec: &StrategySpec) -> Result<StrategyRecord, VaultError> {
        spec.validate()?;
        let id = StrategyId(self.next_id);
        let record = StrategyRecord {
            id,
            name: spec.name.clone(),
            venue: spec.venue.clone(),
            asset: spec.asset,
            active: true,
            max_allocation: spec.max_allocation,
            risk_score: spec.risk_score,
            apy_bps: spec.apy_bps,
            allocated: 0,
            reported_risk_score: None,
        };
        self.records.insert(id, record.clone());
        self.next_id += 1;
        info!(strategy = %id, venue = %spec.venue, asset = %spec.asset, "Strategy registered");
        Ok(record)
    }

    /// Deactivated records stay in the arena; the next rebalance drains them.
    pub(crate) fn deactivate(&mut self, id: StrategyId) -> Result<StrategyRecord, VaultError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(VaultError::UnknownStrategy(id))?;
        record.active = false;
        info!(strategy = %id, allocated = record.allocated, "Strategy deactivated");
        Ok(record.clone())
    }

    pub(crate) fn update_limits(
        &mut self,
        id: StrategyId,
        max_allocation: Option<Amount>,
        risk_score: Option<u8>,
    ) -> Result<StrategyRecord, VaultError> {
        if let Some(score) = risk_score {
            validate_risk_score(score)?;
        }
        let record = self
            .records
            .get_mut(&id)
            .ok_or(VaultError::UnknownStrategy(id))?;
        if let Some(max) = max_allocation {
            if max < record.allocated {
                return Err(VaultError::InvalidParameter(format!(
                    "{id} max allocation {max} below currently allocated {}",
                    record.allocated
                )));
            }
            record.max_allocation = max;
        }
        if let Some(score) = risk_score {
            record.risk_score = score;
        }
        Ok(record.clone())
    }

    /// Commit step of `allocate`: re-validated against the latest record.
    ///
    /// `risk_ceiling` is the ceiling of the cohort being allocated; `idle` is the
    /// vault's undeployed liquidity in the strategy's asset.
    pub fn reserve(
        &mut self,
        id: StrategyId,
        amount: Amount,
        risk_ceiling: u8,
        idle: Amount,
    ) -> Result<StrategyRecord, VaultError> {
        if amount == 0 {
            return Err(VaultError::InvalidAmount {
                amount,
                reason: "allocation must be positive",
            });
        }
        let record = self
            .records
            .get_mut(&id)
            .ok_or(VaultError::UnknownStrategy(id))?;
        if !record.active {
            return Err(VaultError::StrategyInactive(id));
        }
        let next = math::add(record.allocated, amount, "strategy allocation")?;
        if next > record.max_allocation {
            return Err(VaultError::ExceedsMaxAllocation {
                strategy: id,
                requested: amount,
                available: record.headroom(),
            });
        }
        let risk_score = record.effective_risk_score();
        if risk_score > risk_ceiling {
            return Err(VaultError::RiskTooHigh {
                strategy: id,
                risk_score,
                ceiling: risk_ceiling,
            });
        }
        if amount > idle {
            return Err(VaultError::InsufficientLiquidity {
                asset: record.asset,
                requested: amount,
                available: idle,
            });
        }

        record.allocated = next;
        debug!(strategy = %id, amount, allocated = next, "Allocation reserved");
        Ok(record.clone())
    }

    /// Commit step of `deallocate`: decrements before the venue is touched.
    pub fn release(&mut self, id: StrategyId, amount: Amount) -> Result<StrategyRecord, VaultError> {
        if amount == 0 {
            return Err(VaultError::InvalidAmount {
                amount,
                reason: "deallocation must be positive",
            });
        }
        let record = self
            .records
            .get_mut(&id)
            .ok_or(VaultError::UnknownStrategy(id))?;
        if amount > record.allocated {
            return Err(VaultError::ExceedsMaxAllocation {
                strategy: id,
                requested: amount,
                available: record.allocated,
            });
        }
        record.allocated -= amount;
        debug!(strategy = %id, amount, allocated = record.allocated, "Allocation released");
        Ok(record.clone())
    }

    /// Put back an allocation whose venue withdrawal failed. Skips the
    /// active/risk checks since the funds never left the venue.
    pub(crate) fn restore(&mut self, id: StrategyId, amount: Amount) -> Result<(), VaultError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(VaultError::UnknownStrategy(id))?;
        record.allocated = math::add(record.allocated, amount, "strategy allocation")?;
        Ok(())
    }

    pub(crate) fn refresh_metrics(&mut self, id: StrategyId, quote: &StrategyQuote) {
        if let Some(record) = self.records.get_mut(&id) {
            record.apy_bps = quote.apy_bps;
            let reported = quote.risk_score.min(MAX_RISK_SCORE);
            if reported != record.risk_score {
                debug!(strategy = %id, governed = record.risk_score, reported, "Venue reports a different risk score");
            }
            record.reported_risk_score = Some(reported);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(max_allocation: Amount, risk_score: u8) -> StrategySpec {
        StrategySpec {
            name: "usdc lending".into(),
            venue: "lend-usdc".into(),
            asset: AssetType::Usdc,
            max_allocation,
            risk_score,
            apy_bps: 500,
        }
    }

    #[test]
    fn reserve_enforces_max_allocation() {
        let mut registry = StrategyRegistry::new();
        let id = registry.register(&spec(1_000, 20)).unwrap().id;
        registry.reserve(id, 800, 60, 10_000).unwrap();

        let err = registry.reserve(id, 300, 60, 10_000).unwrap_err();
        assert!(matches!(
            err,
            VaultError::ExceedsMaxAllocation {
                requested: 300,
                available: 200,
                ..
            }
        ));
        assert_eq!(registry.get(id).unwrap().allocated, 800);
    }

    #[test]
    fn reserve_checks_cohort_ceiling() {
        let mut registry = StrategyRegistry::new();
        let id = registry.register(&spec(1_000, 70)).unwrap().id;
        let err = registry.reserve(id, 100, 30, 10_000).unwrap_err();
        assert!(matches!(
            err,
            VaultError::RiskTooHigh {
                risk_score: 70,
                ceiling: 30,
                ..
            }
        ));
    }

    #[test]
    fn inactive_strategies_refuse_allocations() {
        let mut registry = StrategyRegistry::new();
        let id = registry.register(&spec(1_000, 20)).unwrap().id;
        registry.deactivate(id).unwrap();
        assert!(matches!(
            registry.reserve(id, 1, 100, 10),
            Err(VaultError::StrategyInactive(_))
        ));
        assert!(registry.get(id).is_some());
    }

    #[test]
    fn reserve_needs_idle_liquidity() {
        let mut registry = StrategyRegistry::new();
        let id = registry.register(&spec(1_000, 20)).unwrap().id;
        assert!(matches!(
            registry.reserve(id, 500, 60, 499),
            Err(VaultError::InsufficientLiquidity { available: 499, .. })
        ));
    }

    #[test]
    fn release_cannot_exceed_allocated() {
        let mut registry = StrategyRegistry::new();
        let id = registry.register(&spec(1_000, 20)).unwrap().id;
        registry.reserve(id, 400, 60, 10_000).unwrap();

        let err = registry.release(id, 401).unwrap_err();
        assert!(matches!(
            err,
            VaultError::ExceedsMaxAllocation { available: 400, .. }
        ));
        assert_eq!(registry.release(id, 150).unwrap().allocated, 250);
    }

    #[test]
    fn lowering_cap_below_allocation_is_rejected() {
        let mut registry = StrategyRegistry::new();
        let id = registry.register(&spec(1_000, 20)).unwrap().id;
        registry.reserve(id, 600, 60, 10_000).unwrap();
        assert!(registry.update_limits(id, Some(500), None).is_err());
        assert_eq!(
            registry.update_limits(id, Some(700), Some(25)).unwrap().risk_score,
            25
        );
    }

    #[test]
    fn venue_reports_never_lower_the_governed_score() {
        let mut registry = StrategyRegistry::new();
        let id = registry.register(&spec(1_000, 70)).unwrap().id;
        let quote = StrategyQuote {
            apy_bps: 900,
            risk_score: 10,
            tvl: 0,
        };
        registry.refresh_metrics(id, &quote);

        let record = registry.get(id).unwrap();
        assert_eq!(record.risk_score, 70);
        assert_eq!(record.reported_risk_score, Some(10));
        assert_eq!(record.effective_risk_score(), 70);
        assert!(matches!(
            registry.reserve(id, 100, 30, 10_000),
            Err(VaultError::RiskTooHigh { risk_score: 70, .. })
        ));

        registry.refresh_metrics(
            id,
            &StrategyQuote {
                risk_score: 85,
                ..quote
            },
        );
        assert_eq!(registry.get(id).unwrap().effective_risk_score(), 85);
    }

    #[test]
    fn from_records_restores_id_sequence() {
        let mut registry = StrategyRegistry::new();
        registry.register(&spec(1_000, 20)).unwrap();
        registry.register(&spec(1_000, 20)).unwrap();
        let mut restored =
            StrategyRegistry::from_records(registry.records().cloned()).unwrap();
        assert_eq!(restored.register(&spec(1, 1)).unwrap().id, StrategyId(3));
    }
}
