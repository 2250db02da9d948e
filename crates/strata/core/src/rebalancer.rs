//! Target-allocation planning.
//!
//! The planner is pure: it reads ledger cohorts, risk profiles, strategy
//! records and per-asset volatility and returns an ordered action list. The
//! engine applies the list through the ordinary allocate/deallocate path.

use crate::config::RebalanceConfig;
use crate::error::VaultError;
use crate::ledger::Ledger;
use crate::math;
use crate::risk::{RiskParameterStore, RiskProfile};
use crate::strategy::{StrategyRecord, StrategyRegistry};
use crate::types::{Amount, AssetType, StrategyId, BPS_DENOMINATOR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Relative preference of a strategy for a cohort. Zero means "do not allocate".
pub trait AllocationWeighting: Send + Sync {
    fn weight(&self, strategy: &StrategyRecord, profile: &RiskProfile) -> Amount;
}

/// `apy_bps * 10_000 / max(effective_risk_score, 1)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YieldPerRisk;

impl AllocationWeighting for YieldPerRisk {
    fn weight(&self, strategy: &StrategyRecord, _profile: &RiskProfile) -> Amount {
        Amount::from(strategy.apy_bps) * BPS_DENOMINATOR
            / Amount::from(strategy.effective_risk_score().max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceAction {
    Deallocate {
        strategy: StrategyId,
        amount: Amount,
    },
    Allocate {
        strategy: StrategyId,
        amount: Amount,
        /// Most conservative profile funding this allocation.
        profile: String,
        risk_ceiling: u8,
    },
}

impl RebalanceAction {
    pub fn strategy(&self) -> StrategyId {
        match self {
            Self::Deallocate { strategy, .. } | Self::Allocate { strategy, .. } => *strategy,
        }
    }

    pub fn amount(&self) -> Amount {
        match self {
            Self::Deallocate { amount, .. } | Self::Allocate { amount, .. } => *amount,
        }
    }
}

impl fmt::Display for RebalanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deallocate { strategy, amount } => write!(f, "deallocate {amount} from {strategy}"),
            Self::Allocate {
                strategy,
                amount,
                profile,
                ..
            } => write!(f, "allocate {amount} to {strategy} ({profile})"),
        }
    }
}

/// How one (asset, profile) cohort was split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortAllocation {
    pub asset: AssetType,
    pub profile: String,
    pub amount: Amount,
    pub deployable: Amount,
    pub per_strategy_cap: Amount,
    pub shares: BTreeMap<StrategyId, Amount>,
    /// Set when the cohort was kept fully liquid.
    pub skipped: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub actions: Vec<RebalanceAction>,
    pub targets: BTreeMap<StrategyId, Amount>,
    pub cohorts: Vec<CohortAllocation>,
    /// Largest |target - allocated| as bps of the strategy asset's deposits.
    pub max_drift_bps: u128,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

pub struct Rebalancer {
    config: RebalanceConfig,
    weighting: Arc<dyn AllocationWeighting>,
}

impl Rebalancer {
    pub fn new(config: RebalanceConfig) -> Self {
        Self {
            config,
            weighting: Arc::new(YieldPerRisk),
        }
    }

    pub fn with_weighting(mut self, weighting: Arc<dyn AllocationWeighting>) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn config(&self) -> &RebalanceConfig {
        &self.config
    }

    pub fn is_due(&self, plan: &RebalancePlan) -> bool {
        !plan.is_empty() && plan.max_drift_bps >= self.config.drift_threshold_bps
    }

    /// Compute targets and the deallocate-then-allocate action list.
    ///
    /// An asset missing from `volatility_bps` is treated as unpriced and its
    /// cohorts are kept liquid.
    pub fn plan(
        &self,
        ledger: &Ledger,
        strategies: &StrategyRegistry,
        risk: &RiskParameterStore,
        volatility_bps: &BTreeMap<AssetType, u128>,
    ) -> Result<RebalancePlan, VaultError> {
        let mut capacity: BTreeMap<StrategyId, Amount> = strategies
            .records()
            .map(|record| (record.id, record.max_allocation))
            .collect();
        let mut targets: BTreeMap<StrategyId, Amount> =
            strategies.records().map(|record| (record.id, 0)).collect();
        let mut ceilings: BTreeMap<StrategyId, (u8, String)> = BTreeMap::new();
        let mut cohorts = Vec::new();

        for ((asset, profile_name), amount) in ledger.cohorts()? {
            let profile = risk.require(&profile_name)?;
            let deployable = math::mul_div(
                amount,
                Amount::from(100u8.saturating_sub(profile.min_liquidity_threshold_pct)),
                100,
                "deployable amount",
            )?;
            let per_strategy_cap = math::percent_of(
                amount,
                profile.max_allocation_per_strategy_pct,
                "per-strategy cap",
            )?;
            let mut cohort = CohortAllocation {
                asset,
                profile: profile_name.clone(),
                amount,
                deployable,
                per_strategy_cap,
                shares: BTreeMap::new(),
                skipped: None,
            };

            match volatility_bps.get(&asset) {
                None => cohort.skipped = Some("no consensus price".into()),
                Some(vol) if *vol > profile.volatility_limit_bps() => {
                    cohort.skipped = Some(format!(
                        "volatility {vol} bps above limit {} bps",
                        profile.volatility_limit_bps()
                    ));
                }
                Some(_) => {}
            }
            if let Some(reason) = &cohort.skipped {
                debug!(asset = %asset, profile = %profile_name, reason = %reason, "Cohort kept liquid");
                cohorts.push(cohort);
                continue;
            }

            let candidates: Vec<(StrategyId, Amount, Amount)> = strategies
                .records()
                .filter(|record| {
                    record.active
                        && record.asset == asset
                        && record.effective_risk_score() <= profile.max_risk_score
                })
                .map(|record| {
                    let room = per_strategy_cap.min(capacity.get(&record.id).copied().unwrap_or(0));
                    (record.id, self.weighting.weight(record, profile), room)
                })
                .collect();

            cohort.shares = water_fill(deployable, &candidates)?;
            for (id, share) in &cohort.shares {
                if *share == 0 {
                    continue;
                }
                if let Some(left) = capacity.get_mut(id) {
                    *left = left.saturating_sub(*share);
                }
                if let Some(target) = targets.get_mut(id) {
                    *target = math::add(*target, *share, "strategy target")?;
                }
                let tighter = ceilings
                    .get(id)
                    .map_or(true, |(ceiling, _)| profile.max_risk_score < *ceiling);
                if tighter {
                    ceilings.insert(*id, (profile.max_risk_score, profile_name.clone()));
                }
            }
            cohorts.push(cohort);
        }

        let mut deallocations = Vec::new();
        let mut allocations = Vec::new();
        let mut max_drift_bps = 0;
        for record in strategies.records() {
            let target = if record.active {
                targets
                    .get(&record.id)
                    .copied()
                    .unwrap_or(0)
                    .min(record.max_allocation)
            } else {
                0
            };
            targets.insert(record.id, target);

            let delta = target.abs_diff(record.allocated);
            if delta == 0 {
                continue;
            }
            let asset_total = ledger.total_deposits(record.asset);
            let drift = if asset_total == 0 {
                BPS_DENOMINATOR
            } else {
                math::mul_div(delta, BPS_DENOMINATOR, asset_total, "allocation drift")?
            };
            max_drift_bps = max_drift_bps.max(drift);

            if delta < self.config.min_action_amount {
                continue;
            }
            if target < record.allocated {
                deallocations.push(RebalanceAction::Deallocate {
                    strategy: record.id,
                    amount: delta,
                });
            } else {
                let (risk_ceiling, profile) = ceilings
                    .get(&record.id)
                    .cloned()
                    .ok_or_else(|| {
                        VaultError::InvariantViolation(format!(
                            "{} has a target but no funding cohort",
                            record.id
                        ))
                    })?;
                allocations.push(RebalanceAction::Allocate {
                    strategy: record.id,
                    amount: delta,
                    profile,
                    risk_ceiling,
                });
            }
        }

        deallocations.extend(allocations);
        Ok(RebalancePlan {
            actions: deallocations,
            targets,
            cohorts,
            max_drift_bps,
        })
    }
}

/// Proportional split of `amount` by weight, capped per candidate at its room.
/// Leftover from capped candidates is redistributed among the rest; integer
/// rounding leftovers stay undeployed.
fn water_fill(
    amount: Amount,
    candidates: &[(StrategyId, Amount, Amount)],
) -> Result<BTreeMap<StrategyId, Amount>, VaultError> {
    let mut shares: BTreeMap<StrategyId, Amount> =
        candidates.iter().map(|(id, _, _)| (*id, 0)).collect();
    let mut open: Vec<&(StrategyId, Amount, Amount)> = candidates
        .iter()
        .filter(|(_, weight, room)| *weight > 0 && *room > 0)
        .collect();
    let mut remaining = amount;

    while remaining > 0 && !open.is_empty() {
        let total_weight = math::sum(open.iter().map(|(_, weight, _)| *weight), "weight total")?;
        let mut distributed = 0;
        let mut still_open = Vec::with_capacity(open.len());
        for candidate in open {
            let (id, weight, room) = candidate;
            let share = shares.entry(*id).or_insert(0);
            let portion = math::mul_div(remaining, *weight, total_weight, "weighted share")?;
            let take = portion.min(room.saturating_sub(*share));
            *share += take;
            distributed += take;
            if *share < *room {
                still_open.push(candidate);
            }
        }
        if distributed == 0 {
            break;
        }
        remaining -= distributed;
        open = still_open;
    }
    Ok(shares)
}
