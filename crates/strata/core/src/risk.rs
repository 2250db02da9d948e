use crate::error::VaultError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CONSERVATIVE: &str = "conservative";
pub const BALANCED: &str = "balanced";
pub const AGGRESSIVE: &str = "aggressive";

/// Upper bound of the strategy risk-score scale.
pub const MAX_RISK_SCORE: u8 = 100;

/// Allocation, liquidity and volatility limits for a cohort of deposits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub name: String,
    /// Share of the cohort any single strategy may receive.
    pub max_allocation_per_strategy_pct: u8,
    /// Share of the cohort that must stay idle in the vault.
    pub min_liquidity_threshold_pct: u8,
    /// Asset volatility above which the cohort is kept fully liquid.
    pub volatility_limit_pct: u8,
    /// Highest strategy risk score the cohort may be allocated to.
    pub max_risk_score: u8,
}

impl RiskProfile {
    pub fn new(
        name: impl Into<String>,
        max_allocation_per_strategy_pct: u8,
        min_liquidity_threshold_pct: u8,
        volatility_limit_pct: u8,
        max_risk_score: u8,
    ) -> Self {
        Self {
            name: name.into(),
            max_allocation_per_strategy_pct,
            min_liquidity_threshold_pct,
            volatility_limit_pct,
            max_risk_score,
        }
    }

    pub fn volatility_limit_bps(&self) -> u128 {
        u128::from(self.volatility_limit_pct) * 100
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if self.name.trim().is_empty() {
            return Err(VaultError::InvalidParameter(
                "risk profile name cannot be empty".into(),
            ));
        }
        for (field, value) in [
            ("max_allocation_per_strategy_pct", self.max_allocation_per_strategy_pct),
            ("min_liquidity_threshold_pct", self.min_liquidity_threshold_pct),
            ("volatility_limit_pct", self.volatility_limit_pct),
        ] {
            if value > 100 {
                return Err(VaultError::InvalidParameter(format!(
                    "{}.{field} = {value} exceeds 100",
                    self.name
                )));
            }
        }
        if self.max_risk_score > MAX_RISK_SCORE {
            return Err(VaultError::InvalidParameter(format!(
                "{}.max_risk_score = {} exceeds {MAX_RISK_SCORE}",
                self.name, self.max_risk_score
            )));
        }
        Ok(())
    }
}

/// Partial update of a named profile, applied by governance.
///
/// Naming a profile that does not exist creates it; every limit must then be given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskProfileUpdate {
    pub profile: String,
    pub max_allocation_per_strategy_pct: Option<u8>,
    pub min_liquidity_threshold_pct: Option<u8>,
    pub volatility_limit_pct: Option<u8>,
    pub max_risk_score: Option<u8>,
}

/// Named risk profiles, mutated only through governance execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameterStore {
    profiles: BTreeMap<String, RiskProfile>,
}

impl Default for RiskParameterStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RiskParameterStore {
    pub fn with_defaults() -> Self {
        Self::from_profiles([
            RiskProfile::new(CONSERVATIVE, 20, 30, 5, 30),
            RiskProfile::new(BALANCED, 35, 20, 15, 60),
            RiskProfile::new(AGGRESSIVE, 50, 10, 30, 90),
        ])
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = RiskProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.name.clone(), profile))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RiskProfile> {
        self.profiles.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&RiskProfile, VaultError> {
        self.get(name)
            .ok_or_else(|| VaultError::UnknownRiskProfile(name.to_string()))
    }

    pub fn profiles(&self) -> impl Iterator<Item = &RiskProfile> {
        self.profiles.values()
    }

    /// Validate an update against current state without applying it.
    pub fn preview(&self, update: &RiskProfileUpdate) -> Result<RiskProfile, VaultError> {
        let next = match self.profiles.get(&update.profile) {
            Some(current) => RiskProfile {
                name: current.name.clone(),
                max_allocation_per_strategy_pct: update
                    .max_allocation_per_strategy_pct
                    .unwrap_or(current.max_allocation_per_strategy_pct),
                min_liquidity_threshold_pct: update
                    .min_liquidity_threshold_pct
                    .unwrap_or(current.min_liquidity_threshold_pct),
                volatility_limit_pct: update
                    .volatility_limit_pct
                    .unwrap_or(current.volatility_limit_pct),
                max_risk_score: update.max_risk_score.unwrap_or(current.max_risk_score),
            },
            None => {
                let missing = |field: &str| {
                    VaultError::InvalidParameter(format!(
                        "new profile '{}' requires {field}",
                        update.profile
                    ))
                };
                RiskProfile {
                    name: update.profile.clone(),
                    max_allocation_per_strategy_pct: update
                        .max_allocation_per_strategy_pct
                        .ok_or_else(|| missing("max_allocation_per_strategy_pct"))?,
                    min_liquidity_threshold_pct: update
                        .min_liquidity_threshold_pct
                        .ok_or_else(|| missing("min_liquidity_threshold_pct"))?,
                    volatility_limit_pct: update
                        .volatility_limit_pct
                        .ok_or_else(|| missing("volatility_limit_pct"))?,
                    max_risk_score: update
                        .max_risk_score
                        .ok_or_else(|| missing("max_risk_score"))?,
                }
            }
        };
        next.validate()?;
        Ok(next)
    }

    pub(crate) fn apply(&mut self, update: &RiskProfileUpdate) -> Result<RiskProfile, VaultError> {
        let next = self.preview(update)?;
        self.profiles.insert(next.name.clone(), next.clone());
        Ok(next)
    }
}
