use crate::governance::ProposalState;
use crate::types::{Address, Amount, AssetType, ProposalId, StrategyId};
use thiserror::Error;

/// Strata core errors.
///
/// Variants carry the quantities a caller needs to react programmatically
/// (requested vs available, observed vs allowed).
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount { amount: Amount, reason: &'static str },

    #[error("insufficient {asset} balance: requested {requested}, available {available}")]
    InsufficientBalance {
        asset: AssetType,
        requested: Amount,
        available: Amount,
    },

    #[error("insufficient idle {asset} liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity {
        asset: AssetType,
        requested: Amount,
        available: Amount,
    },

    #[error("{strategy} allocation exceeded: requested {requested}, available {available}")]
    ExceedsMaxAllocation {
        strategy: StrategyId,
        requested: Amount,
        available: Amount,
    },

    #[error("{0} is not active")]
    StrategyInactive(StrategyId),

    #[error("{strategy} risk score {risk_score} exceeds ceiling {ceiling}")]
    RiskTooHigh {
        strategy: StrategyId,
        risk_score: u8,
        ceiling: u8,
    },

    #[error("stale {asset} reading from '{source_id}': age {age_secs}s exceeds {max_age_secs}s")]
    StaleOracleData {
        asset: AssetType,
        source_id: String,
        age_secs: i64,
        max_age_secs: i64,
    },

    #[error(
        "{asset} reading from '{source_id}' deviates {deviation_bps} bps (max {max_deviation_bps})"
    )]
    PriceDeviationTooHigh {
        asset: AssetType,
        source_id: String,
        deviation_bps: u128,
        max_deviation_bps: u128,
    },

    #[error("insufficient oracle sources for {asset}: {available} usable, {required} required")]
    InsufficientOracleSources {
        asset: AssetType,
        available: usize,
        required: usize,
    },

    #[error("oracle source '{source_id}' failed: {message}")]
    OracleSource { source_id: String, message: String },

    #[error("'{actor}' is not authorized to {action}")]
    Unauthorized { actor: Address, action: &'static str },

    #[error("vault is paused")]
    ContractPaused,

    #[error(
        "{asset} withdrawal of {requested} exceeds daily limit: {remaining} of {cap} remaining"
    )]
    ExceedsWithdrawalLimit {
        asset: AssetType,
        requested: Amount,
        remaining: Amount,
        cap: Amount,
    },

    #[error("{proposal} is not active (state: {state:?})")]
    ProposalNotActive {
        proposal: ProposalId,
        state: ProposalState,
    },

    #[error("{proposal} missed quorum: {participated} of {required} voting power participated")]
    QuorumNotMet {
        proposal: ProposalId,
        required: Amount,
        participated: Amount,
    },

    #[error("arithmetic overflow in {context}")]
    Overflow { context: &'static str },

    #[error("unknown account '{0}'")]
    UnknownAccount(Address),

    #[error("unknown strategy {0}")]
    UnknownStrategy(StrategyId),

    #[error("no venue registered under '{0}'")]
    UnknownVenue(String),

    #[error("unknown proposal {0}")]
    UnknownProposal(ProposalId),

    #[error("unknown risk profile '{0}'")]
    UnknownRiskProfile(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("operation already in progress for '{key}'")]
    OperationInProgress { key: String },

    #[error("rebalance aborted after {applied} applied action(s) at '{action}': {source}")]
    RebalanceAborted {
        applied: usize,
        action: String,
        #[source]
        source: Box<VaultError>,
    },

    #[error("venue for {strategy} failed: {message}")]
    Venue { strategy: StrategyId, message: String },

    #[error("custody transfer failed: {0}")]
    Custody(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl VaultError {
    pub fn overflow(context: &'static str) -> Self {
        Self::Overflow { context }
    }

    /// Errors that reject a single oracle reading without failing the whole consensus.
    pub fn is_reading_rejection(&self) -> bool {
        matches!(
            self,
            Self::StaleOracleData { .. }
                | Self::PriceDeviationTooHigh { .. }
                | Self::OracleSource { .. }
        )
    }
}
