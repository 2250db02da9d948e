//! Strata vault core: deposit accounting, risk-bounded strategy allocation,
//! manipulation-resistant price consensus and token-weighted governance.
//!
//! The crate owns no transport, storage engine or scheduler. Venues, price
//! sources, custody and snapshot sinks are injected through traits, and the
//! rebalancer runs only when a collaborator calls it.

#![deny(unsafe_code)]

pub mod clock;
pub mod config;
pub mod custody;
pub mod engine;
pub mod error;
pub mod events;
pub mod governance;
pub mod guard;
pub mod ledger;
pub mod math;
pub mod oracle;
pub mod rebalancer;
pub mod risk;
pub mod snapshot;
pub mod strategy;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, GovernanceConfig, LedgerConfig, OracleConfig, RebalanceConfig};
pub use custody::Custody;
pub use engine::{ProtocolState, VaultEngine};
pub use error::VaultError;
pub use events::{EventBus, EventJournal, JournalEntry, VaultEvent};
pub use governance::{
    AppliedChange, Proposal, ProposalBook, ProposalCategory, ProposalPayload, ProposalState,
};
pub use guard::{GuardToken, ReentrancyGuard};
pub use ledger::{Account, DepositReceipt, Ledger, VaultState, WithdrawalDebit, WithdrawalWindow};
pub use oracle::{
    ConsensusPrice, OracleAggregator, OracleReading, PricePoint, PriceSource, RejectedReading,
};
pub use rebalancer::{
    AllocationWeighting, CohortAllocation, RebalanceAction, RebalancePlan, Rebalancer, YieldPerRisk,
};
pub use risk::{RiskParameterStore, RiskProfile, RiskProfileUpdate, MAX_RISK_SCORE};
pub use snapshot::{SnapshotSink, VaultSnapshot};
pub use strategy::{
    StrategyQuote, StrategyRecord, StrategyRegistry, StrategySpec, VenueRegistry, YieldStrategy,
};
pub use types::{
    Address, Amount, AssetType, Price, ProposalId, StrategyId, Tally, VoteDirection,
    BPS_DENOMINATOR,
};
