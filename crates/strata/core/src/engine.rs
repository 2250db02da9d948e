//! The vault engine: one explicit protocol state threaded through every operation.
//!
//! Locking discipline:
//! - `state` is the vault-wide guard. It is never held across an `.await`.
//! - Each proposal has its own mutex. When both are needed the proposal is
//!   locked first.
//! - Oracle fetches and venue/custody calls happen outside every lock; the
//!   values they depend on are re-validated at commit time.
//! - The `rebalance` guard key serializes anything that moves allocations in
//!   bulk: rebalance passes and withdrawals that recall deployed funds.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::custody::Custody;
use crate::error::VaultError;
use crate::events::{EventBus, EventJournal, VaultEvent};
use crate::governance::{AppliedChange, Proposal, ProposalBook, ProposalPayload, ProposalState};
use crate::guard::ReentrancyGuard;
use crate::ledger::{Account, DepositReceipt, Ledger};
use crate::math;
use crate::oracle::{ConsensusPrice, OracleAggregator, PriceSource};
use crate::rebalancer::{AllocationWeighting, RebalanceAction, RebalancePlan, Rebalancer};
use crate::risk::{RiskParameterStore, RiskProfile};
use crate::snapshot::{SnapshotSink, VaultSnapshot};
use crate::strategy::{
    StrategyQuote, StrategyRecord, StrategyRegistry, VenueRegistry, YieldStrategy,
};
use crate::types::{Address, Amount, AssetType, ProposalId, StrategyId, Tally, VoteDirection};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const REBALANCE_KEY: &str = "rebalance";

/// Everything the vault-wide guard protects.
#[derive(Debug, Clone)]
pub struct ProtocolState {
    pub ledger: Ledger,
    pub strategies: StrategyRegistry,
    pub risk: RiskParameterStore,
}

impl ProtocolState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ledger: Ledger::new(config.emergency_admin.clone()),
            strategies: StrategyRegistry::new(),
            risk: RiskParameterStore::with_defaults(),
        }
    }

    /// Deposits of `asset` not deployed to any strategy.
    pub fn idle_liquidity(&self, asset: AssetType) -> Result<Amount, VaultError> {
        let allocated = self.strategies.allocated_total(asset)?;
        self.ledger
            .total_deposits(asset)
            .checked_sub(allocated)
            .ok_or_else(|| {
                VaultError::InvariantViolation(format!(
                    "{asset} allocated {allocated} exceeds deposits {}",
                    self.ledger.total_deposits(asset)
                ))
            })
    }

    pub fn check_invariants(&self) -> Result<(), VaultError> {
        self.ledger.verify_totals()?;
        for record in self.strategies.records() {
            if record.allocated > record.max_allocation {
                return Err(VaultError::InvariantViolation(format!(
                    "{} allocated {} above max {}",
                    record.id, record.allocated, record.max_allocation
                )));
            }
        }
        for asset in AssetType::ALL {
            self.idle_liquidity(asset)?;
        }
        for profile in self.risk.profiles() {
            profile.validate()?;
        }
        Ok(())
    }
}

pub struct VaultEngine {
    config: EngineConfig,
    state: Mutex<ProtocolState>,
    proposals: ProposalBook,
    oracle: OracleAggregator,
    venues: RwLock<VenueRegistry>,
    rebalancer: Rebalancer,
    guard: ReentrancyGuard,
    events: EventBus,
    custody: Arc<dyn Custody>,
    clock: Arc<dyn Clock>,
}

impl VaultEngine {
    pub fn new(config: EngineConfig, custody: Arc<dyn Custody>) -> Result<Self, VaultError> {
        config.validate()?;
        let state = ProtocolState::new(&config);
        Ok(Self::assemble(config, state, EventBus::new(), custody))
    }

    fn assemble(
        config: EngineConfig,
        state: ProtocolState,
        events: EventBus,
        custody: Arc<dyn Custody>,
    ) -> Self {
        Self {
            proposals: ProposalBook::new(config.governance.clone()),
            oracle: OracleAggregator::new(config.oracle.clone()),
            rebalancer: Rebalancer::new(config.rebalance.clone()),
            state: Mutex::new(state),
            venues: RwLock::new(VenueRegistry::new()),
            guard: ReentrancyGuard::new(),
            events,
            custody,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_weighting(mut self, weighting: Arc<dyn AllocationWeighting>) -> Self {
        self.rebalancer = Rebalancer::new(self.config.rebalance.clone()).with_weighting(weighting);
        self
    }

    pub fn register_price_source(&self, source: Arc<dyn PriceSource>) -> Result<(), VaultError> {
        info!(source = source.source_id(), "Price source registered");
        self.oracle.register_source(source)
    }

    pub fn register_venue(&self, venue: Arc<dyn YieldStrategy>) -> Result<(), VaultError> {
        info!(venue = venue.venue(), "Venue registered");
        self.venues
            .write()
            .map_err(|_| VaultError::LockPoisoned("venue registry"))?
            .register(venue);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ProtocolState>, VaultError> {
        self.state
            .lock()
            .map_err(|_| VaultError::LockPoisoned("protocol state"))
    }

    fn venue(&self, name: &str) -> Result<Arc<dyn YieldStrategy>, VaultError> {
        self.venues
            .read()
            .map_err(|_| VaultError::LockPoisoned("venue registry"))?
            .get(name)
            .ok_or_else(|| VaultError::UnknownVenue(name.to_string()))
    }

    fn emit(&self, event: VaultEvent) {
        let name = event.name();
        if let Err(err) = self.events.publish(event, self.clock.now()) {
            error!(event = name, error = %err, "Failed to journal event");
        }
    }

    // ---- ledger ----

    pub async fn deposit(
        &self,
        address: &Address,
        asset: AssetType,
        amount: Amount,
        risk_profile: &str,
    ) -> Result<DepositReceipt, VaultError> {
        let now = self.clock.now();
        let receipt = {
            let mut state = self.lock_state()?;
            if state.ledger.is_paused() {
                return Err(VaultError::ContractPaused);
            }
            state.risk.require(risk_profile)?;
            state.ledger.deposit(
                address,
                asset,
                amount,
                risk_profile,
                self.config.ledger.daily_withdrawal_cap,
                now,
            )?
        };
        self.emit(VaultEvent::Deposited {
            account: address.clone(),
            asset,
            amount,
            transaction_id: receipt.transaction_id.clone(),
        });
        Ok(receipt)
    }

    /// Debit the ledger, then transfer out. Funds parked in strategies are
    /// recalled first when idle liquidity is short.
    pub async fn withdraw(
        &self,
        address: &Address,
        asset: AssetType,
        amount: Amount,
    ) -> Result<Amount, VaultError> {
        let _token = self.guard.enter(format!("withdraw:{address}"))?;
        let window_secs = self.config.ledger.withdrawal_window_secs;

        let mut recalls = self.plan_withdrawal(address, asset, amount, window_secs)?;
        // Held from recall through debit so no rebalance pass redeploys the
        // recalled funds. Planned again once held.
        let allocation_lock = if recalls.is_empty() {
            None
        } else {
            let token = self.guard.enter(REBALANCE_KEY)?;
            recalls = self.plan_withdrawal(address, asset, amount, window_secs)?;
            Some(token)
        };
        for (strategy, take) in recalls {
            info!(account = %address, strategy = %strategy, amount = take, "Recalling liquidity for withdrawal");
            self.deallocate(strategy, take).await?;
        }

        let debit = {
            let mut state = self.lock_state()?;
            let idle = state.idle_liquidity(asset)?;
            if idle < amount {
                return Err(VaultError::InsufficientLiquidity {
                    asset,
                    requested: amount,
                    available: idle,
                });
            }
            state
                .ledger
                .withdraw(address, asset, amount, window_secs, self.clock.now())?
        };
        drop(allocation_lock);

        match self.custody.transfer_out(address, asset, amount).await {
            Ok(transfer_ref) => {
                info!(
                    account = %address,
                    asset = %asset,
                    amount,
                    tx = %debit.transaction_id,
                    transfer = %transfer_ref,
                    "Withdrawal settled"
                );
                self.emit(VaultEvent::Withdrawn {
                    account: address.clone(),
                    asset,
                    amount,
                    transaction_id: debit.transaction_id,
                    transfer_ref,
                });
                Ok(amount)
            }
            Err(err) => {
                warn!(account = %address, asset = %asset, amount, error = %err, "Custody transfer failed");
                self.lock_state()?.ledger.restore_debit(&debit)?;
                Err(match err {
                    VaultError::Custody(_) => err,
                    other => VaultError::Custody(other.to_string()),
                })
            }
        }
    }

    fn plan_withdrawal(
        &self,
        address: &Address,
        asset: AssetType,
        amount: Amount,
        window_secs: i64,
    ) -> Result<Vec<(StrategyId, Amount)>, VaultError> {
        let state = self.lock_state()?;
        state
            .ledger
            .check_withdrawal(address, asset, amount, window_secs, self.clock.now())?;
        plan_recall(&state, asset, amount)
    }

    pub async fn credit_reward(
        &self,
        address: &Address,
        asset: AssetType,
        amount: Amount,
    ) -> Result<Amount, VaultError> {
        let balance = self
            .lock_state()?
            .ledger
            .credit_reward(address, asset, amount)?;
        self.emit(VaultEvent::RewardCredited {
            account: address.clone(),
            asset,
            amount,
        });
        Ok(balance)
    }

    // ---- strategies ----

    /// Allocate idle funds on behalf of `profile`, whose risk ceiling applies.
    pub async fn allocate(
        &self,
        strategy: StrategyId,
        amount: Amount,
        profile: &str,
    ) -> Result<StrategyRecord, VaultError> {
        let ceiling = self.lock_state()?.risk.require(profile)?.max_risk_score;
        self.allocate_within(strategy, amount, ceiling).await
    }

    async fn allocate_within(
        &self,
        strategy: StrategyId,
        amount: Amount,
        risk_ceiling: u8,
    ) -> Result<StrategyRecord, VaultError> {
        let venue_name = self.lock_state()?.strategies.require(strategy)?.venue.clone();
        let venue = self.venue(&venue_name)?;

        let record = {
            let mut state = self.lock_state()?;
            if state.ledger.is_paused() {
                return Err(VaultError::ContractPaused);
            }
            let asset = state.strategies.require(strategy)?.asset;
            let idle = state.idle_liquidity(asset)?;
            state.strategies.reserve(strategy, amount, risk_ceiling, idle)?
        };

        if let Err(err) = venue.allocate(amount).await {
            warn!(strategy = %strategy, amount, error = %err, "Venue allocation failed; rolling back");
            self.lock_state()?.strategies.release(strategy, amount)?;
            return Err(VaultError::Venue {
                strategy,
                message: err.to_string(),
            });
        }
        info!(strategy = %strategy, amount, allocated = record.allocated, "Allocated");
        Ok(record)
    }

    pub async fn deallocate(&self, strategy: StrategyId, amount: Amount) -> Result<Amount, VaultError> {
        let venue_name = self.lock_state()?.strategies.require(strategy)?.venue.clone();
        let venue = self.venue(&venue_name)?;

        let record = self.lock_state()?.strategies.release(strategy, amount)?;
        match venue.deallocate(amount).await {
            Ok(freed) => {
                if freed != amount {
                    warn!(strategy = %strategy, requested = amount, freed, "Venue freed a different amount");
                }
                info!(strategy = %strategy, amount, allocated = record.allocated, "Deallocated");
                Ok(freed)
            }
            Err(err) => {
                warn!(strategy = %strategy, amount, error = %err, "Venue deallocation failed; restoring record");
                self.lock_state()?.strategies.restore(strategy, amount)?;
                Err(VaultError::Venue {
                    strategy,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Read live metrics from the venue and refresh the cached record.
    pub async fn query_strategy(&self, strategy: StrategyId) -> Result<StrategyQuote, VaultError> {
        let venue_name = self.lock_state()?.strategies.require(strategy)?.venue.clone();
        let venue = self.venue(&venue_name)?;
        let venue_err = |err: VaultError| VaultError::Venue {
            strategy,
            message: err.to_string(),
        };

        let quote = StrategyQuote {
            apy_bps: venue.apy_bps().await.map_err(venue_err)?,
            risk_score: venue.risk_score().await.map_err(venue_err)?,
            tvl: venue.tvl().await.map_err(venue_err)?,
        };
        self.lock_state()?
            .strategies
            .refresh_metrics(strategy, &quote);
        Ok(quote)
    }

    // ---- oracle & rebalancer ----

    pub async fn consensus_price(&self, asset: AssetType) -> Result<ConsensusPrice, VaultError> {
        self.oracle.consensus_price(asset, self.clock.now()).await
    }

    async fn volatility_by_asset(&self) -> Result<BTreeMap<AssetType, u128>, VaultError> {
        let held = self.lock_state()?.ledger.held_assets();
        let mut volatility = BTreeMap::new();
        for asset in held {
            match self.consensus_price(asset).await {
                Ok(consensus) => {
                    volatility.insert(asset, consensus.volatility_bps);
                }
                // unpriced assets are planned as fully liquid
                Err(err @ VaultError::InsufficientOracleSources { .. }) => {
                    warn!(asset = %asset, error = %err, "No consensus price; keeping asset liquid");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(volatility)
    }

    /// Plan against fresh consensus data without applying anything.
    pub async fn preview_rebalance(&self) -> Result<RebalancePlan, VaultError> {
        let volatility = self.volatility_by_asset().await?;
        let state = self.lock_state()?;
        self.rebalancer
            .plan(&state.ledger, &state.strategies, &state.risk, &volatility)
    }

    pub async fn rebalance_due(&self) -> Result<bool, VaultError> {
        let plan = self.preview_rebalance().await?;
        Ok(self.is_due(&plan))
    }

    /// Whether a previewed plan crosses the configured drift threshold.
    pub fn is_due(&self, plan: &RebalancePlan) -> bool {
        self.rebalancer.is_due(plan)
    }

    /// Run one pass. Applied actions stay applied if a later one fails.
    pub async fn rebalance(&self) -> Result<Vec<RebalanceAction>, VaultError> {
        let _token = self.guard.enter(REBALANCE_KEY)?;
        if self.is_paused()? {
            return Err(VaultError::ContractPaused);
        }

        let volatility = self.volatility_by_asset().await?;
        self.refresh_venue_metrics().await?;
        let plan = {
            let state = self.lock_state()?;
            self.rebalancer
                .plan(&state.ledger, &state.strategies, &state.risk, &volatility)?
        };

        let mut applied = Vec::with_capacity(plan.actions.len());
        for action in plan.actions {
            let outcome = match &action {
                RebalanceAction::Deallocate { strategy, amount } => {
                    self.deallocate(*strategy, *amount).await.map(|_| ())
                }
                RebalanceAction::Allocate {
                    strategy,
                    amount,
                    risk_ceiling,
                    ..
                } => self
                    .allocate_within(*strategy, *amount, *risk_ceiling)
                    .await
                    .map(|_| ()),
            };
            if let Err(source) = outcome {
                error!(applied = applied.len(), action = %action, error = %source, "Rebalance aborted");
                if !applied.is_empty() {
                    self.emit(VaultEvent::Rebalanced {
                        actions: applied.clone(),
                    });
                }
                return Err(VaultError::RebalanceAborted {
                    applied: applied.len(),
                    action: action.to_string(),
                    source: Box::new(source),
                });
            }
            applied.push(action);
        }

        info!(actions = applied.len(), "Rebalance pass complete");
        if !applied.is_empty() {
            self.emit(VaultEvent::Rebalanced {
                actions: applied.clone(),
            });
        }
        Ok(applied)
    }

    async fn refresh_venue_metrics(&self) -> Result<(), VaultError> {
        let active: Vec<StrategyId> = self
            .lock_state()?
            .strategies
            .records()
            .filter(|record| record.active)
            .map(|record| record.id)
            .collect();
        for strategy in active {
            if let Err(err) = self.query_strategy(strategy).await {
                warn!(strategy = %strategy, error = %err, "Keeping cached venue metrics");
            }
        }
        Ok(())
    }

    // ---- governance ----

    /// Live governance-asset balance. Each proposal further caps votes at the
    /// balance recorded when it was created.
    pub fn voting_power(&self, address: &Address) -> Result<Amount, VaultError> {
        Ok(self
            .lock_state()?
            .ledger
            .balance_of(address, self.config.governance_asset))
    }

    pub async fn create_proposal(
        &self,
        proposer: &Address,
        title: &str,
        payload: ProposalPayload,
        voting_window_secs: i64,
    ) -> Result<ProposalId, VaultError> {
        let holders = {
            let state = self.lock_state()?;
            let venues = self
                .venues
                .read()
                .map_err(|_| VaultError::LockPoisoned("venue registry"))?;
            payload.validate(&state.risk, &state.strategies, &venues)?;
            state.ledger.holders(self.config.governance_asset)
        };
        let proposal = self.proposals.submit(
            proposer,
            title,
            payload,
            voting_window_secs,
            holders,
            self.clock.now(),
        )?;
        self.emit(VaultEvent::ProposalCreated {
            proposal: proposal.id,
            proposer: proposer.clone(),
            category: proposal.category(),
        });
        Ok(proposal.id)
    }

    pub async fn vote(
        &self,
        voter: &Address,
        proposal_id: ProposalId,
        direction: VoteDirection,
        amount: Amount,
    ) -> Result<Tally, VaultError> {
        let handle = self.proposals.handle(proposal_id)?;
        let (tally, finalized) = {
            let mut proposal = handle
                .lock()
                .map_err(|_| VaultError::LockPoisoned("proposal"))?;
            let transition = proposal.refresh(self.clock.now());
            let finalized = closed_transition(&proposal, transition);
            let power = proposal.power_of(voter, self.voting_power(voter)?);
            (proposal.cast_vote(voter, direction, amount, power), finalized)
        };
        if let Some(event) = finalized {
            self.emit(event);
        }

        let tally = tally?;
        info!(proposal = %proposal_id, voter = %voter, ?direction, amount, "Vote cast");
        self.emit(VaultEvent::VoteCast {
            proposal: proposal_id,
            voter: voter.clone(),
            direction,
            amount,
            tally,
        });
        Ok(tally)
    }

    /// External trigger for the window-close transition.
    pub async fn finalize(&self, proposal_id: ProposalId) -> Result<ProposalState, VaultError> {
        let handle = self.proposals.handle(proposal_id)?;
        let (state, finalized) = {
            let mut proposal = handle
                .lock()
                .map_err(|_| VaultError::LockPoisoned("proposal"))?;
            let transition = proposal.refresh(self.clock.now());
            (proposal.state, closed_transition(&proposal, transition))
        };
        if let Some(event) = finalized {
            self.emit(event);
        }
        Ok(state)
    }

    pub async fn execute_proposal(
        &self,
        caller: &Address,
        proposal_id: ProposalId,
    ) -> Result<AppliedChange, VaultError> {
        let handle = self.proposals.handle(proposal_id)?;
        let (change, finalized) = {
            let mut proposal = handle
                .lock()
                .map_err(|_| VaultError::LockPoisoned("proposal"))?;
            let now = self.clock.now();
            let transition = proposal.refresh(now);
            let finalized = closed_transition(&proposal, transition);

            (self.apply_proposal(&mut proposal, now), finalized)
        };
        if let Some(event) = finalized {
            self.emit(event);
        }

        let change = change?;
        info!(proposal = %proposal_id, caller = %caller, "Proposal executed");
        self.emit(VaultEvent::ProposalExecuted {
            proposal: proposal_id,
            change: change.clone(),
        });
        Ok(change)
    }

    /// Runs with the proposal locked; takes the vault guard second.
    fn apply_proposal(
        &self,
        proposal: &mut Proposal,
        now: DateTime<Utc>,
    ) -> Result<AppliedChange, VaultError> {
        let mut state = self.lock_state()?;
        if state.ledger.is_paused() {
            return Err(VaultError::ContractPaused);
        }
        proposal.ensure_executable()?;
        let venues = self
            .venues
            .read()
            .map_err(|_| VaultError::LockPoisoned("venue registry"))?;
        let state = &mut *state;
        let change = proposal
            .payload
            .apply(&mut state.risk, &mut state.strategies, &venues)?;
        proposal.mark_executed(now);
        Ok(change)
    }

    pub fn emergency_pause(&self, caller: &Address) -> Result<bool, VaultError> {
        self.set_paused(caller, true, "pause the vault")
    }

    pub fn unpause(&self, caller: &Address) -> Result<bool, VaultError> {
        self.set_paused(caller, false, "unpause the vault")
    }

    fn set_paused(&self, caller: &Address, paused: bool, action: &'static str) -> Result<bool, VaultError> {
        let changed = {
            let mut state = self.lock_state()?;
            if state.ledger.emergency_admin() != caller {
                warn!(caller = %caller, action, "Rejected emergency control call");
                return Err(VaultError::Unauthorized {
                    actor: caller.clone(),
                    action,
                });
            }
            state.ledger.set_paused(paused)
        };
        if changed {
            warn!(by = %caller, paused, "Vault pause state changed");
            self.emit(if paused {
                VaultEvent::EmergencyPaused { by: caller.clone() }
            } else {
                VaultEvent::Unpaused { by: caller.clone() }
            });
        }
        Ok(changed)
    }

    // ---- queries ----

    pub fn account(&self, address: &Address) -> Result<Option<Account>, VaultError> {
        Ok(self.lock_state()?.ledger.account(address).cloned())
    }

    pub fn balance_of(&self, address: &Address, asset: AssetType) -> Result<Amount, VaultError> {
        Ok(self.lock_state()?.ledger.balance_of(address, asset))
    }

    pub fn total_deposits(&self, asset: AssetType) -> Result<Amount, VaultError> {
        Ok(self.lock_state()?.ledger.total_deposits(asset))
    }

    pub fn idle_liquidity(&self, asset: AssetType) -> Result<Amount, VaultError> {
        self.lock_state()?.idle_liquidity(asset)
    }

    pub fn strategy(&self, strategy: StrategyId) -> Result<StrategyRecord, VaultError> {
        self.lock_state()?.strategies.require(strategy).cloned()
    }

    pub fn strategies(&self) -> Result<Vec<StrategyRecord>, VaultError> {
        Ok(self.lock_state()?.strategies.records().cloned().collect())
    }

    pub fn risk_profile(&self, name: &str) -> Result<RiskProfile, VaultError> {
        self.lock_state()?.risk.require(name).cloned()
    }

    pub fn proposal(&self, proposal_id: ProposalId) -> Result<Proposal, VaultError> {
        self.proposals.get(proposal_id)
    }

    pub fn is_paused(&self) -> Result<bool, VaultError> {
        Ok(self.lock_state()?.ledger.is_paused())
    }

    pub fn check_invariants(&self) -> Result<(), VaultError> {
        self.lock_state()?.check_invariants()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.events.subscribe()
    }

    pub fn journal(&self) -> Result<EventJournal, VaultError> {
        self.events.journal()
    }

    // ---- persistence ----

    pub fn snapshot(&self) -> Result<VaultSnapshot, VaultError> {
        let proposals = self.proposals.all()?;
        let next_proposal_id = self.proposals.next_id();
        let oracle_history = self.oracle.history_snapshot()?;
        let journal = self.events.journal()?.entries().to_vec();
        let state = self.lock_state()?;
        Ok(VaultSnapshot {
            taken_at: self.clock.now(),
            accounts: state.ledger.accounts().cloned().collect(),
            vault: state.ledger.vault().clone(),
            strategies: state.strategies.records().cloned().collect(),
            risk_profiles: state.risk.profiles().cloned().collect(),
            proposals,
            next_proposal_id,
            oracle_history,
            journal,
        })
    }

    pub async fn persist_snapshot(&self, sink: &dyn SnapshotSink) -> Result<(), VaultError> {
        let snapshot = self.snapshot()?;
        sink.persist(&snapshot).await
    }

    /// Rebuild an engine from a snapshot, refusing state that breaks the
    /// balance/total or allocation invariants, or a broken journal chain.
    pub fn restore(
        config: EngineConfig,
        snapshot: VaultSnapshot,
        custody: Arc<dyn Custody>,
    ) -> Result<Self, VaultError> {
        config.validate()?;
        let state = ProtocolState {
            ledger: Ledger::from_parts(snapshot.accounts, snapshot.vault)?,
            strategies: StrategyRegistry::from_records(snapshot.strategies)?,
            risk: RiskParameterStore::from_profiles(snapshot.risk_profiles),
        };
        state.check_invariants()?;
        let journal = EventJournal::from_entries(snapshot.journal)?;

        let engine = Self::assemble(config, state, EventBus::with_journal(journal), custody);
        engine
            .proposals
            .restore(snapshot.proposals, snapshot.next_proposal_id)?;
        for (asset, points) in snapshot.oracle_history {
            engine.oracle.seed_history(asset, points)?;
        }
        info!(taken_at = %snapshot.taken_at, "Engine restored from snapshot");
        Ok(engine)
    }
}

fn closed_transition(proposal: &Proposal, transition: Option<ProposalState>) -> Option<VaultEvent> {
    match transition {
        Some(state @ (ProposalState::Passed | ProposalState::Rejected)) => {
            Some(VaultEvent::ProposalFinalized {
                proposal: proposal.id,
                state,
                tally: proposal.tally,
            })
        }
        _ => None,
    }
}

/// Deallocations (highest risk first) that free enough idle liquidity for `amount`.
fn plan_recall(
    state: &ProtocolState,
    asset: AssetType,
    amount: Amount,
) -> Result<Vec<(StrategyId, Amount)>, VaultError> {
    let idle = state.idle_liquidity(asset)?;
    let mut shortfall = amount.saturating_sub(idle);
    if shortfall == 0 {
        return Ok(Vec::new());
    }

    let mut candidates: Vec<&StrategyRecord> = state
        .strategies
        .records()
        .filter(|record| record.asset == asset && record.allocated > 0)
        .collect();
    candidates.sort_by(|a, b| {
        b.effective_risk_score()
            .cmp(&a.effective_risk_score())
            .then(a.id.cmp(&b.id))
    });

    let recallable = math::sum(candidates.iter().map(|r| r.allocated), "recallable")?;
    if recallable < shortfall {
        return Err(VaultError::InsufficientLiquidity {
            asset,
            requested: amount,
            available: math::add(idle, recallable, "recallable liquidity")?,
        });
    }

    let mut recalls = Vec::new();
    for record in candidates {
        if shortfall == 0 {
            break;
        }
        let take = record.allocated.min(shortfall);
        recalls.push((record.id, take));
        shortfall -= take;
    }
    Ok(recalls)
}
