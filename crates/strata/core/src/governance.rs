//! Proposal lifecycle: create, vote, close, execute.
//!
//! Proposals live in a [`ProposalBook`], each behind its own mutex. State
//! transitions on window boundaries happen lazily whenever a proposal is
//! touched; nothing here owns a timer.

use crate::config::GovernanceConfig;
use crate::error::VaultError;
use crate::math;
use crate::risk::{RiskParameterStore, RiskProfile, RiskProfileUpdate};
use crate::strategy::{StrategyRecord, StrategyRegistry, StrategySpec, VenueRegistry};
use crate::types::{Address, Amount, ProposalId, StrategyId, Tally, VoteDirection};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Pending,
    Active,
    Passed,
    Rejected,
    Executed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalCategory {
    ParameterChange,
    StrategyAddition,
    StrategyRemoval,
    StrategyUpdate,
}

impl fmt::Display for ProposalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ParameterChange => "parameter_change",
            Self::StrategyAddition => "strategy_addition",
            Self::StrategyRemoval => "strategy_removal",
            Self::StrategyUpdate => "strategy_update",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalPayload {
    ParameterChange {
        update: RiskProfileUpdate,
    },
    AddStrategy(StrategySpec),
    RemoveStrategy {
        strategy: StrategyId,
    },
    UpdateStrategy {
        strategy: StrategyId,
        max_allocation: Option<Amount>,
        risk_score: Option<u8>,
    },
}

impl ProposalPayload {
    pub fn category(&self) -> ProposalCategory {
        match self {
            Self::ParameterChange { .. } => ProposalCategory::ParameterChange,
            Self::AddStrategy(_) => ProposalCategory::StrategyAddition,
            Self::RemoveStrategy { .. } => ProposalCategory::StrategyRemoval,
            Self::UpdateStrategy { .. } => ProposalCategory::StrategyUpdate,
        }
    }

    /// Reject payloads that could never apply against the current state.
    pub fn validate(
        &self,
        risk: &RiskParameterStore,
        strategies: &StrategyRegistry,
        venues: &VenueRegistry,
    ) -> Result<(), VaultError> {
        match self {
            Self::ParameterChange { update } => risk.preview(update).map(|_| ()),
            Self::AddStrategy(spec) => {
                spec.validate()?;
                if !venues.has(&spec.venue) {
                    return Err(VaultError::UnknownVenue(spec.venue.clone()));
                }
                Ok(())
            }
            Self::RemoveStrategy { strategy } => strategies.require(*strategy).map(|_| ()),
            Self::UpdateStrategy {
                strategy,
                max_allocation,
                risk_score,
            } => {
                strategies.require(*strategy)?;
                if max_allocation.is_none() && risk_score.is_none() {
                    return Err(VaultError::InvalidParameter(
                        "strategy update changes nothing".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Apply to the registries. Only governance execution calls this.
    pub(crate) fn apply(
        &self,
        risk: &mut RiskParameterStore,
        strategies: &mut StrategyRegistry,
        venues: &VenueRegistry,
    ) -> Result<AppliedChange, VaultError> {
        match self {
            Self::ParameterChange { update } => {
                risk.apply(update).map(AppliedChange::RiskProfileUpdated)
            }
            Self::AddStrategy(spec) => {
                if !venues.has(&spec.venue) {
                    return Err(VaultError::UnknownVenue(spec.venue.clone()));
                }
                strategies.register(spec).map(AppliedChange::StrategyAdded)
            }
            Self::RemoveStrategy { strategy } => strategies
                .deactivate(*strategy)
                .map(AppliedChange::StrategyRemoved),
            Self::UpdateStrategy {
                strategy,
                max_allocation,
                risk_score,
            } => strategies
                .update_limits(*strategy, *max_allocation, *risk_score)
                .map(AppliedChange::StrategyUpdated),
        }
    }
}

/// What an executed proposal changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedChange {
    RiskProfileUpdated(RiskProfile),
    StrategyAdded(StrategyRecord),
    StrategyRemoved(StrategyRecord),
    StrategyUpdated(StrategyRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub proposer: Address,
    pub title: String,
    pub payload: ProposalPayload,
    pub state: ProposalState,
    pub tally: Tally,
    pub quorum_required: Amount,
    pub created_at: DateTime<Utc>,
    pub voting_starts_at: DateTime<Utc>,
    pub voting_ends_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Cumulative voting power each voter has committed.
    pub voters: BTreeMap<Address, Amount>,
    /// Governance-asset balances when the proposal was created.
    #[serde(default)]
    pub voting_power: BTreeMap<Address, Amount>,
}

impl Proposal {
    pub fn category(&self) -> ProposalCategory {
        self.payload.category()
    }

    /// Advance time-driven transitions. Returns the new state if it changed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Option<ProposalState> {
        let before = self.state;
        if self.state == ProposalState::Pending && now >= self.voting_starts_at {
            self.state = ProposalState::Active;
        }
        if self.state == ProposalState::Active && now >= self.voting_ends_at {
            self.state = if self.tally.total() >= self.quorum_required
                && self.tally.votes_for > self.tally.votes_against
            {
                ProposalState::Passed
            } else {
                ProposalState::Rejected
            };
        }
        (self.state != before).then_some(self.state)
    }

    /// Power `voter` may commit: the balance recorded at creation, reduced
    /// to `current_balance` if they have since withdrawn.
    pub fn power_of(&self, voter: &Address, current_balance: Amount) -> Amount {
        self.voting_power
            .get(voter)
            .copied()
            .unwrap_or(0)
            .min(current_balance)
    }

    pub fn committed_by(&self, voter: &Address) -> Amount {
        self.voters.get(voter).copied().unwrap_or(0)
    }

    /// Record a vote of `amount` out of `voting_power`. Call `refresh` first.
    pub fn cast_vote(
        &mut self,
        voter: &Address,
        direction: VoteDirection,
        amount: Amount,
        voting_power: Amount,
    ) -> Result<Tally, VaultError> {
        if self.state != ProposalState::Active {
            return Err(VaultError::ProposalNotActive {
                proposal: self.id,
                state: self.state,
            });
        }
        if amount == 0 {
            return Err(VaultError::InvalidAmount {
                amount,
                reason: "vote amount must be positive",
            });
        }
        let committed = math::add(self.committed_by(voter), amount, "committed votes")?;
        if committed > voting_power {
            return Err(VaultError::InvalidAmount {
                amount,
                reason: "vote exceeds remaining voting power",
            });
        }

        let mut tally = self.tally;
        match direction {
            VoteDirection::For => {
                tally.votes_for = math::add(tally.votes_for, amount, "votes for")?;
            }
            VoteDirection::Against => {
                tally.votes_against = math::add(tally.votes_against, amount, "votes against")?;
            }
        }
        self.tally = tally;
        self.voters.insert(voter.clone(), committed);
        Ok(tally)
    }

    /// Gate for execution. Call `refresh` first.
    pub fn ensure_executable(&self) -> Result<(), VaultError> {
        match self.state {
            ProposalState::Passed => Ok(()),
            ProposalState::Rejected if self.tally.total() < self.quorum_required => {
                Err(VaultError::QuorumNotMet {
                    proposal: self.id,
                    required: self.quorum_required,
                    participated: self.tally.total(),
                })
            }
            state => Err(VaultError::ProposalNotActive {
                proposal: self.id,
                state,
            }),
        }
    }

    pub(crate) fn mark_executed(&mut self, now: DateTime<Utc>) {
        self.state = ProposalState::Executed;
        self.executed_at = Some(now);
    }
}

/// Proposal storage with one mutex per proposal.
pub struct ProposalBook {
    config: GovernanceConfig,
    proposals: RwLock<BTreeMap<ProposalId, Arc<Mutex<Proposal>>>>,
    next_id: Mutex<u64>,
}

impl ProposalBook {
    pub fn new(config: GovernanceConfig) -> Self {
        Self {
            config,
            proposals: RwLock::new(BTreeMap::new()),
            next_id: Mutex::new(1),
        }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Check proposer power and window bounds, then store a new proposal.
    ///
    /// `voting_power` is the governance-asset balance of every holder at `now`;
    /// votes on this proposal are bounded by it.
    pub fn submit(
        &self,
        proposer: &Address,
        title: impl Into<String>,
        payload: ProposalPayload,
        voting_window_secs: i64,
        voting_power: BTreeMap<Address, Amount>,
        now: DateTime<Utc>,
    ) -> Result<Proposal, VaultError> {
        let proposer_power = voting_power.get(proposer).copied().unwrap_or(0);
        if proposer_power < self.config.min_proposal_power {
            return Err(VaultError::Unauthorized {
                actor: proposer.clone(),
                action: "create proposals",
            });
        }
        if voting_window_secs < self.config.min_voting_window_secs
            || voting_window_secs > self.config.max_voting_window_secs
        {
            return Err(VaultError::InvalidParameter(format!(
                "voting window {voting_window_secs}s outside [{}, {}]",
                self.config.min_voting_window_secs, self.config.max_voting_window_secs
            )));
        }

        let mut next_id = self
            .next_id
            .lock()
            .map_err(|_| VaultError::LockPoisoned("proposal ids"))?;
        let mut proposals = self
            .proposals
            .write()
            .map_err(|_| VaultError::LockPoisoned("proposals"))?;

        let voting_starts_at = now + Duration::seconds(self.config.voting_delay_secs);
        let mut proposal = Proposal {
            id: ProposalId(*next_id),
            proposer: proposer.clone(),
            title: title.into(),
            payload,
            state: ProposalState::Pending,
            tally: Tally::default(),
            quorum_required: self.config.quorum_required,
            created_at: now,
            voting_starts_at,
            voting_ends_at: voting_starts_at + Duration::seconds(voting_window_secs),
            executed_at: None,
            voters: BTreeMap::new(),
            voting_power,
        };
        proposal.refresh(now);

        proposals.insert(proposal.id, Arc::new(Mutex::new(proposal.clone())));
        *next_id += 1;
        info!(
            proposal = %proposal.id,
            proposer = %proposer,
            category = %proposal.category(),
            state = ?proposal.state,
            "Proposal created"
        );
        Ok(proposal)
    }

    pub fn handle(&self, id: ProposalId) -> Result<Arc<Mutex<Proposal>>, VaultError> {
        self.proposals
            .read()
            .map_err(|_| VaultError::LockPoisoned("proposals"))?
            .get(&id)
            .cloned()
            .ok_or(VaultError::UnknownProposal(id))
    }

    pub fn get(&self, id: ProposalId) -> Result<Proposal, VaultError> {
        let handle = self.handle(id)?;
        let proposal = handle
            .lock()
            .map_err(|_| VaultError::LockPoisoned("proposal"))?;
        Ok(proposal.clone())
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.lock().map(|id| *id).unwrap_or(0)
    }

    pub fn all(&self) -> Result<Vec<Proposal>, VaultError> {
        let handles: Vec<Arc<Mutex<Proposal>>> = self
            .proposals
            .read()
            .map_err(|_| VaultError::LockPoisoned("proposals"))?
            .values()
            .cloned()
            .collect();
        handles
            .iter()
            .map(|handle| {
                handle
                    .lock()
                    .map(|proposal| proposal.clone())
                    .map_err(|_| VaultError::LockPoisoned("proposal"))
            })
            .collect()
    }

    /// Replace every stored proposal, e.g. when restoring a snapshot.
    pub fn restore(
        &self,
        proposals: impl IntoIterator<Item = Proposal>,
        next_id: u64,
    ) -> Result<(), VaultError> {
        let proposals: BTreeMap<ProposalId, Arc<Mutex<Proposal>>> = proposals
            .into_iter()
            .map(|proposal| (proposal.id, Arc::new(Mutex::new(proposal))))
            .collect();
        if proposals.keys().any(|id| id.0 >= next_id) {
            return Err(VaultError::InvariantViolation(format!(
                "proposal id at or above next id {next_id}"
            )));
        }
        *self
            .next_id
            .lock()
            .map_err(|_| VaultError::LockPoisoned("proposal ids"))? = next_id;
        *self
            .proposals
            .write()
            .map_err(|_| VaultError::LockPoisoned("proposals"))? = proposals;
        Ok(())
    }
}
