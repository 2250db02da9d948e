//! Vault events: broadcast to subscribers and appended to a hash-chained journal.

use crate::error::VaultError;
use crate::governance::{AppliedChange, ProposalCategory, ProposalState};
use crate::rebalancer::RebalanceAction;
use crate::types::{Address, Amount, AssetType, ProposalId, Tally, VoteDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultEvent {
    Deposited {
        account: Address,
        asset: AssetType,
        amount: Amount,
        transaction_id: String,
    },
    Withdrawn {
        account: Address,
        asset: AssetType,
        amount: Amount,
        transaction_id: String,
        transfer_ref: String,
    },
    RewardCredited {
        account: Address,
        asset: AssetType,
        amount: Amount,
    },
    Rebalanced {
        actions: Vec<RebalanceAction>,
    },
    ProposalCreated {
        proposal: ProposalId,
        proposer: Address,
        category: ProposalCategory,
    },
    VoteCast {
        proposal: ProposalId,
        voter: Address,
        direction: VoteDirection,
        amount: Amount,
        tally: Tally,
    },
    ProposalFinalized {
        proposal: ProposalId,
        state: ProposalState,
        tally: Tally,
    },
    ProposalExecuted {
        proposal: ProposalId,
        change: AppliedChange,
    },
    EmergencyPaused {
        by: Address,
    },
    Unpaused {
        by: Address,
    },
}

impl VaultEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deposited { .. } => "deposited",
            Self::Withdrawn { .. } => "withdrawn",
            Self::RewardCredited { .. } => "reward_credited",
            Self::Rebalanced { .. } => "rebalanced",
            Self::ProposalCreated { .. } => "proposal_created",
            Self::VoteCast { .. } => "vote_cast",
            Self::ProposalFinalized { .. } => "proposal_finalized",
            Self::ProposalExecuted { .. } => "proposal_executed",
            Self::EmergencyPaused { .. } => "emergency_paused",
            Self::Unpaused { .. } => "unpaused",
        }
    }
}

/// Hash-chained journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub index: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: VaultEvent,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Append-only event journal. Entries are never rewritten.
#[derive(Debug, Clone, Default)]
pub struct EventJournal {
    entries: Vec<JournalEntry>,
}

impl EventJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries, refusing a broken chain.
    pub fn from_entries(entries: Vec<JournalEntry>) -> Result<Self, VaultError> {
        let journal = Self { entries };
        if let Some((position, entry)) = journal
            .entries
            .iter()
            .enumerate()
            .find(|(position, entry)| entry.index != *position as u64)
        {
            return Err(VaultError::InvariantViolation(format!(
                "journal index gap at position {position} (found {})",
                entry.index
            )));
        }
        if !journal.verify_chain() {
            return Err(VaultError::InvariantViolation(
                "journal hash chain verification failed".into(),
            ));
        }
        Ok(journal)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(
        &mut self,
        event: VaultEvent,
        recorded_at: DateTime<Utc>,
    ) -> Result<JournalEntry, VaultError> {
        let index = self.entries.len() as u64;
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = compute_entry_hash(index, recorded_at, &event, previous_hash.as_deref())?;

        let entry = JournalEntry {
            index,
            recorded_at,
            event,
            previous_hash,
            entry_hash,
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected = compute_entry_hash(
                entry.index,
                entry.recorded_at,
                &entry.event,
                previous_hash.as_deref(),
            );
            if expected.ok().as_deref() != Some(entry.entry_hash.as_str())
                || entry.previous_hash != previous_hash
            {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }
}

#[derive(Serialize)]
struct HashMaterial<'a> {
    index: u64,
    recorded_at: DateTime<Utc>,
    event: &'a VaultEvent,
    previous_hash: Option<&'a str>,
}

fn compute_entry_hash(
    index: u64,
    recorded_at: DateTime<Utc>,
    event: &VaultEvent,
    previous_hash: Option<&str>,
) -> Result<String, VaultError> {
    let material = HashMaterial {
        index,
        recorded_at,
        event,
        previous_hash,
    };
    let bytes =
        serde_json::to_vec(&material).map_err(|e| VaultError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Journals every event, then broadcasts it to live subscribers.
pub struct EventBus {
    sender: broadcast::Sender<VaultEvent>,
    journal: Mutex<EventJournal>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_journal(EventJournal::new())
    }

    /// Continue an existing chain, e.g. one restored from a snapshot.
    pub fn with_journal(journal: EventJournal) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            journal: Mutex::new(journal),
        }
    }

    pub fn publish(&self, event: VaultEvent, at: DateTime<Utc>) -> Result<(), VaultError> {
        self.journal
            .lock()
            .map_err(|_| VaultError::LockPoisoned("event journal"))?
            .append(event.clone(), at)?;
        debug!(event = event.name(), "Event published");
        // no receivers is fine
        let _ = self.sender.send(event);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn journal(&self) -> Result<EventJournal, VaultError> {
        self.journal
            .lock()
            .map(|journal| journal.clone())
            .map_err(|_| VaultError::LockPoisoned("event journal"))
    }
}
