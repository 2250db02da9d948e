//! In-memory yield venue for simulations and chaos testing.

use crate::error::AdapterError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use strata_core::{Amount, VaultError, YieldStrategy};
use tracing::debug;

#[derive(Debug)]
struct VenueBook {
    deployed: Amount,
    apy_bps: u32,
    risk_score: u8,
}

/// Tracks a deployed balance and reports configurable metrics.
///
/// `set_offline(true)` makes every call fail until switched back, which lets
/// callers exercise rollback paths deterministically.
#[derive(Debug)]
pub struct SimulatedVenue {
    name: String,
    book: Mutex<VenueBook>,
    capacity: Option<Amount>,
    offline: AtomicBool,
}

impl SimulatedVenue {
    pub fn new(name: impl Into<String>, apy_bps: u32, risk_score: u8) -> Self {
        Self {
            name: name.into(),
            book: Mutex::new(VenueBook {
                deployed: 0,
                apy_bps,
                risk_score,
            }),
            capacity: None,
            offline: AtomicBool::new(false),
        }
    }

    /// Cap on the total the venue accepts.
    pub fn with_capacity(mut self, capacity: Amount) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_apy_bps(&self, apy_bps: u32) -> Result<(), VaultError> {
        self.book()?.apy_bps = apy_bps;
        Ok(())
    }

    pub fn set_risk_score(&self, risk_score: u8) -> Result<(), VaultError> {
        self.book()?.risk_score = risk_score;
        Ok(())
    }

    pub fn deployed(&self) -> Result<Amount, VaultError> {
        Ok(self.book()?.deployed)
    }

    fn book(&self) -> Result<std::sync::MutexGuard<'_, VenueBook>, VaultError> {
        self.book
            .lock()
            .map_err(|_| VaultError::LockPoisoned("simulated venue"))
    }

    fn ensure_online(&self) -> Result<(), AdapterError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable(format!(
                "venue '{}' is offline",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl YieldStrategy for SimulatedVenue {
    fn venue(&self) -> &str {
        &self.name
    }

    async fn allocate(&self, amount: Amount) -> Result<(), VaultError> {
        self.ensure_online()?;
        let mut book = self.book()?;
        let next = book
            .deployed
            .checked_add(amount)
            .ok_or_else(|| VaultError::overflow("venue deployed balance"))?;
        if let Some(capacity) = self.capacity {
            if next > capacity {
                return Err(AdapterError::CapacityExceeded {
                    venue: self.name.clone(),
                    requested: amount,
                    room: capacity.saturating_sub(book.deployed),
                }
                .into());
            }
        }
        book.deployed = next;
        debug!(venue = %self.name, amount, deployed = next, "Simulated venue accepted funds");
        Ok(())
    }

    async fn deallocate(&self, amount: Amount) -> Result<Amount, VaultError> {
        self.ensure_online()?;
        let mut book = self.book()?;
        if amount > book.deployed {
            return Err(AdapterError::InsufficientDeployed {
                venue: self.name.clone(),
                requested: amount,
                deployed: book.deployed,
            }
            .into());
        }
        book.deployed -= amount;
        debug!(venue = %self.name, amount, deployed = book.deployed, "Simulated venue released funds");
        Ok(amount)
    }

    async fn apy_bps(&self) -> Result<u32, VaultError> {
        self.ensure_online()?;
        Ok(self.book()?.apy_bps)
    }

    async fn risk_score(&self) -> Result<u8, VaultError> {
        self.ensure_online()?;
        Ok(self.book()?.risk_score)
    }

    async fn tvl(&self) -> Result<Amount, VaultError> {
        self.ensure_online()?;
        Ok(self.book()?.deployed)
    }
}
