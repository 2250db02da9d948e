#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use strata_core::{
    Address, Amount, AssetType, Clock, Custody, EngineConfig, ManualClock, OracleReading, Price,
    PriceSource, StrategyId, StrategySpec, VaultEngine, VaultError, YieldStrategy,
};
use tokio::sync::Notify;

pub const ADMIN: &str = "admin";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
}

pub fn addr(name: &str) -> Address {
    Address::new(name)
}

/// Quotes the same price for every asset, stamped with the shared clock.
pub struct FakePriceSource {
    id: String,
    price: Mutex<Price>,
    clock: Arc<ManualClock>,
}

impl FakePriceSource {
    pub fn new(id: &str, units: u128, clock: Arc<ManualClock>) -> Self {
        Self {
            id: id.to_string(),
            price: Mutex::new(Price::from_units(units)),
            clock,
        }
    }

    pub fn set_units(&self, units: u128) {
        *self.price.lock().unwrap() = Price::from_units(units);
    }
}

#[async_trait]
impl PriceSource for FakePriceSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, asset: AssetType) -> Result<OracleReading, VaultError> {
        Ok(OracleReading {
            asset,
            price: *self.price.lock().unwrap(),
            observed_at: self.clock.now(),
            source_id: self.id.clone(),
        })
    }
}

pub struct FakeVenue {
    name: String,
    pub deployed: Mutex<Amount>,
    pub apy_bps: u32,
    pub risk_score: u8,
    pub fail_allocate: AtomicBool,
    pub fail_deallocate: AtomicBool,
    /// When set, `deallocate` signals `deallocating` and waits for `resume`.
    pub hold_deallocate: AtomicBool,
    pub deallocating: Notify,
    pub resume: Notify,
}

impl FakeVenue {
    pub fn new(name: &str, apy_bps: u32, risk_score: u8) -> Self {
        Self {
            name: name.to_string(),
            deployed: Mutex::new(0),
            apy_bps,
            risk_score,
            fail_allocate: AtomicBool::new(false),
            fail_deallocate: AtomicBool::new(false),
            hold_deallocate: AtomicBool::new(false),
            deallocating: Notify::new(),
            resume: Notify::new(),
        }
    }

    pub fn deployed(&self) -> Amount {
        *self.deployed.lock().unwrap()
    }
}

#[async_trait]
impl YieldStrategy for FakeVenue {
    fn venue(&self) -> &str {
        &self.name
    }

    async fn allocate(&self, amount: Amount) -> Result<(), VaultError> {
        if self.fail_allocate.load(Ordering::SeqCst) {
            return Err(VaultError::InvalidParameter(format!("{} is down", self.name)));
        }
        *self.deployed.lock().unwrap() += amount;
        Ok(())
    }

    async fn deallocate(&self, amount: Amount) -> Result<Amount, VaultError> {
        if self.fail_deallocate.load(Ordering::SeqCst) {
            return Err(VaultError::InvalidParameter(format!("{} is down", self.name)));
        }
        if self.hold_deallocate.load(Ordering::SeqCst) {
            self.deallocating.notify_one();
            self.resume.notified().await;
        }
        *self.deployed.lock().unwrap() -= amount;
        Ok(amount)
    }

    async fn apy_bps(&self) -> Result<u32, VaultError> {
        Ok(self.apy_bps)
    }

    async fn risk_score(&self) -> Result<u8, VaultError> {
        Ok(self.risk_score)
    }

    async fn tvl(&self) -> Result<Amount, VaultError> {
        Ok(self.deployed())
    }
}

#[derive(Default)]
pub struct FakeCustody {
    pub transfers: Mutex<Vec<(Address, AssetType, Amount)>>,
    pub fail: AtomicBool,
}

impl FakeCustody {
    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }
}

#[async_trait]
impl Custody for FakeCustody {
    async fn transfer_out(
        &self,
        to: &Address,
        asset: AssetType,
        amount: Amount,
    ) -> Result<String, VaultError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VaultError::Custody("bridge unavailable".into()));
        }
        let mut transfers = self.transfers.lock().unwrap();
        transfers.push((to.clone(), asset, amount));
        Ok(format!("transfer-{}", transfers.len()))
    }
}

pub struct Harness {
    pub engine: Arc<VaultEngine>,
    pub clock: Arc<ManualClock>,
    pub custody: Arc<FakeCustody>,
    pub sources: Vec<Arc<FakePriceSource>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig {
            emergency_admin: addr(ADMIN),
            ..EngineConfig::default()
        })
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let custody = Arc::new(FakeCustody::default());
        let engine = VaultEngine::new(config, custody.clone())
            .unwrap()
            .with_clock(clock.clone());
        let sources: Vec<Arc<FakePriceSource>> = ["feed-a", "feed-b", "feed-c"]
            .into_iter()
            .map(|id| Arc::new(FakePriceSource::new(id, 100, clock.clone())))
            .collect();
        for source in &sources {
            engine.register_price_source(source.clone()).unwrap();
        }
        Self {
            engine: Arc::new(engine),
            clock,
            custody,
            sources,
        }
    }

    pub fn set_price(&self, units: u128) {
        for source in &self.sources {
            source.set_units(units);
        }
    }

    /// Register a venue and push a strategy for it through governance.
    pub async fn add_strategy(
        &self,
        venue: Arc<FakeVenue>,
        asset: AssetType,
        max_allocation: Amount,
    ) -> StrategyId {
        self.engine.register_venue(venue.clone()).unwrap();
        let whale = addr("governance-whale");
        self.engine
            .deposit(&whale, self.engine.config().governance_asset, 1_000_000, "balanced")
            .await
            .ok();

        let payload = strata_core::ProposalPayload::AddStrategy(StrategySpec {
            name: venue.venue().to_string(),
            venue: venue.venue().to_string(),
            asset,
            max_allocation,
            risk_score: venue.risk_score,
            apy_bps: venue.apy_bps,
        });
        let id = self
            .engine
            .create_proposal(&whale, "add venue", payload, 3_600)
            .await
            .unwrap();
        let power = self.engine.voting_power(&whale).unwrap();
        self.engine
            .vote(&whale, id, strata_core::VoteDirection::For, power)
            .await
            .unwrap();
        self.clock.advance(chrono::Duration::seconds(3_600));
        match self.engine.execute_proposal(&whale, id).await.unwrap() {
            strata_core::AppliedChange::StrategyAdded(record) => record.id,
            other => panic!("unexpected change {other:?}"),
        }
    }
}
