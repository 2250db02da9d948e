//! Per-account, per-asset balance bookkeeping and vault-wide totals.
//!
//! The ledger is the single source of truth for deposited funds. Every
//! mutation validates fully first and commits afterwards, so a failing call
//! leaves balances, totals and withdrawal windows untouched.

use crate::error::VaultError;
use crate::math;
use crate::types::{Address, Amount, AssetType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Amount withdrawn by an account within the current rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalWindow {
    pub started_at: DateTime<Utc>,
    pub withdrawn: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balances: BTreeMap<AssetType, Amount>,
    /// Profile recorded on first deposit; later deposits do not reprofile.
    pub risk_profile: String,
    pub daily_withdrawal_cap: Amount,
    pub withdrawal_windows: BTreeMap<AssetType, WithdrawalWindow>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn balance(&self, asset: AssetType) -> Amount {
        self.balances.get(&asset).copied().unwrap_or(0)
    }

    fn active_window(
        &self,
        asset: AssetType,
        window_secs: i64,
        now: DateTime<Utc>,
    ) -> Option<WithdrawalWindow> {
        self.withdrawal_windows
            .get(&asset)
            .copied()
            .filter(|window| now - window.started_at < Duration::seconds(window_secs))
    }

    /// Withdrawal allowance left in the current window.
    pub fn remaining_withdrawal(
        &self,
        asset: AssetType,
        window_secs: i64,
        now: DateTime<Utc>,
    ) -> Amount {
        let used = self
            .active_window(asset, window_secs, now)
            .map(|window| window.withdrawn)
            .unwrap_or(0);
        self.daily_withdrawal_cap.saturating_sub(used)
    }
}

/// Vault-wide totals and emergency controls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultState {
    pub total_deposits: BTreeMap<AssetType, Amount>,
    pub paused: bool,
    pub emergency_admin: Address,
}

impl VaultState {
    pub fn new(emergency_admin: Address) -> Self {
        Self {
            total_deposits: BTreeMap::new(),
            paused: false,
            emergency_admin,
        }
    }

    pub fn total(&self, asset: AssetType) -> Amount {
        self.total_deposits.get(&asset).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositReceipt {
    pub transaction_id: String,
    pub account: Address,
    pub asset: AssetType,
    pub amount: Amount,
    pub balance: Amount,
    pub created_account: bool,
}

/// A committed withdrawal debit, kept until the external transfer settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalDebit {
    pub transaction_id: String,
    pub account: Address,
    pub asset: AssetType,
    pub amount: Amount,
    pub balance: Amount,
    previous_window: Option<WithdrawalWindow>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    accounts: BTreeMap<Address, Account>,
    vault: VaultState,
}

impl Ledger {
    pub fn new(emergency_admin: Address) -> Self {
        Self {
            accounts: BTreeMap::new(),
            vault: VaultState::new(emergency_admin),
        }
    }

    /// Rebuild from persisted parts, rejecting state whose totals disagree with balances.
    pub fn from_parts(
        accounts: impl IntoIterator<Item = Account>,
        vault: VaultState,
    ) -> Result<Self, VaultError> {
        let ledger = Self {
            accounts: accounts
                .into_iter()
                .map(|account| (account.address.clone(), account))
                .collect(),
            vault,
        };
        ledger.verify_totals()?;
        Ok(ledger)
    }

    pub fn account(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn vault(&self) -> &VaultState {
        &self.vault
    }

    pub fn balance_of(&self, address: &Address, asset: AssetType) -> Amount {
        self.account(address)
            .map(|account| account.balance(asset))
            .unwrap_or(0)
    }

    /// Non-zero balances of `asset` keyed by holder.
    pub fn holders(&self, asset: AssetType) -> BTreeMap<Address, Amount> {
        self.accounts
            .values()
            .map(|account| (account.address.clone(), account.balance(asset)))
            .filter(|(_, balance)| *balance > 0)
            .collect()
    }

    pub fn total_deposits(&self, asset: AssetType) -> Amount {
        self.vault.total(asset)
    }

    pub fn is_paused(&self) -> bool {
        self.vault.paused
    }

    pub fn emergency_admin(&self) -> &Address {
        &self.vault.emergency_admin
    }

    /// Returns whether the flag changed.
    pub(crate) fn set_paused(&mut self, paused: bool) -> bool {
        let changed = self.vault.paused != paused;
        self.vault.paused = paused;
        changed
    }

    /// Deposit into `address`, creating the account on first deposit.
    pub fn deposit(
        &mut self,
        address: &Address,
        asset: AssetType,
        amount: Amount,
        risk_profile: &str,
        daily_withdrawal_cap: Amount,
        now: DateTime<Utc>,
    ) -> Result<DepositReceipt, VaultError> {
        if self.vault.paused {
            return Err(VaultError::ContractPaused);
        }
        if amount == 0 {
            return Err(VaultError::InvalidAmount {
                amount,
                reason: "deposit must be positive",
            });
        }

        let balance = math::add(
            self.balance_of(address, asset),
            amount,
            "account balance",
        )?;
        let total = math::add(self.vault.total(asset), amount, "total deposits")?;

        let created_account = !self.accounts.contains_key(address);
        let account = self
            .accounts
            .entry(address.clone())
            .or_insert_with(|| Account {
                address: address.clone(),
                balances: BTreeMap::new(),
                risk_profile: risk_profile.to_string(),
                daily_withdrawal_cap,
                withdrawal_windows: BTreeMap::new(),
                created_at: now,
            });
        if !created_account && account.risk_profile != risk_profile {
            debug!(
                account = %address,
                recorded = %account.risk_profile,
                requested = risk_profile,
                "Deposit profile differs from recorded profile; keeping recorded profile"
            );
        }
        account.balances.insert(asset, balance);
        self.vault.total_deposits.insert(asset, total);

        let receipt = DepositReceipt {
            transaction_id: Uuid::new_v4().to_string(),
            account: address.clone(),
            asset,
            amount,
            balance,
            created_account,
        };
        info!(
            account = %address,
            asset = %asset,
            amount,
            balance,
            tx = %receipt.transaction_id,
            "Deposit committed"
        );
        Ok(receipt)
    }

    /// Validate a withdrawal without mutating anything.
    pub fn check_withdrawal(
        &self,
        address: &Address,
        asset: AssetType,
        amount: Amount,
        window_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<(), VaultError> {
        if self.vault.paused {
            return Err(VaultError::ContractPaused);
        }
        if amount == 0 {
            return Err(VaultError::InvalidAmount {
                amount,
                reason: "withdrawal must be positive",
            });
        }
        let account = self
            .accounts
            .get(address)
            .ok_or_else(|| VaultError::UnknownAccount(address.clone()))?;

        let available = account.balance(asset);
        if amount > available {
            return Err(VaultError::InsufficientBalance {
                asset,
                requested: amount,
                available,
            });
        }

        let remaining = account.remaining_withdrawal(asset, window_secs, now);
        if amount > remaining {
            warn!(
                account = %address,
                asset = %asset,
                requested = amount,
                remaining,
                "Withdrawal exceeds rolling limit"
            );
            return Err(VaultError::ExceedsWithdrawalLimit {
                asset,
                requested: amount,
                remaining,
                cap: account.daily_withdrawal_cap,
            });
        }

        math::sub(self.vault.total(asset), amount, "total deposits")?;
        Ok(())
    }

    /// Debit balance, totals and the rolling window. Must run before any
    /// external transfer is issued.
    pub fn withdraw(
        &mut self,
        address: &Address,
        asset: AssetType,
        amount: Amount,
        window_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalDebit, VaultError> {
        self.check_withdrawal(address, asset, amount, window_secs, now)?;

        let total = math::sub(self.vault.total(asset), amount, "total deposits")?;
        let account = self
            .accounts
            .get_mut(address)
            .ok_or_else(|| VaultError::UnknownAccount(address.clone()))?;
        let balance = math::sub(account.balance(asset), amount, "account balance")?;

        let previous_window = account.withdrawal_windows.get(&asset).copied();
        let next_window = match account.active_window(asset, window_secs, now) {
            Some(window) => WithdrawalWindow {
                started_at: window.started_at,
                withdrawn: math::add(window.withdrawn, amount, "withdrawal window")?,
            },
            None => WithdrawalWindow {
                started_at: now,
                withdrawn: amount,
            },
        };

        account.balances.insert(asset, balance);
        account.withdrawal_windows.insert(asset, next_window);
        self.vault.total_deposits.insert(asset, total);

        Ok(WithdrawalDebit {
            transaction_id: Uuid::new_v4().to_string(),
            account: address.clone(),
            asset,
            amount,
            balance,
            previous_window,
        })
    }

    /// Undo a debit whose external transfer failed.
    pub fn restore_debit(&mut self, debit: &WithdrawalDebit) -> Result<(), VaultError> {
        let total = math::add(self.vault.total(debit.asset), debit.amount, "total deposits")?;
        let account = self
            .accounts
            .get_mut(&debit.account)
            .ok_or_else(|| VaultError::UnknownAccount(debit.account.clone()))?;
        let balance = math::add(account.balance(debit.asset), debit.amount, "account balance")?;

        account.balances.insert(debit.asset, balance);
        match debit.previous_window {
            Some(window) => account.withdrawal_windows.insert(debit.asset, window),
            None => account.withdrawal_windows.remove(&debit.asset),
        };
        self.vault.total_deposits.insert(debit.asset, total);

        warn!(
            account = %debit.account,
            asset = %debit.asset,
            amount = debit.amount,
            tx = %debit.transaction_id,
            "Withdrawal debit restored after failed transfer"
        );
        Ok(())
    }

    /// Credit harvested yield to an existing account.
    pub fn credit_reward(
        &mut self,
        address: &Address,
        asset: AssetType,
        amount: Amount,
    ) -> Result<Amount, VaultError> {
        if amount == 0 {
            return Err(VaultError::InvalidAmount {
                amount,
                reason: "reward must be positive",
            });
        }
        let current = self
            .accounts
            .get(address)
            .ok_or_else(|| VaultError::UnknownAccount(address.clone()))?
            .balance(asset);
        let balance = math::add(current, amount, "account balance")?;
        let total = math::add(self.vault.total(asset), amount, "total deposits")?;

        if let Some(account) = self.accounts.get_mut(address) {
            account.balances.insert(asset, balance);
        }
        self.vault.total_deposits.insert(asset, total);
        Ok(balance)
    }

    /// Deposits grouped by (asset, risk profile).
    pub fn cohorts(&self) -> Result<BTreeMap<(AssetType, String), Amount>, VaultError> {
        let mut cohorts: BTreeMap<(AssetType, String), Amount> = BTreeMap::new();
        for account in self.accounts.values() {
            for (asset, balance) in &account.balances {
                if *balance == 0 {
                    continue;
                }
                let entry = cohorts
                    .entry((*asset, account.risk_profile.clone()))
                    .or_insert(0);
                *entry = math::add(*entry, *balance, "cohort total")?;
            }
        }
        Ok(cohorts)
    }

    /// Assets with a non-zero vault total.
    pub fn held_assets(&self) -> Vec<AssetType> {
        self.vault
            .total_deposits
            .iter()
            .filter(|(_, total)| **total > 0)
            .map(|(asset, _)| *asset)
            .collect()
    }

    /// Σ balances == total for every asset.
    pub fn verify_totals(&self) -> Result<(), VaultError> {
        let mut computed: BTreeMap<AssetType, Amount> = BTreeMap::new();
        for account in self.accounts.values() {
            for (asset, balance) in &account.balances {
                let entry = computed.entry(*asset).or_insert(0);
                *entry = math::add(*entry, *balance, "balance sum")?;
            }
        }

        for asset in AssetType::ALL {
            let recorded = self.vault.total(asset);
            let summed = computed.get(&asset).copied().unwrap_or(0);
            if recorded != summed {
                return Err(VaultError::InvariantViolation(format!(
                    "{asset} total deposits {recorded} != sum of balances {summed}"
                )));
            }
        }
        Ok(())
    }
}
