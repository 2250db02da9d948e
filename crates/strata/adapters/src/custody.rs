use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use strata_core::{Address, Amount, AssetType, Custody, VaultError};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub reference: String,
    pub to: Address,
    pub asset: AssetType,
    pub amount: Amount,
    pub recorded_at: DateTime<Utc>,
}

/// Dry-run custody: records every transfer instead of moving funds.
#[derive(Debug, Default)]
pub struct RecordingCustody {
    transfers: Mutex<Vec<TransferRecord>>,
}

impl RecordingCustody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transfers(&self) -> Result<Vec<TransferRecord>, VaultError> {
        Ok(self
            .transfers
            .lock()
            .map_err(|_| VaultError::LockPoisoned("custody transfers"))?
            .clone())
    }
}

#[async_trait]
impl Custody for RecordingCustody {
    async fn transfer_out(
        &self,
        to: &Address,
        asset: AssetType,
        amount: Amount,
    ) -> Result<String, VaultError> {
        let id = Uuid::new_v4().to_string();
        let short_id: String = id.chars().take(8).collect();
        let record = TransferRecord {
            reference: format!("dry-run-{short_id}"),
            to: to.clone(),
            asset,
            amount,
            recorded_at: Utc::now(),
        };
        info!(to = %to, asset = %asset, amount, reference = %record.reference, "Recorded dry-run transfer");
        let reference = record.reference.clone();
        self.transfers
            .lock()
            .map_err(|_| VaultError::LockPoisoned("custody transfers"))?
            .push(record);
        Ok(reference)
    }
}

/// Custody that refuses every transfer.
#[derive(Debug, Clone)]
pub struct FailingCustody {
    reason: String,
}

impl FailingCustody {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Custody for FailingCustody {
    async fn transfer_out(
        &self,
        _to: &Address,
        _asset: AssetType,
        _amount: Amount,
    ) -> Result<String, VaultError> {
        Err(VaultError::Custody(self.reason.clone()))
    }
}
