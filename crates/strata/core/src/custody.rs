use crate::error::VaultError;
use crate::types::{Address, Amount, AssetType};
use async_trait::async_trait;

/// Moves funds out of the vault to an external address.
///
/// Called only after the ledger debit has been committed. An error makes the
/// engine re-credit the debit.
#[async_trait]
pub trait Custody: Send + Sync {
    /// Returns an external transfer reference.
    async fn transfer_out(
        &self,
        to: &Address,
        asset: AssetType,
        amount: Amount,
    ) -> Result<String, VaultError>;
}
