//! Checked amount arithmetic.
//!
//! Every helper maps overflow/underflow to [`VaultError::Overflow`] so a
//! failing operation aborts before anything is committed.

use crate::error::VaultError;
use crate::types::Amount;

pub fn add(a: Amount, b: Amount, context: &'static str) -> Result<Amount, VaultError> {
    a.checked_add(b).ok_or(VaultError::overflow(context))
}

pub fn sub(a: Amount, b: Amount, context: &'static str) -> Result<Amount, VaultError> {
    a.checked_sub(b).ok_or(VaultError::overflow(context))
}

/// `value * numerator / denominator`, rounding down.
pub fn mul_div(
    value: Amount,
    numerator: Amount,
    denominator: Amount,
    context: &'static str,
) -> Result<Amount, VaultError> {
    if denominator == 0 {
        return Err(VaultError::overflow(context));
    }
    value
        .checked_mul(numerator)
        .map(|product| product / denominator)
        .ok_or(VaultError::overflow(context))
}

/// `value * pct / 100`, rounding down.
pub fn percent_of(value: Amount, pct: u8, context: &'static str) -> Result<Amount, VaultError> {
    mul_div(value, Amount::from(pct), 100, context)
}

pub fn sum<I>(values: I, context: &'static str) -> Result<Amount, VaultError>
where
    I: IntoIterator<Item = Amount>,
{
    values
        .into_iter()
        .try_fold(0, |acc: Amount, value| add(acc, value, context))
}
