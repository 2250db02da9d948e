use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Amount in the smallest unit of an asset.
pub type Amount = u128;

/// Basis points denominator.
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Owning address of an account or governance actor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Closed set of assets the vault accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Native,
    Usdc,
    Usdt,
    BridgedBtc,
    BridgedEth,
}

impl AssetType {
    pub const ALL: [AssetType; 5] = [
        AssetType::Native,
        AssetType::Usdc,
        AssetType::Usdt,
        AssetType::BridgedBtc,
        AssetType::BridgedEth,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Usdc => "usdc",
            Self::Usdt => "usdt",
            Self::BridgedBtc => "bridged_btc",
            Self::BridgedEth => "bridged_eth",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AssetType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AssetType::ALL
            .into_iter()
            .find(|asset| asset.name() == value.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown asset '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyId(pub u64);

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "strategy-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(pub u64);

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proposal-{}", self.0)
    }
}

/// Fixed-point price with eight decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(u128);

impl Price {
    pub const DECIMALS: u32 = 8;
    pub const SCALE: u128 = 100_000_000;

    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    /// Whole units, e.g. `Price::from_units(100)` is 100.00000000.
    pub const fn from_units(units: u128) -> Self {
        Self(units * Self::SCALE)
    }

    pub const fn raw(self) -> u128 {
        self.0
    }

    /// Absolute deviation from `reference` in basis points of `reference`.
    pub fn deviation_bps(self, reference: Price) -> u128 {
        if reference.0 == 0 {
            return u128::MAX;
        }
        let diff = self.0.abs_diff(reference.0);
        diff.saturating_mul(BPS_DENOMINATOR) / reference.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:08}",
            self.0 / Self::SCALE,
            self.0 % Self::SCALE
        )
    }
}

impl FromStr for Price {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err("empty price".to_string());
        }
        // u128 parsing alone would accept a sign in either part
        if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid price '{value}': expected decimal digits"));
        }
        if fraction.len() > Self::DECIMALS as usize {
            return Err(format!(
                "price '{value}' has more than {} decimals",
                Self::DECIMALS
            ));
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|e| format!("invalid price '{value}': {e}"))?
        };
        let padded = format!("{:0<width$}", fraction, width = Self::DECIMALS as usize);
        let fraction: u128 = padded
            .parse()
            .map_err(|e| format!("invalid price '{value}': {e}"))?;

        whole
            .checked_mul(Self::SCALE)
            .and_then(|scaled| scaled.checked_add(fraction))
            .map(Self)
            .ok_or_else(|| format!("price '{value}' overflows"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDirection {
    For,
    Against,
}

/// Voting-power-weighted tallies of a proposal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub votes_for: Amount,
    pub votes_against: Amount,
}

impl Tally {
    pub fn total(&self) -> Amount {
        self.votes_for.saturating_add(self.votes_against)
    }
}
