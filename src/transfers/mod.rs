//! Canonical transfer records and historical transfer retrieval.
//!
//! Every value movement, whether it came from the historical query or from a
//! real-time webhook, is normalized into a [`TransferRecord`]. The
//! `unique_id` field is the idempotency key used by storage.

pub mod fetcher;

pub use fetcher::{FlowSet, TransferFetcher};

use crate::error::WatchError;
use crate::tvl::units::scale_units;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Token address used for the native coin.
pub const NATIVE_TOKEN: &str = "";

/// Transfer category. Only the three categories the pipeline requests are
/// represented; anything else is skipped at normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferCategory {
    Erc20,
    External,
    Internal,
}

impl TransferCategory {
    /// Map a provider category string (`erc20`, `token`, `external`, `internal`).
    pub fn from_provider(category: &str) -> Option<Self> {
        match category {
            "erc20" | "token" => Some(Self::Erc20),
            "external" => Some(Self::External),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for TransferCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erc20 => write!(f, "erc20"),
            Self::External => write!(f, "external"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Direction of a transfer relative to the monitored address.
/// Serialized as `1` / `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Flow {
    Inbound,
    Outbound,
}

impl Flow {
    pub fn sign(self) -> Decimal {
        match self {
            Flow::Inbound => Decimal::ONE,
            Flow::Outbound => Decimal::NEGATIVE_ONE,
        }
    }

    /// Flow of a transfer from `from` as seen by `monitored`.
    pub fn relative_to(monitored: &str, from: &str) -> Self {
        if from.eq_ignore_ascii_case(monitored) {
            Flow::Outbound
        } else {
            Flow::Inbound
        }
    }
}

impl From<Flow> for i8 {
    fn from(flow: Flow) -> i8 {
        match flow {
            Flow::Inbound => 1,
            Flow::Outbound => -1,
        }
    }
}

impl TryFrom<i8> for Flow {
    type Error = String;

    fn try_from(v: i8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Flow::Inbound),
            -1 => Ok(Flow::Outbound),
            other => Err(format!("invalid flow {other}")),
        }
    }
}

/// Raw token contract data as reported by the provider.
///
/// `value` is the hex integer amount, `decimal` the token precision. Historical
/// queries report `decimal` as a hex string, webhook deliveries as a number
/// under `decimals`; both are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContract {
    #[serde(default, alias = "rawValue")]
    pub value: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, alias = "decimals", deserialize_with = "de_decimal_field")]
    pub decimal: Option<String>,
}

fn de_decimal_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => n.as_u64().map(|d| format!("{:#x}", d)),
        _ => None,
    })
}

impl RawContract {
    pub fn decimals(&self) -> Option<u32> {
        self.decimal
            .as_deref()
            .and_then(crate::chain::parse_hex_u64)
            .and_then(|d| u32::try_from(d).ok())
    }

    /// Lowercased token address, or the native sentinel.
    pub fn token_address(&self) -> String {
        self.address
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| NATIVE_TOKEN.to_string())
    }
}

/// One normalized value movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub from: String,
    pub to: String,
    pub value: Decimal,
    pub asset: String,
    pub token_address: String,
    pub category: TransferCategory,
    pub block_number: u64,
    /// Estimated, ms since epoch. Derived from block distance or webhook
    /// delivery time, never the true block timestamp.
    pub timestamp: i64,
    pub hash: String,
    pub unique_id: String,
    pub flow: Flow,
    /// Token balance immediately after this transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_tvl: Option<Decimal>,
    #[serde(default)]
    pub raw_contract: RawContract,
}

impl TransferRecord {
    pub fn is_native(&self) -> bool {
        self.token_address == NATIVE_TOKEN
    }

    /// Signed effect of this transfer on the monitored balance.
    pub fn delta(&self) -> Decimal {
        self.flow.sign() * self.value
    }

    /// Balance immediately before this transfer.
    pub fn balance_before(&self) -> Option<Decimal> {
        self.running_tvl.map(|after| after - self.delta())
    }
}

/// Decode a transfer amount. Prefers the exact raw integer and decimals;
/// falls back to the provider's pre-scaled float.
pub fn decode_value(raw: &RawContract, fallback: Option<f64>) -> Option<Decimal> {
    if let (Some(hex), Some(decimals)) = (raw.value.as_deref(), raw.decimals()) {
        if let Some(units) = crate::chain::parse_u256(hex) {
            if let Ok(v) = scale_units(units, decimals) {
                return Some(v);
            }
        }
    }
    fallback
        .filter(|v| v.is_finite())
        .and_then(|v| Decimal::from_str(&v.to_string()).ok())
}

/// Supported lookback windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    label: &'static str,
    minutes: u64,
}

const TIME_RANGES: [(&str, u64); 7] = [
    ("24h", 60 * 24),
    ("12h", 60 * 12),
    ("6h", 60 * 6),
    ("3h", 60 * 3),
    ("1h", 60),
    ("30m", 30),
    ("5m", 5),
];

impl TimeRange {
    pub fn minutes(&self) -> u64 {
        self.minutes
    }

    /// Number of blocks covered at the given block interval, floored.
    pub fn blocks(&self, block_interval_secs: u64) -> u64 {
        if block_interval_secs == 0 {
            return 0;
        }
        self.minutes * 60 / block_interval_secs
    }
}

impl FromStr for TimeRange {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TIME_RANGES
            .iter()
            .find(|&&(label, _)| label == s)
            .map(|&(label, minutes)| TimeRange { label, minutes })
            .ok_or_else(|| WatchError::InvalidTimeRange(s.to_string()))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}
