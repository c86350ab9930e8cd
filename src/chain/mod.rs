//! Blockchain data provider access.
//!
//! The rest of the crate talks to the chain only through [`ChainProvider`]:
//! - latest block lookup (block timing)
//! - paginated historical transfer queries (seed history)
//! - token / native balance snapshots and token metadata (TVL reconstruction)
//! - address-activity webhook creation (real-time subscription)
//!
//! `AlchemyProvider` is the production implementation. Every call it makes is
//! bounded by the configured request timeout; a timeout surfaces as
//! [`ProviderError::Timeout`].

pub mod alchemy;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use alchemy::AlchemyProvider;
pub use types::{AssetTransfer, BlockHeader, TokenBalance, TokenMetadata, TransferPage, TransferQuery};

use alloy::primitives::U256;
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("rpc call {method} failed: {reason}")]
    Rpc { method: &'static str, reason: String },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected provider response: {0}")]
    BadResponse(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Read access to chain data plus webhook subscription management.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Latest block number and its timestamp (seconds).
    async fn latest_block(&self) -> Result<BlockHeader, ProviderError>;

    /// One page of historical transfers. `page_key` continues a previous page.
    async fn asset_transfers(
        &self,
        query: &TransferQuery,
        page_key: Option<String>,
    ) -> Result<TransferPage, ProviderError>;

    /// Current raw balances of `owner` for each ERC-20 contract in `tokens`.
    async fn token_balances(
        &self,
        owner: &str,
        tokens: &[String],
    ) -> Result<Vec<TokenBalance>, ProviderError>;

    /// Native coin balance of `owner` at `block`, in wei.
    async fn native_balance(&self, owner: &str, block: u64) -> Result<U256, ProviderError>;

    async fn token_metadata(&self, token: &str) -> Result<TokenMetadata, ProviderError>;

    /// Subscribe to address activity for `address`; returns the webhook id.
    async fn create_address_activity_webhook(&self, address: &str) -> Result<String, ProviderError>;
}

/// Parse a `0x`-prefixed hex quantity (block numbers, log indexes).
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if digits.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Parse a hex (or decimal) integer quantity into a U256.
/// Providers return `"0x"` for zero balances, which maps to zero.
pub fn parse_u256(s: &str) -> Option<U256> {
    let trimmed = s.trim();
    if trimmed == "0x" || trimmed.is_empty() {
        return Some(U256::ZERO);
    }
    U256::from_str(trimmed).ok()
}

pub fn to_hex_quantity(n: u64) -> String {
    format!("{:#x}", n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_quantities() {
        assert_eq!(parse_hex_u64("0x1183577"), Some(18_363_767));
        assert_eq!(parse_hex_u64("0x13f"), Some(319));
        assert_eq!(parse_hex_u64("0x"), Some(0));
        assert_eq!(parse_hex_u64("42"), None);
        assert_eq!(to_hex_quantity(18_363_767), "0x1183577");
    }

    #[test]
    fn test_parse_u256_balances() {
        assert_eq!(parse_u256("0x"), Some(U256::ZERO));
        assert_eq!(
            parse_u256("0x00000000000000000000000000000000000000000000000022b1c8c1227a0000"),
            Some(U256::from(2_500_000_000_000_000_000u128))
        );
        assert_eq!(parse_u256("not a number"), None);
    }
}
