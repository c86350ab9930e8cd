//! Provider request/response types.

use crate::transfers::RawContract;
use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    /// Unix seconds.
    pub timestamp: u64,
}

/// Block window and address side of a historical transfer query.
/// Exactly one of `from_address` / `to_address` is set per query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferQuery {
    pub from_block: u64,
    pub to_block: u64,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TransferPage {
    pub transfers: Vec<AssetTransfer>,
    pub page_key: Option<String>,
}

/// One historical transfer as returned by `alchemy_getAssetTransfers`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTransfer {
    pub block_num: String,
    pub unique_id: String,
    pub hash: String,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub asset: Option<String>,
    pub category: String,
    #[serde(default)]
    pub raw_contract: RawContract,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBalance {
    pub contract_address: String,
    pub balance: U256,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenMetadata {
    #[serde(default)]
    pub decimals: Option<u32>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}
