//! Scripted in-memory provider for tests.

use super::types::{AssetTransfer, BlockHeader, TokenBalance, TokenMetadata, TransferPage, TransferQuery};
use super::{ChainProvider, ProviderError};
use crate::transfers::RawContract;

use alloy::primitives::U256;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MockProvider {
    pub latest: Option<BlockHeader>,
    /// Pages served for `fromAddress` queries, in order.
    pub outbound_pages: Vec<TransferPage>,
    /// Pages served for `toAddress` queries, in order.
    pub inbound_pages: Vec<TransferPage>,
    pub token_balances: HashMap<String, U256>,
    pub metadata: HashMap<String, TokenMetadata>,
    pub native_balance: U256,
    pub webhook_id: String,
    pub unavailable: bool,
    /// Only webhook creation fails, with a timeout.
    pub webhook_fails: bool,
    pub webhook_calls: AtomicUsize,
    pub queries: Mutex<Vec<(TransferQuery, Option<String>)>>,
    pub balance_calls: AtomicUsize,
    pub native_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            webhook_id: "wh_test".to_string(),
            ..Default::default()
        }
    }

    pub fn with_latest(mut self, number: u64, timestamp: u64) -> Self {
        self.latest = Some(BlockHeader { number, timestamp });
        self
    }

    pub fn with_token(mut self, address: &str, symbol: &str, decimals: u32, balance: U256) -> Self {
        self.token_balances.insert(address.to_string(), balance);
        self.metadata.insert(
            address.to_string(),
            TokenMetadata {
                decimals: Some(decimals),
                symbol: Some(symbol.to_string()),
                name: None,
            },
        );
        self
    }

    pub fn with_native_balance(mut self, wei: U256) -> Self {
        self.native_balance = wei;
        self
    }

    fn check(&self, method: &'static str) -> Result<(), ProviderError> {
        if self.unavailable {
            return Err(ProviderError::Rpc {
                method,
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

/// Build a provider-shaped transfer with an 18-decimal raw value.
pub fn asset_transfer(
    hash: &str,
    block: u64,
    from: &str,
    to: &str,
    value: f64,
    asset: &str,
    category: &str,
    token_address: Option<&str>,
) -> AssetTransfer {
    let suffix = match category {
        "erc20" => ":log:0",
        "internal" => ":internal:0",
        _ => ":external",
    };
    AssetTransfer {
        block_num: format!("{:#x}", block),
        unique_id: format!("{hash}{suffix}"),
        hash: hash.to_string(),
        from: from.to_string(),
        to: Some(to.to_string()),
        value: Some(value),
        asset: Some(asset.to_string()),
        category: category.to_string(),
        raw_contract: RawContract {
            value: None,
            address: token_address.map(str::to_string),
            decimal: None,
        },
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn latest_block(&self) -> Result<BlockHeader, ProviderError> {
        self.check("eth_getBlockByNumber")?;
        self.latest
            .ok_or_else(|| ProviderError::BadResponse("no latest block scripted".to_string()))
    }

    async fn asset_transfers(
        &self,
        query: &TransferQuery,
        page_key: Option<String>,
    ) -> Result<TransferPage, ProviderError> {
        self.check("alchemy_getAssetTransfers")?;
        self.queries
            .lock()
            .unwrap()
            .push((query.clone(), page_key.clone()));

        let pages = if query.from_address.is_some() {
            &self.outbound_pages
        } else {
            &self.inbound_pages
        };
        let index = page_key
            .as_deref()
            .and_then(|k| k.strip_prefix("page-"))
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        Ok(pages.get(index).cloned().unwrap_or_default())
    }

    async fn token_balances(
        &self,
        _owner: &str,
        tokens: &[String],
    ) -> Result<Vec<TokenBalance>, ProviderError> {
        self.check("alchemy_getTokenBalances")?;
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        Ok(tokens
            .iter()
            .map(|t| TokenBalance {
                contract_address: t.clone(),
                balance: self.token_balances.get(t).copied().unwrap_or(U256::ZERO),
            })
            .collect())
    }

    async fn native_balance(&self, _owner: &str, _block: u64) -> Result<U256, ProviderError> {
        self.check("eth_getBalance")?;
        self.native_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.native_balance)
    }

    async fn token_metadata(&self, token: &str) -> Result<TokenMetadata, ProviderError> {
        self.check("alchemy_getTokenMetadata")?;
        Ok(self.metadata.get(token).cloned().unwrap_or_default())
    }

    async fn create_address_activity_webhook(&self, _address: &str) -> Result<String, ProviderError> {
        self.check("create-webhook")?;
        self.webhook_calls.fetch_add(1, Ordering::SeqCst);
        if self.webhook_fails {
            return Err(ProviderError::Timeout {
                what: "create-webhook",
                after: std::time::Duration::from_secs(10),
            });
        }
        Ok(self.webhook_id.clone())
    }
}
