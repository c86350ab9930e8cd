//! Alchemy-backed [`ChainProvider`].
//!
//! Standard JSON-RPC (`eth_getBlockByNumber`, `eth_getBalance`) and the
//! Alchemy enhanced methods (`alchemy_getAssetTransfers`,
//! `alchemy_getTokenBalances`, `alchemy_getTokenMetadata`) go through a single
//! alloy HTTP provider. Webhook creation uses the Notify REST API.

use super::types::{AssetTransfer, BlockHeader, TokenBalance, TokenMetadata, TransferPage, TransferQuery};
use super::{parse_u256, to_hex_quantity, ChainProvider, ProviderError};
use crate::config::ChainConfig;

use alloy::eips::{BlockId, BlockNumberOrTag};
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Transfer categories requested for seed history.
const TRANSFER_CATEGORIES: [&str; 3] = ["erc20", "external", "internal"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssetTransfersParams {
    from_block: String,
    to_block: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to_address: Option<String>,
    category: Vec<&'static str>,
    exclude_zero_value: bool,
    with_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetTransfersResult {
    #[serde(default)]
    transfers: Vec<AssetTransfer>,
    #[serde(default)]
    page_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBalancesResult {
    #[serde(default)]
    token_balances: Vec<RawTokenBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTokenBalance {
    contract_address: String,
    #[serde(default)]
    token_balance: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CreateWebhookRequest<'a> {
    network: &'a str,
    webhook_type: &'static str,
    webhook_url: &'a str,
    addresses: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateWebhookResponse {
    data: CreatedWebhook,
}

#[derive(Debug, Deserialize)]
struct CreatedWebhook {
    id: String,
}

pub struct AlchemyProvider {
    rpc: DynProvider,
    http: reqwest::Client,
    notify_url: String,
    auth_token: String,
    network: String,
    /// Public URL the provider pushes address activity to.
    webhook_url: String,
    timeout: Duration,
}

impl AlchemyProvider {
    /// Build the RPC and Notify clients. `webhook_url` is the externally
    /// reachable address-activity endpoint of this service.
    pub async fn connect(config: &ChainConfig, webhook_url: String) -> Result<Self, ProviderError> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let rpc_url = config.rpc_endpoint();

        let rpc = ProviderBuilder::new()
            .connect(&rpc_url)
            .await
            .map_err(|e| ProviderError::Rpc {
                method: "connect",
                reason: e.to_string(),
            })?
            .erased();

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        info!(
            network = %config.network,
            timeout_ms = config.request_timeout_ms,
            "alchemy provider ready"
        );

        Ok(Self {
            rpc,
            http,
            notify_url: config.notify_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            network: config.network.clone(),
            webhook_url,
            timeout,
        })
    }

    async fn bounded<T, F>(&self, what: &'static str, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        bounded(what, self.timeout, fut).await
    }

    async fn alchemy_call<P, R>(&self, method: &'static str, params: P) -> Result<R, ProviderError>
    where
        P: alloy::rpc::json_rpc::RpcSend,
        R: alloy::rpc::json_rpc::RpcRecv,
    {
        self.bounded(method, async {
            self.rpc
                .raw_request::<P, R>(Cow::Borrowed(method), params)
                .await
                .map_err(|e| ProviderError::Rpc {
                    method,
                    reason: e.to_string(),
                })
        })
        .await
    }
}

/// Run a provider future under `after`; expiry becomes [`ProviderError::Timeout`].
pub async fn bounded<T, F>(what: &'static str, after: Duration, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout { what, after }),
    }
}

fn parse_address(s: &str) -> Result<Address, ProviderError> {
    Address::from_str(s).map_err(|_| ProviderError::InvalidAddress(s.to_string()))
}

#[async_trait]
impl ChainProvider for AlchemyProvider {
    async fn latest_block(&self) -> Result<BlockHeader, ProviderError> {
        let block = self
            .bounded("eth_getBlockByNumber", async {
                self.rpc
                    .get_block_by_number(BlockNumberOrTag::Latest)
                    .await
                    .map_err(|e| ProviderError::Rpc {
                        method: "eth_getBlockByNumber",
                        reason: e.to_string(),
                    })
            })
            .await?
            .ok_or_else(|| ProviderError::BadResponse("latest block missing".to_string()))?;

        Ok(BlockHeader {
            number: block.header.number,
            timestamp: block.header.timestamp,
        })
    }

    async fn asset_transfers(
        &self,
        query: &TransferQuery,
        page_key: Option<String>,
    ) -> Result<TransferPage, ProviderError> {
        let params = AssetTransfersParams {
            from_block: to_hex_quantity(query.from_block),
            to_block: to_hex_quantity(query.to_block),
            from_address: query.from_address.clone(),
            to_address: query.to_address.clone(),
            category: TRANSFER_CATEGORIES.to_vec(),
            exclude_zero_value: true,
            with_metadata: false,
            page_key,
        };

        let result: AssetTransfersResult = self
            .alchemy_call("alchemy_getAssetTransfers", (params,))
            .await?;

        debug!(
            from_block = query.from_block,
            to_block = query.to_block,
            count = result.transfers.len(),
            has_more = result.page_key.is_some(),
            "asset transfers page"
        );

        Ok(TransferPage {
            transfers: result.transfers,
            page_key: result.page_key,
        })
    }

    async fn token_balances(
        &self,
        owner: &str,
        tokens: &[String],
    ) -> Result<Vec<TokenBalance>, ProviderError> {
        let result: TokenBalancesResult = self
            .alchemy_call("alchemy_getTokenBalances", (owner.to_string(), tokens.to_vec()))
            .await?;

        result
            .token_balances
            .into_iter()
            .map(|b| {
                if let Some(err) = b.error {
                    return Err(ProviderError::BadResponse(format!(
                        "balance of {} unavailable: {}",
                        b.contract_address, err
                    )));
                }
                let raw = b.token_balance.unwrap_or_default();
                let balance = parse_u256(&raw).ok_or_else(|| {
                    ProviderError::BadResponse(format!("unparseable token balance {raw:?}"))
                })?;
                Ok(TokenBalance {
                    contract_address: b.contract_address.to_lowercase(),
                    balance,
                })
            })
            .collect()
    }

    async fn native_balance(&self, owner: &str, block: u64) -> Result<U256, ProviderError> {
        let address = parse_address(owner)?;
        self.bounded("eth_getBalance", async {
            self.rpc
                .get_balance(address)
                .block_id(BlockId::number(block))
                .await
                .map_err(|e| ProviderError::Rpc {
                    method: "eth_getBalance",
                    reason: e.to_string(),
                })
        })
        .await
    }

    async fn token_metadata(&self, token: &str) -> Result<TokenMetadata, ProviderError> {
        self.alchemy_call("alchemy_getTokenMetadata", (token.to_string(),))
            .await
    }

    async fn create_address_activity_webhook(&self, address: &str) -> Result<String, ProviderError> {
        info!(contract = %address, "creating address activity webhook");

        let body = CreateWebhookRequest {
            network: &self.network,
            webhook_type: "ADDRESS_ACTIVITY",
            webhook_url: &self.webhook_url,
            addresses: vec![address],
        };

        let resp = self
            .http
            .post(format!("{}/create-webhook", self.notify_url))
            .header("X-Alchemy-Token", &self.auth_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        what: "create-webhook",
                        after: self.timeout,
                    }
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let created: CreateWebhookResponse = resp.json().await?;
        info!(contract = %address, webhook_id = %created.data.id, "address activity webhook created");
        Ok(created.data.id)
    }
}
