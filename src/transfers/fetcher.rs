//! Paginated historical transfer retrieval.
//!
//! A lookback window of `range` is converted to a block count at the fixed
//! block interval and queried as `[anchor - blocks, anchor - 2]`; the two
//! block buffer avoids blocks the provider has not indexed yet. Inbound and
//! outbound sides are separate queries.

use super::{decode_value, Flow, TimeRange, TransferCategory, TransferRecord};
use crate::chain::{parse_hex_u64, AssetTransfer, ChainProvider, ProviderError, TransferQuery};
use crate::error::WatchError;

use std::sync::Arc;
use tracing::{debug, info, warn};

/// Blocks below the anchor that are left out of the query window.
const INDEXING_BUFFER_BLOCKS: u64 = 2;

/// Inbound and outbound transfers of one address over one window.
#[derive(Debug, Clone, Default)]
pub struct FlowSet {
    pub inflow: Vec<TransferRecord>,
    pub outflow: Vec<TransferRecord>,
}

impl FlowSet {
    pub fn len(&self) -> usize {
        self.inflow.len() + self.outflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct TransferFetcher {
    provider: Arc<dyn ChainProvider>,
    block_interval_secs: u64,
}

impl TransferFetcher {
    pub fn new(provider: Arc<dyn ChainProvider>, block_interval_secs: u64) -> Self {
        Self {
            provider,
            block_interval_secs,
        }
    }

    /// Block window `[from, to]` for `range` ending at `anchor_block`.
    pub fn window(&self, range: TimeRange, anchor_block: u64) -> (u64, u64) {
        let blocks = range.blocks(self.block_interval_secs);
        (
            anchor_block.saturating_sub(blocks),
            anchor_block.saturating_sub(INDEXING_BUFFER_BLOCKS),
        )
    }

    /// All transfers of `address` in one direction, every page accumulated.
    pub async fn fetch_transfers(
        &self,
        address: &str,
        direction: Flow,
        range: TimeRange,
        anchor_block: u64,
        request_time_ms: i64,
    ) -> Result<Vec<TransferRecord>, WatchError> {
        let (from_block, to_block) = self.window(range, anchor_block);
        let query = match direction {
            Flow::Outbound => TransferQuery {
                from_block,
                to_block,
                from_address: Some(address.to_string()),
                to_address: None,
            },
            Flow::Inbound => TransferQuery {
                from_block,
                to_block,
                from_address: None,
                to_address: Some(address.to_string()),
            },
        };

        let mut raw = Vec::new();
        let mut page_key = None;
        let mut pages = 0usize;
        loop {
            let page = self.provider.asset_transfers(&query, page_key).await?;
            pages += 1;
            raw.extend(page.transfers);
            match page.page_key {
                Some(key) if !key.is_empty() => page_key = Some(key),
                _ => break,
            }
        }

        debug!(
            address = %address,
            ?direction,
            from_block,
            to_block,
            pages,
            count = raw.len(),
            "fetched transfer history"
        );

        let interval_ms = (self.block_interval_secs * 1000) as i64;
        let mut records = Vec::with_capacity(raw.len());
        for transfer in &raw {
            if let Some(record) =
                normalize_transfer(transfer, direction, anchor_block, request_time_ms, interval_ms)?
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Both directions, queried concurrently. Either side empty is
    /// `InsufficientHistory`: a one-sided seed would produce a misleading
    /// running balance.
    pub async fn fetch_inflow_and_outflow(
        &self,
        address: &str,
        range: TimeRange,
        anchor_block: u64,
        request_time_ms: i64,
    ) -> Result<FlowSet, WatchError> {
        let (outflow, inflow) = tokio::try_join!(
            self.fetch_transfers(address, Flow::Outbound, range, anchor_block, request_time_ms),
            self.fetch_transfers(address, Flow::Inbound, range, anchor_block, request_time_ms),
        )?;

        if outflow.is_empty() || inflow.is_empty() {
            warn!(
                address = %address,
                range = %range,
                inflow = inflow.len(),
                outflow = outflow.len(),
                "not enough transfer history"
            );
            return Err(WatchError::InsufficientHistory {
                range: range.to_string(),
            });
        }

        info!(
            address = %address,
            range = %range,
            anchor_block,
            inflow = inflow.len(),
            outflow = outflow.len(),
            "transfer history loaded"
        );
        Ok(FlowSet { inflow, outflow })
    }
}

/// Normalize one provider transfer. Categories outside erc20/external/internal
/// yield `None`.
pub fn normalize_transfer(
    transfer: &AssetTransfer,
    flow: Flow,
    anchor_block: u64,
    request_time_ms: i64,
    block_interval_ms: i64,
) -> Result<Option<TransferRecord>, ProviderError> {
    let Some(category) = TransferCategory::from_provider(&transfer.category) else {
        debug!(category = %transfer.category, hash = %transfer.hash, "skipping unsupported category");
        return Ok(None);
    };

    let block_number = parse_hex_u64(&transfer.block_num).ok_or_else(|| {
        ProviderError::BadResponse(format!("bad block number {:?}", transfer.block_num))
    })?;

    let value = decode_value(&transfer.raw_contract, transfer.value).ok_or_else(|| {
        ProviderError::BadResponse(format!("transfer {} has no decodable value", transfer.unique_id))
    })?;

    let blocks_behind = anchor_block.saturating_sub(block_number) as i64;
    let timestamp = request_time_ms - blocks_behind * block_interval_ms;

    let token_address = transfer.raw_contract.token_address();
    let asset = transfer.asset.clone().unwrap_or_else(|| {
        if token_address.is_empty() {
            crate::tvl::NATIVE_SYMBOL.to_string()
        } else {
            token_address.clone()
        }
    });

    Ok(Some(TransferRecord {
        from: transfer.from.to_lowercase(),
        to: transfer.to.as_deref().unwrap_or_default().to_lowercase(),
        value,
        asset,
        token_address,
        category,
        block_number,
        timestamp,
        hash: transfer.hash.clone(),
        unique_id: transfer.unique_id.clone(),
        flow,
        running_tvl: None,
        raw_contract: transfer.raw_contract.clone(),
    }))
}
