//! TVL reconstruction.
//!
//! The provider only tells us the balance *now*. To attach a balance to every
//! historical transfer we take that snapshot as the balance after the most
//! recent transfer of each token and walk backward in time, undoing one
//! transfer at a time:
//!
//! ```text
//! balance_after(earlier) = balance_after(later) - flow(later) * value(later)
//! ```
//!
//! Each token's chain is independent; the adjustment always uses the
//! immediately preceding (later) record of the same token.

pub mod units;

use crate::chain::ChainProvider;
use crate::error::WatchError;
use crate::transfers::{Flow, TransferRecord, NATIVE_TOKEN};
use units::scale_units;

use alloy::primitives::U256;
use futures::future::try_join_all;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const NATIVE_SYMBOL: &str = "ETH";
pub const NATIVE_DECIMALS: u32 = 18;

/// Asset symbol -> current balance.
pub type PerTokenTvl = BTreeMap<String, Decimal>;

#[derive(Error, Debug)]
pub enum TvlError {
    #[error("token {0} reports no decimals")]
    MissingDecimals(String),
    #[error("no snapshot balance for token {0:?}")]
    MissingBalance(String),
    #[error("unsupported token precision: {0} decimals")]
    UnsupportedDecimals(u32),
    #[error("balance {0} does not fit a decimal")]
    BalanceOverflow(U256),
    #[error("balance {raw} at {decimals} decimals exceeds decimal precision")]
    PrecisionLoss { raw: U256, decimals: u32 },
}

/// Snapshot balance of one token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSnapshot {
    pub symbol: String,
    pub balance: Decimal,
}

/// Balances after all observed transfers, keyed by token address
/// (native coin under [`NATIVE_TOKEN`]).
pub type Snapshot = HashMap<String, TokenSnapshot>;

/// Result of a reconstruction: records sorted most recent first with
/// `running_tvl` filled in, plus the anchor balance per asset.
#[derive(Debug, Clone, Default)]
pub struct Reconstruction {
    pub transfers: Vec<TransferRecord>,
    pub per_token: PerTokenTvl,
}

impl Reconstruction {
    /// Records in chronological order (oldest first).
    pub fn chronological(&self) -> impl Iterator<Item = &TransferRecord> {
        self.transfers.iter().rev()
    }

    pub fn opening_balances(&self) -> PerTokenTvl {
        opening_balances(&self.transfers)
    }
}

#[derive(Clone)]
pub struct TvlReconstructor {
    provider: Arc<dyn ChainProvider>,
}

impl TvlReconstructor {
    pub fn new(provider: Arc<dyn ChainProvider>) -> Self {
        Self { provider }
    }

    /// Tag, merge, snapshot and walk. Returns asset symbol -> anchor balance
    /// together with the annotated records.
    pub async fn reconstruct_tvl(
        &self,
        inflow: Vec<TransferRecord>,
        outflow: Vec<TransferRecord>,
        address: &str,
        anchor_block: u64,
    ) -> Result<Reconstruction, WatchError> {
        let mut transfers = merge_flows(inflow, outflow);
        let snapshot = self.snapshot(&transfers, address, anchor_block).await?;
        apply_running_tvl(&mut transfers, &snapshot)?;

        let per_token = per_token_tvl(&snapshot);
        info!(
            address = %address,
            anchor_block,
            transfers = transfers.len(),
            tokens = per_token.len(),
            "tvl reconstructed"
        );
        Ok(Reconstruction {
            transfers,
            per_token,
        })
    }

    /// Reconstruct against the latest block; used by the resync path.
    pub async fn reconstruct_at_latest(
        &self,
        transfers: Vec<TransferRecord>,
        address: &str,
    ) -> Result<Reconstruction, WatchError> {
        let latest = self.provider.latest_block().await?;
        let (inflow, outflow): (Vec<_>, Vec<_>) = transfers
            .into_iter()
            .partition(|t| t.flow == Flow::Inbound);
        self.reconstruct_tvl(inflow, outflow, address, latest.number)
            .await
    }

    /// Query balances for every token present in `transfers`: one balance
    /// call for all ERC-20s, metadata per token, native balance only when a
    /// native transfer is present.
    pub async fn snapshot(
        &self,
        transfers: &[TransferRecord],
        address: &str,
        anchor_block: u64,
    ) -> Result<Snapshot, WatchError> {
        let mut tokens: Vec<String> = transfers
            .iter()
            .filter(|t| !t.is_native())
            .map(|t| t.token_address.clone())
            .collect();
        tokens.sort();
        tokens.dedup();

        let mut snapshot = Snapshot::new();

        if !tokens.is_empty() {
            let balances = self.provider.token_balances(address, &tokens).await?;
            let raw: HashMap<String, U256> = balances
                .into_iter()
                .map(|b| (b.contract_address.to_lowercase(), b.balance))
                .collect();

            let metadata = try_join_all(tokens.iter().map(|t| self.provider.token_metadata(t))).await?;

            for (token, meta) in tokens.iter().zip(metadata) {
                let decimals = meta
                    .decimals
                    .ok_or_else(|| TvlError::MissingDecimals(token.clone()))?;
                let units = raw
                    .get(token)
                    .copied()
                    .ok_or_else(|| TvlError::MissingBalance(token.clone()))?;
                let balance = scale_units(units, decimals)?;
                let symbol = meta.symbol.unwrap_or_else(|| {
                    transfers
                        .iter()
                        .find(|t| &t.token_address == token)
                        .map(|t| t.asset.clone())
                        .unwrap_or_else(|| token.clone())
                });
                debug!(token = %token, symbol = %symbol, balance = %balance, "token snapshot");
                snapshot.insert(token.clone(), TokenSnapshot { symbol, balance });
            }
        }

        if transfers.iter().any(TransferRecord::is_native) {
            let wei = self.provider.native_balance(address, anchor_block).await?;
            let balance = scale_units(wei, NATIVE_DECIMALS)?;
            debug!(balance = %balance, block = anchor_block, "native snapshot");
            snapshot.insert(
                NATIVE_TOKEN.to_string(),
                TokenSnapshot {
                    symbol: NATIVE_SYMBOL.to_string(),
                    balance,
                },
            );
        }

        Ok(snapshot)
    }
}

/// Tag inflow `+1` and outflow `-1` and merge into one set.
pub fn merge_flows(inflow: Vec<TransferRecord>, outflow: Vec<TransferRecord>) -> Vec<TransferRecord> {
    let tagged_in = inflow.into_iter().map(|mut t| {
        t.flow = Flow::Inbound;
        t
    });
    let tagged_out = outflow.into_iter().map(|mut t| {
        t.flow = Flow::Outbound;
        t
    });
    tagged_in.chain(tagged_out).collect()
}

/// Sort most recent first and fill `running_tvl` per token from `snapshot`.
pub fn apply_running_tvl(transfers: &mut [TransferRecord], snapshot: &Snapshot) -> Result<(), TvlError> {
    // stable: equal timestamps keep their relative order
    transfers.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then(b.block_number.cmp(&a.block_number))
    });

    // token -> balance after the next (earlier) record
    let mut carry: HashMap<String, Decimal> = HashMap::new();
    for t in transfers.iter_mut() {
        let after = match carry.get(&t.token_address) {
            Some(balance) => *balance,
            None => {
                snapshot
                    .get(&t.token_address)
                    .ok_or_else(|| TvlError::MissingBalance(t.token_address.clone()))?
                    .balance
            }
        };
        t.running_tvl = Some(after);
        carry.insert(t.token_address.clone(), after - t.delta());
    }
    Ok(())
}

fn per_token_tvl(snapshot: &Snapshot) -> PerTokenTvl {
    let mut out = PerTokenTvl::new();
    for snap in snapshot.values() {
        if out.insert(snap.symbol.clone(), snap.balance).is_some() {
            warn!(symbol = %snap.symbol, "two tokens share a symbol, keeping the last balance");
        }
    }
    out
}

/// Balance of each asset before its earliest record, i.e. at the start of
/// the window. Expects records most recent first, as produced by
/// [`apply_running_tvl`].
pub fn opening_balances(transfers: &[TransferRecord]) -> PerTokenTvl {
    let mut out = PerTokenTvl::new();
    for t in transfers {
        if let Some(before) = t.balance_before() {
            // later iterations are earlier in time and overwrite
            out.insert(t.asset.clone(), before);
        }
    }
    out
}
