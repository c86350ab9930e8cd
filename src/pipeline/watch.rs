//! Watch registration: seed a contract's transfer history and TVL, then
//! subscribe to its real-time activity.

use crate::chain::ChainProvider;
use crate::error::WatchError;
use crate::registry::{ContractRegistry, TransferStore, UpsertOutcome};
use crate::timing::BlockTimer;
use crate::transfers::{Flow, TimeRange, TransferFetcher, TransferRecord};
use crate::tvl::{PerTokenTvl, TvlReconstructor};

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub user_id: String,
    pub contract_address: String,
    pub name: Option<String>,
    pub time_range: Option<String>,
}

/// Per-asset totals over the seed window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowTotals {
    pub inflow: PerTokenTvl,
    pub outflow: PerTokenTvl,
}

impl FlowTotals {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TransferRecord>) -> Self {
        let mut totals = FlowTotals::default();
        for r in records {
            let side = match r.flow {
                Flow::Inbound => &mut totals.inflow,
                Flow::Outbound => &mut totals.outflow,
            };
            *side.entry(r.asset.clone()).or_insert(Decimal::ZERO) += r.value;
        }
        totals
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSummary {
    pub contract_address: String,
    pub webhook_id: String,
    pub anchor_block: u64,
    pub time_range: String,
    /// Balance per asset at the anchor block.
    pub tvl: PerTokenTvl,
    /// Balance per asset at the start of the window.
    pub opening_tvl: PerTokenTvl,
    pub flows: FlowTotals,
    pub transfers_stored: usize,
    pub created: bool,
}

pub struct WatchService {
    provider: Arc<dyn ChainProvider>,
    timer: BlockTimer,
    fetcher: TransferFetcher,
    reconstructor: TvlReconstructor,
    registry: Arc<dyn ContractRegistry>,
    transfers: Arc<dyn TransferStore>,
    default_range: TimeRange,
}

impl WatchService {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        timer: BlockTimer,
        registry: Arc<dyn ContractRegistry>,
        transfers: Arc<dyn TransferStore>,
        default_range: TimeRange,
    ) -> Self {
        let fetcher = TransferFetcher::new(provider.clone(), timer.timing().interval.as_secs());
        let reconstructor = TvlReconstructor::new(provider.clone());
        Self {
            provider,
            timer,
            fetcher,
            reconstructor,
            registry,
            transfers,
            default_range,
        }
    }

    /// Webhook already bound to `address`, or a newly created one.
    async fn subscription_for(&self, address: &str) -> Result<String, WatchError> {
        if let Some(existing) = self.registry.get(address).await?.and_then(|c| c.webhook_id) {
            debug!(contract = %address, webhook_id = %existing, "reusing address activity webhook");
            return Ok(existing);
        }
        Ok(self.provider.create_address_activity_webhook(address).await?)
    }

    /// Estimate block, fetch both directions, reconstruct, obtain the webhook,
    /// then persist the seed history and record the watch.
    pub async fn register(&self, request: WatchRequest) -> Result<WatchSummary, WatchError> {
        let started = Instant::now();
        let address = request.contract_address.to_lowercase();
        let range = match request.time_range.as_deref() {
            Some(r) => r.parse::<TimeRange>()?,
            None => self.default_range,
        };
        info!(
            user = %request.user_id,
            contract = %address,
            name = request.name.as_deref().unwrap_or(""),
            range = %range,
            "watch registration"
        );

        let request_time_ms = chrono::Utc::now().timestamp_millis();
        let anchor_block = self.timer.estimate_safe_block().await?;

        let flows = self
            .fetcher
            .fetch_inflow_and_outflow(&address, range, anchor_block, request_time_ms)
            .await?;

        let reconstruction = self
            .reconstructor
            .reconstruct_tvl(flows.inflow, flows.outflow, &address, anchor_block)
            .await?;

        // provider work ends here; nothing is written until it all succeeded
        let webhook_id = self.subscription_for(&address).await?;

        let seed: Vec<TransferRecord> = reconstruction.chronological().cloned().collect();
        let transfers_stored = self.transfers.append_transfers(&address, &seed).await?;
        let outcome = self
            .registry
            .upsert(&address, &request.user_id, Some(&webhook_id))
            .await?;

        info!(
            contract = %address,
            webhook_id = %webhook_id,
            anchor_block,
            transfers = transfers_stored,
            ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "watch registered"
        );

        Ok(WatchSummary {
            contract_address: address,
            webhook_id,
            anchor_block,
            time_range: range.to_string(),
            opening_tvl: reconstruction.opening_balances(),
            flows: FlowTotals::from_records(&reconstruction.transfers),
            tvl: reconstruction.per_token,
            transfers_stored,
            created: outcome == UpsertOutcome::Created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{asset_transfer, MockProvider};
    use crate::chain::{ProviderError, TransferPage};
    use crate::store::MemoryStore;
    use crate::timing::BlockTiming;
    use alloy::primitives::U256;
    use std::str::FromStr;
    use std::sync::atomic::Ordering;

    const CONTRACT: &str = "0x1f9840a85d5af5bf1d1762f925bdaddc4201f984";
    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn scripted_provider() -> MockProvider {
        let now = chrono::Utc::now().timestamp() as u64;
        let mut provider = MockProvider::new()
            .with_latest(100, now)
            .with_native_balance(U256::from(5u64) * U256::from(10u64).pow(U256::from(18u64)))
            .with_token(USDC, "USDC", 6, U256::from(3_000_000u64));
        provider.outbound_pages = vec![TransferPage {
            transfers: vec![asset_transfer("0x01", 98, CONTRACT, "0xbeef", 1.0, "ETH", "external", None)],
            page_key: None,
        }];
        provider.inbound_pages = vec![TransferPage {
            transfers: vec![asset_transfer("0x02", 90, "0xbeef", CONTRACT, 2.0, "USDC", "erc20", Some(USDC))],
            page_key: None,
        }];
        provider
    }

    fn service(provider: MockProvider, store: &MemoryStore) -> WatchService {
        let provider: Arc<dyn ChainProvider> = Arc::new(provider);
        WatchService::new(
            provider.clone(),
            BlockTimer::new(provider, BlockTiming::default()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            "5m".parse().unwrap(),
        )
    }

    fn request(user: &str) -> WatchRequest {
        WatchRequest {
            user_id: user.to_string(),
            contract_address: "0x1F9840A85D5AF5BF1D1762F925BDADDC4201F984".to_string(),
            name: None,
            time_range: None,
        }
    }

    #[tokio::test]
    async fn test_register_seeds_history_and_binds_webhook() {
        let store = MemoryStore::new();
        let watch = service(scripted_provider(), &store);

        let summary = watch.register(request("alice")).await.unwrap();
        assert_eq!(summary.contract_address, CONTRACT);
        assert_eq!(summary.anchor_block, 100);
        assert_eq!(summary.webhook_id, "wh_test");
        assert_eq!(summary.tvl.get("ETH"), Some(&dec("5")));
        assert_eq!(summary.tvl.get("USDC"), Some(&dec("3")));
        assert_eq!(summary.opening_tvl.get("ETH"), Some(&dec("6")));
        assert_eq!(summary.opening_tvl.get("USDC"), Some(&dec("1")));
        assert_eq!(summary.flows.outflow.get("ETH"), Some(&dec("1")));
        assert_eq!(summary.transfers_stored, 2);
        assert!(summary.created);

        // stored oldest first
        let stored = store.transfers(CONTRACT).await.unwrap();
        assert_eq!(stored[0].hash, "0x02");
        assert_eq!(stored[1].hash, "0x01");
        assert_eq!(stored[1].running_tvl, Some(dec("5")));

        let contract = store.find_by_webhook_id("wh_test").await.unwrap().unwrap();
        assert_eq!(contract.user_ids, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_second_user_joins_existing_watch() {
        let store = MemoryStore::new();
        let watch = service(scripted_provider(), &store);
        watch.register(request("alice")).await.unwrap();
        let summary = watch.register(request("bob")).await.unwrap();

        assert!(!summary.created);
        assert_eq!(summary.transfers_stored, 0);
        assert_eq!(summary.webhook_id, "wh_test");
        let contract = store.get(CONTRACT).await.unwrap().unwrap();
        assert_eq!(contract.user_ids, vec!["alice", "bob"]);
        assert_eq!(store.contracts_for_user("bob").await.unwrap(), vec![CONTRACT.to_string()]);
    }

    #[tokio::test]
    async fn test_repeat_registration_reuses_webhook() {
        let store = MemoryStore::new();
        let provider = Arc::new(scripted_provider());
        let shared: Arc<dyn ChainProvider> = provider.clone();
        let watch = WatchService::new(
            shared.clone(),
            BlockTimer::new(shared, BlockTiming::default()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            "5m".parse().unwrap(),
        );

        watch.register(request("alice")).await.unwrap();
        watch.register(request("bob")).await.unwrap();
        watch.register(request("alice")).await.unwrap();

        assert_eq!(provider.webhook_calls.load(Ordering::SeqCst), 1);
        let contract = store.find_by_webhook_id("wh_test").await.unwrap().unwrap();
        assert_eq!(contract.user_ids, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_failed_webhook_creation_writes_nothing() {
        let store = MemoryStore::new();
        let mut provider = scripted_provider();
        provider.webhook_fails = true;
        let watch = service(provider, &store);

        let err = watch.register(request("alice")).await.unwrap_err();
        assert!(matches!(
            err,
            WatchError::ProviderUnavailable(ProviderError::Timeout { what: "create-webhook", .. })
        ));
        assert!(store.transfers(CONTRACT).await.unwrap().is_empty());
        assert!(store.get(CONTRACT).await.unwrap().is_none());
        assert!(store.contracts_for_user("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_history_registers_nothing() {
        let store = MemoryStore::new();
        let mut provider = scripted_provider();
        provider.inbound_pages.clear();
        let watch = service(provider, &store);

        let err = watch.register(request("alice")).await.unwrap_err();
        assert!(matches!(err, WatchError::InsufficientHistory { .. }));
        assert!(store.get(CONTRACT).await.unwrap().is_none());
        assert!(store.transfers(CONTRACT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_range_is_rejected() {
        let store = MemoryStore::new();
        let watch = service(scripted_provider(), &store);
        let mut req = request("alice");
        req.time_range = Some("7d".to_string());
        assert!(matches!(
            watch.register(req).await,
            Err(WatchError::InvalidTimeRange(r)) if r == "7d"
        ));
    }
}
