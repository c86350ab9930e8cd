//! Real-time address activity ingestion.
//!
//! The provider may deliver activity for a freshly created webhook before the
//! watch registration has stored the webhook binding. A lookup miss is
//! retried exactly once after `race_retry_delay`; a second miss is an error.

use crate::chain::parse_hex_u64;
use crate::error::WatchError;
use crate::registry::{ContractRegistry, MonitoredContract, TransferStore};
use crate::transfers::{decode_value, Flow, RawContract, TransferCategory, TransferRecord};
use crate::tvl::TvlReconstructor;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Address activity webhook body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressActivityUpdate {
    pub webhook_id: String,
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub event: ActivityEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityEvent {
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub activity: Vec<Activity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityCategory {
    Token,
    Internal,
    External,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLog {
    pub log_index: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

/// One entry of an address activity delivery.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub from_address: String,
    #[serde(default)]
    pub to_address: Option<String>,
    pub block_num: String,
    pub hash: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub asset: Option<String>,
    pub category: ActivityCategory,
    /// `call_N` for internal transfers.
    #[serde(default)]
    pub type_trace_address: Option<String>,
    #[serde(default)]
    pub raw_contract: RawContract,
    #[serde(default)]
    pub log: Option<ActivityLog>,
}

impl Activity {
    pub fn decoded_value(&self) -> Option<Decimal> {
        decode_value(&self.raw_contract, self.value)
    }

    pub fn has_value(&self) -> bool {
        self.decoded_value().is_some_and(|v| !v.is_zero())
    }
}

/// Idempotency key of an activity entry: `{hash}:log:{logIndex}` for token
/// transfers, `{hash}:internal:{n}` for internal calls, `{hash}:external`.
pub fn activity_unique_id(activity: &Activity) -> Result<String, WatchError> {
    match activity.category {
        ActivityCategory::Token => {
            let log = activity.log.as_ref().ok_or_else(|| {
                WatchError::MalformedActivity(format!("token transfer {} carries no log", activity.hash))
            })?;
            let index = parse_hex_u64(&log.log_index).ok_or_else(|| {
                WatchError::MalformedActivity(format!("bad log index {:?}", log.log_index))
            })?;
            Ok(format!("{}:log:{}", activity.hash, index))
        }
        ActivityCategory::Internal => {
            let call = activity
                .type_trace_address
                .as_deref()
                .and_then(|t| t.split_once("call_"))
                .map(|(_, n)| n)
                .ok_or_else(|| {
                    WatchError::MalformedActivity(format!(
                        "internal transfer {} carries no trace address",
                        activity.hash
                    ))
                })?;
            Ok(format!("{}:internal:{}", activity.hash, call))
        }
        ActivityCategory::External => Ok(format!("{}:external", activity.hash)),
        ActivityCategory::Other => Err(WatchError::MalformedActivity(format!(
            "transfer {} has an unsupported category",
            activity.hash
        ))),
    }
}

/// Normalize one activity entry against the monitored contract. Entries of
/// other categories yield `None`.
pub fn normalize_activity(
    activity: &Activity,
    contract_address: &str,
    timestamp_ms: i64,
) -> Result<Option<TransferRecord>, WatchError> {
    let category = match activity.category {
        ActivityCategory::Token => TransferCategory::Erc20,
        ActivityCategory::Internal => TransferCategory::Internal,
        ActivityCategory::External => TransferCategory::External,
        ActivityCategory::Other => {
            debug!(hash = %activity.hash, "skipping activity of unsupported category");
            return Ok(None);
        }
    };

    let unique_id = activity_unique_id(activity)?;
    let block_number = parse_hex_u64(&activity.block_num)
        .ok_or_else(|| WatchError::MalformedActivity(format!("bad block number {:?}", activity.block_num)))?;
    let value = activity
        .decoded_value()
        .ok_or_else(|| WatchError::MalformedActivity(format!("{unique_id} has no decodable value")))?;

    let token_address = activity.raw_contract.token_address();
    let asset = activity.asset.clone().unwrap_or_else(|| {
        if token_address.is_empty() {
            crate::tvl::NATIVE_SYMBOL.to_string()
        } else {
            token_address.clone()
        }
    });

    Ok(Some(TransferRecord {
        from: activity.from_address.to_lowercase(),
        to: activity.to_address.as_deref().unwrap_or_default().to_lowercase(),
        value,
        asset,
        token_address,
        category,
        block_number,
        timestamp: timestamp_ms,
        hash: activity.hash.clone(),
        unique_id,
        flow: Flow::relative_to(contract_address, &activity.from_address),
        running_tvl: None,
        raw_contract: activity.raw_contract.clone(),
    }))
}

/// When a webhook batch triggers a full TVL reconstruction instead of the
/// incremental carry-forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncPolicy {
    pub after: Option<Duration>,
}

impl ResyncPolicy {
    pub fn is_due(&self, last_resync: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let Some(after) = self.after else {
            return false;
        };
        (now - last_resync).to_std().is_ok_and(|elapsed| elapsed > after)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Nothing with a non-zero value in the delivery.
    NoTransfers,
    Appended {
        contract: String,
        received: usize,
        inserted: usize,
    },
    Resynced {
        contract: String,
        received: usize,
        inserted: usize,
    },
}

pub struct WebhookIngestor {
    registry: Arc<dyn ContractRegistry>,
    transfers: Arc<dyn TransferStore>,
    reconstructor: TvlReconstructor,
    race_retry_delay: Duration,
    resync: ResyncPolicy,
}

impl WebhookIngestor {
    pub fn new(
        registry: Arc<dyn ContractRegistry>,
        transfers: Arc<dyn TransferStore>,
        reconstructor: TvlReconstructor,
        race_retry_delay: Duration,
        resync: ResyncPolicy,
    ) -> Self {
        Self {
            registry,
            transfers,
            reconstructor,
            race_retry_delay,
            resync,
        }
    }

    pub async fn ingest(&self, update: &AddressActivityUpdate) -> Result<IngestOutcome, WatchError> {
        let active: Vec<&Activity> = update.event.activity.iter().filter(|a| a.has_value()).collect();
        info!(
            webhook_id = %update.webhook_id,
            delivery = %update.id,
            activity = update.event.activity.len(),
            non_zero = active.len(),
            "address activity received"
        );
        if active.is_empty() {
            return Ok(IngestOutcome::NoTransfers);
        }

        let contract = self.resolve_contract(&update.webhook_id).await?;
        let address = contract.contract_address.clone();

        // delivery time, not block time
        let timestamp_ms = update.created_at.timestamp_millis();
        let mut records = Vec::with_capacity(active.len());
        for activity in active {
            if let Some(record) = normalize_activity(activity, &address, timestamp_ms)? {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Ok(IngestOutcome::NoTransfers);
        }
        let received = records.len();

        if self.resync.is_due(contract.last_tvl_resync, Utc::now()) {
            return self.resync_batch(&contract, records).await;
        }

        let fresh = self.drop_known(&address, records).await?;
        let inserted = if fresh.is_empty() {
            0
        } else {
            let carried = self.carry_forward(&address, fresh).await?;
            self.transfers.append_transfers(&address, &carried).await?
        };

        info!(contract = %address, received, inserted, "address activity stored");
        Ok(IngestOutcome::Appended {
            contract: address,
            received,
            inserted,
        })
    }

    /// Look the webhook up, waiting once for an in-flight registration.
    async fn resolve_contract(&self, webhook_id: &str) -> Result<MonitoredContract, WatchError> {
        if let Some(contract) = self.registry.find_by_webhook_id(webhook_id).await? {
            return Ok(contract);
        }

        debug!(
            webhook_id = %webhook_id,
            delay_ms = self.race_retry_delay.as_millis() as u64,
            "webhook not bound yet, retrying once"
        );
        tokio::time::sleep(self.race_retry_delay).await;

        match self.registry.find_by_webhook_id(webhook_id).await? {
            Some(contract) => {
                info!(webhook_id = %webhook_id, contract = %contract.contract_address, "webhook bound after retry");
                Ok(contract)
            }
            None => {
                error!(
                    webhook_id = %webhook_id,
                    "received address activity without matching monitored contract"
                );
                Err(WatchError::UnmatchedWebhook {
                    webhook_id: webhook_id.to_string(),
                })
            }
        }
    }

    /// Remove records already stored and duplicates within the batch so the
    /// carried balance counts each transfer once.
    async fn drop_known(
        &self,
        address: &str,
        records: Vec<TransferRecord>,
    ) -> Result<Vec<TransferRecord>, WatchError> {
        let ids: Vec<String> = records.iter().map(|r| r.unique_id.clone()).collect();
        let mut seen: HashSet<String> = self.transfers.existing_ids(address, &ids).await?;
        let before = records.len();
        let fresh: Vec<TransferRecord> = records
            .into_iter()
            .filter(|r| seen.insert(r.unique_id.clone()))
            .collect();
        if fresh.len() < before {
            debug!(contract = %address, skipped = before - fresh.len(), "replayed transfers skipped");
        }
        Ok(fresh)
    }

    /// Extend each token's last stored balance through the batch. Tokens with
    /// no stored balance are left without `running_tvl`.
    async fn carry_forward(
        &self,
        address: &str,
        mut records: Vec<TransferRecord>,
    ) -> Result<Vec<TransferRecord>, WatchError> {
        let mut balances: HashMap<String, Option<Decimal>> = HashMap::new();
        for record in records.iter_mut() {
            let last = match balances.get(&record.token_address) {
                Some(last) => *last,
                None => self.transfers.last_tvl(address, &record.token_address).await?,
            };
            let next = last.map(|balance| balance + record.delta());
            if next.is_none() {
                warn!(contract = %address, token = %record.token_address, "no stored balance to carry forward");
            }
            record.running_tvl = next;
            balances.insert(record.token_address.clone(), next);
        }
        Ok(records)
    }

    async fn resync_batch(
        &self,
        contract: &MonitoredContract,
        records: Vec<TransferRecord>,
    ) -> Result<IngestOutcome, WatchError> {
        let address = contract.contract_address.clone();
        let received = records.len();
        info!(contract = %address, last_resync = %contract.last_tvl_resync, "resyncing tvl");

        let reconstruction = self.reconstructor.reconstruct_at_latest(records, &address).await?;
        let ordered: Vec<TransferRecord> = reconstruction.chronological().cloned().collect();
        let inserted = self.transfers.append_transfers(&address, &ordered).await?;
        self.registry.touch_resync(&address, Utc::now()).await?;

        Ok(IngestOutcome::Resynced {
            contract: address,
            received,
            inserted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockProvider;
    use crate::store::MemoryStore;
    use crate::transfers::NATIVE_TOKEN;
    use alloy::primitives::U256;
    use std::str::FromStr;

    const CONTRACT: &str = "0x1f9840a85d5af5bf1d1762f925bdaddc4201f984";
    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn payload(activity: serde_json::Value) -> AddressActivityUpdate {
        serde_json::from_value(serde_json::json!({
            "webhookId": "wh_test",
            "id": "whevt_1",
            "createdAt": "2024-02-01T12:00:00.000Z",
            "type": "ADDRESS_ACTIVITY",
            "event": { "network": "ETH_MAINNET", "activity": activity }
        }))
        .unwrap()
    }

    fn eth_out(hash: &str, value: f64) -> serde_json::Value {
        serde_json::json!({
            "fromAddress": "0x1F9840A85D5AF5BF1D1762F925BDADDC4201F984",
            "toAddress": "0xbeef",
            "blockNum": "0x1183577",
            "hash": hash,
            "value": value,
            "asset": "ETH",
            "category": "external",
            "rawContract": { "rawValue": null, "address": null, "decimals": 18 }
        })
    }

    fn usdc_in(hash: &str, log_index: &str, raw: &str) -> serde_json::Value {
        serde_json::json!({
            "fromAddress": "0xbeef",
            "toAddress": CONTRACT,
            "blockNum": "0x1183577",
            "hash": hash,
            "value": 1.0,
            "asset": "USDC",
            "category": "token",
            "rawContract": { "rawValue": raw, "address": USDC, "decimals": 6 },
            "log": { "logIndex": log_index, "address": USDC, "removed": false }
        })
    }

    fn ingestor(store: &MemoryStore, provider: MockProvider, resync: ResyncPolicy) -> WebhookIngestor {
        WebhookIngestor::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            TvlReconstructor::new(Arc::new(provider)),
            Duration::from_millis(100),
            resync,
        )
    }

    #[test]
    fn test_unique_ids() {
        let token: Activity = serde_json::from_value(usdc_in("0xaa", "0x13f", "0x0f4240")).unwrap();
        assert_eq!(activity_unique_id(&token).unwrap(), "0xaa:log:319");

        let external: Activity = serde_json::from_value(eth_out("0xbb", 1.0)).unwrap();
        assert_eq!(activity_unique_id(&external).unwrap(), "0xbb:external");

        let mut internal = external.clone();
        internal.category = ActivityCategory::Internal;
        internal.type_trace_address = Some("call_2".to_string());
        assert_eq!(activity_unique_id(&internal).unwrap(), "0xbb:internal:2");

        internal.type_trace_address = None;
        assert!(matches!(activity_unique_id(&internal), Err(WatchError::MalformedActivity(_))));

        let mut logless = token;
        logless.log = None;
        assert!(matches!(activity_unique_id(&logless), Err(WatchError::MalformedActivity(_))));
    }

    #[test]
    fn test_normalize_uses_delivery_time_and_flow() {
        let outbound: Activity = serde_json::from_value(eth_out("0xbb", 0.5)).unwrap();
        let record = normalize_activity(&outbound, CONTRACT, 42).unwrap().unwrap();
        assert_eq!(record.flow, Flow::Outbound);
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.block_number, 0x1183577);
        assert_eq!(record.value, dec("0.5"));
        assert_eq!(record.token_address, NATIVE_TOKEN);

        let inbound: Activity = serde_json::from_value(usdc_in("0xaa", "0x1", "0x0f4240")).unwrap();
        let record = normalize_activity(&inbound, CONTRACT, 42).unwrap().unwrap();
        assert_eq!(record.flow, Flow::Inbound);
        assert_eq!(record.category, TransferCategory::Erc20);
        assert_eq!(record.value, Decimal::ONE);
    }

    #[test]
    fn test_resync_policy() {
        let now = Utc::now();
        let policy = ResyncPolicy {
            after: Some(Duration::from_secs(180)),
        };
        assert!(policy.is_due(now - chrono::Duration::seconds(181), now));
        assert!(!policy.is_due(now - chrono::Duration::seconds(60), now));
        assert!(!ResyncPolicy::default().is_due(now - chrono::Duration::days(30), now));
    }

    #[tokio::test]
    async fn test_zero_value_delivery_short_circuits() {
        let store = MemoryStore::new();
        let ingestor = ingestor(&store, MockProvider::new(), ResyncPolicy::default());
        // no registered contract, yet no lookup happens
        let outcome = ingestor
            .ingest(&payload(serde_json::json!([eth_out("0xbb", 0.0)])))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::NoTransfers);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = MemoryStore::new();
        store.upsert(CONTRACT, "alice", Some("wh_test")).await.unwrap();
        let ingestor = ingestor(&store, MockProvider::new(), ResyncPolicy::default());

        let body = payload(serde_json::json!([
            eth_out("0x01", 1.0),
            usdc_in("0x02", "0x0", "0x0f4240"),
            usdc_in("0x02", "0x1", "0x1e8480"),
        ]));
        let first = ingestor.ingest(&body).await.unwrap();
        assert_eq!(
            first,
            IngestOutcome::Appended {
                contract: CONTRACT.to_string(),
                received: 3,
                inserted: 3,
            }
        );
        let second = ingestor.ingest(&body).await.unwrap();
        assert!(matches!(second, IngestOutcome::Appended { inserted: 0, .. }));

        let stored = store.transfers(CONTRACT).await.unwrap();
        let ids: Vec<_> = stored.iter().map(|r| r.unique_id.as_str()).collect();
        assert_eq!(ids, vec!["0x01:external", "0x02:log:0", "0x02:log:1"]);
    }

    #[tokio::test]
    async fn test_incremental_balance_carries_forward() {
        let store = MemoryStore::new();
        store.upsert(CONTRACT, "alice", Some("wh_test")).await.unwrap();
        let mut seed = normalize_activity(
            &serde_json::from_value(usdc_in("0x00", "0x0", "0x0f4240")).unwrap(),
            CONTRACT,
            0,
        )
        .unwrap()
        .unwrap();
        seed.running_tvl = Some(dec("10"));
        store.append_transfers(CONTRACT, &[seed]).await.unwrap();

        let ingestor = ingestor(&store, MockProvider::new(), ResyncPolicy::default());
        ingestor
            .ingest(&payload(serde_json::json!([
                usdc_in("0x01", "0x0", "0x1e8480"),
                eth_out("0x02", 1.0),
            ])))
            .await
            .unwrap();

        let stored = store.transfers(CONTRACT).await.unwrap();
        assert_eq!(stored[1].running_tvl, Some(dec("12")));
        // no native balance stored yet
        assert_eq!(stored[2].running_tvl, None);
        assert_eq!(store.last_tvl(CONTRACT, USDC).await.unwrap(), Some(dec("12")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_race_resolves_after_retry() {
        let store = MemoryStore::new();
        let ingestor = ingestor(&store, MockProvider::new(), ResyncPolicy::default());

        let late = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            late.upsert(CONTRACT, "alice", Some("wh_test")).await.unwrap();
        });

        let started = tokio::time::Instant::now();
        let outcome = ingestor
            .ingest(&payload(serde_json::json!([eth_out("0x01", 1.0)])))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Appended { inserted: 1, .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_miss_is_unmatched() {
        let store = MemoryStore::new();
        let ingestor = ingestor(&store, MockProvider::new(), ResyncPolicy::default());
        let err = ingestor
            .ingest(&payload(serde_json::json!([eth_out("0x01", 1.0)])))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::UnmatchedWebhook { ref webhook_id } if webhook_id == "wh_test"));
        assert!(store.transfers(CONTRACT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_due_resync_reconstructs_batch() {
        let store = MemoryStore::new();
        store.upsert(CONTRACT, "alice", Some("wh_test")).await.unwrap();
        let before = store.get(CONTRACT).await.unwrap().unwrap().last_tvl_resync;

        let provider = MockProvider::new()
            .with_latest(200, 0)
            .with_token(USDC, "USDC", 6, U256::from(5_000_000u64));
        let ingestor = ingestor(
            &store,
            provider,
            ResyncPolicy {
                after: Some(Duration::ZERO),
            },
        );
        tokio::time::sleep(Duration::from_millis(5)).await;

        let outcome = ingestor
            .ingest(&payload(serde_json::json!([usdc_in("0x01", "0x0", "0x1e8480")])))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Resynced { inserted: 1, .. }));

        let stored = store.transfers(CONTRACT).await.unwrap();
        assert_eq!(stored[0].running_tvl, Some(dec("5")));
        assert!(store.get(CONTRACT).await.unwrap().unwrap().last_tvl_resync > before);
    }
}
