//! In-process store backed by `DashMap`.
//!
//! Same semantics as [`super::ValkeyStore`]; the per-key entry lock stands in
//! for the server-side scripts. Used by tests and when no Valkey is reachable.

use crate::registry::{apply_upsert, ContractRegistry, MonitoredContract, StoreError, TransferStore, UpsertOutcome};
use crate::transfers::TransferRecord;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct TransferLog {
    records: Vec<TransferRecord>,
    seen: HashSet<String>,
    last_tvl: HashMap<String, Decimal>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    contracts: Arc<DashMap<String, MonitoredContract>>,
    webhooks: Arc<DashMap<String, String>>,
    users: Arc<DashMap<String, BTreeSet<String>>>,
    transfers: Arc<DashMap<String, TransferLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn reindex_webhook(&self, address: &str, previous: Option<&str>, current: Option<&str>) {
        if previous == current {
            return;
        }
        if let Some(old) = previous {
            self.webhooks.remove(old);
        }
        if let Some(new) = current {
            self.webhooks.insert(new.to_string(), address.to_string());
        }
    }
}

#[async_trait]
impl ContractRegistry for MemoryStore {
    async fn upsert(
        &self,
        contract_address: &str,
        user_id: &str,
        webhook_id: Option<&str>,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let outcome = match self.contracts.entry(contract_address.to_string()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().webhook_id.clone();
                let (outcome, doc) = apply_upsert(Some(entry.get().clone()), contract_address, user_id, webhook_id, now);
                if let Some(doc) = doc {
                    self.reindex_webhook(contract_address, previous.as_deref(), doc.webhook_id.as_deref());
                    entry.insert(doc);
                }
                outcome
            }
            Entry::Vacant(entry) => {
                let (outcome, doc) = apply_upsert(None, contract_address, user_id, webhook_id, now);
                if let Some(doc) = doc {
                    self.reindex_webhook(contract_address, None, doc.webhook_id.as_deref());
                    entry.insert(doc);
                }
                outcome
            }
        };

        self.users
            .entry(user_id.to_string())
            .or_default()
            .insert(contract_address.to_string());
        Ok(outcome)
    }

    async fn bind_webhook(&self, contract_address: &str, webhook_id: &str) -> Result<(), StoreError> {
        let mut contract = self
            .contracts
            .get_mut(contract_address)
            .ok_or_else(|| StoreError::NotFound(contract_address.to_string()))?;
        if contract.webhook_id.as_deref() == Some(webhook_id) {
            return Ok(());
        }
        self.reindex_webhook(contract_address, contract.webhook_id.as_deref(), Some(webhook_id));
        contract.webhook_id = Some(webhook_id.to_string());
        contract.updated_at = Utc::now();
        Ok(())
    }

    async fn find_by_webhook_id(&self, webhook_id: &str) -> Result<Option<MonitoredContract>, StoreError> {
        let Some(address) = self.webhooks.get(webhook_id).map(|a| a.clone()) else {
            return Ok(None);
        };
        Ok(self
            .contracts
            .get(&address)
            .filter(|c| c.webhook_id.as_deref() == Some(webhook_id))
            .map(|c| c.clone()))
    }

    async fn get(&self, contract_address: &str) -> Result<Option<MonitoredContract>, StoreError> {
        Ok(self.contracts.get(contract_address).map(|c| c.clone()))
    }

    async fn contracts_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .users
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn touch_resync(&self, contract_address: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut contract = self
            .contracts
            .get_mut(contract_address)
            .ok_or_else(|| StoreError::NotFound(contract_address.to_string()))?;
        contract.last_tvl_resync = at;
        contract.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn append_transfers(
        &self,
        contract_address: &str,
        records: &[TransferRecord],
    ) -> Result<usize, StoreError> {
        let mut log = self.transfers.entry(contract_address.to_string()).or_default();
        let mut inserted = 0;
        for record in records {
            if !log.seen.insert(record.unique_id.clone()) {
                continue;
            }
            if let Some(tvl) = record.running_tvl {
                log.last_tvl.insert(record.token_address.clone(), tvl);
            }
            log.records.push(record.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn existing_ids(&self, contract_address: &str, unique_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let Some(log) = self.transfers.get(contract_address) else {
            return Ok(HashSet::new());
        };
        Ok(unique_ids
            .iter()
            .filter(|id| log.seen.contains(*id))
            .cloned()
            .collect())
    }

    async fn transfers(&self, contract_address: &str) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self
            .transfers
            .get(contract_address)
            .map(|log| log.records.clone())
            .unwrap_or_default())
    }

    async fn last_tvl(&self, contract_address: &str, token_address: &str) -> Result<Option<Decimal>, StoreError> {
        Ok(self
            .transfers
            .get(contract_address)
            .and_then(|log| log.last_tvl.get(token_address).copied()))
    }
}
