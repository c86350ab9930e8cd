//! Monitored contract registry and transfer storage interfaces.
//!
//! Implementations:
//! - `store::ValkeyStore`: Valkey/Redis JSON documents, atomic Lua upserts
//! - `store::MemoryStore`: `DashMap`-backed, for tests and store-less runs

use crate::transfers::TransferRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("valkey error: {0}")]
    Valkey(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("monitored contract {0} not found")]
    NotFound(String),
    #[error("webhook binding of {0} kept changing during update")]
    Contended(String),
}

/// One watched contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredContract {
    pub contract_address: String,
    /// Append-only, insertion ordered, no duplicates.
    pub user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
    pub last_tvl_resync: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MonitoredContract {
    pub fn new(contract_address: &str, user_id: &str, webhook_id: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            contract_address: contract_address.to_string(),
            user_ids: vec![user_id.to_string()],
            webhook_id: webhook_id.map(str::to_string),
            last_tvl_resync: now,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Apply an upsert to the current document. Returns the document to write,
/// or `None` when nothing changed (no write, no timestamp bump).
pub fn apply_upsert(
    existing: Option<MonitoredContract>,
    contract_address: &str,
    user_id: &str,
    webhook_id: Option<&str>,
    now: DateTime<Utc>,
) -> (UpsertOutcome, Option<MonitoredContract>) {
    let Some(mut contract) = existing else {
        return (
            UpsertOutcome::Created,
            Some(MonitoredContract::new(contract_address, user_id, webhook_id, now)),
        );
    };

    let mut changed = false;
    if !contract.user_ids.iter().any(|u| u == user_id) {
        contract.user_ids.push(user_id.to_string());
        changed = true;
    }
    if let Some(id) = webhook_id {
        if contract.webhook_id.as_deref() != Some(id) {
            contract.webhook_id = Some(id.to_string());
            changed = true;
        }
    }

    if changed {
        contract.updated_at = now;
        (UpsertOutcome::Updated, Some(contract))
    } else {
        (UpsertOutcome::Unchanged, None)
    }
}

#[async_trait]
pub trait ContractRegistry: Send + Sync {
    /// Create or extend a monitored contract. Atomic per contract.
    async fn upsert(
        &self,
        contract_address: &str,
        user_id: &str,
        webhook_id: Option<&str>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Attach a webhook id to an existing contract.
    async fn bind_webhook(&self, contract_address: &str, webhook_id: &str) -> Result<(), StoreError>;

    async fn find_by_webhook_id(&self, webhook_id: &str) -> Result<Option<MonitoredContract>, StoreError>;

    async fn get(&self, contract_address: &str) -> Result<Option<MonitoredContract>, StoreError>;

    /// Contracts a user watches.
    async fn contracts_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    /// Record a completed full TVL resync.
    async fn touch_resync(&self, contract_address: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Append records in order, skipping any whose `unique_id` is already
    /// stored. Returns how many were inserted.
    async fn append_transfers(
        &self,
        contract_address: &str,
        records: &[TransferRecord],
    ) -> Result<usize, StoreError>;

    /// The subset of `unique_ids` already stored for this contract.
    async fn existing_ids(&self, contract_address: &str, unique_ids: &[String]) -> Result<HashSet<String>, StoreError>;

    /// All stored records in insertion order.
    async fn transfers(&self, contract_address: &str) -> Result<Vec<TransferRecord>, StoreError>;

    /// Most recently stored `running_tvl` of a token.
    async fn last_tvl(&self, contract_address: &str, token_address: &str) -> Result<Option<Decimal>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "0x1f9840a85d5af5bf1d1762f925bdaddc4201f984";

    #[test]
    fn test_upsert_creates_then_extends() {
        let t0 = Utc::now();
        let (outcome, created) = apply_upsert(None, ADDR, "alice", None, t0);
        assert_eq!(outcome, UpsertOutcome::Created);
        let created = created.unwrap();
        assert_eq!(created.user_ids, vec!["alice"]);
        assert_eq!(created.webhook_id, None);

        let t1 = t0 + chrono::Duration::seconds(5);
        let (outcome, updated) = apply_upsert(Some(created.clone()), ADDR, "bob", Some("wh_1"), t1);
        assert_eq!(outcome, UpsertOutcome::Updated);
        let updated = updated.unwrap();
        assert_eq!(updated.user_ids, vec!["alice", "bob"]);
        assert_eq!(updated.webhook_id.as_deref(), Some("wh_1"));
        assert_eq!(updated.updated_at, t1);
        assert_eq!(updated.created_at, t0);
    }

    #[test]
    fn test_upsert_without_change_is_noop() {
        let t0 = Utc::now();
        let existing = MonitoredContract::new(ADDR, "alice", Some("wh_1"), t0);
        let (outcome, doc) = apply_upsert(Some(existing), ADDR, "alice", Some("wh_1"), t0 + chrono::Duration::seconds(1));
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert!(doc.is_none());
    }

    #[test]
    fn test_contract_json_shape() {
        let t0 = Utc::now();
        let json = serde_json::to_value(MonitoredContract::new(ADDR, "alice", None, t0)).unwrap();
        assert_eq!(json["contractAddress"], ADDR);
        assert_eq!(json["userIds"], serde_json::json!(["alice"]));
        assert!(json.get("webhookId").is_none());
    }
}
