//! Valkey (Redis-compatible) document store for monitored contracts and
//! their transfer history.
//!
//! Data model:
//! Keys are `{prefix}:...`; the braces are a cluster hash tag.
//!
//!   monitored_contract:{address}  → JSON MonitoredContract
//!   webhook:{webhook_id}          → contract address      (secondary index)
//!   user_contracts:{user_id}      → SET of contract addresses
//!   transfers:{address}           → HASH unique_id → JSON TransferRecord
//!   transfer_order:{address}      → LIST of unique_ids (insertion order)
//!   last_tvl:{address}            → HASH token → Decimal string
//!
//! Every read-modify-write runs as a Lua script so it is atomic per key on
//! the server; concurrent watch registrations cannot lose `userIds`. Scripts
//! only touch keys passed in `KEYS`. The old webhook index key is read first
//! and the script rejects the call if the binding moved in between.

pub mod memory;

pub use memory::MemoryStore;

use crate::registry::{ContractRegistry, MonitoredContract, StoreError, TransferStore, UpsertOutcome};
use crate::transfers::TransferRecord;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info};

/// KEYS: contract doc, user set, new webhook index (or KEYS[1]), bound
/// webhook index (or KEYS[1]). ARGV: address, user, webhook|'', now, bound
/// webhook|'' as read by the caller.
/// Returns 2 created, 1 updated, 0 unchanged, -2 binding moved since the read.
const UPSERT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local doc
local outcome
if raw then
  doc = cjson.decode(raw)
  local bound = doc.webhookId
  if type(bound) ~= 'string' then bound = '' end
  if bound ~= ARGV[5] then
    return -2
  end
  local changed = false
  local seen = false
  for _, u in ipairs(doc.userIds) do
    if u == ARGV[2] then seen = true end
  end
  if not seen then
    table.insert(doc.userIds, ARGV[2])
    changed = true
  end
  if ARGV[3] ~= '' and bound ~= ARGV[3] then
    if bound ~= '' then
      redis.call('DEL', KEYS[4])
    end
    doc.webhookId = ARGV[3]
    changed = true
  end
  if not changed then
    return 0
  end
  doc.updatedAt = ARGV[4]
  outcome = 1
else
  if ARGV[5] ~= '' then
    return -2
  end
  doc = {
    contractAddress = ARGV[1],
    userIds = { ARGV[2] },
    lastTvlResync = ARGV[4],
    createdAt = ARGV[4],
    updatedAt = ARGV[4],
  }
  if ARGV[3] ~= '' then doc.webhookId = ARGV[3] end
  outcome = 2
end
redis.call('SET', KEYS[1], cjson.encode(doc))
if ARGV[3] ~= '' then
  redis.call('SET', KEYS[3], ARGV[1])
end
redis.call('SADD', KEYS[2], ARGV[1])
return outcome
"#;

/// KEYS: contract doc, new webhook index, bound webhook index (or KEYS[1]).
/// ARGV: address, webhook, now, bound webhook|'' as read by the caller.
/// Returns -2 binding moved since the read, -1 missing, 0 unchanged, 1 updated.
const BIND_WEBHOOK_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return -1
end
local doc = cjson.decode(raw)
local bound = doc.webhookId
if type(bound) ~= 'string' then bound = '' end
if bound ~= ARGV[4] then
  return -2
end
if bound == ARGV[2] then
  return 0
end
if bound ~= '' then
  redis.call('DEL', KEYS[3])
end
doc.webhookId = ARGV[2]
doc.updatedAt = ARGV[3]
redis.call('SET', KEYS[1], cjson.encode(doc))
redis.call('SET', KEYS[2], ARGV[1])
return 1
"#;

/// KEYS: contract doc. ARGV: resync time, now. Returns -1 missing, 1 updated.
const TOUCH_RESYNC_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return -1
end
local doc = cjson.decode(raw)
doc.lastTvlResync = ARGV[1]
doc.updatedAt = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(doc))
return 1
"#;

/// KEYS: transfers hash, order list, last_tvl hash.
/// ARGV: repeated (unique_id, json, token field, tvl|'').
/// Returns the number of newly inserted records.
const APPEND_TRANSFERS_SCRIPT: &str = r#"
local inserted = 0
for i = 1, #ARGV, 4 do
  if redis.call('HSETNX', KEYS[1], ARGV[i], ARGV[i + 1]) == 1 then
    redis.call('RPUSH', KEYS[2], ARGV[i])
    if ARGV[i + 3] ~= '' then
      redis.call('HSET', KEYS[3], ARGV[i + 2], ARGV[i + 3])
    end
    inserted = inserted + 1
  end
end
return inserted
"#;

/// Script result when the contract's webhook binding changed between the
/// caller's read and the script run.
const BINDING_MOVED: i64 = -2;

/// Read-then-script rounds before giving up on a contended binding.
const MAX_BINDING_ATTEMPTS: usize = 5;

/// `{prefix}:{suffix}` with the prefix as a cluster hash tag, so every key a
/// script touches maps to the same slot.
fn namespaced(prefix: &str, suffix: &str) -> String {
    format!("{{{}}}:{}", prefix, suffix)
}

/// Hash field for a token's last balance; the native sentinel is empty.
fn tvl_field(token_address: &str) -> &str {
    if token_address.is_empty() {
        "native"
    } else {
        token_address
    }
}

/// Valkey-backed registry and transfer store.
///
/// All keys are namespaced under a configurable prefix so several instances
/// can share a single Valkey.
#[derive(Clone)]
pub struct ValkeyStore {
    conn: MultiplexedConnection,
    prefix: String,
    upsert_script: Script,
    bind_script: Script,
    touch_script: Script,
    append_script: Script,
}

impl ValkeyStore {
    /// Connect to Valkey/Redis.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            upsert_script: Script::new(UPSERT_SCRIPT),
            bind_script: Script::new(BIND_WEBHOOK_SCRIPT),
            touch_script: Script::new(TOUCH_RESYNC_SCRIPT),
            append_script: Script::new(APPEND_TRANSFERS_SCRIPT),
        })
    }

    fn key(&self, suffix: &str) -> String {
        namespaced(&self.prefix, suffix)
    }

    fn contract_key(&self, address: &str) -> String {
        self.key(&format!("monitored_contract:{}", address))
    }

    fn webhook_key(&self, webhook_id: &str) -> String {
        self.key(&format!("webhook:{}", webhook_id))
    }

    /// Index key for `webhook_id`, or `placeholder` when there is none. Lua
    /// only touches the slot when the id is present.
    fn webhook_key_or(&self, webhook_id: Option<&str>, placeholder: &str) -> String {
        webhook_id.map_or_else(|| placeholder.to_string(), |id| self.webhook_key(id))
    }

    async fn bound_webhook(&self, contract_address: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(contract_address).await?.and_then(|c| c.webhook_id))
    }

    /// Test connectivity.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }
}

#[async_trait]
impl ContractRegistry for ValkeyStore {
    async fn upsert(
        &self,
        contract_address: &str,
        user_id: &str,
        webhook_id: Option<&str>,
    ) -> Result<UpsertOutcome, StoreError> {
        let contract_key = self.contract_key(contract_address);
        let user_key = self.key(&format!("user_contracts:{}", user_id));
        let mut conn = self.conn.clone();

        for attempt in 1..=MAX_BINDING_ATTEMPTS {
            let bound = self.bound_webhook(contract_address).await?;
            let code: i64 = self
                .upsert_script
                .prepare_invoke()
                .key(&contract_key)
                .key(&user_key)
                .key(self.webhook_key_or(webhook_id, &contract_key))
                .key(self.webhook_key_or(bound.as_deref(), &contract_key))
                .arg(contract_address)
                .arg(user_id)
                .arg(webhook_id.unwrap_or_default())
                .arg(Utc::now().to_rfc3339())
                .arg(bound.as_deref().unwrap_or_default())
                .invoke_async(&mut conn)
                .await?;

            let outcome = match code {
                BINDING_MOVED => {
                    debug!(contract = %contract_address, attempt, "webhook binding moved, retrying upsert");
                    continue;
                }
                2 => UpsertOutcome::Created,
                1 => UpsertOutcome::Updated,
                _ => UpsertOutcome::Unchanged,
            };
            debug!(contract = %contract_address, user = %user_id, ?outcome, "monitored contract upsert");
            return Ok(outcome);
        }
        Err(StoreError::Contended(contract_address.to_string()))
    }

    async fn bind_webhook(&self, contract_address: &str, webhook_id: &str) -> Result<(), StoreError> {
        let contract_key = self.contract_key(contract_address);
        let mut conn = self.conn.clone();

        for attempt in 1..=MAX_BINDING_ATTEMPTS {
            let bound = self.bound_webhook(contract_address).await?;
            let code: i64 = self
                .bind_script
                .prepare_invoke()
                .key(&contract_key)
                .key(self.webhook_key(webhook_id))
                .key(self.webhook_key_or(bound.as_deref(), &contract_key))
                .arg(contract_address)
                .arg(webhook_id)
                .arg(Utc::now().to_rfc3339())
                .arg(bound.as_deref().unwrap_or_default())
                .invoke_async(&mut conn)
                .await?;

            match code {
                BINDING_MOVED => {
                    debug!(contract = %contract_address, attempt, "webhook binding moved, retrying bind");
                }
                -1 => return Err(StoreError::NotFound(contract_address.to_string())),
                _ => return Ok(()),
            }
        }
        Err(StoreError::Contended(contract_address.to_string()))
    }

    async fn find_by_webhook_id(&self, webhook_id: &str) -> Result<Option<MonitoredContract>, StoreError> {
        let mut conn = self.conn.clone();
        let address: Option<String> = conn.get(self.webhook_key(webhook_id)).await?;
        let Some(address) = address else {
            return Ok(None);
        };
        let contract = self.get(&address).await?;
        Ok(contract.filter(|c| c.webhook_id.as_deref() == Some(webhook_id)))
    }

    async fn get(&self, contract_address: &str) -> Result<Option<MonitoredContract>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(self.contract_key(contract_address)).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    async fn contracts_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut addresses: Vec<String> = conn.smembers(self.key(&format!("user_contracts:{}", user_id))).await?;
        addresses.sort();
        Ok(addresses)
    }

    async fn touch_resync(&self, contract_address: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .touch_script
            .prepare_invoke()
            .key(self.contract_key(contract_address))
            .arg(at.to_rfc3339())
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        if code < 0 {
            return Err(StoreError::NotFound(contract_address.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferStore for ValkeyStore {
    async fn append_transfers(
        &self,
        contract_address: &str,
        records: &[TransferRecord],
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut invocation = self.append_script.prepare_invoke();
        invocation
            .key(self.key(&format!("transfers:{}", contract_address)))
            .key(self.key(&format!("transfer_order:{}", contract_address)))
            .key(self.key(&format!("last_tvl:{}", contract_address)));
        for record in records {
            invocation
                .arg(&record.unique_id)
                .arg(serde_json::to_string(record)?)
                .arg(tvl_field(&record.token_address))
                .arg(record.running_tvl.map(|v| v.to_string()).unwrap_or_default());
        }

        let mut conn = self.conn.clone();
        let inserted: usize = invocation.invoke_async(&mut conn).await?;
        debug!(
            contract = %contract_address,
            received = records.len(),
            inserted,
            "transfers appended"
        );
        Ok(inserted)
    }

    async fn existing_ids(&self, contract_address: &str, unique_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        if unique_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let key = self.key(&format!("transfers:{}", contract_address));
        let mut pipe = redis::pipe();
        for id in unique_ids {
            pipe.hexists(&key, id);
        }
        let mut conn = self.conn.clone();
        let flags: Vec<bool> = pipe.query_async(&mut conn).await?;
        Ok(unique_ids
            .iter()
            .zip(flags)
            .filter(|(_, exists)| *exists)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn transfers(&self, contract_address: &str) -> Result<Vec<TransferRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .lrange(self.key(&format!("transfer_order:{}", contract_address)), 0, -1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let jsons: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.key(&format!("transfers:{}", contract_address)))
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(jsons.len());
        for j in jsons.into_iter().flatten() {
            records.push(serde_json::from_str(&j)?);
        }
        Ok(records)
    }

    async fn last_tvl(&self, contract_address: &str, token_address: &str) -> Result<Option<Decimal>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .hget(self.key(&format!("last_tvl:{}", contract_address)), tvl_field(token_address))
            .await?;
        Ok(value.and_then(|v| Decimal::from_str(&v).ok()))
    }
}
