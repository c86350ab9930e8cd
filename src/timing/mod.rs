//! Block timing estimation.
//!
//! Registering a watch just before a new block lands risks missing that
//! block's events in the seed window. If the latest block is already older
//! than the freshness threshold, we wait out the rest of the block interval
//! plus a margin and anchor on the next block instead.

use crate::chain::ChainProvider;
use crate::config::ChainConfig;
use crate::error::WatchError;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTiming {
    pub interval: Duration,
    pub freshness: Duration,
    pub margin: Duration,
}

impl Default for BlockTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(12),
            freshness: Duration::from_secs(5),
            margin: Duration::from_secs(1),
        }
    }
}

impl BlockTiming {
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.block_interval_secs),
            freshness: Duration::from_secs(config.freshness_secs),
            margin: Duration::from_secs(config.margin_secs),
        }
    }

    /// Decide the anchor block from the latest block and wall clock time.
    pub fn plan(&self, latest: u64, block_timestamp_ms: i64, now_ms: i64) -> SafeBlock {
        let drift_ms = now_ms - block_timestamp_ms;
        if drift_ms <= self.freshness.as_millis() as i64 {
            return SafeBlock {
                block: latest,
                wait: None,
            };
        }

        let wait_ms = (self.interval + self.margin).as_millis() as i64 - drift_ms;
        SafeBlock {
            block: latest + 1,
            wait: (wait_ms > 0).then(|| Duration::from_millis(wait_ms as u64)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeBlock {
    pub block: u64,
    pub wait: Option<Duration>,
}

pub struct BlockTimer {
    provider: Arc<dyn ChainProvider>,
    timing: BlockTiming,
}

impl BlockTimer {
    pub fn new(provider: Arc<dyn ChainProvider>, timing: BlockTiming) -> Self {
        Self { provider, timing }
    }

    pub fn timing(&self) -> BlockTiming {
        self.timing
    }

    /// Latest block, or the next one after waiting for it to land.
    pub async fn estimate_safe_block(&self) -> Result<u64, WatchError> {
        let latest = self.provider.latest_block().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let block_ms = (latest.timestamp as i64) * 1000;
        let plan = self.timing.plan(latest.number, block_ms, now_ms);

        debug!(
            latest = latest.number,
            drift_ms = now_ms - block_ms,
            "block timing"
        );

        if let Some(wait) = plan.wait {
            info!(
                wait_ms = wait.as_millis() as u64,
                block = plan.block,
                "latest block is stale, waiting for the next one"
            );
            tokio::time::sleep(wait).await;
        }
        Ok(plan.block)
    }
}
