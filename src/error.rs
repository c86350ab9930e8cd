use crate::chain::ProviderError;
use crate::registry::StoreError;
use crate::tvl::TvlError;
use thiserror::Error;

/// Failures of the watch-registration and ingestion flows.
///
/// Every variant reaches the HTTP boundary as a non-200 response; none are
/// swallowed.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(#[from] ProviderError),
    #[error("Not enough transfers found in the last {range}")]
    InsufficientHistory { range: String },
    #[error("received address activity for webhook {webhook_id} without matching monitored contract")]
    UnmatchedWebhook { webhook_id: String },
    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),
    #[error("malformed activity: {0}")]
    MalformedActivity(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("tvl reconstruction failed: {0}")]
    Tvl(#[from] TvlError),
}
