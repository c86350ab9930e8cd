//! Watch registration and real-time ingestion flows.
//!
//! ```text
//! register: block timing -> fetch in/out -> reconstruct -> store seed -> webhook -> registry
//! ingest:   webhook delivery -> resolve contract (one retry) -> normalize -> store
//! ```

pub mod ingest;
pub mod watch;

pub use ingest::{AddressActivityUpdate, IngestOutcome, ResyncPolicy, WebhookIngestor};
pub use watch::{WatchRequest, WatchService, WatchSummary};
