use alert_hub::chain::{AlchemyProvider, ChainProvider};
use alert_hub::config::Config;
use alert_hub::pipeline::{ResyncPolicy, WatchService, WebhookIngestor};
use alert_hub::registry::{ContractRegistry, TransferStore};
use alert_hub::server::{self, AppState};
use alert_hub::store::{MemoryStore, ValkeyStore};
use alert_hub::timing::{BlockTimer, BlockTiming};
use alert_hub::transfers::TimeRange;
use alert_hub::tvl::TvlReconstructor;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CONFIG_FILE: &str = "alert-hub.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config = if Path::new(CONFIG_FILE).exists() {
        Config::load(Path::new(CONFIG_FILE))?
    } else {
        Config::from_env()
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("alert-hub v{} starting", env!("CARGO_PKG_VERSION"));
    config.require_credentials()?;

    // --- Chain provider ---
    let provider: Arc<dyn ChainProvider> =
        Arc::new(AlchemyProvider::connect(&config.chain, config.webhook_url()).await?);

    // --- Valkey store ---
    let (registry, transfers) = match ValkeyStore::connect(&config.valkey.url, &config.valkey.prefix).await {
        Ok(store) => {
            if let Err(e) = store.ping().await {
                error!(error = %e, "Valkey ping failed, falling back to in-memory store");
                shared(MemoryStore::new())
            } else {
                shared(store)
            }
        }
        Err(e) => {
            warn!(
                error = %e,
                url = %config.valkey.url,
                "failed to connect to Valkey, running without persistent state"
            );
            shared(MemoryStore::new())
        }
    };

    // --- Pipeline ---
    let timing = BlockTiming::from_config(&config.chain);
    let default_range: TimeRange = config.pipeline.default_time_range.parse()?;
    let watch = WatchService::new(
        provider.clone(),
        BlockTimer::new(provider.clone(), timing),
        registry.clone(),
        transfers.clone(),
        default_range,
    );

    let resync = ResyncPolicy {
        after: config.pipeline.resync_after_secs.map(Duration::from_secs),
    };
    let ingestor = WebhookIngestor::new(
        registry,
        transfers,
        TvlReconstructor::new(provider),
        Duration::from_millis(config.pipeline.race_retry_delay_ms),
        resync,
    );

    info!(
        bind = %config.server.bind,
        webhook_url = %config.webhook_url(),
        race_retry_delay_ms = config.pipeline.race_retry_delay_ms,
        resync_after_secs = ?config.pipeline.resync_after_secs,
        "pipeline ready"
    );

    let state = AppState {
        watch: Arc::new(watch),
        ingestor: Arc::new(ingestor),
    };
    server::serve(state, &config.server.bind).await
}

/// One store instance behind both trait objects.
fn shared<S>(store: S) -> (Arc<dyn ContractRegistry>, Arc<dyn TransferStore>)
where
    S: ContractRegistry + TransferStore + 'static,
{
    let store = Arc::new(store);
    (
        store.clone() as Arc<dyn ContractRegistry>,
        store as Arc<dyn TransferStore>,
    )
}
