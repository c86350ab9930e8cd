use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub valkey: ValkeyConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the HTTP server.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Public base URL the provider delivers webhooks to - env BASE_URL
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC base URL, the API key is appended as the last path segment.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Provider API key - loaded from env ALCHEMY_KEY
    #[serde(default)]
    pub api_key: String,
    /// Notify (webhook management) API base URL
    #[serde(default = "default_notify_url")]
    pub notify_url: String,
    /// Notify auth token - loaded from env ALCHEMY_TOKEN
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_network")]
    pub network: String,
    /// Upper bound on every provider call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_block_interval")]
    pub block_interval_secs: u64,
    /// A latest block older than this is considered stale.
    #[serde(default = "default_freshness")]
    pub freshness_secs: u64,
    #[serde(default = "default_margin")]
    pub margin_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValkeyConfig {
    /// Connection URL - env VALKEY_URL
    #[serde(default = "default_valkey_url")]
    pub url: String,
    /// Key namespace prefix
    #[serde(default = "default_valkey_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Wait before the single retry of an unmatched webhook lookup.
    #[serde(default = "default_race_retry_delay_ms")]
    pub race_retry_delay_ms: u64,
    /// Full TVL resync interval for webhook batches. Unset = never.
    #[serde(default)]
    pub resync_after_secs: Option<u64>,
    /// Seed lookback used when a watch request names none.
    #[serde(default = "default_time_range")]
    pub default_time_range: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_bind() -> String {
    "0.0.0.0:7010".to_string()
}
fn default_base_url() -> String {
    "http://localhost".to_string()
}
fn default_rpc_url() -> String {
    "https://eth-mainnet.g.alchemy.com/v2".to_string()
}
fn default_notify_url() -> String {
    "https://dashboard.alchemy.com/api".to_string()
}
fn default_network() -> String {
    "ETH_MAINNET".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_block_interval() -> u64 {
    12
}
fn default_freshness() -> u64 {
    5
}
fn default_margin() -> u64 {
    1
}
fn default_valkey_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_valkey_prefix() -> String {
    "alert-hub".to_string()
}
fn default_race_retry_delay_ms() -> u64 {
    100
}
fn default_time_range() -> String {
    "5m".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            base_url: default_base_url(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            api_key: String::new(),
            notify_url: default_notify_url(),
            auth_token: String::new(),
            network: default_network(),
            request_timeout_ms: default_request_timeout_ms(),
            block_interval_secs: default_block_interval(),
            freshness_secs: default_freshness(),
            margin_secs: default_margin(),
        }
    }
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            url: default_valkey_url(),
            prefix: default_valkey_prefix(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            race_retry_delay_ms: default_race_retry_delay_ms(),
            resync_after_secs: None,
            default_time_range: default_time_range(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ChainConfig {
    pub fn rpc_endpoint(&self) -> String {
        format!("{}/{}", self.rpc_url.trim_end_matches('/'), self.api_key)
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        Ok(config)
    }

    /// Load a default config with env-only secrets (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    // Secrets are never stored in the config file.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ALCHEMY_KEY") {
            self.chain.api_key = key;
        }
        if let Ok(token) = std::env::var("ALCHEMY_TOKEN") {
            self.chain.auth_token = token;
        }
        if let Ok(url) = std::env::var("VALKEY_URL") {
            self.valkey.url = url;
        }
        if let Ok(base) = std::env::var("BASE_URL") {
            self.server.base_url = base;
        }
    }

    /// Fail fast when provider credentials are absent.
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.chain.api_key.is_empty() {
            return Err(ConfigError::MissingEnv("ALCHEMY_KEY".to_string()));
        }
        if self.chain.auth_token.is_empty() {
            return Err(ConfigError::MissingEnv("ALCHEMY_TOKEN".to_string()));
        }
        Ok(())
    }

    /// Endpoint registered with the provider for address activity.
    pub fn webhook_url(&self) -> String {
        format!(
            "{}/alchemy/address-activity",
            self.server.base_url.trim_end_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            base_url = "https://hooks.example.org/"

            [pipeline]
            race_retry_delay_ms = 250
            resync_after_secs = 180
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:7010");
        assert_eq!(config.pipeline.race_retry_delay_ms, 250);
        assert_eq!(config.pipeline.resync_after_secs, Some(180));
        assert_eq!(config.pipeline.default_time_range, "5m");
        assert_eq!(config.chain.block_interval_secs, 12);
        assert_eq!(config.valkey.prefix, "alert-hub");
        assert_eq!(
            config.webhook_url(),
            "https://hooks.example.org/alchemy/address-activity"
        );
    }

    #[test]
    fn test_rpc_endpoint_appends_key() {
        let chain = ChainConfig {
            api_key: "abc".to_string(),
            ..Default::default()
        };
        assert_eq!(
            chain.rpc_endpoint(),
            "https://eth-mainnet.g.alchemy.com/v2/abc"
        );
    }

    #[test]
    fn test_missing_credentials_are_reported() {
        let config = Config::default();
        assert!(matches!(
            config.require_credentials(),
            Err(ConfigError::MissingEnv(v)) if v == "ALCHEMY_KEY"
        ));
    }
}
