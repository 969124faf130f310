use std::{collections::BTreeMap, fs, path::PathBuf};

use metering_core::{AggregateConfig, ConfigurationError, MeteringConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct QuestDbConfig {
    pub uri: String,
    pub max_connections: u32,
    pub ilp_tcp_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSourceConfig {
    pub http_bind_addr: String,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Newline-delimited JSON to `path` (stdout when unset).
    Ndjson,
    /// QuestDB over the Postgres wire protocol.
    Pgwire,
    /// QuestDB line protocol over TCP.
    Ilp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub path: Option<PathBuf>,
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPipelineConfig {
    pub name: String,
    /// Key into `[metering]`.
    pub metering: String,
    pub source: HttpSourceConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadingsConfig {
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub questdb: Option<QuestDbConfig>,
    pub events: EventPipelineConfig,
    pub readings: ReadingsConfig,
    #[serde(default)]
    pub metering: BTreeMap<String, MeteringConfig>,
    #[serde(default)]
    pub aggregations: BTreeMap<String, AggregateConfig>,
    pub metrics: Option<MetricsConfig>,
}

/// Supplies extraction and aggregation configuration by key.
pub trait ConfigProvider: Send + Sync {
    fn metering_config(&self, key: &str) -> Result<&MeteringConfig, ConfigurationError>;
    fn aggregate_config(&self, key: &str) -> Result<&AggregateConfig, ConfigurationError>;
}

impl ConfigProvider for AppConfig {
    fn metering_config(&self, key: &str) -> Result<&MeteringConfig, ConfigurationError> {
        self.metering
            .get(key)
            .ok_or_else(|| ConfigurationError::UnknownKey(key.to_string()))
    }

    fn aggregate_config(&self, key: &str) -> Result<&AggregateConfig, ConfigurationError> {
        self.aggregations
            .get(key)
            .ok_or_else(|| ConfigurationError::UnknownKey(key.to_string()))
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path =
            env::var("METERING_CONFIG").unwrap_or_else(|_| "metering-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg = Self::from_toml_str(&contents)?;
        tracing::info!(
            path = %path,
            metering = cfg.metering.len(),
            aggregations = cfg.aggregations.len(),
            "loaded configuration"
        );
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        // The event pipeline must point at a real extraction config.
        cfg.metering_config(&cfg.events.metering)?;
        Ok(cfg)
    }

    pub fn questdb(&self) -> anyhow::Result<&QuestDbConfig> {
        self.questdb
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("a [questdb] section is required for pgwire/ilp sinks"))
    }
}
