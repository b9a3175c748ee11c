use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Shared, hot-swappable configuration handle
pub type SharedConfig = Arc<ArcSwap<TelemetryConfig>>;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Seconds the collector sleeps between cycles
    pub collect_interval_seconds: u64,
    pub elastic_search_host: String,
    pub elastic_search_port: u16,
    /// Emit compact statistics records
    pub trace_statistics: bool,
    /// Emit full request/response snapshots
    pub trace_exchanges: bool,
    /// Include headers in snapshots
    pub trace_includes_header: bool,
    /// Snapshot body limit in bytes, -1 for unlimited
    pub body_byte_limit: i64,
    pub shutdown_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            collect_interval_seconds: 10,
            elastic_search_host: "localhost".to_string(),
            elastic_search_port: 9200,
            trace_statistics: true,
            trace_exchanges: true,
            trace_includes_header: true,
            body_byte_limit: -1,
            shutdown_timeout_seconds: 5,
            request_timeout_seconds: 30,
            proxy: None,
        }
    }
}

impl TelemetryConfig {
    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Body limit as an optional byte count (`None` = unlimited)
    pub fn body_limit(&self) -> Option<usize> {
        usize::try_from(self.body_byte_limit).ok()
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(ArcSwap::from_pointee(self))
    }
}

/// Load configuration from an optional file plus `GATEWAY_TELEMETRY__*` environment overrides
pub fn load_config(path: Option<&Path>) -> anyhow::Result<TelemetryConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let config = builder
        .add_source(
            config::Environment::with_prefix("GATEWAY_TELEMETRY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let cfg: TelemetryConfig = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &TelemetryConfig) -> anyhow::Result<()> {
    if cfg.collect_interval_seconds == 0 {
        anyhow::bail!("collect_interval_seconds must be at least 1");
    }

    if cfg.elastic_search_host.trim().is_empty() {
        anyhow::bail!("elastic_search_host cannot be empty");
    }

    if cfg.elastic_search_port == 0 {
        anyhow::bail!("elastic_search_port cannot be 0");
    }

    if cfg.body_byte_limit < -1 {
        anyhow::bail!(
            "body_byte_limit must be -1 (unlimited) or a byte count, got {}",
            cfg.body_byte_limit
        );
    }

    if let Some(proxy) = &cfg.proxy {
        if proxy.host.trim().is_empty() {
            anyhow::bail!("proxy host cannot be empty");
        }
    }

    Ok(())
}

/// Reload configuration from disk and swap it in atomically
///
/// The previous configuration stays in place when loading or validation fails.
/// The collector picks the new values up at its next cycle.
pub fn reload_config(shared: &SharedConfig, path: Option<&Path>) -> anyhow::Result<()> {
    let new_config = load_config(path)?;

    tracing::info!(
        interval_secs = new_config.collect_interval_seconds,
        trace_statistics = new_config.trace_statistics,
        trace_exchanges = new_config.trace_exchanges,
        "Telemetry configuration reloaded"
    );

    shared.store(Arc::new(new_config));
    Ok(())
}
