use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the flow aggregation agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Host name reported on every document. Empty: the system host name.
    #[serde(default)]
    pub hostname: String,

    /// Logical source name handed to the feeder. Default: "netflow".
    #[serde(default = "default_source")]
    pub source: String,

    /// Extra tags attached to every document.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Flow aggregation settings.
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// UDP listeners, one per flow type and port.
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Where flushed documents are sent.
    #[serde(default)]
    pub output: OutputConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Flow aggregation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Capacity of the ingest channel. Default: 10000.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// How often pending flows are emitted. Default: 300s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// How long an idle flow context is kept after its last flush.
    /// Default: the flush interval.
    #[serde(default, with = "humantime_serde")]
    pub flow_context_ttl: Option<Duration>,

    /// Distinct peer ports above which a port is rolled up. Default: 10.
    #[serde(default = "default_port_rollup_threshold")]
    pub port_rollup_threshold: usize,

    /// Disable ephemeral port rollup. Default: false.
    #[serde(default)]
    pub port_rollup_disabled: bool,

    /// How often the rollup tracker forgets unconfirmed ports. Default: 300s.
    #[serde(default = "default_rollup_refresh_interval", with = "humantime_serde")]
    pub rollup_tracker_refresh_interval: Duration,

    /// Capacity of the hash-collision check queue. Default: 1024.
    #[serde(default = "default_collision_check_queue_size")]
    pub collision_check_queue_size: usize,
}

/// One UDP listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// netflow5, netflow9, ipfix or sflow5.
    pub flow_type: String,

    /// UDP port. Default: the protocol's conventional port.
    #[serde(default)]
    pub port: Option<u16>,

    /// Bind address. Default: "0.0.0.0".
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Datagram workers sharing the socket. Default: 1.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Device namespace for flows from this listener. Default: "default".
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Output destination.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    /// Output kind. Default: stdout.
    #[serde(default)]
    pub kind: OutputKind,

    /// HTTP output settings, used when `kind` is http.
    #[serde(default)]
    pub http: HttpOutputConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Stdout,
    Http,
}

/// HTTP output configuration (e.g., for Vector).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpOutputConfig {
    /// HTTP endpoint to send documents to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zlib). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_source() -> String {
    "netflow".to_string()
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_port_rollup_threshold() -> usize {
    10
}

fn default_rollup_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_collision_check_queue_size() -> usize {
    1024
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            source: default_source(),
            tags: BTreeMap::new(),
            aggregator: AggregatorConfig::default(),
            listeners: Vec::new(),
            output: OutputConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            flush_interval: default_flush_interval(),
            flow_context_ttl: None,
            port_rollup_threshold: default_port_rollup_threshold(),
            port_rollup_disabled: false,
            rollup_tracker_refresh_interval: default_rollup_refresh_interval(),
            collision_check_queue_size: default_collision_check_queue_size(),
        }
    }
}

impl Default for HttpOutputConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            timeout: default_http_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl AggregatorConfig {
    /// Effective flow context TTL.
    pub fn context_ttl(&self) -> Duration {
        self.flow_context_ttl.unwrap_or(self.flush_interval)
    }

    /// True when ports should be rolled up.
    pub fn rollup_enabled(&self) -> bool {
        !self.port_rollup_disabled && self.port_rollup_threshold > 0
    }
}

impl ListenerConfig {
    /// Creates a listener config with defaults for everything but the type.
    pub fn new(flow_type: impl Into<String>) -> Self {
        Self {
            flow_type: flow_type.into(),
            port: None,
            bind_host: default_bind_host(),
            workers: default_workers(),
            namespace: default_namespace(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    ///
    /// Listener entries are checked when each listener starts so one bad
    /// listener does not keep the others from running.
    pub fn validate(&self) -> Result<()> {
        if self.source.is_empty() {
            bail!("source must not be empty");
        }

        let agg = &self.aggregator;
        if agg.buffer_size == 0 {
            bail!("aggregator.buffer_size must be positive");
        }
        if agg.flush_interval.is_zero() {
            bail!("aggregator.flush_interval must be positive");
        }
        if agg.flow_context_ttl.is_some_and(|ttl| ttl.is_zero()) {
            bail!("aggregator.flow_context_ttl must be positive when set");
        }
        if agg.rollup_tracker_refresh_interval.is_zero() {
            bail!("aggregator.rollup_tracker_refresh_interval must be positive");
        }
        if agg.collision_check_queue_size == 0 {
            bail!("aggregator.collision_check_queue_size must be positive");
        }

        if self.output.kind == OutputKind::Http {
            let http = &self.output.http;
            if http.address.is_empty() {
                bail!("output.http.address is required when output.kind is http");
            }
            if http.timeout.is_zero() {
                bail!("output.http.timeout must be positive");
            }
            match http.compression.as_str() {
                "none" | "gzip" | "zlib" => {}
                other => bail!("invalid compression type: {other}"),
            }
        }

        Ok(())
    }
}
