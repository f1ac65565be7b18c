use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Span};

use crate::aggregator::{FeedMetadata, FlowAggregator};
use crate::clock::system_clock;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::feeder::Output;
use crate::listener::ListenerSet;

/// Agent orchestrates all components: health server, aggregator, listeners.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    health_addr: Option<SocketAddr>,
    aggregator: Option<Arc<FlowAggregator<Output>>>,
    aggregator_task: Option<JoinHandle<Result<()>>>,
    listeners: Option<ListenerSet>,
    span: Span,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            health_addr: None,
            aggregator: None,
            aggregator_task: None,
            listeners: None,
            span: tracing::info_span!("flowagg"),
        })
    }

    /// Start all components and begin collecting flows.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond during startup.
        let addr = self
            .health
            .start()
            .await
            .context("starting health metrics server")?;
        self.health_addr = Some(addr);

        // 2. Output and aggregator.
        let feeder = Arc::new(Output::from_config(&self.cfg.output).context("creating output")?);
        let hostname = resolve_hostname(&self.cfg.hostname);
        let meta = FeedMetadata::new(&hostname, &self.cfg.source, self.cfg.tags.clone());

        let aggregator = Arc::new(FlowAggregator::new(
            &self.cfg.aggregator,
            meta,
            feeder,
            Arc::clone(&self.health),
            system_clock(),
            tracing::info_span!(parent: &self.span, "aggregator"),
        ));

        let runner = Arc::clone(&aggregator);
        self.aggregator_task = Some(tokio::spawn(async move { runner.start().await }));

        // 3. Listeners last, once something is draining the channel.
        let listeners = ListenerSet::start_all(
            &self.cfg.listeners,
            &aggregator.sender(),
            &self.health,
            &self.span,
        )
        .await;
        if listeners.is_empty() {
            warn!(parent: &self.span, "no listeners running, no flows will be received");
        }

        info!(
            parent: &self.span,
            hostname = %hostname,
            listeners = listeners.len(),
            configured = self.cfg.listeners.len(),
            "agent fully started",
        );

        self.listeners = Some(listeners);
        self.aggregator = Some(aggregator);

        Ok(())
    }

    /// Stops listeners, then the aggregator (emitting pending flows), then
    /// the health server.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(listeners) = self.listeners.take() {
            listeners.stop().await;
        }

        if let Some(aggregator) = self.aggregator.take() {
            aggregator.stop().await;
        }

        if let Some(task) = self.aggregator_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(parent: &self.span, error = %e, "aggregator exited with error"),
                Err(e) => error!(parent: &self.span, error = %e, "aggregator task panicked"),
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    /// Address the health server is bound to, once started.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Number of listeners currently running.
    pub fn running_listeners(&self) -> usize {
        self.listeners.as_ref().map_or(0, ListenerSet::len)
    }
}

/// Returns `configured`, or the system host name when it is empty.
fn resolve_hostname(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }

    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}
