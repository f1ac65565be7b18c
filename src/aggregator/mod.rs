//! Flow aggregation pipeline.
//!
//! Decoders push [`FlowRecord`]s into a bounded channel. The ingest loop
//! merges them into the [`FlowAccumulator`]; the flush loop periodically
//! emits ready flows through a [`Feeder`] and refreshes the port rollup
//! tracker.

pub mod accumulator;
pub mod collision;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::clock::{unix_millis, Clock};
use crate::config::AggregatorConfig;
use crate::export::health::HealthMetrics;
use crate::feeder::{FeedItem, Feeder};
use crate::flow::FlowRecord;
use crate::payload::build_payload;
use crate::rollup::PortRollupStore;

use self::accumulator::FlowAccumulator;
use self::collision::{collision_queue, CollisionWorker};

/// Identity attached to every emitted document.
#[derive(Debug, Clone)]
pub struct FeedMetadata {
    pub hostname: String,
    pub source: Arc<str>,
    /// User tags plus `host`.
    pub tags: Arc<BTreeMap<String, String>>,
}

impl FeedMetadata {
    /// Combines user tags with the host tag. A user supplied `host` tag wins.
    pub fn new(hostname: &str, source: &str, mut tags: BTreeMap<String, String>) -> Self {
        tags.entry("host".to_string())
            .or_insert_with(|| hostname.to_string());
        Self {
            hostname: hostname.to_string(),
            source: Arc::from(source),
            tags: Arc::new(tags),
        }
    }
}

/// Snapshot of the aggregator's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorStats {
    pub flows_received: u64,
    pub flows_flushed: u64,
    pub flow_contexts: usize,
}

/// Wires the ingest channel, accumulator and feeder together.
///
/// An aggregator runs once: [`start`](Self::start) blocks on the flush loop
/// until [`stop`](Self::stop) is called from another task. Whichever of the
/// two claims the receiver first decides whether the loops ever run.
pub struct FlowAggregator<F: Feeder> {
    tx: mpsc::Sender<FlowRecord>,
    rx: parking_lot::Mutex<Option<mpsc::Receiver<FlowRecord>>>,
    collision_worker: parking_lot::Mutex<Option<CollisionWorker>>,
    accumulator: Arc<FlowAccumulator>,
    rollup: Option<Arc<PortRollupStore>>,
    flush_interval: Duration,
    rollup_refresh_interval: Duration,
    feeder: Arc<F>,
    meta: FeedMetadata,
    clock: Clock,
    metrics: Arc<HealthMetrics>,
    stop: CancellationToken,
    ingest_done: CancellationToken,
    flush_done: CancellationToken,
    span: Span,
}

impl<F: Feeder> FlowAggregator<F> {
    pub fn new(
        cfg: &AggregatorConfig,
        meta: FeedMetadata,
        feeder: Arc<F>,
        metrics: Arc<HealthMetrics>,
        clock: Clock,
        span: Span,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.buffer_size.max(1));

        let rollup = cfg.rollup_enabled().then(|| {
            Arc::new(PortRollupStore::new(
                cfg.port_rollup_threshold,
                span.clone(),
            ))
        });

        let (checker, worker) = collision_queue(
            cfg.collision_check_queue_size,
            Arc::clone(&metrics),
            span.clone(),
        );

        let accumulator = Arc::new(FlowAccumulator::new(
            cfg.flush_interval,
            cfg.context_ttl(),
            rollup.clone(),
            checker,
            Arc::clone(&clock),
            span.clone(),
        ));

        Self {
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            collision_worker: parking_lot::Mutex::new(Some(worker)),
            accumulator,
            rollup,
            flush_interval: cfg.flush_interval,
            rollup_refresh_interval: cfg.rollup_tracker_refresh_interval,
            feeder,
            meta,
            clock,
            metrics,
            stop: CancellationToken::new(),
            ingest_done: CancellationToken::new(),
            flush_done: CancellationToken::new(),
            span,
        }
    }

    /// Returns a handle decoders use to submit flows. Sends wait when the
    /// channel is full.
    pub fn sender(&self) -> mpsc::Sender<FlowRecord> {
        self.tx.clone()
    }

    /// Runs the pipeline. The ingest loop is spawned; the flush loop runs on
    /// the calling task and returns after [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        let Some(rx) = self.rx.lock().take() else {
            bail!("flow aggregator already started or stopped");
        };

        let worker = self.collision_worker.lock().take();
        if let Some(worker) = worker {
            tokio::spawn(
                worker
                    .run(self.stop.clone())
                    .instrument(self.span.clone()),
            );
        }

        tokio::spawn(
            ingest_loop(
                rx,
                Arc::clone(&self.accumulator),
                Arc::clone(&self.metrics),
                self.stop.clone(),
                self.ingest_done.clone(),
            )
            .instrument(self.span.clone()),
        );

        info!(
            parent: &self.span,
            flush_interval = ?self.flush_interval,
            rollup_refresh_interval = ?self.rollup_refresh_interval,
            rollup_threshold = ?self.rollup.as_ref().map(|r| r.threshold()),
            feeder = self.feeder.name(),
            "flow aggregator started",
        );

        self.flush_loop().await;
        Ok(())
    }

    /// Signals both loops and waits until they have finished. Pending flows
    /// are emitted before this returns.
    pub async fn stop(&self) {
        self.stop.cancel();
        if self.rx.lock().take().is_some() {
            // Never started; the loops will not run.
            self.ingest_done.cancel();
            self.flush_done.cancel();
            debug!(parent: &self.span, "flow aggregator stopped before start");
            return;
        }
        self.ingest_done.cancelled().await;
        self.flush_done.cancelled().await;
        info!(parent: &self.span, "flow aggregator stopped");
    }

    pub fn flow_context_count(&self) -> usize {
        self.accumulator.flow_context_count()
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            flows_received: self.metrics.flows_received.get(),
            flows_flushed: self.metrics.flows_flushed.get(),
            flow_contexts: self.accumulator.flow_context_count(),
        }
    }

    async fn flush_loop(&self) {
        let mut flush_ticker =
            interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh_ticker = interval_at(
            Instant::now() + self.rollup_refresh_interval,
            self.rollup_refresh_interval,
        );
        refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = flush_ticker.tick() => self.flush().await,
                _ = refresh_ticker.tick(), if self.rollup.is_some() => self.refresh_rollup(),
            }
        }

        // No more merges once ingest has exited; emit what is left.
        self.ingest_done.cancelled().await;
        let remaining = self.accumulator.drain();
        debug!(parent: &self.span, flows = remaining.len(), "draining accumulator");
        self.emit(remaining).await;
        self.flush_done.cancel();
    }

    async fn flush(&self) {
        let flows = self.accumulator.flush();
        let contexts = self.accumulator.flow_context_count();
        self.metrics
            .flow_contexts
            .set(i64::try_from(contexts).unwrap_or(i64::MAX));
        self.emit(flows).await;
    }

    fn refresh_rollup(&self) {
        if let Some(rollup) = &self.rollup {
            rollup.use_new_store_as_current_store();
            self.metrics.rollup_refreshes.inc();
        }
    }

    /// Serializes and feeds each flow. Failures are counted and skipped.
    async fn emit(&self, flows: Vec<FlowRecord>) {
        if flows.is_empty() {
            return;
        }

        let flush_time = (self.clock)();
        let flush_ms = unix_millis(flush_time);
        self.metrics.flows_flushed.inc_by(flows.len() as u64);

        let mut fed = 0usize;
        for flow in &flows {
            let doc = build_payload(flow, &self.meta.hostname, flush_ms);
            let body = match serde_json::to_string(&doc) {
                Ok(body) => body,
                Err(e) => {
                    self.metrics.serialize_errors.inc();
                    warn!(parent: &self.span, error = %e, "serializing flow document");
                    continue;
                }
            };

            let item = FeedItem {
                source: Arc::clone(&self.meta.source),
                tags: Arc::clone(&self.meta.tags),
                body,
                time: flush_time,
            };
            match self.feeder.feed(item).await {
                Ok(()) => fed += 1,
                Err(e) => {
                    self.metrics.feed_errors.inc();
                    warn!(
                        parent: &self.span,
                        feeder = self.feeder.name(),
                        error = %e,
                        "feeding flow document",
                    );
                }
            }
        }

        debug!(
            parent: &self.span,
            flushed = flows.len(),
            fed,
            "emitted flows",
        );
    }
}

async fn ingest_loop(
    mut rx: mpsc::Receiver<FlowRecord>,
    accumulator: Arc<FlowAccumulator>,
    metrics: Arc<HealthMetrics>,
    stop: CancellationToken,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            flow = rx.recv() => match flow {
                Some(flow) => {
                    metrics.flows_received.inc();
                    accumulator.add(flow);
                }
                None => break,
            },
        }
    }
    debug!("ingest loop stopped");
    done.cancel();
}
