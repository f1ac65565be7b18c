use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "flowagg";

/// Prometheus metrics for the flow pipeline.
///
/// Metrics live in a private registry served on `/metrics` once
/// [`start`](Self::start) has been called. Components increment them
/// directly; tests read them back with `get()`.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Flow records taken off the ingest channel.
    pub flows_received: IntCounter,
    /// Flow records returned by accumulator flushes.
    pub flows_flushed: IntCounter,
    /// Distinct flows that hashed to the same aggregation key.
    pub hash_collisions: IntCounter,
    /// Collision checks skipped because the check queue was full.
    pub collision_checks_dropped: IntCounter,
    /// Documents the feeder failed to accept.
    pub feed_errors: IntCounter,
    /// Flows that could not be serialized into a document.
    pub serialize_errors: IntCounter,
    /// Port rollup generation swaps.
    pub rollup_refreshes: IntCounter,
    /// Live flow contexts in the accumulator, sampled after each flush.
    pub flow_contexts: IntGauge,
    /// Listener start failures by flow type.
    pub listener_start_errors: IntCounterVec,
    /// Datagrams the decoder rejected, by flow type.
    pub decode_errors: IntCounterVec,
}

impl HealthMetrics {
    /// Creates the metric set and registers it. `addr` is where
    /// [`start`](Self::start) will listen (`":9090"` shorthand accepted).
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let flows_received = IntCounter::with_opts(
            Opts::new(
                "flows_received_total",
                "Flow records taken off the ingest channel.",
            )
            .namespace(NAMESPACE),
        )?;
        let flows_flushed = IntCounter::with_opts(
            Opts::new(
                "flows_flushed_total",
                "Flow records emitted by accumulator flushes.",
            )
            .namespace(NAMESPACE),
        )?;
        let hash_collisions = IntCounter::with_opts(
            Opts::new(
                "hash_collisions_total",
                "Distinct flows sharing an aggregation key.",
            )
            .namespace(NAMESPACE),
        )?;
        let collision_checks_dropped = IntCounter::with_opts(
            Opts::new(
                "collision_checks_dropped_total",
                "Collision checks skipped because the queue was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let feed_errors = IntCounter::with_opts(
            Opts::new("feed_errors_total", "Documents rejected by the feeder.")
                .namespace(NAMESPACE),
        )?;
        let serialize_errors = IntCounter::with_opts(
            Opts::new(
                "serialize_errors_total",
                "Flows that failed to serialize.",
            )
            .namespace(NAMESPACE),
        )?;
        let rollup_refreshes = IntCounter::with_opts(
            Opts::new(
                "rollup_refreshes_total",
                "Port rollup generation swaps.",
            )
            .namespace(NAMESPACE),
        )?;
        let flow_contexts = IntGauge::with_opts(
            Opts::new("flow_contexts", "Live flow contexts in the accumulator.")
                .namespace(NAMESPACE),
        )?;
        let listener_start_errors = IntCounterVec::new(
            Opts::new(
                "listener_start_errors_total",
                "Listener start failures by flow type.",
            )
            .namespace(NAMESPACE),
            &["flow_type"],
        )?;
        let decode_errors = IntCounterVec::new(
            Opts::new(
                "decode_errors_total",
                "Datagrams rejected by the decoder.",
            )
            .namespace(NAMESPACE),
            &["flow_type"],
        )?;

        registry.register(Box::new(flows_received.clone()))?;
        registry.register(Box::new(flows_flushed.clone()))?;
        registry.register(Box::new(hash_collisions.clone()))?;
        registry.register(Box::new(collision_checks_dropped.clone()))?;
        registry.register(Box::new(feed_errors.clone()))?;
        registry.register(Box::new(serialize_errors.clone()))?;
        registry.register(Box::new(rollup_refreshes.clone()))?;
        registry.register(Box::new(flow_contexts.clone()))?;
        registry.register(Box::new(listener_start_errors.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            flows_received,
            flows_flushed,
            hash_collisions,
            collision_checks_dropped,
            feed_errors,
            serialize_errors,
            rollup_refreshes,
            flow_contexts,
            listener_start_errors,
            decode_errors,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops the HTTP server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
