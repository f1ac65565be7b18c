//! UDP listeners feeding decoded flows into the aggregator.
//!
//! Each configured listener binds one socket shared by `workers` tasks.
//! A listener that fails to start is reported and skipped; the rest of the
//! set still runs.

pub mod netflow5;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::ListenerConfig;
use crate::export::health::HealthMetrics;
use crate::flow::{FlowRecord, FlowType};

use self::netflow5::NetFlow5Decoder;

const MAX_NAMESPACE_LEN: usize = 100;
const MAX_DATAGRAM_SIZE: usize = 65_535;
const RECV_ERROR_BACKOFF_BASE: Duration = Duration::from_millis(10);
const RECV_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Reasons a listener could not be started.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("unknown flow type: {0:?}")]
    UnknownFlowType(String),

    #[error("{flow_type} listener: port must be non-zero")]
    InvalidPort { flow_type: FlowType },

    #[error("{flow_type} listener: workers must be positive")]
    InvalidWorkers { flow_type: FlowType },

    #[error("invalid namespace {namespace:?}: {reason}")]
    InvalidNamespace {
        namespace: String,
        reason: &'static str,
    },

    #[error("no decoder available for flow type {0}")]
    UnsupportedFlowType(FlowType),

    #[error("binding {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced while decoding a single datagram.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("datagram too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unsupported version: {version}")]
    UnsupportedVersion { version: u16 },

    #[error("record count {count} exceeds protocol maximum")]
    TooManyRecords { count: usize },

    #[error("header declares {count} records, datagram holds {available}")]
    RecordsTruncated { count: usize, available: usize },
}

/// Turns one export datagram into normalized flow records.
pub trait Decoder: Send + Sync {
    fn flow_type(&self) -> FlowType;

    fn decode(
        &self,
        datagram: &[u8],
        exporter: IpAddr,
        namespace: &str,
    ) -> Result<Vec<FlowRecord>, DecodeError>;
}

/// Returns the in-tree decoder for `flow_type`.
pub fn decoder_for(flow_type: FlowType) -> Result<Arc<dyn Decoder>, ListenerError> {
    match flow_type {
        FlowType::NetFlow5 => Ok(Arc::new(NetFlow5Decoder)),
        other => Err(ListenerError::UnsupportedFlowType(other)),
    }
}

/// Checks a device namespace: 1 to 100 characters from `[A-Za-z0-9_.-]`.
pub fn validate_namespace(namespace: &str) -> Result<(), ListenerError> {
    let reason = if namespace.is_empty() {
        Some("must not be empty")
    } else if namespace.len() > MAX_NAMESPACE_LEN {
        Some("longer than 100 characters")
    } else if !namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        Some("only letters, digits, '_', '.' and '-' are allowed")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ListenerError::InvalidNamespace {
            namespace: namespace.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Address bytes as stored on flow records. IPv4-mapped IPv6 peers are
/// reported as IPv4.
pub(crate) fn exporter_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.octets().to_vec(),
            None => v6.octets().to_vec(),
        },
    }
}

/// One running UDP listener.
pub struct Listener {
    flow_type: FlowType,
    namespace: String,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Listener {
    /// Validates `cfg`, binds the socket and spawns the workers.
    pub async fn start(
        cfg: &ListenerConfig,
        tx: mpsc::Sender<FlowRecord>,
        metrics: Arc<HealthMetrics>,
        span: Span,
    ) -> Result<Self, ListenerError> {
        let flow_type = FlowType::from_name(&cfg.flow_type)
            .ok_or_else(|| ListenerError::UnknownFlowType(cfg.flow_type.clone()))?;
        let port = cfg.port.unwrap_or_else(|| flow_type.default_port());
        if port == 0 {
            return Err(ListenerError::InvalidPort { flow_type });
        }
        if cfg.workers == 0 {
            return Err(ListenerError::InvalidWorkers { flow_type });
        }
        validate_namespace(&cfg.namespace)?;
        let decoder = decoder_for(flow_type)?;

        let addr = format_bind_addr(&cfg.bind_host, port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| ListenerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let socket = Arc::new(socket);

        let cancel = CancellationToken::new();
        let namespace: Arc<str> = Arc::from(cfg.namespace.as_str());
        let worker_span = tracing::info_span!(
            parent: &span,
            "listener",
            flow_type = %flow_type,
            addr = %local_addr,
        );

        let workers = (0..cfg.workers)
            .map(|id| {
                tokio::spawn(
                    worker_loop(
                        Arc::clone(&socket),
                        Arc::clone(&decoder),
                        Arc::clone(&namespace),
                        tx.clone(),
                        Arc::clone(&metrics),
                        cancel.clone(),
                    )
                    .instrument(tracing::debug_span!(parent: &worker_span, "worker", id)),
                )
            })
            .collect();

        info!(
            parent: &span,
            flow_type = %flow_type,
            addr = %local_addr,
            workers = cfg.workers,
            namespace = %cfg.namespace,
            "listener started",
        );

        Ok(Self {
            flow_type,
            namespace: cfg.namespace.clone(),
            local_addr,
            cancel,
            workers,
        })
    }

    pub fn flow_type(&self) -> FlowType {
        self.flow_type
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancels the workers and waits for them to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!(error = %e, flow_type = %self.flow_type, "listener worker panicked");
            }
        }
        debug!(
            flow_type = %self.flow_type,
            namespace = %self.namespace,
            addr = %self.local_addr,
            "listener stopped",
        );
    }
}

fn format_bind_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

async fn worker_loop(
    socket: Arc<UdpSocket>,
    decoder: Arc<dyn Decoder>,
    namespace: Arc<str>,
    tx: mpsc::Sender<FlowRecord>,
    metrics: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    let flow_type = decoder.flow_type();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut recv_errors = 0u32;

    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => res,
        };
        let (n, peer) = match res {
            Ok(v) => {
                recv_errors = 0;
                v
            }
            Err(e) => {
                recv_errors = recv_errors.saturating_add(1);
                let backoff = recv_error_backoff(recv_errors);
                warn!(error = %e, consecutive = recv_errors, ?backoff, "receiving datagram");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        let flows = match decoder.decode(&buf[..n], peer.ip(), &namespace) {
            Ok(flows) => flows,
            Err(e) => {
                metrics
                    .decode_errors
                    .with_label_values(&[flow_type.as_str()])
                    .inc();
                debug!(error = %e, peer = %peer, "dropping undecodable datagram");
                continue;
            }
        };

        for flow in flows {
            tokio::select! {
                _ = cancel.cancelled() => return,
                res = tx.send(flow) => if res.is_err() {
                    debug!("aggregator channel closed");
                    return;
                },
            }
        }
    }
}

/// Delay before the next receive after `consecutive` failed ones, doubling
/// from 10ms up to 1s.
fn recv_error_backoff(consecutive: u32) -> Duration {
    let exponent = consecutive.saturating_sub(1).min(7);
    RECV_ERROR_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(RECV_ERROR_BACKOFF_MAX)
}

/// The set of listeners started from configuration.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    /// Starts every configured listener. Failures are logged and counted;
    /// the remaining listeners still start.
    pub async fn start_all(
        configs: &[ListenerConfig],
        tx: &mpsc::Sender<FlowRecord>,
        metrics: &Arc<HealthMetrics>,
        span: &Span,
    ) -> Self {
        let mut listeners = Vec::with_capacity(configs.len());
        for cfg in configs {
            match Listener::start(cfg, tx.clone(), Arc::clone(metrics), span.clone()).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    metrics
                        .listener_start_errors
                        .with_label_values(&[cfg.flow_type.as_str()])
                        .inc();
                    error!(parent: span, error = %e, flow_type = %cfg.flow_type, "starting listener");
                }
            }
        }
        Self { listeners }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// Stops every listener and waits for their workers.
    pub async fn stop(self) {
        for listener in self.listeners {
            listener.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::netflow5::tests::{datagram, TestRecord};
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::time::Duration;

    fn metrics() -> Arc<HealthMetrics> {
        Arc::new(HealthMetrics::new(":0").expect("metrics"))
    }

    fn netflow5(port: u16) -> ListenerConfig {
        ListenerConfig {
            port: Some(port),
            bind_host: "127.0.0.1".to_string(),
            ..ListenerConfig::new("netflow5")
        }
    }

    #[test]
    fn test_recv_error_backoff_grows_and_caps() {
        assert_eq!(recv_error_backoff(1), Duration::from_millis(10));
        assert_eq!(recv_error_backoff(2), Duration::from_millis(20));
        assert_eq!(recv_error_backoff(4), Duration::from_millis(80));
        assert_eq!(recv_error_backoff(8), Duration::from_secs(1));
        assert_eq!(recv_error_backoff(u32::MAX), Duration::from_secs(1));
        assert!(recv_error_backoff(0) > Duration::ZERO);
    }

    #[test]
    fn test_validate_namespace() {
        assert!(validate_namespace("default").is_ok());
        assert!(validate_namespace("dc-1.edge_a").is_ok());
        assert!(validate_namespace(&"a".repeat(100)).is_ok());

        for bad in ["", "has space", "slash/ns", "ünï"] {
            assert!(
                matches!(
                    validate_namespace(bad),
                    Err(ListenerError::InvalidNamespace { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_namespace(&"a".repeat(101)).is_err());
    }

    #[test]
    fn test_decoder_for() {
        assert!(decoder_for(FlowType::NetFlow5).is_ok());
        assert!(matches!(
            decoder_for(FlowType::SFlow5),
            Err(ListenerError::UnsupportedFlowType(FlowType::SFlow5))
        ));
    }

    #[test]
    fn test_exporter_bytes() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(exporter_bytes(v4), vec![192, 0, 2, 1]);
        let mapped = IpAddr::V6(Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped());
        assert_eq!(exporter_bytes(mapped), vec![192, 0, 2, 1]);
        assert_eq!(exporter_bytes(IpAddr::V6(Ipv6Addr::LOCALHOST)).len(), 16);
    }

    #[test]
    fn test_format_bind_addr() {
        assert_eq!(format_bind_addr("0.0.0.0", 2055), "0.0.0.0:2055");
        assert_eq!(format_bind_addr("::", 2055), "[::]:2055");
        assert_eq!(format_bind_addr("[::1]", 2055), "[::1]:2055");
    }

    #[tokio::test]
    async fn test_start_rejects_bad_config() {
        let (tx, _rx) = mpsc::channel(4);
        let m = metrics();

        let err = Listener::start(&ListenerConfig::new("netflow7"), tx.clone(), Arc::clone(&m), Span::none())
            .await
            .err()
            .expect("unknown type");
        assert!(matches!(err, ListenerError::UnknownFlowType(_)));

        let err = Listener::start(&netflow5(0), tx.clone(), Arc::clone(&m), Span::none())
            .await
            .err()
            .expect("port 0");
        assert!(matches!(err, ListenerError::InvalidPort { .. }));

        let mut cfg = netflow5(0);
        cfg.port = None;
        cfg.namespace = "bad ns".to_string();
        let err = Listener::start(&cfg, tx.clone(), Arc::clone(&m), Span::none())
            .await
            .err()
            .expect("namespace");
        assert!(matches!(err, ListenerError::InvalidNamespace { .. }));

        let cfg = ListenerConfig {
            port: Some(0),
            ..ListenerConfig::new("ipfix")
        };
        let err = Listener::start(&cfg, tx.clone(), Arc::clone(&m), Span::none())
            .await
            .err()
            .expect("port 0 before decoder lookup");
        assert!(matches!(err, ListenerError::InvalidPort { .. }));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
        let port = taken.local_addr().expect("addr").port();
        let (tx, _rx) = mpsc::channel(4);

        let err = Listener::start(&netflow5(port), tx, metrics(), Span::none())
            .await
            .err()
            .expect("bind conflict");
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_listener_decodes_datagrams() {
        let (tx, mut rx) = mpsc::channel(16);
        let cfg = ListenerConfig {
            namespace: "edge".to_string(),
            workers: 2,
            ..netflow5(free_udp_port())
        };
        let listener = Listener::start(&cfg, tx, metrics(), Span::none())
            .await
            .expect("start");

        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
        let data = datagram(&[TestRecord::default(), TestRecord::default()]);
        sender
            .send_to(&data, listener.local_addr())
            .await
            .expect("send");

        for _ in 0..2 {
            let flow = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timely flow")
                .expect("flow");
            assert_eq!(flow.namespace, "edge");
            assert_eq!(flow.exporter_addr, vec![127, 0, 0, 1]);
            assert_eq!(flow.bytes, 120);
        }

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_decode_errors_are_counted() {
        let (tx, _rx) = mpsc::channel(16);
        let m = metrics();
        let cfg = netflow5(free_udp_port());
        let listener = Listener::start(&cfg, tx, Arc::clone(&m), Span::none())
            .await
            .expect("start");

        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
        sender
            .send_to(&[0, 9, 0, 0], listener.local_addr())
            .await
            .expect("send");

        let counter = m.decode_errors.with_label_values(&["netflow5"]);
        for _ in 0..200 {
            if counter.get() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.get(), 1);
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_listener_set_skips_failures() {
        let (tx, _rx) = mpsc::channel(4);
        let m = metrics();
        let configs = vec![
            ListenerConfig::new("bogus"),
            netflow5(free_udp_port()),
            ListenerConfig {
                port: Some(free_udp_port()),
                ..ListenerConfig::new("sflow5")
            },
        ];

        let set = ListenerSet::start_all(&configs, &tx, &m, &Span::none()).await;
        assert_eq!(set.len(), 1);
        assert_eq!(set.listeners()[0].flow_type(), FlowType::NetFlow5);
        assert_eq!(
            m.listener_start_errors.with_label_values(&["bogus"]).get(),
            1
        );
        assert_eq!(
            m.listener_start_errors.with_label_values(&["sflow5"]).get(),
            1
        );
        set.stop().await;
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .and_then(|s| s.local_addr())
            .map(|a| a.port())
            .expect("free port")
    }
}
