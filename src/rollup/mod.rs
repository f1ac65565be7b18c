//! Ephemeral port rollup.
//!
//! Tracks, per ordered endpoint address pair, which ports were seen on each
//! side and reports when a port has been paired with more distinct peer ports
//! than the configured threshold. Such a port is almost certainly a client
//! side ephemeral port and gets replaced with a wildcard before aggregation.
//!
//! Observations live in two generations. Writes go to both, reads use
//! `current`. A periodic refresh promotes `new` to `current` and starts an
//! empty `new`, so ports that were not reconfirmed since the previous refresh
//! are forgotten.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tracing::{debug, Span};

/// Result of an ephemeral-port lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsEphemeralStatus {
    NotEphemeral,
    SourceIsEphemeral,
    DestIsEphemeral,
}

/// Fixed-size copy of an IPv4/IPv6 address used as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AddrBytes {
    len: u8,
    bytes: [u8; 16],
}

impl AddrBytes {
    fn from_slice(addr: &[u8]) -> Self {
        let len = addr.len().min(16);
        let mut bytes = [0u8; 16];
        bytes[..len].copy_from_slice(&addr[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }
}

/// Ordered (source, destination) address pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EndpointPair {
    src: AddrBytes,
    dst: AddrBytes,
}

impl EndpointPair {
    fn new(src: &[u8], dst: &[u8]) -> Self {
        Self {
            src: AddrBytes::from_slice(src),
            dst: AddrBytes::from_slice(dst),
        }
    }
}

/// Port observations for one endpoint pair.
#[derive(Debug, Default)]
struct PairPorts {
    /// Destination ports seen for each source port.
    dst_ports_by_src_port: HashMap<u16, HashSet<u16>>,
    /// Source ports seen for each destination port.
    src_ports_by_dst_port: HashMap<u16, HashSet<u16>>,
}

impl PairPorts {
    fn record(&mut self, src_port: u16, dst_port: u16) {
        self.dst_ports_by_src_port
            .entry(src_port)
            .or_default()
            .insert(dst_port);
        self.src_ports_by_dst_port
            .entry(dst_port)
            .or_default()
            .insert(src_port);
    }

    fn distinct_dst_ports(&self, src_port: u16) -> usize {
        self.dst_ports_by_src_port
            .get(&src_port)
            .map_or(0, HashSet::len)
    }

    fn distinct_src_ports(&self, dst_port: u16) -> usize {
        self.src_ports_by_dst_port
            .get(&dst_port)
            .map_or(0, HashSet::len)
    }
}

type Generation = DashMap<EndpointPair, PairPorts>;

struct Generations {
    current: Arc<Generation>,
    new: Arc<Generation>,
}

/// Double-buffered store deciding which ports to wildcard.
pub struct PortRollupStore {
    threshold: usize,
    generations: ArcSwap<Generations>,
    swap_lock: parking_lot::Mutex<()>,
    span: Span,
}

impl PortRollupStore {
    /// Creates an empty store. A port is ephemeral once it was seen with more
    /// than `threshold` distinct peer ports.
    pub fn new(threshold: usize, span: Span) -> Self {
        Self {
            threshold,
            generations: ArcSwap::from_pointee(Generations {
                current: Arc::new(Generation::new()),
                new: Arc::new(Generation::new()),
            }),
            swap_lock: parking_lot::Mutex::new(()),
            span,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Records `src_port -> dst_port` for the address pair in both generations.
    pub fn add(&self, src_addr: &[u8], dst_addr: &[u8], src_port: u16, dst_port: u16) {
        let pair = EndpointPair::new(src_addr, dst_addr);
        let generations = self.generations.load();
        generations
            .current
            .entry(pair)
            .or_default()
            .record(src_port, dst_port);
        generations
            .new
            .entry(pair)
            .or_default()
            .record(src_port, dst_port);
    }

    /// Decides whether one side of the flow should be wildcarded.
    ///
    /// At most one side is ever reported: if both sides exceed the threshold
    /// the flow is left untouched.
    pub fn is_ephemeral(
        &self,
        src_addr: &[u8],
        dst_addr: &[u8],
        src_port: u16,
        dst_port: u16,
    ) -> IsEphemeralStatus {
        let pair = EndpointPair::new(src_addr, dst_addr);
        let generations = self.generations.load();
        let Some(ports) = generations.current.get(&pair) else {
            return IsEphemeralStatus::NotEphemeral;
        };

        let src_rolls_up = ports.distinct_dst_ports(src_port) > self.threshold;
        let dst_rolls_up = ports.distinct_src_ports(dst_port) > self.threshold;

        match (src_rolls_up, dst_rolls_up) {
            (true, false) => IsEphemeralStatus::SourceIsEphemeral,
            (false, true) => IsEphemeralStatus::DestIsEphemeral,
            _ => IsEphemeralStatus::NotEphemeral,
        }
    }

    /// Promotes the `new` generation to `current` and starts an empty `new`.
    ///
    /// Readers holding the previous snapshot keep a consistent view; an `add`
    /// racing with the swap lands in the promoted generation.
    pub fn use_new_store_as_current_store(&self) {
        let _guard = self.swap_lock.lock();
        let previous = self.generations.load_full();
        let promoted_pairs = previous.new.len();
        let dropped_pairs = previous.current.len().saturating_sub(promoted_pairs);

        self.generations.store(Arc::new(Generations {
            current: Arc::clone(&previous.new),
            new: Arc::new(Generation::new()),
        }));

        debug!(
            parent: &self.span,
            promoted_pairs,
            dropped_pairs,
            "port rollup generation refreshed",
        );
    }

    /// Number of address pairs in the current generation.
    pub fn current_store_size(&self) -> usize {
        self.generations.load().current.len()
    }

    /// Number of address pairs in the new generation.
    pub fn new_store_size(&self) -> usize {
        self.generations.load().new.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SRC: [u8; 4] = [10, 0, 0, 1];
    const DST: [u8; 4] = [10, 0, 0, 2];

    fn store(threshold: usize) -> PortRollupStore {
        PortRollupStore::new(threshold, Span::none())
    }

    #[test]
    fn test_unknown_pair_is_not_ephemeral() {
        let s = store(3);
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 50000, 80),
            IsEphemeralStatus::NotEphemeral
        );
    }

    #[test]
    fn test_threshold_boundary_source() {
        let s = store(5);
        for dst_port in 1..=5u16 {
            s.add(&SRC, &DST, 50000, dst_port);
        }
        // Exactly N distinct destination ports does not roll up.
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 50000, 5),
            IsEphemeralStatus::NotEphemeral
        );

        s.add(&SRC, &DST, 50000, 6);
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 50000, 6),
            IsEphemeralStatus::SourceIsEphemeral
        );
    }

    #[test]
    fn test_repeated_ports_are_not_counted_twice() {
        let s = store(2);
        for _ in 0..10 {
            s.add(&SRC, &DST, 50000, 443);
        }
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 50000, 443),
            IsEphemeralStatus::NotEphemeral
        );
    }

    #[test]
    fn test_destination_side_rolls_up() {
        let s = store(3);
        for src_port in [8080u16, 8081, 8082, 8083] {
            s.add(&SRC, &DST, src_port, 33000);
        }
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 8083, 33000),
            IsEphemeralStatus::DestIsEphemeral
        );
    }

    #[test]
    fn test_both_sides_over_threshold_is_not_ephemeral() {
        let s = store(1);
        // src 1000 talks to dst 1,2 and dst 1 is reached from src 1000,2000.
        s.add(&SRC, &DST, 1000, 1);
        s.add(&SRC, &DST, 1000, 2);
        s.add(&SRC, &DST, 2000, 1);
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 1000, 1),
            IsEphemeralStatus::NotEphemeral
        );
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 1000, 2),
            IsEphemeralStatus::SourceIsEphemeral
        );
    }

    #[test]
    fn test_pairs_are_ordered() {
        let s = store(1);
        s.add(&SRC, &DST, 50000, 1);
        s.add(&SRC, &DST, 50000, 2);
        assert_eq!(
            s.is_ephemeral(&DST, &SRC, 50000, 2),
            IsEphemeralStatus::NotEphemeral
        );
    }

    #[test]
    fn test_refresh_forgets_unconfirmed_ports() {
        let s = store(1);
        s.add(&SRC, &DST, 50000, 1);
        s.add(&SRC, &DST, 50000, 2);
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 50000, 2),
            IsEphemeralStatus::SourceIsEphemeral
        );

        // First refresh: new generation already holds both observations.
        s.use_new_store_as_current_store();
        assert_eq!(s.current_store_size(), 1);
        assert_eq!(s.new_store_size(), 0);
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 50000, 2),
            IsEphemeralStatus::SourceIsEphemeral
        );

        // Nothing reconfirmed before the second refresh.
        s.use_new_store_as_current_store();
        assert_eq!(s.current_store_size(), 0);
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 50000, 2),
            IsEphemeralStatus::NotEphemeral
        );
    }

    #[test]
    fn test_concurrent_refresh_and_add() {
        let s = Arc::new(store(4));
        let mut handles = Vec::new();

        for t in 0..4u16 {
            let s = Arc::clone(&s);
            handles.push(thread::spawn(move || {
                for i in 0..2_000u16 {
                    s.add(&SRC, &DST, 40000 + t, i % 16);
                    let _ = s.is_ephemeral(&SRC, &DST, 40000 + t, i % 16);
                }
            }));
        }

        let refresher = {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                for _ in 0..200 {
                    s.use_new_store_as_current_store();
                }
            })
        };

        for h in handles {
            h.join().expect("writer thread panicked");
        }
        refresher.join().expect("refresher thread panicked");

        // Every writer has finished: a fresh observation is always visible.
        s.add(&SRC, &DST, 40000, 100);
        for p in 101..=104u16 {
            s.add(&SRC, &DST, 40000, p);
        }
        assert_eq!(
            s.is_ephemeral(&SRC, &DST, 40000, 104),
            IsEphemeralStatus::SourceIsEphemeral
        );
    }
}
