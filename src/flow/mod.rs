//! Normalized flow records as produced by the decoders.
//!
//! A [`FlowRecord`] is protocol independent: NetFlow v5/v9, IPFIX and sFlow
//! decoders all emit the same shape. Records sharing an [`AggregationKey`]
//! describe the same logical flow and are merged by the accumulator.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Export protocol a record was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowType {
    NetFlow5,
    NetFlow9,
    Ipfix,
    SFlow5,
    #[default]
    Unknown,
}

impl FlowType {
    /// Returns the name used in configuration and output documents.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetFlow5 => "netflow5",
            Self::NetFlow9 => "netflow9",
            Self::Ipfix => "ipfix",
            Self::SFlow5 => "sflow5",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a configured flow type name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "netflow5" => Some(Self::NetFlow5),
            "netflow9" => Some(Self::NetFlow9),
            "ipfix" => Some(Self::Ipfix),
            "sflow5" => Some(Self::SFlow5),
            _ => None,
        }
    }

    /// Conventional collector port for this protocol.
    pub fn default_port(self) -> u16 {
        match self {
            Self::NetFlow5 | Self::NetFlow9 => 2055,
            Self::Ipfix => 4739,
            Self::SFlow5 => 6343,
            Self::Unknown => 0,
        }
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport port of a flow endpoint.
///
/// `Ephemeral` replaces a concrete port once the rollup store has seen it
/// paired with too many distinct peer ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Concrete(u16),
    Ephemeral,
}

impl Default for Port {
    fn default() -> Self {
        Self::Concrete(0)
    }
}

impl From<u16> for Port {
    fn from(p: u16) -> Self {
        Self::Concrete(p)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete(p) => write!(f, "{p}"),
            Self::Ephemeral => f.write_str("*"),
        }
    }
}

/// Fixed-width digest of the key fields of a [`FlowRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey(pub u64);

/// One decoded (possibly exporter-aggregated) flow.
///
/// Addresses are raw network-order bytes: 4 bytes for IPv4, 16 for IPv6.
/// Timestamps use epoch seconds as produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowRecord {
    pub namespace: String,
    pub flow_type: FlowType,
    pub sequence_num: u32,
    pub sampling_rate: u64,
    /// 0 = ingress, 1 = egress.
    pub direction: u32,
    pub exporter_addr: Vec<u8>,

    pub start_timestamp: u64,
    pub end_timestamp: u64,
    pub bytes: u64,
    pub packets: u64,

    pub src_addr: Vec<u8>,
    pub dst_addr: Vec<u8>,
    /// Lower 48 bits hold the MAC address.
    pub src_mac: u64,
    pub dst_mac: u64,
    pub src_mask: u32,
    pub dst_mask: u32,

    pub ether_type: u32,
    pub ip_protocol: u32,
    pub src_port: Port,
    pub dst_port: Port,

    pub input_interface: u32,
    pub output_interface: u32,
    pub tos: u8,
    pub next_hop: Vec<u8>,
    pub tcp_flags: u32,
}

impl FlowRecord {
    /// Computes the aggregation key over the fields identifying a logical flow.
    ///
    /// Ports must already have been rolled up, otherwise every ephemeral
    /// client port yields its own key.
    pub fn aggregation_key(&self) -> AggregationKey {
        let mut h = DefaultHasher::new();
        self.namespace.hash(&mut h);
        self.flow_type.hash(&mut h);
        self.exporter_addr.hash(&mut h);
        self.src_addr.hash(&mut h);
        self.dst_addr.hash(&mut h);
        self.src_port.hash(&mut h);
        self.dst_port.hash(&mut h);
        self.ip_protocol.hash(&mut h);
        self.tos.hash(&mut h);
        self.direction.hash(&mut h);
        self.input_interface.hash(&mut h);
        self.output_interface.hash(&mut h);
        AggregationKey(h.finish())
    }

    /// Reports whether `other` agrees with `self` on every field that feeds
    /// [`aggregation_key`](Self::aggregation_key). Two records with equal keys
    /// that fail this check are a hash collision.
    pub fn same_key_fields(&self, other: &FlowRecord) -> bool {
        self.namespace == other.namespace
            && self.flow_type == other.flow_type
            && self.exporter_addr == other.exporter_addr
            && self.src_addr == other.src_addr
            && self.dst_addr == other.dst_addr
            && self.src_port == other.src_port
            && self.dst_port == other.dst_port
            && self.ip_protocol == other.ip_protocol
            && self.tos == other.tos
            && self.direction == other.direction
            && self.input_interface == other.input_interface
            && self.output_interface == other.output_interface
    }

    /// Folds `other` into `self`: counters are summed, the time window is
    /// widened, the highest sequence number wins and TCP flags are OR-ed.
    pub fn merge(&mut self, other: &FlowRecord) {
        self.bytes = self.bytes.wrapping_add(other.bytes);
        self.packets = self.packets.wrapping_add(other.packets);
        self.start_timestamp = self.start_timestamp.min(other.start_timestamp);
        self.end_timestamp = self.end_timestamp.max(other.end_timestamp);
        self.sequence_num = self.sequence_num.max(other.sequence_num);
        self.tcp_flags |= other.tcp_flags;
    }
}
