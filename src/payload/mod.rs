//! Output document construction.

pub mod enrich;

use serde::Serialize;

use crate::flow::FlowRecord;

use self::enrich::{
    direction_name, ether_type_name, format_ip, format_mac, format_mask, ip_protocol_name,
    tcp_flag_names,
};

/// One flushed flow as handed to the feeder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowDocument {
    pub flush_timestamp: i64,
    #[serde(rename = "type")]
    pub flow_type: &'static str,
    pub sampling_rate: u64,
    pub direction: &'static str,
    pub start: u64,
    pub end: u64,
    pub bytes: u64,
    pub packets: u64,
    pub ether_type: &'static str,
    pub ip_protocol: &'static str,
    pub device: Device,
    pub exporter: Exporter,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub ingress: ObservationPoint,
    pub egress: ObservationPoint,
    pub host: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tcp_flags: Vec<&'static str>,
    pub next_hop: NextHop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exporter {
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    pub ip: String,
    /// Decimal port, or `*` once rolled up.
    pub port: String,
    pub mac: String,
    pub mask: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationPoint {
    pub interface: Interface,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interface {
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextHop {
    pub ip: String,
}

/// Renders `flow` as a document. Never fails; unknown values fall back to
/// empty strings.
pub fn build_payload(flow: &FlowRecord, hostname: &str, flush_timestamp: i64) -> FlowDocument {
    FlowDocument {
        flush_timestamp,
        flow_type: flow.flow_type.as_str(),
        sampling_rate: flow.sampling_rate,
        direction: direction_name(flow.direction),
        start: flow.start_timestamp,
        end: flow.end_timestamp,
        bytes: flow.bytes,
        packets: flow.packets,
        ether_type: ether_type_name(flow.ether_type),
        ip_protocol: ip_protocol_name(flow.ip_protocol),
        device: Device {
            namespace: flow.namespace.clone(),
        },
        exporter: Exporter {
            ip: format_ip(&flow.exporter_addr),
        },
        source: Endpoint {
            ip: format_ip(&flow.src_addr),
            port: flow.src_port.to_string(),
            mac: format_mac(flow.src_mac),
            mask: format_mask(&flow.src_addr, flow.src_mask),
        },
        destination: Endpoint {
            ip: format_ip(&flow.dst_addr),
            port: flow.dst_port.to_string(),
            mac: format_mac(flow.dst_mac),
            mask: format_mask(&flow.dst_addr, flow.dst_mask),
        },
        ingress: ObservationPoint {
            interface: Interface {
                index: flow.input_interface,
            },
        },
        egress: ObservationPoint {
            interface: Interface {
                index: flow.output_interface,
            },
        },
        host: hostname.to_string(),
        tcp_flags: tcp_flag_names(flow.tcp_flags),
        next_hop: NextHop {
            ip: format_ip(&flow.next_hop),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowType, Port};

    fn flow() -> FlowRecord {
        FlowRecord {
            namespace: "edge".to_string(),
            flow_type: FlowType::NetFlow5,
            sampling_rate: 64,
            direction: 1,
            exporter_addr: vec![192, 0, 2, 1],
            start_timestamp: 1_700_000_000,
            end_timestamp: 1_700_000_030,
            bytes: 1500,
            packets: 3,
            src_addr: vec![10, 0, 0, 5],
            dst_addr: vec![10, 0, 1, 9],
            src_mac: 0x0000_0011_2233_4455,
            src_mask: 24,
            dst_mask: 16,
            ether_type: 0x0800,
            ip_protocol: 6,
            src_port: Port::Ephemeral,
            dst_port: Port::Concrete(443),
            input_interface: 3,
            output_interface: 7,
            next_hop: vec![10, 0, 0, 254],
            tcp_flags: 0x1b,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_payload_fields() {
        let doc = build_payload(&flow(), "collector-1", 1_700_000_100_000);
        assert_eq!(doc.flush_timestamp, 1_700_000_100_000);
        assert_eq!(doc.flow_type, "netflow5");
        assert_eq!(doc.direction, "egress");
        assert_eq!(doc.ether_type, "IPv4");
        assert_eq!(doc.ip_protocol, "TCP");
        assert_eq!(doc.exporter.ip, "192.0.2.1");
        assert_eq!(doc.source.port, "*");
        assert_eq!(doc.source.mac, "00:11:22:33:44:55");
        assert_eq!(doc.source.mask, "10.0.0.0/24");
        assert_eq!(doc.destination.port, "443");
        assert_eq!(doc.destination.mask, "10.0.0.0/16");
        assert_eq!(doc.ingress.interface.index, 3);
        assert_eq!(doc.egress.interface.index, 7);
        assert_eq!(doc.tcp_flags, vec!["FIN", "SYN", "PSH", "ACK"]);
        assert_eq!(doc.next_hop.ip, "10.0.0.254");
        assert_eq!(doc.host, "collector-1");
        assert_eq!(doc.device.namespace, "edge");
    }

    #[test]
    fn test_payload_json_shape() {
        let doc = build_payload(&flow(), "h", 42);
        let json = serde_json::to_value(&doc).expect("serialize");
        assert_eq!(json["type"], "netflow5");
        assert_eq!(json["source"]["port"], "*");
        assert_eq!(json["egress"]["interface"]["index"], 7);
        assert_eq!(json["tcp_flags"][1], "SYN");
    }

    #[test]
    fn test_payload_defaults_for_empty_flow() {
        let doc = build_payload(&FlowRecord::default(), "", 0);
        assert_eq!(doc.flow_type, "unknown");
        assert_eq!(doc.direction, "ingress");
        assert_eq!(doc.ip_protocol, "HOPOPT");
        assert_eq!(doc.ether_type, "");
        assert_eq!(doc.source.ip, "");
        assert_eq!(doc.source.port, "0");
        assert_eq!(doc.source.mask, "/0");

        let json = serde_json::to_value(&doc).expect("serialize");
        assert!(json.get("tcp_flags").is_none());
    }
}
