//! Read-only lookups used when rendering a flow document.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

const TCP_FLAGS: [(u32, &str); 6] = [
    (0x01, "FIN"),
    (0x02, "SYN"),
    (0x04, "RST"),
    (0x08, "PSH"),
    (0x10, "ACK"),
    (0x20, "URG"),
];

/// Maps the raw direction value. Only 1 means egress.
pub fn direction_name(direction: u32) -> &'static str {
    match direction {
        1 => "egress",
        _ => "ingress",
    }
}

/// IANA protocol name, or "" when unmapped.
pub fn ip_protocol_name(protocol: u32) -> &'static str {
    match protocol {
        0 => "HOPOPT",
        1 => "ICMP",
        2 => "IGMP",
        4 => "IPv4",
        6 => "TCP",
        17 => "UDP",
        41 => "IPv6",
        47 => "GRE",
        50 => "ESP",
        51 => "AH",
        58 => "IPv6-ICMP",
        88 => "EIGRP",
        89 => "OSPF",
        103 => "PIM",
        112 => "VRRP",
        132 => "SCTP",
        _ => "",
    }
}

/// EtherType name, or "" when unmapped.
pub fn ether_type_name(ether_type: u32) -> &'static str {
    match ether_type {
        0x0800 => "IPv4",
        0x0806 => "ARP",
        0x8100 => "VLAN",
        0x86DD => "IPv6",
        0x8847 => "MPLS",
        0x88CC => "LLDP",
        _ => "",
    }
}

/// Formats the lower 48 bits as a colon-separated MAC address.
pub fn format_mac(mac: u64) -> String {
    let b = mac.to_be_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[2], b[3], b[4], b[5], b[6], b[7]
    )
}

/// Parses 4 or 16 raw bytes into an address.
pub fn bytes_to_ip(addr: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(addr) {
        return Some(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    if let Ok(v6) = <[u8; 16]>::try_from(addr) {
        return Some(IpAddr::V6(Ipv6Addr::from(v6)));
    }
    None
}

/// Renders raw address bytes, or "" for any other length.
pub fn format_ip(addr: &[u8]) -> String {
    bytes_to_ip(addr).map(|ip| ip.to_string()).unwrap_or_default()
}

/// Builds the network CIDR containing `addr`, e.g. `10.0.0.0/24`.
///
/// Falls back to `/<prefix>` when the address is unparseable or the prefix
/// is too long for the address family.
pub fn format_mask(addr: &[u8], prefix: u32) -> String {
    let net = bytes_to_ip(addr)
        .zip(u8::try_from(prefix).ok())
        .and_then(|(ip, len)| IpNet::new(ip, len).ok());
    match net {
        Some(net) => net.trunc().to_string(),
        None => format!("/{prefix}"),
    }
}

/// Names of the TCP flags set in `flags`, lowest bit first.
pub fn tcp_flag_names(flags: u32) -> Vec<&'static str> {
    TCP_FLAGS
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_name() {
        assert_eq!(direction_name(0), "ingress");
        assert_eq!(direction_name(1), "egress");
        assert_eq!(direction_name(5), "ingress");
    }

    #[test]
    fn test_protocol_and_ether_type_names() {
        assert_eq!(ip_protocol_name(6), "TCP");
        assert_eq!(ip_protocol_name(17), "UDP");
        assert_eq!(ip_protocol_name(253), "");
        assert_eq!(ether_type_name(0x0800), "IPv4");
        assert_eq!(ether_type_name(0x86DD), "IPv6");
        assert_eq!(ether_type_name(0x1234), "");
    }

    #[test]
    fn test_format_mac_uses_lower_48_bits() {
        assert_eq!(format_mac(0x0000_0a1b_2c3d_4e5f), "0a:1b:2c:3d:4e:5f");
        assert_eq!(format_mac(0xffff_0000_0000_0001), "00:00:00:00:00:01");
        assert_eq!(format_mac(0), "00:00:00:00:00:00");
    }

    #[test]
    fn test_format_ip() {
        assert_eq!(format_ip(&[192, 168, 1, 10]), "192.168.1.10");
        let mut v6 = [0u8; 16];
        v6[0] = 0x20;
        v6[1] = 0x01;
        v6[2] = 0x0d;
        v6[3] = 0xb8;
        v6[15] = 1;
        assert_eq!(format_ip(&v6), "2001:db8::1");
        assert_eq!(format_ip(&[1, 2, 3]), "");
        assert_eq!(format_ip(&[]), "");
    }

    #[test]
    fn test_format_mask() {
        assert_eq!(format_mask(&[10, 1, 2, 3], 24), "10.1.2.0/24");
        assert_eq!(format_mask(&[10, 1, 2, 3], 0), "0.0.0.0/0");
        assert_eq!(format_mask(&[10, 1, 2, 3], 40), "/40");
        assert_eq!(format_mask(&[], 16), "/16");
    }

    #[test]
    fn test_tcp_flag_names() {
        assert_eq!(tcp_flag_names(0x12), vec!["SYN", "ACK"]);
        assert_eq!(tcp_flag_names(0x3f).len(), 6);
        assert!(tcp_flag_names(0).is_empty());
        assert!(tcp_flag_names(0x40).is_empty());
    }
}
