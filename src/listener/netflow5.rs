//! NetFlow v5 datagram decoding.
//!
//! Layout (all fields big-endian): a 24-byte header followed by `count`
//! fixed 48-byte records.

use std::net::IpAddr;

use crate::flow::{FlowRecord, FlowType, Port};

use super::{exporter_bytes, DecodeError, Decoder};

const VERSION: u16 = 5;
const HEADER_SIZE: usize = 24;
const RECORD_SIZE: usize = 48;
const MAX_RECORDS: usize = 30;
const ETHER_TYPE_IPV4: u32 = 0x0800;

/// Decodes NetFlow v5 export datagrams.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetFlow5Decoder;

#[derive(Debug, Clone, Copy)]
struct Header {
    count: usize,
    /// Milliseconds since the epoch at which the exporter booted.
    boot_ms: u64,
    flow_sequence: u32,
    sampling_interval: u16,
}

impl Decoder for NetFlow5Decoder {
    fn flow_type(&self) -> FlowType {
        FlowType::NetFlow5
    }

    fn decode(
        &self,
        datagram: &[u8],
        exporter: IpAddr,
        namespace: &str,
    ) -> Result<Vec<FlowRecord>, DecodeError> {
        let header = parse_header(datagram)?;
        let exporter_addr = exporter_bytes(exporter);

        let records = datagram
            .get(HEADER_SIZE..)
            .unwrap_or_default()
            .chunks_exact(RECORD_SIZE)
            .take(header.count)
            .map(|record| parse_record(record, &header, &exporter_addr, namespace))
            .collect();
        Ok(records)
    }
}

fn parse_header(data: &[u8]) -> Result<Header, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated { size: data.len() });
    }

    let version = read_u16_be(data, 0);
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion { version });
    }

    let count = usize::from(read_u16_be(data, 2));
    if count > MAX_RECORDS {
        return Err(DecodeError::TooManyRecords { count });
    }
    let available = (data.len() - HEADER_SIZE) / RECORD_SIZE;
    if available < count {
        return Err(DecodeError::RecordsTruncated { count, available });
    }

    let sys_uptime = u64::from(read_u32_be(data, 4));
    let unix_secs = u64::from(read_u32_be(data, 8));
    let unix_nsecs = u64::from(read_u32_be(data, 12));
    let boot_ms = (unix_secs * 1000 + unix_nsecs / 1_000_000).saturating_sub(sys_uptime);

    Ok(Header {
        count,
        boot_ms,
        flow_sequence: read_u32_be(data, 16),
        sampling_interval: read_u16_be(data, 22),
    })
}

fn parse_record(r: &[u8], header: &Header, exporter_addr: &[u8], namespace: &str) -> FlowRecord {
    let first = u64::from(read_u32_be(r, 24));
    let last = u64::from(read_u32_be(r, 28));

    FlowRecord {
        namespace: namespace.to_string(),
        flow_type: FlowType::NetFlow5,
        sequence_num: header.flow_sequence,
        // Top two bits carry the sampling mode.
        sampling_rate: u64::from(header.sampling_interval & 0x3FFF),
        direction: 0,
        exporter_addr: exporter_addr.to_vec(),
        start_timestamp: (header.boot_ms + first) / 1000,
        end_timestamp: (header.boot_ms + last) / 1000,
        bytes: u64::from(read_u32_be(r, 20)),
        packets: u64::from(read_u32_be(r, 16)),
        src_addr: read_fixed::<4>(r, 0).to_vec(),
        dst_addr: read_fixed::<4>(r, 4).to_vec(),
        src_mac: 0,
        dst_mac: 0,
        src_mask: u32::from(read_u8(r, 44)),
        dst_mask: u32::from(read_u8(r, 45)),
        ether_type: ETHER_TYPE_IPV4,
        ip_protocol: u32::from(read_u8(r, 38)),
        src_port: Port::Concrete(read_u16_be(r, 32)),
        dst_port: Port::Concrete(read_u16_be(r, 34)),
        input_interface: u32::from(read_u16_be(r, 12)),
        output_interface: u32::from(read_u16_be(r, 14)),
        tos: read_u8(r, 39),
        next_hop: read_fixed::<4>(r, 8).to_vec(),
        tcp_flags: u32::from(read_u8(r, 37)),
    }
}

// Callers check lengths before reading fixed offsets; short reads yield zeros.

fn read_u8(data: &[u8], offset: usize) -> u8 {
    data.get(offset).copied().unwrap_or(0)
}

fn read_u16_be(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(read_fixed::<2>(data, offset))
}

fn read_u32_be(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(read_fixed::<4>(data, offset))
}

fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    data.get(offset..offset + N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .unwrap_or([0u8; N])
}
