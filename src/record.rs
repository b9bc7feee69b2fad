//! Decoding of fixed-width event records produced by the capture layer.
//!
//! The capture layer writes one `RawEventRecord` per observed packet as a
//! fixed 40-byte little-endian struct. The IPv4 address and L4 port fields
//! are the exception: the kernel stores them in network byte order, so their
//! on-wire bytes survive the little-endian struct read reversed and have to
//! be swapped back before display.

use std::net::Ipv4Addr;

use serde::Serialize;
use thiserror::Error;

/// Exact byte width of one capture record. Anything shorter is a decode error.
pub const RECORD_LEN: usize = 40;

/// Errors that can occur while decoding a capture record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer did not contain a full record.
    #[error("truncated event record: got {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
}

/// One packet observation exactly as the capture layer emitted it.
///
/// All multi-byte fields are read little-endian; `src_addr`, `dst_addr`,
/// `src_port` and `dst_port` therefore hold the byte-swapped view of values
/// that are network-ordered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEventRecord {
    pub timestamp_ns: u64,
    pub flow_hash: u32,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub probe_point: u8,
    pub length: u32,
    pub cpu_id: u32,
    pub queue_mapping: u16,
}

impl RawEventRecord {
    /// Parses one record from the front of `buf`.
    ///
    /// Fails if fewer than [`RECORD_LEN`] bytes are available; never consumes
    /// or mutates anything on failure.
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        match buf.get(..RECORD_LEN).and_then(|b| <&[u8; RECORD_LEN]>::try_from(b).ok()) {
            Some(frame) => Ok(Self::from_bytes(frame)),
            None => Err(DecodeError::Truncated {
                got: buf.len(),
                need: RECORD_LEN,
            }),
        }
    }

    /// Decodes a full-width frame. Infallible: the width is proven by the
    /// argument type.
    pub fn from_bytes(buf: &[u8; RECORD_LEN]) -> Self {
        Self {
            timestamp_ns: u64_at(buf, 0),
            flow_hash: u32_at(buf, 8),
            src_addr: u32_at(buf, 12),
            dst_addr: u32_at(buf, 16),
            src_port: u16_at(buf, 20),
            dst_port: u16_at(buf, 22),
            protocol: buf[24],
            probe_point: buf[25],
            // 26..28 reserved
            length: u32_at(buf, 28),
            cpu_id: u32_at(buf, 32),
            queue_mapping: u16_at(buf, 36),
            // 38..40 reserved
        }
    }
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        buf[off],
        buf[off + 1],
        buf[off + 2],
        buf[off + 3],
        buf[off + 4],
        buf[off + 5],
        buf[off + 6],
        buf[off + 7],
    ])
}

/// Display-ready form of a capture record.
///
/// Field names match the wire format of the live update channel.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedEvent {
    /// Capture timestamp in seconds.
    pub timestamp: f64,
    /// Capture timestamp in raw nanoseconds.
    pub timestamp_ns: u64,
    /// Flow hash rendered as 8 lowercase hex digits.
    pub hash: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    /// Protocol label, e.g. `TCP` or `PROTO-47`.
    pub protocol: String,
    /// Capture probe point label, e.g. `NIC-RX` or `PROBE-9`.
    pub probe: String,
    pub len: u32,
    pub cpu: u32,
    pub queue: u16,
}

impl DecodedEvent {
    pub fn from_record(record: &RawEventRecord) -> Self {
        Self {
            timestamp: record.timestamp_ns as f64 / 1e9,
            timestamp_ns: record.timestamp_ns,
            hash: format!("{:08x}", record.flow_hash),
            src_ip: Ipv4Addr::from(record.src_addr.swap_bytes()).to_string(),
            dst_ip: Ipv4Addr::from(record.dst_addr.swap_bytes()).to_string(),
            src_port: record.src_port.swap_bytes(),
            dst_port: record.dst_port.swap_bytes(),
            protocol: protocol_label(record.protocol),
            probe: probe_label(record.probe_point),
            len: record.length,
            cpu: record.cpu_id,
            queue: record.queue_mapping,
        }
    }

    /// Composite key the flow table aggregates under.
    pub fn flow_key(&self) -> String {
        format!("{}_{}", self.hash, self.protocol)
    }

    /// Human-readable flow identifier, fixed at first sight of a flow.
    pub fn flow_id(&self) -> String {
        format!(
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Maps an IP protocol number to its display label.
///
/// Unknown protocols degrade to a numbered label rather than failing.
pub fn protocol_label(code: u8) -> String {
    match code {
        1 => "ICMP".to_string(),
        6 => "TCP".to_string(),
        17 => "UDP".to_string(),
        other => format!("PROTO-{other}"),
    }
}

/// Maps a capture probe point to its display label.
pub fn probe_label(code: u8) -> String {
    match code {
        1 => "NIC-RX".to_string(),
        2 => "IP-Receive".to_string(),
        other => format!("PROBE-{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the little-endian wire encoding of a record, with the address
    /// and port fields taken as already network-ordered byte sequences.
    pub fn encode(
        timestamp_ns: u64,
        flow_hash: u32,
        src_addr: [u8; 4],
        dst_addr: [u8; 4],
        src_port: u16,
        dst_port: u16,
        protocol: u8,
        probe_point: u8,
        length: u32,
        cpu_id: u32,
        queue_mapping: u16,
    ) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..8].copy_from_slice(&timestamp_ns.to_le_bytes());
        buf[8..12].copy_from_slice(&flow_hash.to_le_bytes());
        buf[12..16].copy_from_slice(&src_addr);
        buf[16..20].copy_from_slice(&dst_addr);
        buf[20..22].copy_from_slice(&src_port.to_be_bytes());
        buf[22..24].copy_from_slice(&dst_port.to_be_bytes());
        buf[24] = protocol;
        buf[25] = probe_point;
        buf[28..32].copy_from_slice(&length.to_le_bytes());
        buf[32..36].copy_from_slice(&cpu_id.to_le_bytes());
        buf[36..38].copy_from_slice(&queue_mapping.to_le_bytes());
        buf
    }

    fn sample() -> [u8; RECORD_LEN] {
        encode(
            1_500_000_000,
            0xdeadbeef,
            [10, 0, 0, 1],
            [192, 168, 1, 42],
            80,
            54321,
            6,
            1,
            1514,
            3,
            7,
        )
    }

    #[test]
    fn decodes_network_order_addresses() {
        let record = RawEventRecord::parse(&sample()).unwrap();
        let event = DecodedEvent::from_record(&record);

        assert_eq!(event.src_ip, "10.0.0.1");
        assert_eq!(event.dst_ip, "192.168.1.42");
    }

    #[test]
    fn ports_round_trip_through_double_reversal() {
        let record = RawEventRecord::parse(&sample()).unwrap();
        let event = DecodedEvent::from_record(&record);

        assert_eq!(event.src_port, 80);
        assert_eq!(event.dst_port, 54321);
        // The host value must reproduce the original network-order byte pair.
        assert_eq!(event.src_port.to_be_bytes(), [0x00, 0x50]);
    }

    #[test]
    fn decodes_scalar_fields() {
        let record = RawEventRecord::parse(&sample()).unwrap();
        let event = DecodedEvent::from_record(&record);

        assert_eq!(event.timestamp_ns, 1_500_000_000);
        assert!((event.timestamp - 1.5).abs() < 1e-9);
        assert_eq!(event.hash, "deadbeef");
        assert_eq!(event.len, 1514);
        assert_eq!(event.cpu, 3);
        assert_eq!(event.queue, 7);
    }

    #[test]
    fn unknown_codes_degrade_to_numbered_labels() {
        assert_eq!(protocol_label(47), "PROTO-47");
        assert_eq!(probe_label(9), "PROBE-9");
        assert_eq!(protocol_label(1), "ICMP");
        assert_eq!(probe_label(2), "IP-Receive");
    }

    #[test]
    fn short_buffer_fails_with_truncated() {
        let err = RawEventRecord::parse(&sample()[..RECORD_LEN - 1]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                got: RECORD_LEN - 1,
                need: RECORD_LEN
            }
        );
    }

    #[test]
    fn flow_key_and_id_derive_from_display_fields() {
        let record = RawEventRecord::parse(&sample()).unwrap();
        let event = DecodedEvent::from_record(&record);

        assert_eq!(event.flow_key(), "deadbeef_TCP");
        assert_eq!(event.flow_id(), "10.0.0.1:80 -> 192.168.1.42:54321");
    }
}
