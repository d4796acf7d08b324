//! Wire types shared between the ncp probe and its consumers
//!
//! This crate defines everything that crosses the probe/consumer boundary:
//! - The packed 13-byte [`ConnEvent`] record carried in event payloads
//! - The three fixed 8-byte handshake tokens
//! - The 16-byte message frame header ([`frame`])
//!
//! Layouts are encoded field by field. Nothing here relies on the in-memory
//! layout of a Rust struct.

#![cfg_attr(not(feature = "userspace"), no_std)]

pub mod frame;

use core::fmt;
use core::net::Ipv4Addr;

/// Size of one encoded [`ConnEvent`] on the wire
pub const RECORD_LEN: usize = 13;

/// Handshake tokens, distinguished from event payloads by content alone
pub mod token {
    /// Sent by a consumer that wants to attach
    pub const ATTACH: &[u8; 8] = b"rainhurt";
    /// Reply to a successful attach
    pub const ATTACH_ACK: &[u8; 8] = b"phpisbst";
    /// Ends a session, in either direction
    pub const DETACH: &[u8; 8] = b"seeunext";

    /// Strips trailing zero bytes (alignment padding, C string terminators).
    pub fn trim_padding(payload: &[u8]) -> &[u8] {
        let end = payload.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        &payload[..end]
    }

    /// Returns true if `payload` is exactly `token`, ignoring trailing padding.
    pub fn matches(payload: &[u8], token: &[u8; 8]) -> bool {
        trim_padding(payload) == token.as_slice()
    }
}

/// IP protocol numbers carried in [`ConnEvent::protocol`]
pub mod protocol {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;

    pub fn name(protocol: u8) -> &'static str {
        match protocol {
            TCP => "TCP",
            UDP => "UDP",
            _ => "UNKNOWN",
        }
    }
}

/// One observed connection tuple
///
/// Wire layout (13 bytes, packed, little-endian fields):
/// - src_addr: Source IPv4 address, host-order value (10.0.0.1 is 0x0A000001)
/// - src_port: Source port
/// - dst_addr: Destination IPv4 address, host-order value
/// - dst_port: Destination port
/// - protocol: IP protocol (6=TCP, 17=UDP)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnEvent {
    pub src_addr: u32,
    pub src_port: u16,
    pub dst_addr: u32,
    pub dst_port: u16,
    pub protocol: u8,
}

impl ConnEvent {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..4].copy_from_slice(&self.src_addr.to_le_bytes());
        out[4..6].copy_from_slice(&self.src_port.to_le_bytes());
        out[6..10].copy_from_slice(&self.dst_addr.to_le_bytes());
        out[10..12].copy_from_slice(&self.dst_port.to_le_bytes());
        out[12] = self.protocol;
        out
    }

    /// Decodes exactly one record. Returns `None` unless `bytes` is `RECORD_LEN` long.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RECORD_LEN {
            return None;
        }
        Some(Self {
            src_addr: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            src_port: u16::from_le_bytes([bytes[4], bytes[5]]),
            dst_addr: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            dst_port: u16::from_le_bytes([bytes[10], bytes[11]]),
            protocol: bytes[12],
        })
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_addr)
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_addr)
    }
}

/// Renders `src sport dst dport PROTO`, the consumer's line format.
impl fmt::Display for ConnEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.src_ip(),
            self.src_port,
            self.dst_ip(),
            self.dst_port,
            protocol::name(self.protocol)
        )
    }
}

/// Iterator over the records of an event payload
pub struct Records<'a> {
    chunks: core::slice::ChunksExact<'a, u8>,
}

impl Iterator for Records<'_> {
    type Item = ConnEvent;

    fn next(&mut self) -> Option<ConnEvent> {
        self.chunks.next().and_then(ConnEvent::decode)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Records<'_> {}

/// Splits an event payload into records.
///
/// Returns `None` for an empty payload or one whose length is not a multiple
/// of [`RECORD_LEN`].
pub fn records(payload: &[u8]) -> Option<Records<'_>> {
    if payload.is_empty() || payload.len() % RECORD_LEN != 0 {
        return None;
    }
    Some(Records {
        chunks: payload.chunks_exact(RECORD_LEN),
    })
}

const _: () = {
    assert!(
        RECORD_LEN
            == 2 * core::mem::size_of::<u32>()
                + 2 * core::mem::size_of::<u16>()
                + core::mem::size_of::<u8>(),
        "ConnEvent wire record must be exactly 13 bytes"
    );
};

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnEvent {
        ConnEvent {
            src_addr: 0x0A00_0001,
            src_port: 1234,
            dst_addr: 0x0808_0808,
            dst_port: 53,
            protocol: protocol::UDP,
        }
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample().encode();
        assert_eq!(&bytes[0..4], &[0x01, 0x00, 0x00, 0x0A]);
        assert_eq!(&bytes[4..6], &1234u16.to_le_bytes());
        assert_eq!(&bytes[6..10], &[0x08, 0x08, 0x08, 0x08]);
        assert_eq!(&bytes[10..12], &[53, 0]);
        assert_eq!(bytes[12], 17);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let bytes = sample().encode();
        assert_eq!(ConnEvent::decode(&bytes), Some(sample()));
        assert_eq!(ConnEvent::decode(&bytes[..12]), None);
    }

    #[test]
    fn test_records_requires_whole_records() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&sample().encode());
        payload.extend_from_slice(&sample().encode());
        assert_eq!(records(&payload).map(|r| r.count()), Some(2));

        payload.push(0);
        assert!(records(&payload).is_none());
        assert!(records(&[]).is_none());
    }

    #[test]
    fn test_display_matches_consumer_format() {
        assert_eq!(sample().to_string(), "10.0.0.1 1234 8.8.8.8 53 UDP");
    }

    #[test]
    fn test_token_matching_ignores_padding() {
        assert!(token::matches(b"rainhurt", token::ATTACH));
        assert!(token::matches(b"seeunext\0\0\0\0", token::DETACH));
        assert!(!token::matches(b"rainhurtx", token::ATTACH));
        assert!(!token::matches(b"rain", token::ATTACH));
        assert!(!token::matches(b"", token::DETACH));
    }
}
