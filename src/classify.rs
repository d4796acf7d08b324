//! Packet classification
//!
//! Turns the network-layer bytes of a captured packet into a [`ConnEvent`],
//! or explains why the packet does not produce one. Classification is pure:
//! no shared state, no logging, no allocation.
//!
//! IPv4 header, which starts the captured bytes:
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |ip_ver | h_len |  ip_dscp  |ecn|        ip_total_length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       ip_identification       |flags|   ip_fragment_offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    ip_ttl     |  ip_protocol  |          ip_checksum          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         source_ipaddr                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      destination_ipaddr                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!
//! TCP and UDP both open with the source and destination ports, which is
//! all that is read from the transport header.

use crate::filter::to_host_order;
use ncp_common::{protocol, ConnEvent};

/// The length of the IPv4 header without options.
pub const IPV4_LEN: usize = 20;
/// The length of the TCP header without options.
pub const TCP_LEN: usize = 20;
/// The length of the UDP header.
pub const UDP_LEN: usize = 8;

/// Which hook observed the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported transport protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn from_number(number: u8) -> Option<Self> {
        match number {
            protocol::TCP => Some(Protocol::Tcp),
            protocol::UDP => Some(Protocol::Udp),
            _ => None,
        }
    }

    pub const fn number(&self) -> u8 {
        match self {
            Protocol::Tcp => protocol::TCP,
            Protocol::Udp => protocol::UDP,
        }
    }

    /// Minimum header length that must be present to trust the ports.
    pub const fn header_len(&self) -> usize {
        match self {
            Protocol::Tcp => TCP_LEN,
            Protocol::Udp => UDP_LEN,
        }
    }

    /// Reads (source port, destination port) in host order from a transport header.
    fn ports(&self, header: &[u8]) -> Option<(u16, u16)> {
        if header.len() < self.header_len() {
            return None;
        }
        Some((
            u16::from_be_bytes([header[0], header[1]]),
            u16::from_be_bytes([header[2], header[3]]),
        ))
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(protocol::name(self.number()))
    }
}

/// The IPv4 header fields classification needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Source address as stored in the header (network order)
    pub src: u32,
    /// Destination address as stored in the header (network order)
    pub dst: u32,
    pub protocol: u8,
    /// Header length in bytes, options included
    pub header_len: usize,
    pub total_len: usize,
    /// Fragment offset in 8-byte units
    pub frag_offset: u16,
}

impl Ipv4Header {
    /// Locates the IPv4 header at the start of `packet`.
    ///
    /// Returns `None` if the bytes are not a plausible IPv4 header.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < IPV4_LEN {
            return None;
        }
        let vihl = packet[0];
        if vihl >> 4 != 4 {
            return None;
        }
        let header_len = usize::from(vihl & 0x0F) << 2;
        if header_len < IPV4_LEN || packet.len() < header_len {
            return None;
        }

        Some(Self {
            src: u32::from_ne_bytes([packet[12], packet[13], packet[14], packet[15]]),
            dst: u32::from_ne_bytes([packet[16], packet[17], packet[18], packet[19]]),
            protocol: packet[9],
            header_len,
            total_len: usize::from(u16::from_be_bytes([packet[2], packet[3]])),
            frag_offset: u16::from_be_bytes([packet[6], packet[7]]) & 0x1FFF,
        })
    }

    /// The bytes following the IP header, bounded by the total length field
    /// when it is consistent with the capture.
    fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        let end = if self.total_len >= self.header_len {
            self.total_len.min(packet.len())
        } else {
            packet.len()
        };
        &packet[self.header_len..end]
    }
}

/// Why a packet produced no event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// No IPv4 header could be located
    NoIpHeader,
    /// Transport protocol other than TCP or UDP
    UnsupportedProtocol(u8),
    /// Same source and destination seen on ingress; counted on egress only
    IngressLoopback,
    /// Non-first fragment, which carries no transport header
    Fragment,
    /// The protocol field promised a transport header that is not there
    TruncatedTransport { protocol: Protocol, available: usize },
}

impl Reason {
    /// Whether this outcome deserves a warning rather than silence.
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Reason::TruncatedTransport { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Event(ConnEvent),
    NotApplicable(Reason),
}

/// Classifies the network-layer bytes of one packet.
pub fn classify(packet: &[u8], direction: Direction) -> Classification {
    let ip = match Ipv4Header::parse(packet) {
        Some(ip) => ip,
        None => return Classification::NotApplicable(Reason::NoIpHeader),
    };

    let proto = match Protocol::from_number(ip.protocol) {
        Some(proto) => proto,
        None => return Classification::NotApplicable(Reason::UnsupportedProtocol(ip.protocol)),
    };

    if direction == Direction::Ingress && ip.src == ip.dst {
        return Classification::NotApplicable(Reason::IngressLoopback);
    }

    if ip.frag_offset != 0 {
        return Classification::NotApplicable(Reason::Fragment);
    }

    let transport = ip.payload(packet);
    let (src_port, dst_port) = match proto.ports(transport) {
        Some(ports) => ports,
        None => {
            return Classification::NotApplicable(Reason::TruncatedTransport {
                protocol: proto,
                available: transport.len(),
            })
        }
    };

    Classification::Event(ConnEvent {
        src_addr: to_host_order(ip.src),
        src_port,
        dst_addr: to_host_order(ip.dst),
        dst_port,
        protocol: ip.protocol,
    })
}
