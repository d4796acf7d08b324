//! Address filtering
//!
//! Filters are configured as dotted-quad strings, parsed to host-order
//! integers, and stored in network order so they compare directly against
//! addresses read out of IP headers.

use crate::{NcpError, Result};
use ncp_common::ConnEvent;
use tracing::warn;

/// Parses a dotted-quad IPv4 address into a host-order `u32`.
///
/// `"10.0.0.1"` parses to `0x0A000001`. Exactly four dot-separated decimal
/// octets are accepted, each at most 255. Surrounding whitespace is ignored.
pub fn parse_address(text: &str) -> Result<u32> {
    let invalid = |reason: &str| NcpError::InvalidFormat {
        input: text.to_string(),
        reason: reason.to_string(),
    };

    let mut value: u32 = 0;
    let mut octets = 0;
    for part in text.trim().split('.') {
        if octets == 4 {
            return Err(invalid("more than four octets"));
        }
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("octets must be 1 to 3 decimal digits"));
        }
        let octet: u32 = part
            .parse()
            .map_err(|_| invalid("octets must be decimal numbers"))?;
        if octet > 255 {
            return Err(invalid("octet exceeds 255"));
        }
        value = (value << 8) | octet;
        octets += 1;
    }

    if octets != 4 {
        return Err(invalid("expected four octets"));
    }
    Ok(value)
}

/// Converts a host-order address to the network-order value found in an IP header.
///
/// Header addresses are read as raw bytes (`u32::from_ne_bytes`), so a filter
/// must go through this conversion before it can be compared against them.
#[inline]
pub const fn to_network_order(host: u32) -> u32 {
    host.to_be()
}

/// Converts a network-order address from an IP header to a host-order value.
#[inline]
pub const fn to_host_order(network: u32) -> u32 {
    u32::from_be(network)
}

/// Source/destination address filter. `None` matches any address.
///
/// Both filters hold network-order values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressFilter {
    src: Option<u32>,
    dst: Option<u32>,
}

impl AddressFilter {
    /// Filter that matches every packet.
    pub const fn any() -> Self {
        Self {
            src: None,
            dst: None,
        }
    }

    /// Builds a filter from host-order addresses.
    pub fn new(src: Option<u32>, dst: Option<u32>) -> Self {
        Self {
            src: src.map(to_network_order),
            dst: dst.map(to_network_order),
        }
    }

    /// Builds a filter from configuration strings.
    ///
    /// Unset or empty strings match any address. A string that fails to parse
    /// is logged and also treated as unset.
    pub fn from_config(src: Option<&str>, dst: Option<&str>) -> Self {
        Self::new(parse_filter("from", src), parse_filter("to", dst))
    }

    /// Returns true unless a set filter disagrees with the packet's address.
    ///
    /// `packet_src` and `packet_dst` are network-order header values.
    #[inline]
    pub fn matches(&self, packet_src: u32, packet_dst: u32) -> bool {
        self.src.map_or(true, |src| src == packet_src)
            && self.dst.map_or(true, |dst| dst == packet_dst)
    }

    /// Checks a classified event, whose addresses are host order.
    #[inline]
    pub fn matches_event(&self, event: &ConnEvent) -> bool {
        self.matches(
            to_network_order(event.src_addr),
            to_network_order(event.dst_addr),
        )
    }

    /// Whether any filter is set.
    pub fn is_active(&self) -> bool {
        self.src.is_some() || self.dst.is_some()
    }

    /// Configured source filter in host order.
    pub fn src(&self) -> Option<u32> {
        self.src.map(to_host_order)
    }

    /// Configured destination filter in host order.
    pub fn dst(&self) -> Option<u32> {
        self.dst.map(to_host_order)
    }
}

fn parse_filter(name: &str, text: Option<&str>) -> Option<u32> {
    let text = text.map(str::trim).filter(|t| !t.is_empty())?;
    match parse_address(text) {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!("Ignoring {} filter: {}", name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn header_addr(text: &str) -> u32 {
        u32::from_ne_bytes(text.parse::<Ipv4Addr>().unwrap().octets())
    }

    #[test]
    fn test_parse_address_host_order() {
        assert_eq!(parse_address("10.0.0.1").unwrap(), 0x0A00_0001);
        assert_eq!(parse_address("255.255.255.255").unwrap(), u32::MAX);
        assert_eq!(parse_address(" 0.0.0.0 ").unwrap(), 0);
    }

    #[test]
    fn test_parse_address_round_trips_octets() {
        for octets in [[1, 2, 3, 4], [192, 168, 0, 254], [0, 255, 0, 255], [8, 8, 4, 4]] {
            let text = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
            assert_eq!(parse_address(&text).unwrap().to_be_bytes(), octets);
        }
    }

    #[test]
    fn test_parse_address_rejects_malformed() {
        for bad in [
            "", "1.2.3", "1.2.3.4.5", "256.0.0.1", "1.2.3.999", "a.b.c.d", "1..2.3", "1.2.3.4.",
            "-1.2.3.4", "1.2.3.0004",
        ] {
            assert!(
                matches!(parse_address(bad), Err(NcpError::InvalidFormat { .. })),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_filter_compares_in_network_order() {
        let filter = AddressFilter::new(Some(parse_address("10.0.0.1").unwrap()), None);

        assert!(filter.matches(header_addr("10.0.0.1"), header_addr("8.8.8.8")));
        assert!(!filter.matches(header_addr("10.0.0.2"), header_addr("8.8.8.8")));
        assert_eq!(
            to_network_order(parse_address("10.0.0.1").unwrap()),
            header_addr("10.0.0.1")
        );
        assert_eq!(to_host_order(header_addr("10.0.0.1")), 0x0A00_0001);
    }

    #[test]
    fn test_filter_destination_only() {
        let filter = AddressFilter::new(None, Some(parse_address("1.1.1.1").unwrap()));
        assert!(filter.matches(header_addr("10.9.9.9"), header_addr("1.1.1.1")));
        assert!(!filter.matches(header_addr("1.1.1.1"), header_addr("10.9.9.9")));
    }

    #[test]
    fn test_unset_filter_matches_everything() {
        let filter = AddressFilter::any();
        assert!(filter.matches(0, 0));
        assert!(filter.matches(u32::MAX, 12345));
    }

    #[test]
    fn test_from_config_treats_invalid_as_unset() {
        let filter = AddressFilter::from_config(Some("300.1.1.1"), Some(""));
        assert_eq!(filter, AddressFilter::any());

        let filter = AddressFilter::from_config(Some("10.0.0.1"), None);
        assert_eq!(filter.src(), Some(0x0A00_0001));
        assert_eq!(filter.dst(), None);
    }
}
