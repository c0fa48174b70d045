#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Owned IPv4 datagrams with in-place header rewriting.
//!
//! Everything that travels through the tunnel is an IPv4 datagram captured
//! off the wire. This crate wraps the raw bytes, validates them once and
//! offers the accessors and mutators the rest of the workspace needs:
//! source/destination rewriting, transport port rewriting and checksum
//! recomputation. Fragments are first-class citizens; a non-initial
//! fragment simply has no transport layer to offer.

pub mod make;

use std::net::Ipv4Addr;

use anyhow::{Context as _, Result};
pub use etherparse;
use etherparse::{
    Icmpv4Slice, Icmpv4Type, IpNumber, Ipv4Header, Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice,
};

/// Offset of the IPv4 identification field.
const IPV4_ID_OFFSET: usize = 4;
/// Offset of the IPv4 flags / fragment-offset word.
const IPV4_FRAG_OFFSET: usize = 6;
/// Offset of the IPv4 header checksum.
const IPV4_CHECKSUM_OFFSET: usize = 10;
/// Offset of the IPv4 source address.
const IPV4_SRC_OFFSET: usize = 12;
/// Offset of the IPv4 destination address.
const IPV4_DST_OFFSET: usize = 16;

/// A source or destination endpoint within a transport layer.
///
/// ICMP does not have ports; the echo `identifier` takes that role so that
/// NAT and connection tracking can treat all three protocols uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp(u16),
    Udp(u16),
    Icmp(u16),
}

impl Protocol {
    pub fn same_type(&self, other: &Protocol) -> bool {
        matches!(
            (self, other),
            (Protocol::Tcp(_), Protocol::Tcp(_))
                | (Protocol::Udp(_), Protocol::Udp(_))
                | (Protocol::Icmp(_), Protocol::Icmp(_))
        )
    }

    pub fn value(&self) -> u16 {
        match self {
            Protocol::Tcp(v) => *v,
            Protocol::Udp(v) => *v,
            Protocol::Icmp(v) => *v,
        }
    }

    pub fn with_value(self, value: u16) -> Protocol {
        match self {
            Protocol::Tcp(_) => Protocol::Tcp(value),
            Protocol::Udp(_) => Protocol::Udp(value),
            Protocol::Icmp(_) => Protocol::Icmp(value),
        }
    }

    pub fn ip_number(&self) -> IpNumber {
        match self {
            Protocol::Tcp(_) => IpNumber::TCP,
            Protocol::Udp(_) => IpNumber::UDP,
            Protocol::Icmp(_) => IpNumber::ICMP,
        }
    }
}

/// An owned, validated IPv4 datagram.
#[derive(Clone, PartialEq, Eq)]
pub struct IpPacket {
    buf: Vec<u8>,
}

impl IpPacket {
    /// Takes ownership of raw IPv4 bytes.
    ///
    /// Trailing bytes beyond the header's total length (link-layer padding
    /// on short frames) are cut off. Fails if the buffer does not hold a
    /// complete datagram.
    pub fn new(mut buf: Vec<u8>) -> Result<Self> {
        let header = Ipv4HeaderSlice::from_slice(&buf).context("Invalid IPv4 header")?;

        let header_len = header.ihl() as usize * 4;
        let total_len = header.total_len() as usize;

        anyhow::ensure!(
            total_len >= header_len,
            "Total length {total_len} smaller than header length {header_len}"
        );
        anyhow::ensure!(
            buf.len() >= total_len,
            "Buffer holds {} bytes of a {total_len} byte datagram",
            buf.len()
        );

        buf.truncate(total_len);

        Ok(Self { buf })
    }

    fn header(&self) -> Ipv4HeaderSlice<'_> {
        Ipv4HeaderSlice::from_slice(&self.buf).expect("validated in `new`")
    }

    /// A copy of the parsed IPv4 header.
    pub fn ipv4_header(&self) -> Ipv4Header {
        self.header().to_header()
    }

    pub fn source(&self) -> Ipv4Addr {
        self.header().source_addr()
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.header().destination_addr()
    }

    pub fn protocol(&self) -> IpNumber {
        self.header().protocol()
    }

    pub fn identification(&self) -> u16 {
        self.ipv4_header().identification
    }

    pub fn dont_fragment(&self) -> bool {
        self.ipv4_header().dont_fragment
    }

    pub fn more_fragments(&self) -> bool {
        self.ipv4_header().more_fragments
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        self.ipv4_header().fragment_offset.value()
    }

    /// Whether this datagram is one piece of a fragmented datagram.
    pub fn is_fragment(&self) -> bool {
        let header = self.ipv4_header();

        header.more_fragments || header.fragment_offset.value() != 0
    }

    pub fn header_len(&self) -> usize {
        self.header().ihl() as usize * 4
    }

    pub fn total_len(&self) -> usize {
        self.buf.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header_len()..]
    }

    pub fn packet(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol() == IpNumber::TCP
    }

    pub fn is_udp(&self) -> bool {
        self.protocol() == IpNumber::UDP
    }

    pub fn is_icmp(&self) -> bool {
        self.protocol() == IpNumber::ICMP
    }

    pub fn as_tcp(&self) -> Option<TcpHeaderSlice<'_>> {
        if !self.is_tcp() || self.fragment_offset() != 0 {
            return None;
        }

        TcpHeaderSlice::from_slice(self.payload()).ok()
    }

    pub fn as_udp(&self) -> Option<UdpHeaderSlice<'_>> {
        if !self.is_udp() || self.fragment_offset() != 0 {
            return None;
        }

        UdpHeaderSlice::from_slice(self.payload()).ok()
    }

    pub fn as_icmpv4(&self) -> Option<Icmpv4Slice<'_>> {
        if !self.is_icmp() || self.fragment_offset() != 0 {
            return None;
        }

        Icmpv4Slice::from_slice(self.payload()).ok()
    }

    fn icmpv4_echo_id(&self) -> Result<u16, UnsupportedProtocol> {
        let icmp = self
            .as_icmpv4()
            .ok_or(UnsupportedProtocol::NonInitialFragment)?;

        use Icmpv4Type::*;
        let (EchoRequest(header) | EchoReply(header)) = icmp.icmp_type() else {
            return Err(UnsupportedProtocol::UnsupportedIcmpv4Type(icmp.icmp_type()));
        };

        Ok(header.id)
    }

    pub fn source_protocol(&self) -> Result<Protocol, UnsupportedProtocol> {
        if self.is_fragment() && self.fragment_offset() != 0 {
            return Err(UnsupportedProtocol::NonInitialFragment);
        }

        if let Some(tcp) = self.as_tcp() {
            return Ok(Protocol::Tcp(tcp.source_port()));
        }

        if let Some(udp) = self.as_udp() {
            return Ok(Protocol::Udp(udp.source_port()));
        }

        if self.is_icmp() {
            return Ok(Protocol::Icmp(self.icmpv4_echo_id()?));
        }

        Err(UnsupportedProtocol::UnsupportedIpPayload(self.protocol()))
    }

    pub fn destination_protocol(&self) -> Result<Protocol, UnsupportedProtocol> {
        if self.is_fragment() && self.fragment_offset() != 0 {
            return Err(UnsupportedProtocol::NonInitialFragment);
        }

        if let Some(tcp) = self.as_tcp() {
            return Ok(Protocol::Tcp(tcp.destination_port()));
        }

        if let Some(udp) = self.as_udp() {
            return Ok(Protocol::Udp(udp.destination_port()));
        }

        if self.is_icmp() {
            return Ok(Protocol::Icmp(self.icmpv4_echo_id()?));
        }

        Err(UnsupportedProtocol::UnsupportedIpPayload(self.protocol()))
    }

    pub fn set_source(&mut self, src: Ipv4Addr) {
        self.put(IPV4_SRC_OFFSET, src.octets());
    }

    pub fn set_destination(&mut self, dst: Ipv4Addr) {
        self.put(IPV4_DST_OFFSET, dst.octets());
    }

    pub fn set_identification(&mut self, id: u16) {
        self.put(IPV4_ID_OFFSET, id.to_be_bytes());
    }

    /// Rewrites the flags / fragment-offset word. `offset` is in 8-byte units.
    pub fn set_fragment_fields(&mut self, offset: u16, more_fragments: bool, dont_fragment: bool) {
        let word =
            ((dont_fragment as u16) << 14) | ((more_fragments as u16) << 13) | (offset & 0x1fff);

        self.put(IPV4_FRAG_OFFSET, word.to_be_bytes());
    }

    /// Rewrites the transport source: TCP/UDP source port or ICMP echo identifier.
    pub fn set_source_protocol(&mut self, value: u16) -> Result<(), UnsupportedProtocol> {
        // Validates that the transport layer is actually there.
        let proto = self.source_protocol()?;

        let header_len = self.header_len();
        match proto {
            Protocol::Tcp(_) | Protocol::Udp(_) => self.put(header_len, value.to_be_bytes()),
            Protocol::Icmp(_) => self.put(header_len + 4, value.to_be_bytes()),
        }

        Ok(())
    }

    /// Rewrites the transport destination: TCP/UDP destination port or ICMP echo identifier.
    pub fn set_destination_protocol(&mut self, value: u16) -> Result<(), UnsupportedProtocol> {
        let proto = self.destination_protocol()?;

        let header_len = self.header_len();
        match proto {
            Protocol::Tcp(_) | Protocol::Udp(_) => self.put(header_len + 2, value.to_be_bytes()),
            Protocol::Icmp(_) => self.put(header_len + 4, value.to_be_bytes()),
        }

        Ok(())
    }

    /// Recomputes the transport checksum (unfragmented datagrams only; a
    /// transport checksum spans the whole datagram) and the IPv4 header
    /// checksum, in that order.
    pub fn update_checksum(&mut self) {
        if !self.is_fragment() {
            self.set_tcp_checksum();
            self.set_udp_checksum();
            self.set_icmpv4_checksum();
        }

        self.set_ipv4_checksum();
    }

    fn set_ipv4_checksum(&mut self) {
        let checksum = self.ipv4_header().calc_header_checksum();

        self.put(IPV4_CHECKSUM_OFFSET, checksum.to_be_bytes());
    }

    fn set_tcp_checksum(&mut self) {
        let Some(tcp) = self.as_tcp() else {
            return;
        };

        let header_len = self.header_len();
        let tcp_header_len = tcp.to_header().header_len() as usize;
        let payload = &self.buf[header_len + tcp_header_len..];

        let checksum = tcp
            .to_header()
            .calc_checksum_ipv4(&self.ipv4_header(), payload)
            .expect("payload length was validated in `new`");

        self.put(header_len + 16, checksum.to_be_bytes());
    }

    fn set_udp_checksum(&mut self) {
        let Some(udp) = self.as_udp() else {
            return;
        };

        let header_len = self.header_len();
        let payload = &self.buf[header_len + etherparse::UdpHeader::LEN..];

        let checksum = udp
            .to_header()
            .calc_checksum_ipv4(&self.ipv4_header(), payload)
            .expect("payload length was validated in `new`");

        self.put(header_len + 6, checksum.to_be_bytes());
    }

    fn set_icmpv4_checksum(&mut self) {
        let Some(icmp) = self.as_icmpv4() else {
            return;
        };

        let checksum = icmp.icmp_type().calc_checksum(icmp.payload());
        let header_len = self.header_len();

        self.put(header_len + 2, checksum.to_be_bytes());
    }

    fn put<const N: usize>(&mut self, offset: usize, bytes: [u8; N]) {
        self.buf[offset..offset + N].copy_from_slice(&bytes);
    }
}

impl std::fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("IpPacket");

        dbg.field("src", &self.source())
            .field("dst", &self.destination())
            .field(
                "protocol",
                &self.protocol().keyword_str().unwrap_or("unknown"),
            );

        if self.is_fragment() {
            dbg.field("id", &self.identification())
                .field("offset", &self.fragment_offset())
                .field("mf", &self.more_fragments());
        }

        if let Some(tcp) = self.as_tcp() {
            dbg.field("src_port", &tcp.source_port())
                .field("dst_port", &tcp.destination_port());
        }

        if let Some(udp) = self.as_udp() {
            dbg.field("src_port", &udp.source_port())
                .field("dst_port", &udp.destination_port());
        }

        dbg.finish()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum UnsupportedProtocol {
    #[error("Unsupported IP protocol: {0:?}")]
    UnsupportedIpPayload(IpNumber),
    #[error("Unsupported ICMPv4 type: {0:?}")]
    UnsupportedIcmpv4Type(Icmpv4Type),
    #[error("Transport layer is in another fragment")]
    NonInitialFragment,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_packet_ports_and_payload() {
        let packet = make::udp_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(8, 8, 8, 8),
            40000,
            53,
            b"foobar",
        );

        assert_eq!(packet.source(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(packet.destination(), Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(packet.source_protocol().unwrap(), Protocol::Udp(40000));
        assert_eq!(packet.destination_protocol().unwrap(), Protocol::Udp(53));
        assert_eq!(&packet.payload()[etherparse::UdpHeader::LEN..], b"foobar");
    }

    #[test]
    fn rewrite_source_recomputes_valid_checksums() {
        let mut packet = make::udp_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(8, 8, 8, 8),
            40000,
            53,
            b"query",
        );

        packet.set_source(Ipv4Addr::new(203, 0, 113, 7));
        packet.set_source_protocol(33333).unwrap();
        packet.update_checksum();

        assert_eq!(packet.source(), Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(packet.source_protocol().unwrap(), Protocol::Udp(33333));

        let header = packet.ipv4_header();
        assert_eq!(header.header_checksum, header.calc_header_checksum());

        let udp = packet.as_udp().unwrap();
        let expected = udp
            .to_header()
            .calc_checksum_ipv4(&header, &packet.payload()[etherparse::UdpHeader::LEN..])
            .unwrap();
        assert_eq!(udp.checksum(), expected);
    }

    #[test]
    fn icmp_echo_identifier_is_the_port() {
        let mut packet = make::icmp_request_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            1,
            777,
            b"ping",
        );

        assert_eq!(packet.source_protocol().unwrap(), Protocol::Icmp(777));

        packet.set_source_protocol(888).unwrap();
        packet.update_checksum();

        assert_eq!(packet.source_protocol().unwrap(), Protocol::Icmp(888));
    }

    #[test]
    fn non_initial_fragment_has_no_transport() {
        let packet = make::fragment(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(8, 8, 8, 8),
            IpNumber::UDP,
            99,
            185,
            false,
            &[0u8; 64],
        );

        assert!(packet.is_fragment());
        assert_eq!(packet.fragment_offset(), 185);
        assert!(matches!(
            packet.source_protocol(),
            Err(UnsupportedProtocol::NonInitialFragment)
        ));
    }

    #[test]
    fn fragment_fields_roundtrip() {
        let mut packet = make::udp_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(8, 8, 8, 8),
            1234,
            5678,
            b"data",
        );

        packet.set_identification(0xbeef);
        packet.set_fragment_fields(42, true, false);
        packet.update_checksum();

        assert_eq!(packet.identification(), 0xbeef);
        assert_eq!(packet.fragment_offset(), 42);
        assert!(packet.more_fragments());
        assert!(!packet.dont_fragment());
    }

    #[test]
    fn padded_capture_is_truncated() {
        let mut bytes = make::udp_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(8, 8, 8, 8),
            1,
            2,
            b"x",
        )
        .into_bytes();

        let unpadded = bytes.len();
        bytes.extend_from_slice(&[0u8; 18]); // Ethernet pads short frames.

        let packet = IpPacket::new(bytes).unwrap();

        assert_eq!(packet.total_len(), unpadded);
    }
}
