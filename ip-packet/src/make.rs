//! Factory module for making all kinds of packets.
//!
//! Mostly used by tests across the workspace.

use crate::IpPacket;
use etherparse::{IpFragOffset, IpNumber, Ipv4Header, PacketBuilder};
use std::net::Ipv4Addr;

/// Helper macro to turn a [`PacketBuilder`] into an [`IpPacket`].
macro_rules! build {
    ($packet:expr, $payload:expr) => {{
        let payload = $payload;
        let mut buf = Vec::with_capacity($packet.size(payload.len()));

        $packet
            .write(&mut buf, payload)
            .expect("writing to a `Vec` never fails");

        IpPacket::new(buf).expect("`PacketBuilder` emits valid packets")
    }};
}

pub fn udp_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> IpPacket {
    let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).udp(sport, dport);

    build!(packet, payload)
}

pub fn tcp_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> IpPacket {
    let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).tcp(sport, dport, 0, 65535);

    build!(packet, payload)
}

pub fn icmp_request_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    seq: u16,
    identifier: u16,
    payload: &[u8],
) -> IpPacket {
    let packet =
        PacketBuilder::ipv4(src.octets(), dst.octets(), 64).icmpv4_echo_request(identifier, seq);

    build!(packet, payload)
}

/// A single IPv4 fragment carrying `payload` at `offset` (8-byte units).
pub fn fragment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: IpNumber,
    identification: u16,
    offset: u16,
    more_fragments: bool,
    payload: &[u8],
) -> IpPacket {
    let header = Ipv4Header {
        total_len: (Ipv4Header::MIN_LEN + payload.len()) as u16,
        identification,
        more_fragments,
        fragment_offset: IpFragOffset::try_new(offset).expect("offset fits in 13 bits"),
        time_to_live: 64,
        protocol,
        source: src.octets(),
        destination: dst.octets(),
        ..Default::default()
    };

    let mut buf = Vec::with_capacity(Ipv4Header::MIN_LEN + payload.len());
    header
        .write(&mut buf)
        .expect("writing to a `Vec` never fails");
    buf.extend_from_slice(payload);

    IpPacket::new(buf).expect("fragment header is valid")
}
