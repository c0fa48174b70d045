//! Wire codec for tunnel segments.
//!
//! A segment is exactly one IPv4 header (IHL 5, DF set, no options) plus one
//! TCP header plus payload. The link-layer header is the capture layer's
//! business; this codec starts at the IP layer.

use std::net::Ipv4Addr;

use anyhow::{Context as _, Result};
use etherparse::{IpNumber, Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice};

/// Fixed advertised window. The tunnel never exerts backpressure via TCP
/// flow control, so the window only has to look plausible on the wire.
pub const WINDOW: u16 = 65535;

const TTL: u8 = 64;

/// A parsed (or to-be-emitted) tunnel segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub ack_flag: bool,
    pub ipid: u16,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Serializes IPv4 + TCP + payload, computing both checksums.
    pub fn encode(&self) -> Vec<u8> {
        let mut tcp = TcpHeader::new(self.src_port, self.dst_port, self.seq, WINDOW);
        tcp.acknowledgment_number = self.ack;
        tcp.ack = self.ack_flag;
        tcp.syn = self.syn;

        let tcp_len = tcp.header_len() as usize;

        let ip = Ipv4Header {
            total_len: (Ipv4Header::MIN_LEN + tcp_len + self.payload.len()) as u16,
            identification: self.ipid,
            dont_fragment: true,
            time_to_live: TTL,
            protocol: IpNumber::TCP,
            source: self.src_ip.octets(),
            destination: self.dst_ip.octets(),
            ..Default::default()
        };

        tcp.checksum = tcp
            .calc_checksum_ipv4(&ip, &self.payload)
            .expect("segment payload is bounded by the MSS");

        let mut buf = Vec::with_capacity(Ipv4Header::MIN_LEN + tcp_len + self.payload.len());
        ip.write(&mut buf).expect("writing to a `Vec` never fails");
        tcp.write(&mut buf).expect("writing to a `Vec` never fails");
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Parses IPv4 + TCP bytes as captured off the tunnel link.
    pub fn decode(bytes: &[u8]) -> Result<Segment> {
        let ip = Ipv4HeaderSlice::from_slice(bytes).context("Invalid IPv4 header")?;

        anyhow::ensure!(ip.protocol() == IpNumber::TCP, "Segment is not TCP");

        let header_len = ip.ihl() as usize * 4;
        let total_len = ip.total_len() as usize;

        anyhow::ensure!(
            bytes.len() >= total_len && total_len >= header_len,
            "Truncated segment"
        );

        let tcp =
            TcpHeaderSlice::from_slice(&bytes[header_len..total_len]).context("Invalid TCP header")?;
        let payload_start = header_len + tcp.to_header().header_len() as usize;

        anyhow::ensure!(payload_start <= total_len, "TCP data offset past segment end");

        let header = ip.to_header();

        Ok(Segment {
            src_ip: ip.source_addr(),
            dst_ip: ip.destination_addr(),
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number(),
            ack: tcp.acknowledgment_number(),
            syn: tcp.syn(),
            ack_flag: tcp.ack(),
            ipid: header.identification,
            payload: bytes[payload_start..total_len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Segment {
        Segment {
            src_ip: Ipv4Addr::new(192, 0, 2, 1),
            dst_ip: Ipv4Addr::new(198, 51, 100, 9),
            src_port: 48392,
            dst_port: 1080,
            seq: 4242,
            ack: 100,
            syn: false,
            ack_flag: true,
            ipid: 7,
            payload: b"encapsulated bytes".to_vec(),
        }
    }

    #[test]
    fn roundtrip() {
        let segment = sample();

        let decoded = Segment::decode(&segment.encode()).unwrap();

        assert_eq!(decoded, segment);
    }

    #[test]
    fn encode_produces_valid_checksums() {
        let bytes = sample().encode();

        let ip = Ipv4HeaderSlice::from_slice(&bytes).unwrap();
        let header = ip.to_header();
        assert_eq!(header.header_checksum, header.calc_header_checksum());
        assert!(header.dont_fragment);
        assert_eq!(header.time_to_live, TTL);

        let tcp = TcpHeaderSlice::from_slice(&bytes[20..]).unwrap();
        let expected = tcp
            .to_header()
            .calc_checksum_ipv4(&header, b"encapsulated bytes")
            .unwrap();
        assert_eq!(tcp.checksum(), expected);
        assert_eq!(tcp.window_size(), WINDOW);
    }

    #[test]
    fn decode_rejects_non_tcp() {
        let packet = ip_packet::make::udp_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            2,
            b"nope",
        );

        assert!(Segment::decode(packet.packet()).is_err());
    }

    #[test]
    fn trailing_link_padding_is_ignored() {
        let segment = sample();

        let mut bytes = segment.encode();
        bytes.extend_from_slice(&[0u8; 11]);

        assert_eq!(Segment::decode(&bytes).unwrap(), segment);
    }
}
