//! Server-side NAT.
//!
//! Outbound packets from the tunnel get their source rewritten to the
//! server's upstream address and a port from a per-protocol pool; replies
//! captured on the upstream are mapped back to the original source and to
//! the tunnel peer that owns the mapping. The mapping
//! `(orig src, orig value, proto) → port` is bijective per protocol.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use ip_packet::{IpPacket, Protocol};

/// Ephemeral pool the mapped ports come from.
pub const MIN_PORT: u16 = 32768;
pub const MAX_PORT: u16 = 60999;

pub const UDP_TTL: Duration = Duration::from_secs(60);
pub const ICMP_TTL: Duration = Duration::from_secs(60);
/// TCP mappings are connection-tracked and only aged out as a backstop.
pub const TCP_TTL: Duration = Duration::from_secs(60 * 60 * 2);

/// Keep the mapping briefly after both sides sent FIN.
const FIN_LINGER: Duration = Duration::from_secs(5);

/// A mapping must be idle this long before exhaustion may evict it.
pub const EVICT_MIN_IDLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ProtoKind {
    Tcp,
    Udp,
    Icmp,
}

fn kind_of(proto: Protocol) -> ProtoKind {
    match proto {
        Protocol::Tcp(_) => ProtoKind::Tcp,
        Protocol::Udp(_) => ProtoKind::Udp,
        Protocol::Icmp(_) => ProtoKind::Icmp,
    }
}

/// The original source a mapping translates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inside {
    pub proto: Protocol,
    pub src: Ipv4Addr,
}

#[derive(Debug)]
struct Entry {
    inside: Inside,
    peer: SocketAddrV4,

    last_outgoing: Instant,
    last_incoming: Option<Instant>,

    outgoing_fin: bool,
    incoming_fin: bool,
    outgoing_rst: bool,
    incoming_rst: bool,
}

impl Entry {
    fn new(inside: Inside, peer: SocketAddrV4, now: Instant) -> Self {
        Self {
            inside,
            peer,
            last_outgoing: now,
            last_incoming: None,
            outgoing_fin: false,
            incoming_fin: false,
            outgoing_rst: false,
            incoming_rst: false,
        }
    }

    fn note_outgoing(&mut self, packet: &IpPacket, now: Instant) {
        if let Some(tcp) = packet.as_tcp() {
            self.outgoing_rst |= tcp.rst();
            self.outgoing_fin |= tcp.fin();
        }

        self.last_outgoing = now;
    }

    fn note_incoming(&mut self, packet: &IpPacket, now: Instant) {
        if let Some(tcp) = packet.as_tcp() {
            self.incoming_rst |= tcp.rst();
            self.incoming_fin |= tcp.fin();
        }

        self.last_incoming = Some(now);
    }

    fn last_packet(&self) -> Instant {
        match self.last_incoming {
            Some(incoming) => self.last_outgoing.max(incoming),
            None => self.last_outgoing,
        }
    }

    fn remove_at(&self) -> Instant {
        let ttl = match kind_of(self.inside.proto) {
            ProtoKind::Tcp => TCP_TTL,
            ProtoKind::Udp => UDP_TTL,
            ProtoKind::Icmp => ICMP_TTL,
        };

        let mut at = self.last_packet() + ttl;

        if self.outgoing_fin && self.incoming_fin {
            at = at.min(self.last_packet() + FIN_LINGER);
        }

        if self.outgoing_rst || self.incoming_rst {
            at = at.min(self.last_packet());
        }

        at
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NatError {
    #[error("Port pool exhausted")]
    Exhausted,
    #[error(transparent)]
    Unsupported(#[from] ip_packet::UnsupportedProtocol),
}

pub struct NatTable {
    by_inside: HashMap<Inside, u16>,
    by_outside: HashMap<(ProtoKind, u16), Entry>,

    min_port: u16,
    max_port: u16,
}

impl Default for NatTable {
    fn default() -> Self {
        Self::with_port_range(MIN_PORT, MAX_PORT)
    }
}

impl NatTable {
    pub fn with_port_range(min_port: u16, max_port: u16) -> Self {
        debug_assert!(min_port <= max_port);

        Self {
            by_inside: HashMap::new(),
            by_outside: HashMap::new(),
            min_port,
            max_port,
        }
    }

    pub fn len(&self) -> usize {
        self.by_outside.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_outside.is_empty()
    }

    /// Looks up or installs the mapping for an outbound packet and returns
    /// the mapped source port.
    pub fn translate_outgoing(
        &mut self,
        packet: &IpPacket,
        peer: SocketAddrV4,
        now: Instant,
    ) -> Result<u16, NatError> {
        let src = packet.source_protocol()?;
        let inside = Inside {
            proto: src,
            src: packet.source(),
        };
        let kind = kind_of(src);

        if let Some(&port) = self.by_inside.get(&inside) {
            let entry = self
                .by_outside
                .get_mut(&(kind, port))
                .expect("maps are kept in sync");

            entry.note_outgoing(packet, now);
            entry.peer = peer;

            return Ok(port);
        }

        let port = match self.free_port(kind, src.value()) {
            Some(port) => port,
            None => self.evict_lru(kind, now).ok_or(NatError::Exhausted)?,
        };

        self.by_inside.insert(inside, port);
        self.by_outside
            .insert((kind, port), Entry::new(inside, peer, now));

        tracing::debug!(?inside, port, "New NAT session");

        Ok(port)
    }

    /// Maps a reply back to its original source and owning tunnel peer.
    ///
    /// `None` means no live mapping: the packet is not for us.
    pub fn translate_incoming(
        &mut self,
        packet: &IpPacket,
        now: Instant,
    ) -> Result<Option<(Inside, SocketAddrV4)>, NatError> {
        let dst = packet.destination_protocol()?;

        let Some(entry) = self.by_outside.get_mut(&(kind_of(dst), dst.value())) else {
            return Ok(None);
        };

        entry.note_incoming(packet, now);

        Ok(Some((entry.inside, entry.peer)))
    }

    /// Ages out idle and closed mappings.
    pub fn handle_timeout(&mut self, now: Instant) {
        let expired: Vec<(ProtoKind, u16)> = self
            .by_outside
            .iter()
            .filter(|(_, entry)| now >= entry.remove_at())
            .map(|(&key, _)| key)
            .collect();

        for key in expired {
            let entry = self.by_outside.remove(&key).expect("key just observed");
            self.by_inside.remove(&entry.inside);

            tracing::debug!(inside = ?entry.inside, port = key.1, "NAT entry removed");
        }
    }

    /// First unused port, scanning the pool from the original source port
    /// so mappings are stable across reinstalls where possible.
    fn free_port(&self, kind: ProtoKind, preferred: u16) -> Option<u16> {
        let span = u32::from(self.max_port - self.min_port) + 1;
        let start = u32::from(preferred.clamp(self.min_port, self.max_port) - self.min_port);

        (0..span)
            .map(|i| self.min_port + (((start + i) % span) as u16))
            .find(|&port| !self.by_outside.contains_key(&(kind, port)))
    }

    /// Frees the least-recently-used mapping that has been idle for at
    /// least [`EVICT_MIN_IDLE`] and returns its port.
    fn evict_lru(&mut self, kind: ProtoKind, now: Instant) -> Option<u16> {
        let (&(_, port), _) = self
            .by_outside
            .iter()
            .filter(|((k, _), entry)| {
                *k == kind && now.saturating_duration_since(entry.last_packet()) >= EVICT_MIN_IDLE
            })
            .min_by_key(|(_, entry)| entry.last_packet())?;

        let entry = self
            .by_outside
            .remove(&(kind, port))
            .expect("key just observed");
        self.by_inside.remove(&entry.inside);

        tracing::debug!(inside = ?entry.inside, port, "Evicted idle NAT entry");

        Some(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ip_packet::make;

    const SOURCE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const OTHER_SOURCE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);
    const DESTINATION: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
    const SERVER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);

    fn peer() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 4), 48392)
    }

    fn reply_to(port: u16) -> IpPacket {
        make::udp_packet(DESTINATION, SERVER, 53, port, b"answer")
    }

    #[test]
    fn udp_mapping_roundtrip() {
        let mut table = NatTable::default();
        let now = Instant::now();

        let outbound = make::udp_packet(SOURCE, DESTINATION, 40000, 53, b"query");
        let port = table.translate_outgoing(&outbound, peer(), now).unwrap();

        // The original port is free, so it is kept.
        assert_eq!(port, 40000);

        let (inside, owner) = table
            .translate_incoming(&reply_to(port), now)
            .unwrap()
            .unwrap();

        assert_eq!(inside.src, SOURCE);
        assert_eq!(inside.proto, Protocol::Udp(40000));
        assert_eq!(owner, peer());
    }

    #[test]
    fn mapping_is_stable_and_bijective() {
        let mut table = NatTable::default();
        let now = Instant::now();

        let a = make::udp_packet(SOURCE, DESTINATION, 40000, 53, b"a");
        let b = make::udp_packet(OTHER_SOURCE, DESTINATION, 40000, 53, b"b");

        let port_a = table.translate_outgoing(&a, peer(), now).unwrap();
        let port_b = table.translate_outgoing(&b, peer(), now).unwrap();

        assert_ne!(port_a, port_b);
        assert_eq!(table.translate_outgoing(&a, peer(), now).unwrap(), port_a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn port_outside_the_pool_is_clamped_in() {
        let mut table = NatTable::default();

        let outbound = make::udp_packet(SOURCE, DESTINATION, 80, 53, b"low port");
        let port = table
            .translate_outgoing(&outbound, peer(), Instant::now())
            .unwrap();

        assert!((MIN_PORT..=MAX_PORT).contains(&port));
    }

    #[test]
    fn icmp_uses_the_echo_identifier() {
        let mut table = NatTable::default();
        let now = Instant::now();

        let echo = make::icmp_request_packet(SOURCE, DESTINATION, 1, 777, b"ping");
        let port = table.translate_outgoing(&echo, peer(), now).unwrap();

        let reply = make::icmp_request_packet(DESTINATION, SERVER, 1, port, b"pong");
        let (inside, _) = table.translate_incoming(&reply, now).unwrap().unwrap();

        assert_eq!(inside.proto, Protocol::Icmp(777));
    }

    #[test]
    fn udp_mapping_expires_after_idle_ttl() {
        let mut table = NatTable::default();
        let now = Instant::now();

        let outbound = make::udp_packet(SOURCE, DESTINATION, 40000, 53, b"query");
        let port = table.translate_outgoing(&outbound, peer(), now).unwrap();

        table.handle_timeout(now + UDP_TTL - Duration::from_secs(1));
        assert_eq!(table.len(), 1);

        table.handle_timeout(now + UDP_TTL);
        assert!(table.is_empty());
        assert!(table
            .translate_incoming(&reply_to(port), now + UDP_TTL)
            .unwrap()
            .is_none());
    }

    #[test]
    fn tcp_rst_closes_the_mapping() {
        let _guard = ikago_logging::test("debug");

        let mut table = NatTable::default();
        let mut now = Instant::now();

        let syn = make::tcp_packet(SOURCE, DESTINATION, 40000, 443, b"");
        table.translate_outgoing(&syn, peer(), now).unwrap();

        now += Duration::from_secs(1);

        let mut rst = make::tcp_packet(SOURCE, DESTINATION, 40000, 443, b"");
        set_rst(&mut rst);
        table.translate_outgoing(&rst, peer(), now).unwrap();

        table.handle_timeout(now);
        assert!(table.is_empty());
    }

    #[test]
    fn exhaustion_evicts_the_lru_idle_mapping() {
        let mut table = NatTable::with_port_range(50000, 50001);
        let now = Instant::now();

        let a = make::udp_packet(SOURCE, DESTINATION, 50000, 53, b"a");
        let b = make::udp_packet(SOURCE, DESTINATION, 50001, 53, b"b");
        let c = make::udp_packet(SOURCE, DESTINATION, 50002, 53, b"c");

        let port_a = table.translate_outgoing(&a, peer(), now).unwrap();
        table
            .translate_outgoing(&b, peer(), now + Duration::from_secs(1))
            .unwrap();

        // Nothing is idle long enough yet.
        assert_eq!(
            table.translate_outgoing(&c, peer(), now + Duration::from_secs(2)),
            Err(NatError::Exhausted)
        );

        // `a` is now the LRU entry past the idle threshold; its port is
        // recycled.
        let later = now + EVICT_MIN_IDLE;
        let port_c = table.translate_outgoing(&c, peer(), later).unwrap();
        assert_eq!(port_c, port_a);

        // The evicted mapping no longer resolves.
        assert!(table
            .translate_incoming(&reply_to(port_a), later)
            .unwrap()
            .map(|(inside, _)| inside.proto)
            .is_some_and(|proto| proto == Protocol::Udp(50002)));
    }

    fn set_rst(packet: &mut IpPacket) {
        let header_len = packet.header_len();
        let flags_offset = header_len + 13;
        let mut bytes = packet.clone().into_bytes();
        bytes[flags_offset] |= 0x04;
        *packet = IpPacket::new(bytes).unwrap();
    }
}
