//! Server-side orchestration.
//!
//! One pump captures FakeTCP segments from clients on the listen device,
//! another captures replies from destinations on the upstream device. The
//! dispatcher keeps one endpoint per tunnel peer, decapsulates their
//! traffic, NATs it onto the upstream network and folds replies back into
//! the right peer's flow.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use faketcp::{Endpoint, Segment};
use ip_packet::IpPacket;
use tunnel_crypto::Cipher;

use crate::capture::{self, CHANNEL_CAPACITY, Frame, PacketSink};
use crate::device::Device;
use crate::encap::{FrameCodec, StreamDecoder};
use crate::frag::{self, FragmentQueue};
use crate::nat::{NatError, NatTable};
use crate::{Error, SHUTDOWN_DRAIN, Shutdown, filter};

const TICK: Duration = Duration::from_millis(100);

/// Minimum spacing of NAT-exhaustion log lines; a flood of distinct
/// 5-tuples must not turn into a flood of log lines.
const EXHAUSTED_LOG_INTERVAL: Duration = Duration::from_secs(1);

pub struct ServerConfig {
    /// Port the FakeTCP flow terminates on.
    pub listen_port: u16,
    /// Device facing the clients.
    pub listen: Device,
    /// Device facing the destinations; may be the same device.
    pub upstream: Device,
    /// Gateway MAC; `None` on loopback.
    pub gateway_mac: Option<[u8; 6]>,
    pub cipher: Option<Cipher>,
}

enum Event {
    Tunnel(Frame),
    Upstream(Frame),
}

struct Peer {
    endpoint: Endpoint,
    stream: StreamDecoder,
}

pub struct ServerTunnel {
    dispatcher: JoinHandle<Result<(), Error>>,
    captures: Vec<JoinHandle<()>>,
    shutdown: Shutdown,
}

impl ServerTunnel {
    pub fn start(config: ServerConfig, shutdown: Shutdown) -> Result<Self> {
        let listen_ip = config
            .listen
            .ipv4()
            .with_context(|| format!("{} has no IPv4 address", config.listen))?;
        let local = SocketAddrV4::new(listen_ip, config.listen_port);

        let upstream_ip = config
            .upstream
            .ipv4()
            .with_context(|| format!("{} has no IPv4 address", config.upstream))?;

        let (events_tx, events_rx) = flume::bounded(CHANNEL_CAPACITY);

        let captures = vec![
            capture::spawn_capture(
                &config.listen,
                &filter::faketcp_listen(config.listen_port),
                shutdown.clone(),
                true,
                events_tx.clone(),
                Event::Tunnel,
            )?,
            capture::spawn_capture(
                &config.upstream,
                &filter::destinations(config.listen_port),
                shutdown.clone(),
                true,
                events_tx,
                Event::Upstream,
            )?,
        ];

        let listen_sink = PacketSink::open(&config.listen)?;
        let upstream_sink = PacketSink::open(&config.upstream)?;

        let dispatcher = thread::Builder::new()
            .name("server-dispatcher".to_owned())
            .spawn({
                let shutdown = shutdown.clone();
                move || {
                    let result = dispatch(
                        local,
                        upstream_ip,
                        config,
                        events_rx,
                        listen_sink,
                        upstream_sink,
                        shutdown.clone(),
                    );

                    // Whatever ended the dispatcher ends the tunnel.
                    shutdown.trigger();

                    result
                }
            })
            .expect("thread names contain no interior NUL");

        Ok(Self {
            dispatcher,
            captures,
            shutdown,
        })
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn join(self) -> Result<()> {
        let result = self
            .dispatcher
            .join()
            .expect("dispatcher thread does not panic");

        self.shutdown.trigger();
        for handle in self.captures {
            let _ = handle.join();
        }

        Ok(result?)
    }
}

struct Dispatcher {
    local: SocketAddrV4,
    upstream_ip: Ipv4Addr,
    gateway_mac: Option<[u8; 6]>,

    peers: HashMap<SocketAddrV4, Peer>,
    codec: FrameCodec,
    nat: NatTable,
    frags: FragmentQueue,

    listen_sink: PacketSink,
    upstream_sink: PacketSink,

    last_exhausted_log: Option<Instant>,
}

fn dispatch(
    local: SocketAddrV4,
    upstream_ip: Ipv4Addr,
    config: ServerConfig,
    events: flume::Receiver<Event>,
    listen_sink: PacketSink,
    upstream_sink: PacketSink,
    shutdown: Shutdown,
) -> Result<(), Error> {
    let mut dispatcher = Dispatcher {
        local,
        upstream_ip,
        gateway_mac: config.gateway_mac,
        peers: HashMap::new(),
        codec: FrameCodec::new(config.cipher),
        nat: NatTable::default(),
        frags: FragmentQueue::default(),
        listen_sink,
        upstream_sink,
        last_exhausted_log: None,
    };

    tracing::info!(%local, "Listening for tunnel peers");

    let mut last_tick = Instant::now();

    while !shutdown.is_triggered() {
        match events.recv_timeout(TICK) {
            Ok(Event::Tunnel(frame)) => dispatcher.handle_tunnel_frame(frame, Instant::now()),
            Ok(Event::Upstream(frame)) => {
                dispatcher.handle_upstream_frame(frame, Instant::now());
            }
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        if now.duration_since(last_tick) >= TICK {
            last_tick = now;
            dispatcher.tick(now);
        }

        dispatcher.flush_transmissions()?;
    }

    dispatcher.drain();

    Ok(())
}

impl Dispatcher {
    fn handle_tunnel_frame(&mut self, frame: Frame, now: Instant) {
        let segment = match Segment::decode(&frame.ip) {
            Ok(segment) => segment,
            Err(e) => {
                tracing::warn!("Malformed tunnel segment: {e:#}");
                return;
            }
        };

        let key = SocketAddrV4::new(segment.src_ip, segment.src_port);

        let peer = match self.peers.entry(key) {
            MapEntry::Occupied(entry) => entry.into_mut(),
            MapEntry::Vacant(entry) => {
                // Only a SYN may open a session.
                if !segment.syn || segment.ack_flag {
                    tracing::trace!(peer = %key, "Segment from unknown peer");
                    return;
                }

                tracing::info!(peer = %key, "New tunnel peer");

                entry.insert(Peer {
                    endpoint: Endpoint::new_server(self.local, key),
                    stream: StreamDecoder::default(),
                })
            }
        };

        if let Err(e) = peer.endpoint.handle_segment(&segment, now) {
            // The endpoint reset itself; the peer's next SYN reopens it.
            tracing::warn!(peer = %key, "Tunnel flow reset: {e}");
            return;
        }

        while let Some(bytes) = peer.endpoint.poll_received() {
            peer.stream.push(&bytes);
        }

        let mut outbound = Vec::new();

        while let Some(result) = peer.stream.next_frame() {
            let tunnel_frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(peer = %key, "Tunnel stream error: {e}");
                    continue;
                }
            };

            match self.codec.decode(&tunnel_frame) {
                Ok(decoded) => outbound.push(decoded),
                Err(e) => {
                    // Probes from third parties are dropped, never fatal.
                    tracing::warn!(peer = %key, "Dropping undecodable frame: {e}");
                }
            }
        }

        for (fingerprint, packet) in outbound {
            self.forward_outbound(packet, &fingerprint, key, now);
        }
    }

    /// NATs one decapsulated packet and injects it towards its destination.
    fn forward_outbound(
        &mut self,
        mut packet: IpPacket,
        fingerprint: &frag::Fingerprint,
        peer: SocketAddrV4,
        now: Instant,
    ) {
        let port = match self.nat.translate_outgoing(&packet, peer, now) {
            Ok(port) => port,
            Err(NatError::Exhausted) => {
                self.log_exhausted(now);
                return;
            }
            Err(NatError::Unsupported(e)) => {
                tracing::warn!("Cannot NAT packet: {e}");
                return;
            }
        };

        packet.set_source(self.upstream_ip);
        if let Err(e) = packet.set_source_protocol(port) {
            tracing::warn!("Cannot rewrite source: {e}");
            return;
        }
        packet.update_checksum();

        let fragments = match frag::refragment(&packet, fingerprint) {
            Ok(fragments) => fragments,
            Err(e) => {
                tracing::warn!("Refragmentation failed: {e}");
                return;
            }
        };

        for fragment in fragments {
            if let Err(e) = self.upstream_sink.inject(self.gateway_mac, fragment.packet()) {
                tracing::error!("Failed to inject towards destination: {e}");
            }
        }
    }

    fn handle_upstream_frame(&mut self, frame: Frame, now: Instant) {
        let packet = match IpPacket::new(frame.ip) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Malformed captured packet: {e:#}");
                return;
            }
        };

        let assembled = match self.frags.push(packet, now) {
            Ok(Some(assembled)) => assembled,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Reply reassembly failed: {e}");
                return;
            }
        };

        let (mut datagram, fingerprint) = assembled;

        let mapping = match self.nat.translate_incoming(&datagram, now) {
            Ok(Some(mapping)) => mapping,
            Ok(None) => {
                tracing::trace!(?datagram, "No NAT mapping, not ours");
                return;
            }
            Err(e) => {
                tracing::trace!("Unmappable reply: {e}");
                return;
            }
        };

        let (inside, peer_key) = mapping;

        datagram.set_destination(inside.src);
        if let Err(e) = datagram.set_destination_protocol(inside.proto.value()) {
            tracing::warn!("Cannot restore destination: {e}");
            return;
        }
        datagram.update_checksum();

        let bytes = match self.codec.encode(&datagram, &fingerprint) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encapsulate reply: {e}");
                return;
            }
        };

        let Some(peer) = self.peers.get_mut(&peer_key) else {
            tracing::debug!(peer = %peer_key, "Owning peer is gone, dropping reply");
            return;
        };

        peer.endpoint.send(&bytes);
    }

    fn tick(&mut self, now: Instant) {
        self.frags.handle_timeout(now);
        self.nat.handle_timeout(now);

        // A failed handshake is fatal for that peer only.
        self.peers.retain(|key, peer| {
            match peer.endpoint.handle_timeout(now) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(peer = %key, "Dropping peer: {e}");
                    false
                }
            }
        });
    }

    /// Injection failures on the listen device are fatal: segments towards
    /// every client leave through it.
    fn flush_transmissions(&mut self) -> Result<(), Error> {
        for peer in self.peers.values_mut() {
            while let Some(segment) = peer.endpoint.poll_transmit() {
                self.listen_sink
                    .inject(self.gateway_mac, &segment.encode())?;
            }
        }

        Ok(())
    }

    fn drain(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_DRAIN;

        for peer in self.peers.values_mut() {
            while Instant::now() < deadline {
                match peer.endpoint.poll_transmit() {
                    Some(segment) => {
                        if self
                            .listen_sink
                            .inject(self.gateway_mac, &segment.encode())
                            .is_err()
                        {
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    fn log_exhausted(&mut self, now: Instant) {
        let due = self
            .last_exhausted_log
            .is_none_or(|last| now.duration_since(last) >= EXHAUSTED_LOG_INTERVAL);

        if due {
            self.last_exhausted_log = Some(now);
            tracing::info!("NAT port pool exhausted, dropping packets");
        }
    }
}
