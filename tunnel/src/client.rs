//! Client-side orchestration.
//!
//! Listen pumps capture traffic from the configured sources; the
//! dispatcher reassembles, encapsulates and folds it into the FakeTCP
//! flow towards the server via the upstream device. Segments coming back
//! are unfolded and re-emitted on the listen device the original source
//! lives behind.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use faketcp::{Endpoint, Segment};
use ip_network::Ipv4Network;
use ip_packet::IpPacket;
use tunnel_crypto::Cipher;

use crate::capture::{self, CHANNEL_CAPACITY, Frame, LinkKind, PacketSink};
use crate::device::Device;
use crate::encap::{FrameCodec, StreamDecoder};
use crate::frag::{self, FragmentQueue};
use crate::{Error, SHUTDOWN_DRAIN, Shutdown, filter};

/// Upper bound between timeout sweeps.
const TICK: Duration = Duration::from_millis(100);

pub struct ClientConfig {
    /// Source ranges whose traffic is intercepted.
    pub sources: Vec<Ipv4Network>,
    /// The tunnel server.
    pub server: SocketAddrV4,
    /// Local FakeTCP port.
    pub local_port: u16,
    /// Device towards the gateway / server.
    pub upstream: Device,
    /// Devices the sources live behind.
    pub listen: Vec<Device>,
    /// Gateway MAC on the upstream; `None` on loopback.
    pub gateway_mac: Option<[u8; 6]>,
    pub cipher: Option<Cipher>,
}

enum Event {
    Source { frame: Frame, device: usize },
    Tunnel(Frame),
}

pub struct ClientTunnel {
    dispatcher: JoinHandle<Result<(), Error>>,
    captures: Vec<JoinHandle<()>>,
    shutdown: Shutdown,
}

impl ClientTunnel {
    /// Opens all capture handles and spawns the pumps.
    pub fn start(config: ClientConfig, shutdown: Shutdown) -> Result<Self> {
        let local_ip = config
            .upstream
            .ipv4()
            .with_context(|| format!("{} has no IPv4 address", config.upstream))?;
        let local = SocketAddrV4::new(local_ip, config.local_port);

        let (events_tx, events_rx) = flume::bounded(CHANNEL_CAPACITY);

        let mut captures = Vec::new();

        let sources_filter = filter::sources(&config.sources, *config.server.ip());
        for (device, dev) in config.listen.iter().enumerate() {
            captures.push(capture::spawn_capture(
                dev,
                &sources_filter,
                shutdown.clone(),
                false,
                events_tx.clone(),
                move |frame| Event::Source { frame, device },
            )?);
        }

        let tunnel_filter = filter::faketcp(*config.server.ip(), config.local_port);
        captures.push(capture::spawn_capture(
            &config.upstream,
            &tunnel_filter,
            shutdown.clone(),
            true,
            events_tx,
            Event::Tunnel,
        )?);

        let upstream_sink = PacketSink::open(&config.upstream)?;
        let listen_sinks = config
            .listen
            .iter()
            .map(PacketSink::open)
            .collect::<Result<Vec<_>, _>>()?;

        let dispatcher = thread::Builder::new()
            .name("client-dispatcher".to_owned())
            .spawn({
                let shutdown = shutdown.clone();
                move || {
                    let result = dispatch(
                        local,
                        config,
                        events_rx,
                        upstream_sink,
                        listen_sinks,
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

    /// Waits for the tunnel to end; triggers shutdown for the pumps on the
    /// way out.
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

fn dispatch(
    local: SocketAddrV4,
    config: ClientConfig,
    events: flume::Receiver<Event>,
    upstream: PacketSink,
    listen_sinks: Vec<PacketSink>,
    shutdown: Shutdown,
) -> Result<(), Error> {
    let mut endpoint = Endpoint::new_client(local, config.server);
    let codec = FrameCodec::new(config.cipher);
    let mut stream = StreamDecoder::default();
    let mut frags = FragmentQueue::default();
    let mut source_macs: HashMap<Ipv4Addr, [u8; 6]> = HashMap::new();

    endpoint.open(Instant::now());
    let mut last_tick = Instant::now();

    while !shutdown.is_triggered() {
        match events.recv_timeout(TICK) {
            Ok(Event::Source { frame, device }) => {
                let now = Instant::now();

                if let Err(e) = handle_source_frame(
                    frame,
                    device,
                    &mut frags,
                    &codec,
                    &mut endpoint,
                    &mut source_macs,
                    now,
                ) {
                    tracing::warn!("Failed to encapsulate captured packet: {e}");
                }
            }
            Ok(Event::Tunnel(frame)) => {
                let now = Instant::now();

                handle_tunnel_frame(
                    frame,
                    &mut endpoint,
                    &mut stream,
                    &codec,
                    &config.listen,
                    &listen_sinks,
                    &source_macs,
                    now,
                );
            }
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        if now.duration_since(last_tick) >= TICK {
            last_tick = now;
            frags.handle_timeout(now);

            // A handshake that never completes is fatal: the client has
            // exactly one peer.
            endpoint.handle_timeout(now).map_err(Error::from)?;

            // Reopens after a desync reset, once the cooldown passed.
            endpoint.open(now);
        }

        // Upstream injection failures are fatal too; without the upstream
        // there is no tunnel.
        flush_transmit(&mut endpoint, &upstream, config.gateway_mac)?;
    }

    drain(&mut endpoint, &upstream, config.gateway_mac);

    Ok(())
}

fn handle_source_frame(
    frame: Frame,
    device: usize,
    frags: &mut FragmentQueue,
    codec: &FrameCodec,
    endpoint: &mut Endpoint,
    source_macs: &mut HashMap<Ipv4Addr, [u8; 6]>,
    now: Instant,
) -> Result<(), Error> {
    let packet = IpPacket::new(frame.ip).map_err(Error::Parse)?;

    // Replies have to go back out with the source's own MAC.
    if let Some(mac) = frame.src_mac {
        source_macs.insert(packet.source(), mac);
    }

    tracing::trace!(?packet, device, "Captured source packet");

    let Some((datagram, fingerprint)) = frags.push(packet, now)? else {
        return Ok(());
    };

    let bytes = codec.encode(&datagram, &fingerprint)?;
    endpoint.send(&bytes);

    Ok(())
}

#[expect(clippy::too_many_arguments)]
fn handle_tunnel_frame(
    frame: Frame,
    endpoint: &mut Endpoint,
    stream: &mut StreamDecoder,
    codec: &FrameCodec,
    listen_devices: &[Device],
    listen_sinks: &[PacketSink],
    source_macs: &HashMap<Ipv4Addr, [u8; 6]>,
    now: Instant,
) {
    let segment = match Segment::decode(&frame.ip) {
        Ok(segment) => segment,
        Err(e) => {
            tracing::warn!("Malformed tunnel segment: {e:#}");
            return;
        }
    };

    if let Err(e) = endpoint.handle_segment(&segment, now) {
        // The endpoint has reset itself; the tick loop reopens it.
        tracing::warn!("Tunnel flow reset: {e}");
        return;
    }

    while let Some(bytes) = endpoint.poll_received() {
        stream.push(&bytes);
    }

    while let Some(result) = stream.next_frame() {
        let tunnel_frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Tunnel stream error: {e}");
                continue;
            }
        };

        let (fingerprint, packet) = match codec.decode(&tunnel_frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                // A third party may have injected a probe; never fatal.
                tracing::warn!("Dropping undecodable frame: {e}");
                continue;
            }
        };

        deliver(
            &packet,
            &fingerprint,
            listen_devices,
            listen_sinks,
            source_macs,
        );
    }
}

/// Re-emits one decapsulated reply towards its source.
fn deliver(
    packet: &IpPacket,
    fingerprint: &frag::Fingerprint,
    listen_devices: &[Device],
    listen_sinks: &[PacketSink],
    source_macs: &HashMap<Ipv4Addr, [u8; 6]>,
) {
    let dst = packet.destination();

    let Some(index) = listen_devices.iter().position(|d| d.contains(dst)) else {
        tracing::warn!(%dst, "No listen device routes to this source");
        return;
    };
    let sink = &listen_sinks[index];

    let dst_mac = match sink.link() {
        LinkKind::Loopback => None,
        LinkKind::Ethernet => match source_macs.get(&dst) {
            Some(mac) => Some(*mac),
            None => {
                tracing::warn!(%dst, "Source MAC unknown, dropping reply");
                return;
            }
        },
    };

    let fragments = match frag::refragment(packet, fingerprint) {
        Ok(fragments) => fragments,
        Err(e) => {
            tracing::warn!("Refragmentation failed: {e}");
            return;
        }
    };

    for fragment in fragments {
        if let Err(e) = sink.inject(dst_mac, fragment.packet()) {
            tracing::error!("Failed to inject reply: {e}");
        }
    }
}

fn flush_transmit(
    endpoint: &mut Endpoint,
    upstream: &PacketSink,
    gateway_mac: Option<[u8; 6]>,
) -> Result<(), Error> {
    while let Some(segment) = endpoint.poll_transmit() {
        upstream.inject(gateway_mac, &segment.encode())?;
    }

    Ok(())
}

/// Flushes the remaining send buffer, bounded by [`SHUTDOWN_DRAIN`].
fn drain(endpoint: &mut Endpoint, upstream: &PacketSink, gateway_mac: Option<[u8; 6]>) {
    let deadline = Instant::now() + SHUTDOWN_DRAIN;

    while Instant::now() < deadline {
        match endpoint.poll_transmit() {
            Some(segment) => {
                if upstream.inject(gateway_mac, &segment.encode()).is_err() {
                    return;
                }
            }
            None => return,
        }
    }
}
