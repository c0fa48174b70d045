//! Capture handles and the receiver pumps.
//!
//! One receiver thread per listen device blocks on the kernel capture
//! socket and feeds link-stripped IPv4 packets into the dispatcher's
//! channel. Injection goes through a separate handle so a blocking read
//! never starves a sender. Reads use a short kernel timeout so the pump
//! observes shutdown promptly.

use std::thread::{self, JoinHandle};

use anyhow::{Context as _, Result};
use etherparse::{EtherType, Ethernet2Header, Ethernet2HeaderSlice};
use parking_lot::Mutex;
use pcap::{Active, Capture, Linktype};

use crate::device::Device;
use crate::{Error, Shutdown};

/// Big enough for a full-size Ethernet frame; the contract only asks for
/// 1600 bytes but capture buffers are cheap.
pub const SNAPLEN: i32 = 65535;

/// Kernel read timeout; bounds how long shutdown takes to be observed.
const READ_TIMEOUT_MS: i32 = 100;

/// Bound of the dispatcher channel.
pub const CHANNEL_CAPACITY: usize = 512;

/// BSD loopback pseudo-header: a 4-byte host-endian address family.
const AF_INET: u32 = 2;
const LOOPBACK_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    Loopback,
}

/// A captured packet with the link layer already stripped.
#[derive(Debug, Clone)]
pub struct Frame {
    pub src_mac: Option<[u8; 6]>,
    pub dst_mac: Option<[u8; 6]>,
    /// The raw IPv4 datagram.
    pub ip: Vec<u8>,
}

/// Strips the link layer. Returns `None` for frames we do not care about
/// (non-IPv4 ethertypes, foreign loopback families, runts).
pub fn decode_link(kind: LinkKind, data: &[u8]) -> Option<Frame> {
    match kind {
        LinkKind::Ethernet => {
            let eth = Ethernet2HeaderSlice::from_slice(data).ok()?;

            if eth.ether_type() != EtherType::IPV4 {
                return None;
            }

            Some(Frame {
                src_mac: Some(eth.source()),
                dst_mac: Some(eth.destination()),
                ip: data[Ethernet2Header::LEN..].to_vec(),
            })
        }
        LinkKind::Loopback => {
            let family = data.get(..LOOPBACK_HEADER_LEN)?;

            if u32::from_ne_bytes(family.try_into().expect("4 bytes")) != AF_INET {
                return None;
            }

            Some(Frame {
                src_mac: None,
                dst_mac: None,
                ip: data[LOOPBACK_HEADER_LEN..].to_vec(),
            })
        }
    }
}

/// Prepends the link layer for injection.
pub fn encode_link(
    kind: LinkKind,
    src_mac: Option<[u8; 6]>,
    dst_mac: Option<[u8; 6]>,
    ip: &[u8],
) -> Result<Vec<u8>> {
    match kind {
        LinkKind::Ethernet => {
            let header = Ethernet2Header {
                source: src_mac.context("Ethernet injection needs a source MAC")?,
                destination: dst_mac.context("Ethernet injection needs a destination MAC")?,
                ether_type: EtherType::IPV4,
            };

            let mut buf = Vec::with_capacity(Ethernet2Header::LEN + ip.len());
            header
                .write(&mut buf)
                .expect("writing to a `Vec` never fails");
            buf.extend_from_slice(ip);

            Ok(buf)
        }
        LinkKind::Loopback => {
            let mut buf = Vec::with_capacity(LOOPBACK_HEADER_LEN + ip.len());
            buf.extend_from_slice(&AF_INET.to_ne_bytes());
            buf.extend_from_slice(ip);

            Ok(buf)
        }
    }
}

pub(crate) fn open(device: &Device, filter: Option<&str>) -> Result<(Capture<Active>, LinkKind), Error> {
    let capture_error = |source| Error::Capture {
        device: device.alias.clone(),
        source,
    };

    let mut cap = Capture::from_device(device.name.as_str())
        .map_err(capture_error)?
        .promisc(true)
        .snaplen(SNAPLEN)
        .timeout(READ_TIMEOUT_MS)
        .immediate_mode(true)
        .open()
        .map_err(capture_error)?;

    let kind = match cap.get_datalink() {
        Linktype::ETHERNET => LinkKind::Ethernet,
        Linktype::NULL | Linktype::LOOP => LinkKind::Loopback,
        other => {
            return Err(capture_error(pcap::Error::PcapError(format!(
                "unsupported link type: {other:?}"
            ))));
        }
    };

    if let Some(program) = filter {
        cap.filter(program, true).map_err(capture_error)?;
    }

    Ok((cap, kind))
}

/// Spawns the receiver pump for one device.
///
/// Every captured frame is mapped through `map` and sent to the
/// dispatcher. A read error takes this pump offline; when `critical` is
/// set (the only upstream device) it takes the whole tunnel with it.
pub fn spawn_capture<T, F>(
    device: &Device,
    filter: &str,
    shutdown: Shutdown,
    critical: bool,
    sender: flume::Sender<T>,
    map: F,
) -> Result<JoinHandle<()>, Error>
where
    T: Send + 'static,
    F: Fn(Frame) -> T + Send + 'static,
{
    let (mut cap, kind) = open(device, Some(filter))?;
    let alias = device.alias.clone();

    let handle = thread::Builder::new()
        .name(format!("capture-{alias}"))
        .spawn(move || {
            loop {
                if shutdown.is_triggered() {
                    break;
                }

                match cap.next_packet() {
                    Ok(packet) => {
                        let Some(frame) = decode_link(kind, packet.data) else {
                            continue;
                        };

                        if sender.send(map(frame)).is_err() {
                            break; // Dispatcher is gone.
                        }
                    }
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        tracing::error!(device = %alias, "Capture read failed: {e}");

                        if critical {
                            shutdown.trigger();
                        }

                        break;
                    }
                }
            }

            tracing::debug!(device = %alias, "Capture pump exited");
        })
        .expect("thread names contain no interior NUL");

    Ok(handle)
}

/// An injection handle for one device, shareable across threads.
pub struct PacketSink {
    alias: String,
    link: LinkKind,
    src_mac: Option<[u8; 6]>,
    cap: Mutex<Capture<Active>>,
}

impl PacketSink {
    pub fn open(device: &Device) -> Result<Self, Error> {
        let (cap, link) = open(device, None)?;

        Ok(Self {
            alias: device.alias.clone(),
            link,
            src_mac: device.mac,
            cap: Mutex::new(cap),
        })
    }

    pub fn link(&self) -> LinkKind {
        self.link
    }

    /// Writes one IPv4 datagram, wrapped in this device's link layer.
    pub fn inject(&self, dst_mac: Option<[u8; 6]>, ip: &[u8]) -> Result<(), Error> {
        let frame = encode_link(self.link, self.src_mac, dst_mac, ip).map_err(Error::Parse)?;

        self.cap
            .lock()
            .sendpacket(frame)
            .map_err(|source| Error::Inject {
                device: self.alias.clone(),
                source,
            })
    }
}
