//! Gateway MAC discovery.
//!
//! There is no raw-ARP machinery here: we send one UDP datagram addressed
//! to the gateway on a port nobody answers and sniff our own outgoing
//! frame off the wire. The kernel has already done the ARP work, so the
//! frame's destination MAC is the gateway's.

use std::net::{Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};

use crate::capture::LinkKind;
use crate::device::Device;
use crate::filter;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A port nothing listens on; the datagram is discarded by the gateway.
const PROBE_PORT: u16 = 65535;

/// Learns the gateway's link-layer address via the upstream device.
pub fn discover_gateway_mac(device: &Device, gateway: Ipv4Addr) -> Result<[u8; 6]> {
    anyhow::ensure!(
        device.contains(gateway),
        "Gateway {gateway} is not in any subnet of {device}"
    );

    let local_ip = device
        .ipv4()
        .with_context(|| format!("{device} has no IPv4 address"))?;

    let (mut cap, kind) = crate::capture::open(
        device,
        Some(&filter::gateway_probe(gateway, PROBE_PORT)),
    )?;

    anyhow::ensure!(
        kind == LinkKind::Ethernet,
        "Gateway discovery only makes sense on Ethernet links"
    );

    let socket = UdpSocket::bind((local_ip, 0)).context("Failed to bind probe socket")?;
    socket
        .send_to(&[0u8; 8], (gateway, PROBE_PORT))
        .context("Failed to send probe datagram")?;

    let deadline = Instant::now() + PROBE_TIMEOUT;

    while Instant::now() < deadline {
        match cap.next_packet() {
            Ok(packet) => {
                let Some(frame) = crate::capture::decode_link(kind, packet.data) else {
                    continue;
                };

                let mac = frame
                    .dst_mac
                    .expect("Ethernet frames carry a destination MAC");

                tracing::info!(
                    %gateway,
                    mac = %format_mac(mac),
                    device = %device,
                    "Discovered gateway"
                );

                return Ok(mac);
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => return Err(e).context("Capture failed during gateway discovery"),
        }
    }

    anyhow::bail!("Gateway {gateway} did not reflect the probe within {PROBE_TIMEOUT:?}")
}

pub fn format_mac(mac: [u8; 6]) -> String {
    mac.map(|b| format!("{b:02x}")).join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac([0xde, 0xad, 0xbe, 0xef, 0x00, 0x42]),
            "de:ad:be:ef:00:42"
        );
    }
}
