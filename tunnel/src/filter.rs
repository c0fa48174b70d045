//! BPF filter programs, one per pump role.
//!
//! The transport clause matches TCP, UDP, ICMP and, via the raw
//! fragment-offset test, non-first fragments, which carry no transport
//! header a protocol keyword could match on.

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use ip_network::Ipv4Network;

const TRANSPORTS: &str = "(tcp or udp or icmp or (ip[6:2] & 0x1fff != 0))";

/// Client side: traffic from the configured sources, minus the tunnel peer.
pub fn sources(sources: &[Ipv4Network], server: Ipv4Addr) -> String {
    let mut nets = String::new();
    for (i, net) in sources.iter().enumerate() {
        if i > 0 {
            nets.push_str(" or ");
        }
        let _ = write!(nets, "src net {}/{}", net.network_address(), net.netmask());
    }

    format!(
        "ip and {TRANSPORTS} and ({nets}) and not (src host {server} or dst host {server})"
    )
}

/// Server side: replies from destinations, minus the tunnel's own flow.
pub fn destinations(listen_port: u16) -> String {
    format!(
        "ip and {TRANSPORTS} and not (tcp and (src port {listen_port} or dst port {listen_port}))"
    )
}

/// Client's tunnel pump: only segments from the server to our port.
pub fn faketcp(peer: Ipv4Addr, local_port: u16) -> String {
    format!("tcp and src host {peer} and dst port {local_port}")
}

/// Server's tunnel pump: peers are not known up front.
pub fn faketcp_listen(local_port: u16) -> String {
    format!("tcp and dst port {local_port}")
}

/// Gateway discovery: the reflection of our own probe datagram.
pub fn gateway_probe(gateway: Ipv4Addr, probe_port: u16) -> String {
    format!("udp and dst host {gateway} and dst port {probe_port}")
}
