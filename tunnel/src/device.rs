//! Pairing of OS interfaces with capture-library devices.
//!
//! The OS knows addresses, MACs and loopback-ness; libpcap knows the name
//! a capture handle must be opened with. A usable [`Device`] is one record
//! holding both identities. Pairing goes by shared address (loopback by the
//! loopback flag); a capture device that would pair ambiguously lands on
//! the blacklist instead, which is returned to the caller rather than kept
//! as process state.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use anyhow::{Context as _, Result};
use ip_network::Ipv4Network;
use pnet::datalink;

/// One IPv4 address bound to a device, with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAddr {
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

impl DeviceAddr {
    pub fn network(&self) -> Ipv4Network {
        Ipv4Network::new_truncate(self.ip, self.prefix).expect("prefix comes from the OS")
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.network().contains(ip)
    }
}

/// A capture device paired with its OS interface identity.
///
/// Immutable after enumeration.
#[derive(Debug, Clone)]
pub struct Device {
    /// Name libpcap opens the device by.
    pub name: String,
    /// Human-facing OS interface name.
    pub alias: String,
    /// Bound IPv4 addresses, in OS order.
    pub addrs: Vec<DeviceAddr>,
    /// Absent on loopback.
    pub mac: Option<[u8; 6]>,
    pub loopback: bool,
}

impl Device {
    /// The device's primary IPv4 address.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.addrs.first().map(|a| a.ip)
    }

    /// Whether `ip` falls into any subnet bound to this device.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.addrs.iter().any(|a| a.contains(ip))
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.alias, self.name)
    }
}

/// The outcome of [`enumerate`]: usable devices plus the names excluded
/// because their pairing was ambiguous.
#[derive(Debug, Default)]
pub struct Enumeration {
    pub devices: Vec<Device>,
    pub blacklist: Vec<String>,
}

impl Enumeration {
    pub fn find(&self, name_or_alias: &str) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| d.name == name_or_alias || d.alias == name_or_alias)
    }

    pub fn loopback(&self) -> Option<&Device> {
        self.devices.iter().find(|d| d.loopback)
    }
}

/// Enumerates OS interfaces and capture devices and pairs them up.
pub fn enumerate() -> Result<Enumeration> {
    let interfaces: Vec<datalink::NetworkInterface> = datalink::interfaces()
        .into_iter()
        .filter(|i| i.is_up() || i.is_loopback())
        .collect();

    let capture_devices = pcap::Device::list().context("Failed to list capture devices")?;

    let mut candidates: HashMap<usize, Vec<pcap::Device>> = HashMap::new();

    for cap in capture_devices {
        let position = if cap.flags.is_loopback() {
            interfaces.iter().position(|i| i.is_loopback())
        } else {
            interfaces.iter().position(|iface| {
                iface.ips.iter().any(|net| {
                    cap.addresses
                        .iter()
                        .any(|addr| addr.addr == net.ip())
                })
            })
        };

        match position {
            Some(idx) => candidates.entry(idx).or_default().push(cap),
            None => tracing::debug!(name = %cap.name, "Capture device has no matching interface"),
        }
    }

    let mut enumeration = Enumeration::default();

    for (idx, caps) in candidates {
        let iface = &interfaces[idx];

        if caps.len() > 1 {
            let names: Vec<String> = caps.into_iter().map(|c| c.name).collect();
            tracing::info!(
                interface = %iface.name,
                devices = ?names,
                "Multiple capture devices pair to one interface, excluding all of them"
            );
            enumeration.blacklist.extend(names);
            continue;
        }

        let cap = caps.into_iter().next().expect("checked non-empty");

        let addrs = iface
            .ips
            .iter()
            .filter_map(|net| match net {
                pnet::ipnetwork::IpNetwork::V4(v4) => Some(DeviceAddr {
                    ip: v4.ip(),
                    prefix: v4.prefix(),
                }),
                pnet::ipnetwork::IpNetwork::V6(_) => None,
            })
            .collect();

        enumeration.devices.push(Device {
            name: cap.name,
            alias: iface.name.clone(),
            addrs,
            mac: iface.mac.map(|m| m.octets()),
            loopback: iface.is_loopback(),
        });
    }

    enumeration.devices.sort_by(|a, b| a.alias.cmp(&b.alias));

    debug_assert!(enumeration.devices.iter().filter(|d| d.loopback).count() <= 1);

    Ok(enumeration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_addr_contains_its_subnet() {
        let addr = DeviceAddr {
            ip: Ipv4Addr::new(192, 168, 1, 7),
            prefix: 24,
        };

        assert!(addr.contains(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(addr.contains(Ipv4Addr::new(192, 168, 1, 254)));
        assert!(!addr.contains(Ipv4Addr::new(192, 168, 2, 1)));
    }

    #[test]
    fn device_lookup_by_name_or_alias() {
        let enumeration = Enumeration {
            devices: vec![Device {
                name: "\\Device\\NPF_{1234}".to_owned(),
                alias: "eth0".to_owned(),
                addrs: vec![],
                mac: Some([2, 0, 0, 0, 0, 1]),
                loopback: false,
            }],
            blacklist: vec![],
        };

        assert!(enumeration.find("eth0").is_some());
        assert!(enumeration.find("\\Device\\NPF_{1234}").is_some());
        assert!(enumeration.find("wlan0").is_none());
    }
}
