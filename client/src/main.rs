//! The client: intercepts traffic from LAN sources and disguises it as one
//! TCP flow towards the server.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use ikago_tunnel::{ClientConfig, ClientTunnel, Device, Shutdown, device, gateway};
use ip_network::Ipv4Network;
use rand::Rng as _;
use tunnel_crypto::{Cipher, Method};

#[derive(Parser)]
#[command(author, version, about = "Tunnel client: wraps LAN traffic into a FakeTCP flow")]
struct Cli {
    /// Source ranges to intercept: CIDRs or single addresses, comma-separated.
    #[arg(short = 'r', long = "sources", value_delimiter = ',', required = true)]
    sources: Vec<String>,

    /// The tunnel server, as ip:port.
    #[arg(short = 's', long)]
    server: SocketAddrV4,

    /// Local FakeTCP port; 0 picks one from the ephemeral range.
    #[arg(short = 'p', long, default_value_t = 0)]
    port: u16,

    /// Upstream device (capture name or OS alias).
    #[arg(long)]
    upstream: Option<String>,

    /// Listen devices; defaults to every paired device except the upstream.
    #[arg(long = "listen")]
    listen: Vec<String>,

    /// Gateway IPv4 address on the upstream network.
    #[arg(long)]
    gateway: Option<Ipv4Addr>,

    /// Encryption method: aes-128-gcm, aes-192-gcm, aes-256-gcm,
    /// chacha20-poly1305 or xchacha20-poly1305.
    #[arg(long)]
    method: Option<String>,

    /// Pre-shared key.
    #[arg(short = 'k', long)]
    key: Option<String>,

    /// More logging; repeat for trace output.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = ikago_logging::setup(cli.verbose) {
        eprintln!("Failed to set up logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => {
            tracing::info!("Goodbye!");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let sources = cli
        .sources
        .iter()
        .map(|s| parse_source(s))
        .collect::<Result<Vec<_>>>()?;

    let cipher = make_cipher(cli.method.as_deref(), cli.key.as_deref())?;

    let enumeration = device::enumerate()?;
    anyhow::ensure!(
        !enumeration.devices.is_empty(),
        "No usable capture devices; are you running with sufficient privileges?"
    );
    for dev in &enumeration.devices {
        tracing::info!(device = %dev, addrs = ?dev.addrs, "Found device");
    }

    let upstream = select_upstream(&enumeration, &cli)?.clone();
    tracing::info!(device = %upstream, "Using upstream");

    let listen = select_listen(&enumeration, &cli.listen, &upstream)?;

    let gateway_mac = if upstream.loopback {
        None
    } else {
        let gateway = cli
            .gateway
            .context("--gateway is required on Ethernet upstreams")?;
        Some(gateway::discover_gateway_mac(&upstream, gateway)?)
    };

    let local_port = match cli.port {
        0 => rand::thread_rng().gen_range(32768..61000),
        port => port,
    };

    let shutdown = Shutdown::new();
    let tunnel = ClientTunnel::start(
        ClientConfig {
            sources,
            server: cli.server,
            local_port,
            upstream,
            listen,
            gateway_mac,
            cipher,
        },
        shutdown.clone(),
    )?;

    tracing::info!(server = %cli.server, port = local_port, "Tunnel running, Ctrl-C stops it");

    wait_for_ctrl_c(shutdown.clone());
    shutdown.trigger();

    tunnel.join()
}

/// Blocks until Ctrl-C or until the tunnel shuts itself down.
fn wait_for_ctrl_c(shutdown: Shutdown) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C, shutting down"),
            _ = async {
                while !shutdown.is_triggered() {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            } => {}
        }
    });
}

fn parse_source(s: &str) -> Result<Ipv4Network> {
    if s.contains('/') {
        return Ipv4Network::from_str(s).with_context(|| format!("Invalid source range: {s}"));
    }

    let ip = Ipv4Addr::from_str(s).with_context(|| format!("Invalid source address: {s}"))?;

    Ok(Ipv4Network::new(ip, 32).expect("/32 is always valid"))
}

fn make_cipher(method: Option<&str>, key: Option<&str>) -> Result<Option<Cipher>> {
    match (method, key) {
        (Some(method), Some(key)) => {
            let method = Method::from_str(method)?;

            Ok(Some(Cipher::new(method, key.as_bytes())))
        }
        (None, None) => Ok(None),
        _ => bail!("--method and --key must be given together"),
    }
}

fn select_upstream<'e>(
    enumeration: &'e device::Enumeration,
    cli: &Cli,
) -> Result<&'e Device> {
    if let Some(name) = &cli.upstream {
        return enumeration
            .find(name)
            .with_context(|| format!("No usable device named {name}"));
    }

    // Loopback servers are reached via the loopback device; otherwise take
    // the first device that can reach the gateway (or any non-loopback one).
    if cli.server.ip().is_loopback() {
        return enumeration.loopback().context("No loopback device");
    }

    enumeration
        .devices
        .iter()
        .find(|d| {
            !d.loopback && cli.gateway.map(|gw| d.contains(gw)).unwrap_or(true)
        })
        .context("No device reaches the gateway; pass --upstream explicitly")
}

fn select_listen(
    enumeration: &device::Enumeration,
    names: &[String],
    upstream: &Device,
) -> Result<Vec<Device>> {
    if !names.is_empty() {
        return names
            .iter()
            .map(|name| {
                enumeration
                    .find(name)
                    .cloned()
                    .with_context(|| format!("No usable device named {name}"))
            })
            .collect();
    }

    let listen: Vec<Device> = enumeration
        .devices
        .iter()
        .filter(|d| d.name != upstream.name)
        .cloned()
        .collect();

    if listen.is_empty() {
        // Single-device setups capture and forward on the same interface.
        return Ok(vec![upstream.clone()]);
    }

    Ok(listen)
}
