//! The server: terminates FakeTCP flows, NATs the tunneled traffic onto
//! its own network and sends replies back through the tunnel.

use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use ikago_tunnel::{Device, ServerConfig, ServerTunnel, Shutdown, device, gateway};
use tunnel_crypto::{Cipher, Method};

#[derive(Parser)]
#[command(author, version, about = "Tunnel server: unwraps FakeTCP flows and NATs them onward")]
struct Cli {
    /// Port the tunnel listens on.
    #[arg(short = 'p', long, default_value_t = 1080)]
    port: u16,

    /// Device facing the clients (capture name or OS alias).
    #[arg(long)]
    listen: Option<String>,

    /// Device facing the destinations; defaults to the listen device.
    #[arg(long)]
    upstream: Option<String>,

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
    let cipher = make_cipher(cli.method.as_deref(), cli.key.as_deref())?;

    let enumeration = device::enumerate()?;
    anyhow::ensure!(
        !enumeration.devices.is_empty(),
        "No usable capture devices; are you running with sufficient privileges?"
    );
    for dev in &enumeration.devices {
        tracing::info!(device = %dev, addrs = ?dev.addrs, "Found device");
    }

    let listen = select_device(&enumeration, cli.listen.as_deref())?.clone();
    let upstream = match &cli.upstream {
        Some(name) => enumeration
            .find(name)
            .with_context(|| format!("No usable device named {name}"))?
            .clone(),
        None => listen.clone(),
    };

    tracing::info!(listen = %listen, upstream = %upstream, "Using devices");

    let gateway_mac = if upstream.loopback {
        None
    } else {
        let gateway = cli
            .gateway
            .context("--gateway is required on Ethernet upstreams")?;
        Some(gateway::discover_gateway_mac(&upstream, gateway)?)
    };

    let shutdown = Shutdown::new();
    let tunnel = ServerTunnel::start(
        ServerConfig {
            listen_port: cli.port,
            listen,
            upstream,
            gateway_mac,
            cipher,
        },
        shutdown.clone(),
    )?;

    tracing::info!(port = cli.port, "Tunnel running, Ctrl-C stops it");

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

fn select_device<'e>(
    enumeration: &'e device::Enumeration,
    name: Option<&str>,
) -> Result<&'e Device> {
    if let Some(name) = name {
        return enumeration
            .find(name)
            .with_context(|| format!("No usable device named {name}"));
    }

    enumeration
        .devices
        .iter()
        .find(|d| !d.loopback)
        .or_else(|| enumeration.loopback())
        .context("No usable device; pass --listen explicitly")
}
