#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The tunnel data plane.
//!
//! Capture pumps lift packets off the wire, the client side folds them into
//! a FakeTCP flow towards the server, the server side unfolds them, NATs
//! them onto its own network and sends replies back the same way.

pub mod capture;
pub mod client;
pub mod device;
pub mod encap;
mod error;
pub mod filter;
pub mod frag;
pub mod gateway;
pub mod nat;
pub mod server;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use client::{ClientConfig, ClientTunnel};
pub use device::{Device, DeviceAddr, Enumeration};
pub use error::Error;
pub use server::{ServerConfig, ServerTunnel};

/// How long senders may keep draining after shutdown is triggered.
pub const SHUTDOWN_DRAIN: std::time::Duration = std::time::Duration::from_millis(500);

/// One shared shutdown signal for all pumps of a tunnel.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
