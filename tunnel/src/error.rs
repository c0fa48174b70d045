use ip_packet::UnsupportedProtocol;

/// Everything that can go wrong in the data plane.
///
/// Policy lives with the dispatchers: `Parse`, `Reassembly` and `Crypto`
/// are per-packet (logged, never fatal); `NatExhausted` drops the packet;
/// `Capture` and `Inject` take the affected device offline; `Handshake`
/// ends the peer session; `PeerDesync` resets the flow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Capture on {device} failed")]
    Capture {
        device: String,
        #[source]
        source: pcap::Error,
    },
    #[error("Inject on {device} failed")]
    Inject {
        device: String,
        #[source]
        source: pcap::Error,
    },
    #[error("Malformed packet: {0}")]
    Parse(#[from] anyhow::Error),
    #[error("Reassembly failed: {0}")]
    Reassembly(String),
    #[error(transparent)]
    Crypto(#[from] tunnel_crypto::CryptoError),
    #[error("Handshake failed")]
    Handshake(#[source] faketcp::Error),
    #[error("NAT port pool exhausted")]
    NatExhausted,
    #[error("FakeTCP peer desynchronized")]
    PeerDesync,
    #[error(transparent)]
    UnsupportedProtocol(#[from] UnsupportedProtocol),
}

impl From<faketcp::Error> for Error {
    fn from(e: faketcp::Error) -> Self {
        match e {
            faketcp::Error::HandshakeTimeout => Error::Handshake(e),
            faketcp::Error::PeerDesync => Error::PeerDesync,
        }
    }
}

impl From<crate::nat::NatError> for Error {
    fn from(e: crate::nat::NatError) -> Self {
        match e {
            crate::nat::NatError::Exhausted => Error::NatExhausted,
            crate::nat::NatError::Unsupported(e) => Error::UnsupportedProtocol(e),
        }
    }
}
