//! The pseudo-TCP endpoint.
//!
//! Presents a single TCP flow to middleboxes while internally moving opaque
//! bytes (the encapsulation stream). Sans-IO: segments and timeouts go in,
//! segments come out of [`Endpoint::poll_transmit`], reassembled stream
//! bytes out of [`Endpoint::poll_received`]. All clocks are explicit.
//!
//! Deliberate deviations from real TCP, required by the disguise:
//! no retransmission, no FIN, and no passive ACKs. Acknowledgment numbers
//! are bookkeeping carried on data segments; the peer never waits for them.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::reorder::ReorderBuffer;
use crate::segment::Segment;

/// Payload bytes per emitted segment.
///
/// 1500 MTU minus the IPv4 and TCP headers the codec writes.
pub const DEFAULT_MSS: usize = 1460;

/// Per-leg handshake deadline. There is no retry; expiry is fatal for the
/// peer session.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before a reset endpoint may handshake again.
pub const RESET_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    SynSent,
    SynReceived,
    Established,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("Handshake leg timed out")]
    HandshakeTimeout,
    #[error("Peer desynchronized: unexpected SYN while established")]
    PeerDesync,
}

pub struct Endpoint {
    role: Role,
    local: SocketAddrV4,
    peer: SocketAddrV4,

    state: State,

    /// Total payload bytes assigned a sequence number; `sent as u32` is the
    /// next sequence number on the wire. Starts at 0, SYNs consume nothing.
    sent: u64,
    send_queue: VecDeque<u8>,
    pending: VecDeque<Segment>,
    reorder: ReorderBuffer,
    ipid_out: u16,
    mss: usize,

    handshake_deadline: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl Endpoint {
    pub fn new_client(local: SocketAddrV4, peer: SocketAddrV4) -> Self {
        Self::new(Role::Client, local, peer)
    }

    pub fn new_server(local: SocketAddrV4, peer: SocketAddrV4) -> Self {
        Self::new(Role::Server, local, peer)
    }

    fn new(role: Role, local: SocketAddrV4, peer: SocketAddrV4) -> Self {
        Self {
            role,
            local,
            peer,
            state: State::Closed,
            sent: 0,
            send_queue: VecDeque::new(),
            pending: VecDeque::new(),
            reorder: ReorderBuffer::default(),
            ipid_out: 0,
            mss: DEFAULT_MSS,
            handshake_deadline: None,
            cooldown_until: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    /// Starts the client handshake. No-op unless the endpoint is `Closed`
    /// (and past a reset cooldown); the server side opens upon SYN receipt.
    pub fn open(&mut self, now: Instant) {
        if self.role != Role::Client || self.state != State::Closed {
            return;
        }

        if let Some(until) = self.cooldown_until {
            if now < until {
                return;
            }
        }
        self.cooldown_until = None;

        let syn = self.next_segment(true, false, Vec::new());
        self.pending.push_back(syn);
        self.state = State::SynSent;
        self.handshake_deadline = Some(now + HANDSHAKE_TIMEOUT);

        tracing::debug!(peer = %self.peer, "Sending SYN");
    }

    /// Queues stream bytes for transmission.
    pub fn send(&mut self, bytes: &[u8]) {
        self.send_queue.extend(bytes);
    }

    /// Feeds one captured segment into the state machine.
    pub fn handle_segment(&mut self, segment: &Segment, now: Instant) -> Result<(), Error> {
        if segment.dst_port != self.local.port() || segment.src_port != self.peer.port() {
            tracing::trace!(?segment, "Segment does not address this endpoint");
            return Ok(());
        }

        if segment.syn {
            return self.handle_syn(segment, now);
        }

        match self.state {
            State::SynReceived => {
                // The final handshake leg: the only empty segment the peer
                // will ever send. Data riding in means the leg got lost and
                // the peer has moved on; establish either way.
                self.state = State::Established;
                self.handshake_deadline = None;
                tracing::info!(peer = %self.peer, "Tunnel established");

                if !segment.payload.is_empty()
                    && !self.reorder.push(segment.seq, segment.payload.clone())
                {
                    tracing::debug!(seq = segment.seq, "Dropped undeliverable segment");
                }

                Ok(())
            }
            State::Established => {
                if segment.payload.is_empty() {
                    // The peer never emits passive ACKs; a stray empty
                    // segment is noise from a third party.
                    tracing::trace!(seq = segment.seq, "Ignoring empty segment");
                    return Ok(());
                }

                if !self.reorder.push(segment.seq, segment.payload.clone()) {
                    tracing::debug!(
                        seq = segment.seq,
                        len = segment.payload.len(),
                        "Dropped segment outside the reorder window"
                    );
                }

                Ok(())
            }
            State::Closed | State::SynSent => {
                tracing::trace!(state = ?self.state, "Dropping non-SYN segment");
                Ok(())
            }
        }
    }

    fn handle_syn(&mut self, segment: &Segment, now: Instant) -> Result<(), Error> {
        match (self.state, segment.ack_flag) {
            // Passive open: answer SYN with SYN+ACK.
            (State::Closed, false) if self.role == Role::Server => {
                let syn_ack = self.next_segment(true, true, Vec::new());
                self.pending.push_back(syn_ack);
                self.state = State::SynReceived;
                self.handshake_deadline = Some(now + HANDSHAKE_TIMEOUT);

                tracing::debug!(peer = %self.peer, "Received SYN, sending SYN+ACK");

                Ok(())
            }
            // Second leg: acknowledge with the only empty ACK of the session.
            (State::SynSent, true) => {
                let ack = self.next_segment(false, true, Vec::new());
                self.pending.push_back(ack);
                self.state = State::Established;
                self.handshake_deadline = None;

                tracing::info!(peer = %self.peer, "Tunnel established");

                Ok(())
            }
            // A SYN on a live session means the peer lost its state.
            (State::Established, _) => {
                tracing::warn!(peer = %self.peer, "Unexpected SYN, resetting session");
                self.reset(now);

                Err(Error::PeerDesync)
            }
            // Duplicate SYN while mid-handshake; the pending reply stands.
            _ => {
                tracing::trace!(state = ?self.state, "Ignoring SYN");
                Ok(())
            }
        }
    }

    /// Next segment to put on the wire, handshake frames first.
    pub fn poll_transmit(&mut self) -> Option<Segment> {
        if let Some(segment) = self.pending.pop_front() {
            return Some(segment);
        }

        if self.state != State::Established || self.send_queue.is_empty() {
            return None;
        }

        let take = self.mss.min(self.send_queue.len());
        let payload: Vec<u8> = self.send_queue.drain(..take).collect();

        let segment = self.next_segment(false, true, payload);
        self.sent += take as u64;

        Some(segment)
    }

    /// Contiguous stream bytes received from the peer, if any.
    pub fn poll_received(&mut self) -> Option<Vec<u8>> {
        self.reorder.pop_contiguous()
    }

    /// Checks the handshake deadline.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        let Some(deadline) = self.handshake_deadline else {
            return Ok(());
        };

        if now < deadline {
            return Ok(());
        }

        tracing::warn!(peer = %self.peer, state = ?self.state, "Handshake timed out");
        self.reset(now);

        Err(Error::HandshakeTimeout)
    }

    /// Returns to `Closed` and starts the reopen cooldown. Counters restart
    /// from zero, so a new session again leads with sequence 0 and ID 0.
    pub fn reset(&mut self, now: Instant) {
        self.state = State::Closed;
        self.sent = 0;
        self.ipid_out = 0;
        self.send_queue.clear();
        self.pending.clear();
        self.reorder = ReorderBuffer::default();
        self.handshake_deadline = None;
        self.cooldown_until = Some(now + RESET_COOLDOWN);
    }

    fn next_segment(&mut self, syn: bool, ack_flag: bool, payload: Vec<u8>) -> Segment {
        let ipid = self.ipid_out;
        self.ipid_out = self.ipid_out.wrapping_add(1);

        Segment {
            src_ip: *self.local.ip(),
            dst_ip: *self.peer.ip(),
            src_port: self.local.port(),
            dst_port: self.peer.port(),
            seq: self.sent as u32,
            ack: if ack_flag { self.reorder.next_seq() } else { 0 },
            syn,
            ack_flag,
            ipid,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn pair() -> (Endpoint, Endpoint) {
        let client_addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 48392);
        let server_addr = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 1), 1080);

        (
            Endpoint::new_client(client_addr, server_addr),
            Endpoint::new_server(server_addr, client_addr),
        )
    }

    /// Shuttles segments between both endpoints until neither has output.
    fn pump(client: &mut Endpoint, server: &mut Endpoint, now: Instant) -> Vec<Segment> {
        let mut wire = Vec::new();

        loop {
            let mut progressed = false;

            while let Some(segment) = client.poll_transmit() {
                server.handle_segment(&segment, now).unwrap();
                wire.push(segment);
                progressed = true;
            }

            while let Some(segment) = server.poll_transmit() {
                client.handle_segment(&segment, now).unwrap();
                wire.push(segment);
                progressed = true;
            }

            if !progressed {
                return wire;
            }
        }
    }

    #[test]
    fn three_way_handshake() {
        let (mut client, mut server) = pair();
        let now = Instant::now();

        client.open(now);
        let wire = pump(&mut client, &mut server, now);

        assert!(client.is_established());
        assert!(server.is_established());

        // SYN, SYN+ACK, ACK and nothing else; all empty.
        assert_eq!(wire.len(), 3);
        assert!(wire.iter().all(|s| s.payload.is_empty()));
        assert!(wire[0].syn && !wire[0].ack_flag);
        assert!(wire[1].syn && wire[1].ack_flag);
        assert!(!wire[2].syn && wire[2].ack_flag);

        // Both sides start sequence and IP ID at zero.
        assert_eq!(wire[0].seq, 0);
        assert_eq!(wire[0].ipid, 0);
        assert_eq!(wire[1].seq, 0);
        assert_eq!(wire[1].ipid, 0);
    }

    #[test]
    fn every_data_segment_carries_payload_and_first_has_seq_zero() {
        let (mut client, mut server) = pair();
        let now = Instant::now();

        client.open(now);
        pump(&mut client, &mut server, now);

        client.send(b"first");
        server.send(b"reply");
        let wire = pump(&mut client, &mut server, now);

        assert_eq!(wire.len(), 2);
        assert!(wire.iter().all(|s| !s.payload.is_empty()));
        assert_eq!(wire[0].seq, 0);
        assert_eq!(wire[1].seq, 0);

        assert_eq!(server.poll_received().unwrap(), b"first");
        assert_eq!(client.poll_received().unwrap(), b"reply");
    }

    #[test]
    fn sequence_advances_by_payload_bytes() {
        let (mut client, mut server) = pair();
        let now = Instant::now();

        client.open(now);
        pump(&mut client, &mut server, now);

        client.send(b"12345");
        client.send(b"6789");
        let wire = pump(&mut client, &mut server, now);

        // Both writes were drained into one MSS-sized segment.
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].seq, 0);
        assert_eq!(wire[0].payload, b"123456789");

        client.send(b"x");
        let wire = pump(&mut client, &mut server, now);
        assert_eq!(wire[0].seq, 9);
    }

    #[test]
    fn large_write_is_drained_in_mss_chunks() {
        let (mut client, mut server) = pair();
        let now = Instant::now();

        client.open(now);
        pump(&mut client, &mut server, now);

        client.send(&vec![7u8; DEFAULT_MSS + 100]);
        let wire = pump(&mut client, &mut server, now);

        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].payload.len(), DEFAULT_MSS);
        assert_eq!(wire[1].payload.len(), 100);
        assert_eq!(wire[1].seq, DEFAULT_MSS as u32);

        let received = server.poll_received().unwrap();
        assert_eq!(received.len(), DEFAULT_MSS + 100);
    }

    #[test]
    fn out_of_order_segments_are_reordered() {
        let (mut client, mut server) = pair();
        let now = Instant::now();

        client.open(now);
        pump(&mut client, &mut server, now);

        client.send(b"aaaa");
        let first = client.poll_transmit().unwrap();
        client.send(b"bbbb");
        let second = client.poll_transmit().unwrap();

        server.handle_segment(&second, now).unwrap();
        assert!(server.poll_received().is_none());

        server.handle_segment(&first, now).unwrap();
        assert_eq!(server.poll_received().unwrap(), b"aaaabbbb");
    }

    #[test]
    fn syn_on_established_session_is_a_desync() {
        let (mut client, mut server) = pair();
        let now = Instant::now();

        client.open(now);
        pump(&mut client, &mut server, now);

        let mut reopened = Endpoint::new_client(client.local(), client.peer());
        reopened.open(now);
        let stray_syn = reopened.poll_transmit().unwrap();

        assert_eq!(
            server.handle_segment(&stray_syn, now),
            Err(Error::PeerDesync)
        );
        assert_eq!(server.state(), State::Closed);
    }

    #[test]
    fn reopen_after_reset_waits_for_the_cooldown() {
        let (mut client, _server) = pair();
        let now = Instant::now();

        client.open(now);
        client.reset(now);

        client.open(now);
        assert_eq!(client.state(), State::Closed);

        let later = now + RESET_COOLDOWN;
        client.open(later);
        assert_eq!(client.state(), State::SynSent);

        // Fresh session leads with sequence 0 and IP ID 0 again.
        let syn = client.poll_transmit().unwrap();
        assert_eq!(syn.seq, 0);
        assert_eq!(syn.ipid, 0);
    }

    #[test]
    fn handshake_times_out_without_reply() {
        let (mut client, _server) = pair();
        let now = Instant::now();

        client.open(now);
        assert!(client.handle_timeout(now).is_ok());

        assert_eq!(
            client.handle_timeout(now + HANDSHAKE_TIMEOUT),
            Err(Error::HandshakeTimeout)
        );
        assert_eq!(client.state(), State::Closed);
    }

    #[test]
    fn data_queued_before_establishment_flows_afterwards() {
        let (mut client, mut server) = pair();
        let now = Instant::now();

        client.send(b"early");
        client.open(now);
        pump(&mut client, &mut server, now);

        assert!(client.is_established());
        assert_eq!(server.poll_received().unwrap(), b"early");
    }
}
