//! Encapsulation of whole IPv4 datagrams into the tunnel byte stream.
//!
//! Each delivery is one length-prefixed frame so that several frames can
//! share a TCP segment and one frame can span several:
//!
//! ```text
//! 2B frame length (big-endian)
//! -- plaintext, or sealed as nonce ‖ ciphertext ‖ tag --
//! 2B original IPv4 ID
//! 1B flags (bit 0 DF, bit 1 MF-on-last, bit 2 was-fragmented)
//! 1B fragment count N
//! N × 2B fragment offsets (8-byte units, ascending)
//! original IPv4 datagram
//! ```

use anyhow::{Context as _, Result, bail};
use ip_packet::IpPacket;
use tunnel_crypto::Cipher;

use crate::Error;
use crate::frag::Fingerprint;

const FLAG_DF: u8 = 1 << 0;
const FLAG_MF_ON_LAST: u8 = 1 << 1;
const FLAG_FRAGMENTED: u8 = 1 << 2;

/// Frames are prefixed with a 16-bit length, which also bounds them.
pub const MAX_FRAME: usize = u16::MAX as usize;

/// Stream bytes buffered while waiting for a frame to complete. Anything
/// beyond this is a desynchronized stream, not a slow one.
const MAX_BUFFERED: usize = 4 * 1024 * 1024;

/// Serializes fingerprint and datagram into one frame body.
pub fn encode_body(packet: &IpPacket, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
    anyhow::ensure!(
        fingerprint.offsets.len() <= u8::MAX as usize,
        "{} fragment offsets do not fit the fingerprint",
        fingerprint.offsets.len()
    );

    let mut flags = 0u8;
    if fingerprint.dont_fragment {
        flags |= FLAG_DF;
    }
    if fingerprint.mf_on_last {
        flags |= FLAG_MF_ON_LAST;
    }
    if fingerprint.fragmented {
        flags |= FLAG_FRAGMENTED;
    }

    let mut body =
        Vec::with_capacity(4 + fingerprint.offsets.len() * 2 + packet.total_len());
    body.extend_from_slice(&fingerprint.id.to_be_bytes());
    body.push(flags);
    body.push(fingerprint.offsets.len() as u8);
    for offset in &fingerprint.offsets {
        body.extend_from_slice(&offset.to_be_bytes());
    }
    body.extend_from_slice(packet.packet());

    Ok(body)
}

/// The inverse of [`encode_body`].
pub fn decode_body(body: &[u8]) -> Result<(Fingerprint, IpPacket)> {
    anyhow::ensure!(body.len() >= 4, "Frame body of {} bytes is too short", body.len());

    let id = u16::from_be_bytes([body[0], body[1]]);
    let flags = body[2];
    let count = body[3] as usize;

    let offsets_end = 4 + count * 2;
    anyhow::ensure!(
        body.len() > offsets_end,
        "Frame body ends inside the fragment offsets"
    );

    let offsets: Vec<u16> = body[4..offsets_end]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    let fragmented = flags & FLAG_FRAGMENTED != 0;
    if fragmented != (count > 0) {
        bail!("Fragmented flag disagrees with a fragment count of {count}");
    }

    let packet = IpPacket::new(body[offsets_end..].to_vec())
        .context("Encapsulated bytes are not an IPv4 datagram")?;

    let fingerprint = Fingerprint {
        id,
        dont_fragment: flags & FLAG_DF != 0,
        mf_on_last: flags & FLAG_MF_ON_LAST != 0,
        fragmented,
        offsets,
    };

    Ok((fingerprint, packet))
}

/// Frame encode/decode with optional AEAD sealing.
pub struct FrameCodec {
    cipher: Option<Cipher>,
}

impl FrameCodec {
    pub fn new(cipher: Option<Cipher>) -> Self {
        Self { cipher }
    }

    /// One length-prefixed frame ready for the tunnel's send buffer.
    pub fn encode(&self, packet: &IpPacket, fingerprint: &Fingerprint) -> Result<Vec<u8>, Error> {
        let body = encode_body(packet, fingerprint)?;

        let body = match &self.cipher {
            Some(cipher) => cipher.seal(&body),
            None => body,
        };

        if body.len() > MAX_FRAME {
            return Err(Error::Parse(anyhow::anyhow!(
                "Frame of {} bytes exceeds the length prefix",
                body.len()
            )));
        }

        let mut out = Vec::with_capacity(2 + body.len());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);

        Ok(out)
    }

    /// Opens one frame (without its length prefix).
    pub fn decode(&self, frame: &[u8]) -> Result<(Fingerprint, IpPacket), Error> {
        let body;
        let plain = match &self.cipher {
            Some(cipher) => {
                body = cipher.open(frame)?;
                body.as_slice()
            }
            None => frame,
        };

        decode_body(plain).map_err(Error::Parse)
    }
}

/// Splits the received tunnel byte stream back into frames.
#[derive(Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
}

impl StreamDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);

        if self.buf.len() > MAX_BUFFERED {
            tracing::warn!(
                buffered = self.buf.len(),
                "Tunnel stream desynchronized, dropping buffered bytes"
            );
            self.buf.clear();
        }
    }

    /// The next complete frame, its length prefix stripped.
    ///
    /// An impossible prefix means the stream cannot be re-synchronized;
    /// buffered bytes are dropped and an error returned, once.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, Error>> {
        if self.buf.len() < 2 {
            return None;
        }

        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;

        if len == 0 {
            self.buf.clear();
            return Some(Err(Error::Parse(anyhow::anyhow!(
                "Zero-length frame prefix"
            ))));
        }

        if self.buf.len() < 2 + len {
            return None;
        }

        let frame = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);

        Some(Ok(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ip_packet::make;
    use std::net::Ipv4Addr;
    use tunnel_crypto::Method;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const DST: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    fn sample() -> (IpPacket, Fingerprint) {
        let packet = make::udp_packet(SRC, DST, 40000, 53, b"query");
        let fingerprint = Fingerprint {
            id: 913,
            dont_fragment: false,
            mf_on_last: false,
            fragmented: true,
            offsets: vec![0, 185],
        };

        (packet, fingerprint)
    }

    #[test]
    fn plaintext_roundtrip() {
        let (packet, fingerprint) = sample();
        let codec = FrameCodec::new(None);

        let wire = codec.encode(&packet, &fingerprint).unwrap();

        let mut stream = StreamDecoder::default();
        stream.push(&wire);
        let frame = stream.next_frame().unwrap().unwrap();

        let (out_fp, out_packet) = codec.decode(&frame).unwrap();
        assert_eq!(out_fp, fingerprint);
        assert_eq!(out_packet, packet);
    }

    #[test]
    fn encrypted_roundtrip_has_nonce_and_tag_overhead() {
        let (packet, fingerprint) = sample();
        let method = Method::Aes128Gcm;
        let codec = FrameCodec::new(Some(tunnel_crypto::Cipher::new(method, &[0u8; 32])));

        let wire = codec.encode(&packet, &fingerprint).unwrap();

        let body_len = encode_body(&packet, &fingerprint).unwrap().len();
        assert_eq!(wire.len(), 2 + body_len + method.overhead());

        let mut stream = StreamDecoder::default();
        stream.push(&wire);
        let frame = stream.next_frame().unwrap().unwrap();

        let (out_fp, out_packet) = codec.decode(&frame).unwrap();
        assert_eq!(out_fp, fingerprint);
        assert_eq!(out_packet, packet);
    }

    #[test]
    fn tampered_ciphertext_is_a_crypto_error() {
        let (packet, fingerprint) = sample();
        let codec = FrameCodec::new(Some(tunnel_crypto::Cipher::new(
            Method::ChaCha20Poly1305,
            b"psk",
        )));

        let wire = codec.encode(&packet, &fingerprint).unwrap();

        let mut stream = StreamDecoder::default();
        stream.push(&wire);
        let mut frame = stream.next_frame().unwrap().unwrap();
        frame[20] ^= 0x01;

        assert!(matches!(codec.decode(&frame), Err(Error::Crypto(_))));
    }

    #[test]
    fn frames_reassemble_across_arbitrary_segmentation() {
        let (packet, fingerprint) = sample();
        let codec = FrameCodec::new(None);

        let mut wire = codec.encode(&packet, &fingerprint).unwrap();
        wire.extend(codec.encode(&packet, &fingerprint).unwrap());

        let mut stream = StreamDecoder::default();

        // Dribble the bytes in 3-byte segments.
        let mut frames = Vec::new();
        for chunk in wire.chunks(3) {
            stream.push(chunk);
            while let Some(frame) = stream.next_frame() {
                frames.push(frame.unwrap());
            }
        }

        assert_eq!(frames.len(), 2);
        for frame in frames {
            let (_, out) = codec.decode(&frame).unwrap();
            assert_eq!(out, packet);
        }
    }

    #[test]
    fn zero_length_prefix_drops_the_buffer() {
        let mut stream = StreamDecoder::default();
        stream.push(&[0, 0, 1, 2, 3]);

        assert!(stream.next_frame().unwrap().is_err());
        assert!(stream.next_frame().is_none());
    }

    #[test]
    fn truncated_body_is_rejected() {
        assert!(decode_body(&[0, 1, 0]).is_err());

        // Count says two offsets, body ends first.
        assert!(decode_body(&[0, 1, 0b100, 2, 0, 0]).is_err());
    }

    #[test]
    fn unfragmented_flag_must_match_count() {
        let (packet, _) = sample();

        let mut body = Vec::new();
        body.extend_from_slice(&[0, 7]);
        body.push(FLAG_FRAGMENTED);
        body.push(0); // No offsets despite the flag.
        body.extend_from_slice(packet.packet());

        assert!(decode_body(&body).is_err());
    }
}
