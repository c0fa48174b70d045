#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Authenticated encryption for tunneled payload frames.
//!
//! Every encapsulated packet is wrapped in a single AEAD frame:
//! `nonce ‖ ciphertext ‖ tag`. The nonce is drawn fresh from the OS RNG per
//! frame; there is no associated data. The cipher key is derived from the
//! operator-supplied pre-shared key with HKDF-SHA256 so that keys of any
//! length work for every method.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::generic_array::typenum::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

/// AES-192-GCM is not exported by name upstream.
type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, U12>;

/// AEAD authentication tag length, identical for all methods.
pub const TAG_LEN: usize = 16;

const KDF_SALT: &[u8] = b"ikago-tunnel";
const KDF_INFO: &[u8] = b"payload key";

/// The AEAD method protecting the tunnel payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    XChaCha20Poly1305,
}

impl Method {
    pub fn key_len(&self) -> usize {
        match self {
            Method::Aes128Gcm => 16,
            Method::Aes192Gcm => 24,
            Method::Aes256Gcm => 32,
            Method::ChaCha20Poly1305 => 32,
            Method::XChaCha20Poly1305 => 32,
        }
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            Method::XChaCha20Poly1305 => 24,
            _ => 12,
        }
    }

    /// Bytes a sealed frame adds on top of the plaintext.
    pub fn overhead(&self) -> usize {
        self.nonce_len() + TAG_LEN
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Aes128Gcm => "aes-128-gcm",
            Method::Aes192Gcm => "aes-192-gcm",
            Method::Aes256Gcm => "aes-256-gcm",
            Method::ChaCha20Poly1305 => "chacha20-poly1305",
            Method::XChaCha20Poly1305 => "xchacha20-poly1305",
        };

        f.write_str(name)
    }
}

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(Method::Aes128Gcm),
            "aes-192-gcm" => Ok(Method::Aes192Gcm),
            "aes-256-gcm" => Ok(Method::Aes256Gcm),
            "chacha20-poly1305" => Ok(Method::ChaCha20Poly1305),
            "xchacha20-poly1305" => Ok(Method::XChaCha20Poly1305),
            other => Err(UnknownMethod(other.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown encryption method: {0}")]
pub struct UnknownMethod(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Frame of {len} bytes is shorter than nonce and tag ({min} bytes)")]
    FrameTooShort { len: usize, min: usize },
    #[error("AEAD tag mismatch")]
    BadTag,
}

enum Inner {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha20(Box<ChaCha20Poly1305>),
    XChaCha20(Box<XChaCha20Poly1305>),
}

/// A per-tunnel AEAD cipher keyed from the pre-shared key.
pub struct Cipher {
    method: Method,
    inner: Inner,
}

impl Cipher {
    pub fn new(method: Method, psk: &[u8]) -> Self {
        let key = derive_key(psk, method.key_len());

        let inner = match method {
            Method::Aes128Gcm => {
                Inner::Aes128(Box::new(Aes128Gcm::new(GenericArray::from_slice(&key))))
            }
            Method::Aes192Gcm => {
                Inner::Aes192(Box::new(Aes192Gcm::new(GenericArray::from_slice(&key))))
            }
            Method::Aes256Gcm => {
                Inner::Aes256(Box::new(Aes256Gcm::new(GenericArray::from_slice(&key))))
            }
            Method::ChaCha20Poly1305 => Inner::ChaCha20(Box::new(ChaCha20Poly1305::new(
                GenericArray::from_slice(&key),
            ))),
            Method::XChaCha20Poly1305 => Inner::XChaCha20(Box::new(XChaCha20Poly1305::new(
                GenericArray::from_slice(&key),
            ))),
        };

        Self { method, inner }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Seals one frame: `nonce ‖ ciphertext ‖ tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; self.method.nonce_len()];
        rand::thread_rng().fill_bytes(&mut frame);

        let ciphertext = match &self.inner {
            Inner::Aes128(c) => c.encrypt(GenericArray::from_slice(&frame), plaintext),
            Inner::Aes192(c) => c.encrypt(GenericArray::from_slice(&frame), plaintext),
            Inner::Aes256(c) => c.encrypt(GenericArray::from_slice(&frame), plaintext),
            Inner::ChaCha20(c) => c.encrypt(GenericArray::from_slice(&frame), plaintext),
            Inner::XChaCha20(c) => c.encrypt(GenericArray::from_slice(&frame), plaintext),
        }
        .expect("in-memory AEAD encryption is infallible");

        frame.extend_from_slice(&ciphertext);
        frame
    }

    /// Opens one `nonce ‖ ciphertext ‖ tag` frame.
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let min = self.method.overhead();
        if frame.len() < min {
            return Err(CryptoError::FrameTooShort {
                len: frame.len(),
                min,
            });
        }

        let (nonce, ciphertext) = frame.split_at(self.method.nonce_len());

        match &self.inner {
            Inner::Aes128(c) => c.decrypt(GenericArray::from_slice(nonce), ciphertext),
            Inner::Aes192(c) => c.decrypt(GenericArray::from_slice(nonce), ciphertext),
            Inner::Aes256(c) => c.decrypt(GenericArray::from_slice(nonce), ciphertext),
            Inner::ChaCha20(c) => c.decrypt(GenericArray::from_slice(nonce), ciphertext),
            Inner::XChaCha20(c) => c.decrypt(GenericArray::from_slice(nonce), ciphertext),
        }
        .map_err(|_| CryptoError::BadTag)
    }
}

fn derive_key(psk: &[u8], len: usize) -> Vec<u8> {
    let hkdf = Hkdf::<Sha256>::new(Some(KDF_SALT), psk);

    let mut key = vec![0u8; len];
    hkdf.expand(KDF_INFO, &mut key)
        .expect("all method key lengths are valid HKDF-SHA256 output lengths");

    key
}

#[cfg(test)]
mod tests {
    use super::*;

    const METHODS: [Method; 5] = [
        Method::Aes128Gcm,
        Method::Aes192Gcm,
        Method::Aes256Gcm,
        Method::ChaCha20Poly1305,
        Method::XChaCha20Poly1305,
    ];

    #[test]
    fn roundtrip_all_methods() {
        for method in METHODS {
            let cipher = Cipher::new(method, &[0u8; 32]);

            let frame = cipher.seal(b"original datagram bytes");

            assert_eq!(frame.len(), b"original datagram bytes".len() + method.overhead());
            assert_eq!(cipher.open(&frame).unwrap(), b"original datagram bytes");
        }
    }

    #[test]
    fn separately_keyed_ciphers_interoperate() {
        let psk = hex_literal::hex!("000102030405060708090a0b0c0d0e0f");

        let sealer = Cipher::new(Method::Aes128Gcm, &psk);
        let opener = Cipher::new(Method::Aes128Gcm, &psk);

        let frame = sealer.seal(b"hello");

        assert_eq!(opener.open(&frame).unwrap(), b"hello");
    }

    #[test]
    fn tampering_any_byte_fails_decryption() {
        for method in METHODS {
            let cipher = Cipher::new(method, &[7u8; 16]);
            let frame = cipher.seal(b"sensitive");

            for i in 0..frame.len() {
                let mut tampered = frame.clone();
                tampered[i] ^= 0x01;

                assert_eq!(cipher.open(&tampered).unwrap_err(), CryptoError::BadTag);
            }
        }
    }

    #[test]
    fn short_frame_is_rejected_without_panicking() {
        let cipher = Cipher::new(Method::XChaCha20Poly1305, b"k");

        assert!(matches!(
            cipher.open(&[0u8; 10]),
            Err(CryptoError::FrameTooShort { len: 10, min: 40 })
        ));
    }

    #[test]
    fn nonces_are_fresh_per_frame() {
        let cipher = Cipher::new(Method::ChaCha20Poly1305, b"psk");

        let a = cipher.seal(b"same plaintext");
        let b = cipher.seal(b"same plaintext");

        assert_ne!(a[..12], b[..12]);
    }
}
