//! Cryptographic layer
//!
//! Primitives used by the two handshake variants and their data phases:
//!
//! - [`dh`]: 2048-bit DH for the legacy handshake
//! - [`aes_cbc`]: chained AES-256-CBC (legacy frames, Noise key obfuscation)
//! - [`noise`]: Noise XK engine with exposed chaining key and transcript hash
//! - [`siphash`]: NTCP2 frame length obfuscation
//! - [`keys`]: X25519 static keys and Ed25519 identity keys

pub mod aes_cbc;
pub mod dh;
mod keys;
pub mod noise;
pub mod siphash;

pub use aes_cbc::{CbcDecryptor, CbcEncryptor};
pub use dh::{DhKeypair, SessionKey};
pub use keys::{SigningKeypair, StaticKeypair, verify_signature};
pub use noise::{CipherState, HandshakeState, Role};
pub use siphash::{LengthObfuscator, SipKeys, derive_sip_keys};

use sha2::{Digest, Sha256};

use crate::core::HASH_SIZE;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    Sha256::digest(data).into()
}
