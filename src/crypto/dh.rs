//! 2048-bit Diffie-Hellman for the legacy handshake.
//!
//! Uses the RFC 3526 group 14 prime with generator 2. Public values travel
//! as 256-byte big-endian integers.

use std::sync::OnceLock;

use num_bigint::BigUint;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::{CryptoError, KEY_SIZE, XY_SIZE};

const PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// Private exponent size in bytes.
const EXPONENT_SIZE: usize = 32;

fn prime() -> &'static BigUint {
    static PRIME: OnceLock<BigUint> = OnceLock::new();
    PRIME.get_or_init(|| {
        BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16).expect("group 14 prime is valid hex")
    })
}

/// A 32-byte AES session key derived from the DH shared secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Ephemeral DH keypair.
pub struct DhKeypair {
    exponent: [u8; EXPONENT_SIZE],
    public: [u8; XY_SIZE],
}

impl DhKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let mut exponent = [0u8; EXPONENT_SIZE];
        OsRng.fill_bytes(&mut exponent);
        // never zero, never tiny
        exponent[0] |= 0x80;
        let x = BigUint::from_bytes_be(&exponent);
        let public = BigUint::from(2u32).modpow(&x, prime());
        Self {
            exponent,
            public: to_fixed(&public),
        }
    }

    /// Our public value, 256 bytes big-endian.
    pub fn public_value(&self) -> &[u8; XY_SIZE] {
        &self.public
    }

    /// Derive the session key from the peer's public value.
    ///
    /// Values outside `(1, p - 1)` are rejected.
    pub fn session_key(&self, peer: &[u8]) -> Result<SessionKey, CryptoError> {
        if peer.len() != XY_SIZE {
            return Err(CryptoError::InvalidLength(peer.len()));
        }
        let p = prime();
        let y = BigUint::from_bytes_be(peer);
        let one = BigUint::from(1u32);
        if y <= one || y >= p - &one {
            return Err(CryptoError::InvalidPublicValue);
        }
        let x = BigUint::from_bytes_be(&self.exponent);
        let shared = y.modpow(&x, p);
        Ok(derive_key(&shared))
    }
}

impl Drop for DhKeypair {
    fn drop(&mut self) {
        self.exponent.zeroize();
    }
}

/// Session key = first 32 bytes of the two's-complement encoding of the
/// shared secret, extended with its SHA-256 when shorter.
fn derive_key(shared: &BigUint) -> SessionKey {
    let mut buf = shared.to_bytes_be();
    if buf.first().is_some_and(|b| b & 0x80 != 0) {
        buf.insert(0, 0);
    }
    let mut key = [0u8; KEY_SIZE];
    if buf.len() >= KEY_SIZE {
        key.copy_from_slice(&buf[..KEY_SIZE]);
    } else {
        key[..buf.len()].copy_from_slice(&buf);
        let extra = Sha256::digest(&buf);
        let missing = KEY_SIZE - buf.len();
        key[buf.len()..].copy_from_slice(&extra[..missing]);
    }
    buf.zeroize();
    SessionKey(key)
}

fn to_fixed(value: &BigUint) -> [u8; XY_SIZE] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; XY_SIZE];
    out[XY_SIZE - bytes.len()..].copy_from_slice(&bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prime_is_2048_bits() {
        assert_eq!(prime().bits(), 2048);
    }

    #[test]
    fn test_shared_key_agrees() {
        let alice = DhKeypair::generate();
        let bob = DhKeypair::generate();
        let ka = alice.session_key(bob.public_value()).unwrap();
        let kb = bob.session_key(alice.public_value()).unwrap();
        assert_eq!(ka.as_bytes(), kb.as_bytes());
    }

    #[test]
    fn test_rejects_degenerate_values() {
        let kp = DhKeypair::generate();
        let mut one = [0u8; XY_SIZE];
        one[XY_SIZE - 1] = 1;
        assert_eq!(kp.session_key(&one).err(), Some(CryptoError::InvalidPublicValue));
        assert_eq!(kp.session_key(&[0u8; XY_SIZE]).err(), Some(CryptoError::InvalidPublicValue));
        assert_eq!(kp.session_key(&[0xffu8; XY_SIZE]).err(), Some(CryptoError::InvalidPublicValue));
        assert_eq!(kp.session_key(&[1u8; 10]).err(), Some(CryptoError::InvalidLength(10)));
    }

    #[test]
    fn test_key_uses_sign_byte() {
        // top bit set: the encoding gains a leading zero
        let shared = BigUint::from_bytes_be(&[0x80; 40]);
        let key = derive_key(&shared);
        assert_eq!(key.as_bytes()[0], 0);
        assert_eq!(key.as_bytes()[1], 0x80);
    }
}
