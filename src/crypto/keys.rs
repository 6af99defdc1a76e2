//! Long-term key management
//!
//! X25519 static keys for the Noise handshake and Ed25519 signing keys for
//! router identities.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{CryptoError, KEY_SIZE, SIGNATURE_SIZE};

/// A static X25519 keypair (the NTCP2 `s` key).
///
/// The private key is zeroized on drop.
#[derive(Clone)]
pub struct StaticKeypair {
    /// Private key (32 bytes) - zeroized on drop
    private: [u8; KEY_SIZE],
    /// Public key (32 bytes)
    public: [u8; KEY_SIZE],
}

impl StaticKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(secret)
    }

    /// Rebuild a keypair from its private half.
    pub fn from_private(private: [u8; KEY_SIZE]) -> Self {
        Self::from_secret(StaticSecret::from(private))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            private: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &[u8; KEY_SIZE] {
        &self.public
    }

    /// Get the private key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn private_key(&self) -> &[u8; KEY_SIZE] {
        &self.private
    }

    /// Compute DH(our_static, their_public).
    pub fn dh(&self, remote_public: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
        let secret = StaticSecret::from(self.private);
        let public = PublicKey::from(*remote_public);
        *secret.diffie_hellman(&public).as_bytes()
    }
}

impl Drop for StaticKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl std::fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &hex_prefix(&self.public))
            .finish_non_exhaustive()
    }
}

/// Ed25519 signing keypair for a router identity.
#[derive(Clone)]
pub struct SigningKeypair {
    key: SigningKey,
}

impl SigningKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild from a 32-byte seed.
    pub fn from_seed(seed: &[u8; KEY_SIZE]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Public verification key.
    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        self.key.verifying_key().to_bytes()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("public", &hex_prefix(&self.public_key()))
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature.
pub fn verify_signature(
    public: &[u8; KEY_SIZE],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public).map_err(|_| CryptoError::InvalidKey)?;
    let sig: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidLength(signature.len()))?;
    key.verify(message, &Signature::from_bytes(&sig))
        .map_err(|_| CryptoError::InvalidSignature)
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp1 = StaticKeypair::generate();
        let kp2 = StaticKeypair::generate();

        assert_ne!(kp1.public_key(), kp2.public_key());
        assert_ne!(kp1.private_key(), kp2.private_key());
    }

    #[test]
    fn test_static_dh_agrees() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();
        assert_eq!(a.dh(b.public_key()), b.dh(a.public_key()));
    }

    #[test]
    fn test_from_private_roundtrip() {
        let kp = StaticKeypair::generate();
        let again = StaticKeypair::from_private(*kp.private_key());
        assert_eq!(kp.public_key(), again.public_key());
    }

    #[test]
    fn test_sign_verify() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign(b"transcript");
        assert!(verify_signature(&kp.public_key(), b"transcript", &sig).is_ok());
        assert_eq!(
            verify_signature(&kp.public_key(), b"tampered", &sig),
            Err(CryptoError::InvalidSignature)
        );
        assert_eq!(
            verify_signature(&kp.public_key(), b"transcript", &sig[..10]),
            Err(CryptoError::InvalidLength(10))
        );
    }
}
