//! Router identities.
//!
//! ```text
//! +---------------------------+
//! | encryption key (256)      |
//! +---------------------------+
//! | padding (96)              |
//! | ed25519 signing key (32)  |  128-byte signing area, key right-aligned
//! +---------------------------+
//! | cert type (1) = 5         |
//! | cert len (2)  = 4         |
//! | sig type (2)  = 7         |
//! | crypto type (2) = 0       |
//! +---------------------------+
//! ```
//!
//! Peers may present older identities: a null certificate means DSA-SHA1,
//! and key certificates name other signature types. Those parse, and their
//! signature lengths are known, but only Ed25519 signatures verify.

use std::fmt;

use rand::{RngCore, rngs::OsRng};

use crate::core::{CryptoError, DecodeError, HASH_SIZE, KEY_SIZE, MIN_RI_SIZE, SIGNATURE_SIZE};
use crate::crypto::{SigningKeypair, sha256, verify_signature};

const PUBKEY_AREA: usize = 256;
const SIGNING_AREA: usize = 128;
const CERT_OFFSET: usize = PUBKEY_AREA + SIGNING_AREA;

/// Null certificate type.
pub const CERT_NULL: u8 = 0;

/// Key certificate type.
pub const CERT_KEY: u8 = 5;

/// DSA-SHA1 signature type code, implied by a null certificate.
pub const SIG_TYPE_DSA_SHA1: u16 = 0;

/// Ed25519 signature type code.
pub const SIG_TYPE_ED25519: u16 = 7;

/// Length of a signature of type `sig_type`, if the type is known.
pub fn signature_len(sig_type: u16) -> Option<usize> {
    match sig_type {
        SIG_TYPE_DSA_SHA1 => Some(40),
        // ECDSA P-256, P-384, P-521
        1 => Some(64),
        2 => Some(96),
        3 => Some(132),
        // RSA 2048, 3072, 4096
        4 => Some(256),
        5 => Some(384),
        6 => Some(512),
        // Ed25519, Ed25519ph, RedDSA
        SIG_TYPE_ED25519 | 8 | 11 => Some(64),
        _ => None,
    }
}

/// Signature type declared by the certificate of the serialized identity at
/// the front of `data`. Fails with [`DecodeError::UnexpectedEof`] until
/// enough of the certificate is present.
pub fn signature_type(data: &[u8]) -> Result<u16, DecodeError> {
    let cert_type = *data.get(CERT_OFFSET).ok_or(DecodeError::UnexpectedEof)?;
    match cert_type {
        CERT_NULL => Ok(SIG_TYPE_DSA_SHA1),
        CERT_KEY => {
            let b = data
                .get(CERT_OFFSET + 3..CERT_OFFSET + 5)
                .ok_or(DecodeError::UnexpectedEof)?;
            Ok(u16::from_be_bytes([b[0], b[1]]))
        }
        other => Err(DecodeError::UnsupportedType(other as u16)),
    }
}

/// Serialized size of an Ed25519 router identity.
pub const IDENTITY_SIZE: usize = MIN_RI_SIZE + 4;

/// SHA-256 of a serialized router identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouterHash(pub [u8; HASH_SIZE]);

impl RouterHash {
    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Debug for RouterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterHash({self})")
    }
}

impl fmt::Display for RouterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A peer's public identity.
#[derive(Clone, PartialEq, Eq)]
pub struct RouterIdentity {
    bytes: Vec<u8>,
    sig_type: u16,
    /// Last 32 bytes of the signing area; the key itself for Ed25519.
    signing_key: [u8; KEY_SIZE],
    hash: RouterHash,
}

impl RouterIdentity {
    /// Build an identity around an Ed25519 signing key.
    pub fn new(signing: &SigningKeypair) -> Self {
        let mut bytes = vec![0u8; IDENTITY_SIZE];
        OsRng.fill_bytes(&mut bytes[..CERT_OFFSET - KEY_SIZE]);
        let key = signing.public_key();
        bytes[CERT_OFFSET - KEY_SIZE..CERT_OFFSET].copy_from_slice(&key);
        bytes[CERT_OFFSET] = CERT_KEY;
        bytes[CERT_OFFSET + 1..CERT_OFFSET + 3].copy_from_slice(&4u16.to_be_bytes());
        bytes[CERT_OFFSET + 3..CERT_OFFSET + 5].copy_from_slice(&SIG_TYPE_ED25519.to_be_bytes());
        // crypto type 0 is already in place
        let hash = RouterHash(sha256(&bytes));
        Self {
            bytes,
            sig_type: SIG_TYPE_ED25519,
            signing_key: key,
            hash,
        }
    }

    /// Parse an identity from the front of `data`, returning it and the
    /// number of bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        if data.len() < MIN_RI_SIZE {
            return Err(DecodeError::UnexpectedEof);
        }
        let cert_type = data[CERT_OFFSET];
        let cert_len = u16::from_be_bytes([data[CERT_OFFSET + 1], data[CERT_OFFSET + 2]]) as usize;
        let total = MIN_RI_SIZE + cert_len;
        if data.len() < total {
            return Err(DecodeError::UnexpectedEof);
        }
        let well_formed = match cert_type {
            CERT_NULL => cert_len == 0,
            CERT_KEY => cert_len >= 4,
            _ => false,
        };
        if !well_formed {
            return Err(DecodeError::UnsupportedType(cert_type as u16));
        }
        let sig_type = signature_type(data)?;
        if signature_len(sig_type).is_none() {
            return Err(DecodeError::UnsupportedType(sig_type));
        }
        let mut signing_key = [0u8; KEY_SIZE];
        signing_key.copy_from_slice(&data[CERT_OFFSET - KEY_SIZE..CERT_OFFSET]);
        let bytes = data[..total].to_vec();
        let hash = RouterHash(sha256(&bytes));
        Ok((
            Self {
                bytes,
                sig_type,
                signing_key,
                hash,
            },
            total,
        ))
    }

    /// Serialized form.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Serialized size.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Identity hash.
    pub fn hash(&self) -> RouterHash {
        self.hash
    }

    /// Signature type from the certificate.
    pub fn sig_type(&self) -> u16 {
        self.sig_type
    }

    /// Length of signatures made with this identity's key.
    pub fn signature_len(&self) -> usize {
        signature_len(self.sig_type).unwrap_or(SIGNATURE_SIZE)
    }

    /// Verify a signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        if self.sig_type != SIG_TYPE_ED25519 {
            return Err(CryptoError::UnsupportedSignatureType(self.sig_type));
        }
        verify_signature(&self.signing_key, message, signature)
    }
}

impl fmt::Debug for RouterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterIdentity")
            .field("hash", &self.hash)
            .field("sig_type", &self.sig_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_layout() {
        let kp = SigningKeypair::generate();
        let ident = RouterIdentity::new(&kp);
        assert_eq!(ident.size(), 391);
        let bytes = ident.as_bytes();
        assert_eq!(&bytes[352..384], &kp.public_key());
        assert_eq!(hex::encode(&bytes[384..391]), "05000400070000");
    }

    #[test]
    fn test_identity_parse_and_verify() {
        let kp = SigningKeypair::generate();
        let ident = RouterIdentity::new(&kp);
        let mut data = ident.as_bytes().to_vec();
        data.extend_from_slice(b"trailing");
        let (parsed, used) = RouterIdentity::from_bytes(&data).unwrap();
        assert_eq!(used, 391);
        assert_eq!(parsed, ident);
        assert_eq!(parsed.hash(), ident.hash());

        let sig = kp.sign(b"msg");
        assert!(parsed.verify(b"msg", &sig).is_ok());
    }

    #[test]
    fn test_identity_rejects_unknown_sig_type() {
        let kp = SigningKeypair::generate();
        let mut data = RouterIdentity::new(&kp).as_bytes().to_vec();
        data[388] = 9;
        assert_eq!(
            RouterIdentity::from_bytes(&data).err(),
            Some(DecodeError::UnsupportedType(9))
        );
        data[384] = 3;
        assert_eq!(
            RouterIdentity::from_bytes(&data).err(),
            Some(DecodeError::UnsupportedType(3))
        );
        assert_eq!(
            RouterIdentity::from_bytes(&data[..300]).err(),
            Some(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn test_signature_length_follows_certificate() {
        let kp = SigningKeypair::generate();
        let mut data = RouterIdentity::new(&kp).as_bytes().to_vec();
        // ECDSA P-521
        data[388] = 3;
        let (ident, _) = RouterIdentity::from_bytes(&data).unwrap();
        assert_eq!(ident.signature_len(), 132);
        assert_eq!(
            ident.verify(b"msg", &[0; 132]),
            Err(CryptoError::UnsupportedSignatureType(3))
        );

        // null certificate: DSA-SHA1
        let mut dsa = data[..MIN_RI_SIZE].to_vec();
        dsa[384..387].copy_from_slice(&[CERT_NULL, 0, 0]);
        let (ident, used) = RouterIdentity::from_bytes(&dsa).unwrap();
        assert_eq!(used, MIN_RI_SIZE);
        assert_eq!(ident.sig_type(), SIG_TYPE_DSA_SHA1);
        assert_eq!(ident.signature_len(), 40);

        assert_eq!(signature_type(&data[..388]), Err(DecodeError::UnexpectedEof));
        assert_eq!(signature_type(&dsa[..385]), Ok(SIG_TYPE_DSA_SHA1));
    }
}
