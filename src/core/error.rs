//! Error types for the NTCP transport.

use thiserror::Error;

/// Errors that can occur when decoding a wire structure
/// (router identities, router infos, I2NP envelopes).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Invalid encoding.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Unexpected end of data.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Unsupported signature or crypto type.
    #[error("unsupported type: {0}")]
    UnsupportedType(u16),
}

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// DH public value out of range.
    #[error("invalid DH public value")]
    InvalidPublicValue,

    /// Buffer is not a whole number of cipher blocks, or a key has the wrong size.
    #[error("invalid length: {0}")]
    InvalidLength(usize),

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Signature did not verify.
    #[error("signature verification failed")]
    InvalidSignature,

    /// Malformed key material.
    #[error("invalid key material")]
    InvalidKey,

    /// Nonce counter exhausted - session must terminate.
    #[error("nonce counter exhausted - session must terminate")]
    CounterExhaustion,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Handshake engine used out of order.
    #[error("handshake state error: {0}")]
    HandshakeState(&'static str),

    /// Identity signs with an algorithm we cannot verify.
    #[error("unsupported signature type {0}")]
    UnsupportedSignatureType(u16),
}

/// Handshake failures.
///
/// Every variant is fatal for the connection. [`EstablishError::is_skew`]
/// and [`EstablishError::blocks_remote`] tell the caller what else must
/// happen before the connection is closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EstablishError {
    /// Malformed or oversized handshake field.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Signature, hash or MAC mismatch.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// Peer clock too far from ours.
    #[error("clock skew exceeded: {skew_secs}s")]
    ClockSkewExceeded {
        /// Measured skew, local minus peer, seconds.
        skew_secs: i64,
    },

    /// Peer belongs to another network.
    #[error("network id mismatch: expected {expected}, got {actual}")]
    NetworkMismatch {
        /// Our network id.
        expected: u8,
        /// Network id declared by the peer.
        actual: u8,
    },

    /// Peer is banned.
    #[error("peer is banned")]
    Banned,

    /// Message 1 was seen before.
    #[error("replayed handshake")]
    Replay,

    /// Socket failure during the handshake.
    #[error("i/o error: {0}")]
    Io(String),

    /// Primitive failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl EstablishError {
    /// Failed because of clock skew rather than corruption.
    pub fn is_skew(&self) -> bool {
        matches!(self, Self::ClockSkewExceeded { .. })
    }

    /// The remote address must be blocklisted so future attempts
    /// short-circuit without a handshake.
    pub fn blocks_remote(&self) -> bool {
        matches!(self, Self::NetworkMismatch { .. } | Self::Banned)
    }
}

impl From<DecodeError> for EstablishError {
    fn from(e: DecodeError) -> Self {
        Self::ProtocolViolation(e.to_string())
    }
}

/// Data phase failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Malformed frame or block.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Adler-32 suffix did not match.
    #[error("frame checksum mismatch")]
    BadChecksum,

    /// Frame or message larger than the codec accepts.
    #[error("oversized frame: {0} bytes")]
    Oversized(usize),

    /// AEAD record did not authenticate.
    #[error("frame authentication failed")]
    AuthenticationFailure,

    /// Keepalive reported a skew beyond the limit.
    #[error("clock skew exceeded: {skew_secs}s")]
    ClockSkewExceeded {
        /// New skew, local minus peer, seconds.
        skew_secs: i64,
    },

    /// Peer sent a TERMINATION block.
    #[error("terminated by peer, reason {reason}")]
    Terminated {
        /// Reason code.
        reason: u8,
    },

    /// Primitive failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<DecodeError> for CodecError {
    fn from(e: DecodeError) -> Self {
        Self::ProtocolViolation(e.to_string())
    }
}

/// Connection and multiplexer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection is closed.
    #[error("connection closed")]
    Closed,

    /// Operation requires an established connection.
    #[error("connection not established")]
    NotEstablished,

    /// Outbound queue is backed up.
    #[error("connection backlogged")]
    Backlogged,

    /// Connection limit reached.
    #[error("connection limit reached")]
    ConnectionLimit,

    /// Remote address is blocklisted.
    #[error("address blocklisted")]
    Blocklisted,

    /// Target address does not advertise a usable transport.
    #[error("unusable address: {0}")]
    UnusableAddress(String),

    /// Handshake failure.
    #[error("establishment failed: {0}")]
    Establish(#[from] EstablishError),

    /// Data phase failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level NTCP errors.
#[derive(Debug, Error)]
pub enum NtcpError {
    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Decode error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_establish_error_classification() {
        assert!(EstablishError::ClockSkewExceeded { skew_secs: 90 }.is_skew());
        assert!(!EstablishError::Banned.is_skew());
        assert!(EstablishError::Banned.blocks_remote());
        assert!(EstablishError::NetworkMismatch { expected: 2, actual: 3 }.blocks_remote());
        assert!(!EstablishError::Replay.blocks_remote());
    }

    #[test]
    fn test_crypto_error_converts() {
        let e: EstablishError = CryptoError::DecryptionFailed.into();
        assert_eq!(e, EstablishError::Crypto(CryptoError::DecryptionFailed));
        let t: TransportError = e.into();
        assert!(matches!(t, TransportError::Establish(_)));
    }
}
