//! Noise XK handshake (variant B).
//!
//! ```text
//! 1  A -> B   AES(X, H(Bob), ivBob)(32) | ChaChaPoly(options1)(32) | pad1
//! 2  B -> A   AES(Y, H(Bob), msg1[16..32])(32) | ChaChaPoly(options2)(32) | pad2
//! 3  A -> B   ChaChaPoly(s)(48) | ChaChaPoly(RouterInfo | Options | Padding)
//! ```
//!
//! Options 1: `[1]` version, `[2..4)` pad1, `[4..6)` msg3 part 2 length,
//! `[8..12)` tsA. Options 2: `[2..4)` pad2, `[8..12)` tsB.
//!
//! Both sides mix pad1 and pad2 into the transcript hash. There is no
//! message 4: after message 3 both sides split and start the data phase.
//! Bob's first data frame is an OPTIONS block, which Alice merges into her
//! send policy when it arrives.

mod inbound;
mod outbound;

pub use inbound::InboundNtcp2;
pub use outbound::OutboundNtcp2;

use crate::codec::{Ntcp2Codec, PaddingOptions};
use crate::core::{
    BLOCK_HEADER_SIZE, EstablishError, IV_SIZE, KEY_SIZE, MAC_SIZE, MIN_RI_SIZE, OPTIONS3_SIZE,
};
use crate::crypto::aes_cbc::{cbc_decrypt, cbc_encrypt};
use crate::crypto::{HandshakeState, Role, derive_sip_keys};
use crate::router::RouterHash;

/// Smallest message 3 part 2 a peer may announce: a router info block
/// with the smallest identity, an options block and the MAC.
pub(crate) const MIN_MSG3P2_SIZE: usize =
    (BLOCK_HEADER_SIZE + 1 + MIN_RI_SIZE) + (BLOCK_HEADER_SIZE + OPTIONS3_SIZE) + MAC_SIZE;

/// AES-CBC encrypt an ephemeral key in place, returning the last
/// ciphertext block for chaining.
pub(crate) fn obfuscate_key(
    key: &mut [u8],
    bob: &RouterHash,
    iv: &[u8; IV_SIZE],
) -> Result<[u8; IV_SIZE], EstablishError> {
    cbc_encrypt(bob.as_bytes(), iv, &mut key[..KEY_SIZE])?;
    let mut tail = [0u8; IV_SIZE];
    tail.copy_from_slice(&key[KEY_SIZE - IV_SIZE..KEY_SIZE]);
    Ok(tail)
}

/// Inverse of [`obfuscate_key`]; also returns the ciphertext tail.
pub(crate) fn deobfuscate_key(
    key: &mut [u8],
    bob: &RouterHash,
    iv: &[u8; IV_SIZE],
) -> Result<[u8; IV_SIZE], EstablishError> {
    let mut tail = [0u8; IV_SIZE];
    tail.copy_from_slice(&key[KEY_SIZE - IV_SIZE..KEY_SIZE]);
    cbc_decrypt(bob.as_bytes(), iv, &mut key[..KEY_SIZE])?;
    if key[..KEY_SIZE].iter().all(|b| *b == 0) {
        return Err(EstablishError::ProtocolViolation("zero ephemeral key".into()));
    }
    Ok(tail)
}

pub(crate) fn u16_at(data: &[u8], at: usize) -> usize {
    u16::from_be_bytes([data[at], data[at + 1]]) as usize
}

pub(crate) fn u32_at(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Split the finished handshake into the data phase codec for `hs`'s role.
pub(crate) fn data_phase(
    hs: &HandshakeState,
    peer_options: Option<&PaddingOptions>,
) -> Result<Ntcp2Codec, EstablishError> {
    let (k_ab, k_ba) = hs.split()?;
    let (sip_ab, sip_ba) = derive_sip_keys(hs.chaining_key(), hs.handshake_hash())?;
    let mut codec = match hs.role() {
        Role::Initiator => Ntcp2Codec::new(k_ab, k_ba, sip_ab, sip_ba),
        Role::Responder => Ntcp2Codec::new(k_ba, k_ab, sip_ba, sip_ab),
    };
    if let Some(theirs) = peer_options {
        codec.apply_peer_options(theirs);
    }
    Ok(codec)
}
