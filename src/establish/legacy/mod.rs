//! Legacy DH/AES handshake (variant A).
//!
//! ```text
//! 1  A -> B   X(256) | H(X) ^ H(Bob)(32)
//! 2  B -> A   Y(256) | E(H(X|Y)(32) | tsB(4) | rnd(12), k, Y[240..256])
//! 3  A -> B   E(len(2) | identA | tsA(4) | pad | S(X|Y|H(Bob)|tsA|tsB), k, hx_xor[16..32])
//! 4  B -> A   E(S(X|Y|H(Alice)|tsA|tsB) | pad, k, msg2[288..304])
//! ```
//!
//! Messages 3 and 4 are padded to a multiple of 16. Afterwards each side
//! keeps chaining on the last ciphertext block it sent and received.

mod inbound;
mod outbound;

pub use inbound::InboundLegacy;
pub use outbound::OutboundLegacy;

use tracing::warn;

use crate::core::{AES_BLOCK_SIZE, CLOCK_FUDGE_FACTOR_MS, EstablishError, SKEW_BAN_DURATION, XY_SIZE};
use crate::router::RouterHash;
use crate::transport::TransportContext;

pub(crate) fn round_up(len: usize) -> usize {
    len.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE
}

/// `X | Y | H(peer) | tsA | tsB`, the data both signatures cover.
pub(crate) fn signed_data(
    x: &[u8; XY_SIZE],
    y: &[u8; XY_SIZE],
    hash: &RouterHash,
    ts_a: u32,
    ts_b: u32,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(2 * XY_SIZE + 32 + 8);
    data.extend_from_slice(x);
    data.extend_from_slice(y);
    data.extend_from_slice(hash.as_bytes());
    data.extend_from_slice(&ts_a.to_be_bytes());
    data.extend_from_slice(&ts_b.to_be_bytes());
    data
}

/// Apply the legacy skew rule, returning the skew to record.
///
/// A clock that was never synchronized is stepped once to match the peer.
/// Otherwise a skew of a minute or more bans the peer and fails.
pub(crate) fn check_skew(
    ctx: &TransportContext,
    peer: &RouterHash,
    skew_secs: i64,
) -> Result<i64, EstablishError> {
    let diff_ms = skew_secs.abs() * 1000;
    let clock = ctx.clock();
    if !clock.updated_successfully() {
        clock.set_offset(clock.offset() - skew_secs * 1000, true);
        if diff_ms != 0 {
            warn!(%peer, skew_secs, "clock never synchronized, stepping to match peer");
        }
        return Ok(0);
    }
    if diff_ms >= CLOCK_FUDGE_FACTOR_MS {
        warn!(%peer, skew_secs, "excessive clock skew");
        ctx.banlist().ban(*peer, Some(SKEW_BAN_DURATION));
        return Err(EstablishError::ClockSkewExceeded { skew_secs });
    }
    Ok(skew_secs)
}
