//! NTCP2 data phase.
//!
//! ```text
//! frame: obfuscated_len(2) | ChaChaPoly(blocks)   len = ciphertext length incl. MAC
//! ```
//!
//! Each direction owns a cipher state (empty associated data, nonce per
//! frame) and a SipHash length obfuscator. Every outgoing frame ends with
//! a PADDING block sized by the negotiated policy.

use tracing::{debug, trace};

use crate::core::{
    BLOCK_HEADER_SIZE, CodecError, I2npMessage, MAC_SIZE, MAX_SKEW_SECS, NTCP2_MAX_FRAME_SIZE,
};
use crate::crypto::{CipherState, LengthObfuscator, SipKeys};

use super::Inbound;
use super::padding::{PaddingOptions, PaddingPolicy};
use super::payload::{Block, parse_blocks, write_blocks};

/// Largest block payload that fits one frame alongside the MAC.
const MAX_PAYLOAD: usize = NTCP2_MAX_FRAME_SIZE - MAC_SIZE;

/// AEAD frame codec with obfuscated lengths.
pub struct Ntcp2Codec {
    send: CipherState,
    recv: CipherState,
    send_len: LengthObfuscator,
    recv_len: LengthObfuscator,
    our_options: PaddingOptions,
    policy: PaddingPolicy,
    pending: Vec<u8>,
    frame_len: Option<usize>,
    frames_received: u64,
}

impl Ntcp2Codec {
    /// Build from the split cipher states and SipHash keys of each direction.
    pub fn new(send: CipherState, recv: CipherState, send_sip: SipKeys, recv_sip: SipKeys) -> Self {
        let our_options = PaddingOptions::default();
        Self {
            send,
            recv,
            send_len: LengthObfuscator::new(send_sip),
            recv_len: LengthObfuscator::new(recv_sip),
            our_options,
            policy: our_options.merge(&PaddingOptions::default()),
            pending: Vec::new(),
            frame_len: None,
            frames_received: 0,
        }
    }

    /// Options we advertise.
    pub fn options(&self) -> &PaddingOptions {
        &self.our_options
    }

    /// Current send padding policy.
    pub fn policy(&self) -> &PaddingPolicy {
        &self.policy
    }

    /// Frames successfully decrypted so far.
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Merge the peer's advertised options into our send policy.
    pub fn apply_peer_options(&mut self, theirs: &PaddingOptions) {
        self.policy = self.our_options.merge(theirs);
        debug!(policy = ?self.policy, "padding policy updated");
    }

    /// Encrypt `blocks` into one frame, appending random padding.
    pub fn encode_blocks(&mut self, mut blocks: Vec<Block>) -> Result<Vec<u8>, CodecError> {
        let size: usize = blocks.iter().map(Block::size).sum();
        if size > MAX_PAYLOAD {
            return Err(CodecError::Oversized(size));
        }
        let room = MAX_PAYLOAD - size;
        if room > BLOCK_HEADER_SIZE {
            let pad = self.policy.padding_len(size, room - BLOCK_HEADER_SIZE);
            if pad > 0 {
                blocks.push(Block::Padding(pad));
            }
        }
        let payload = write_blocks(&blocks);
        let ct = self.send.encrypt_with_ad(&[], &payload)?;
        let mut frame = Vec::with_capacity(2 + ct.len());
        frame.extend_from_slice(&self.send_len.obfuscate(ct.len() as u16));
        frame.extend_from_slice(&ct);
        Ok(frame)
    }

    /// Frame one message.
    pub fn encode_message(&mut self, msg: &I2npMessage) -> Result<Vec<u8>, CodecError> {
        self.encode_blocks(vec![Block::I2np(msg.clone())])
    }

    /// Frame a DATETIME block.
    pub fn encode_datetime(&mut self, now_secs: u32) -> Result<Vec<u8>, CodecError> {
        self.encode_blocks(vec![Block::DateTime(now_secs)])
    }

    /// Frame our OPTIONS block.
    pub fn encode_options(&mut self) -> Result<Vec<u8>, CodecError> {
        let opts = self.our_options;
        self.encode_blocks(vec![Block::Options(opts)])
    }

    /// Frame a TERMINATION block carrying the frames received so far.
    pub fn encode_termination(&mut self, reason: u8) -> Result<Vec<u8>, CodecError> {
        let valid_frames = self.frames_received;
        self.encode_blocks(vec![Block::Termination { valid_frames, reason }])
    }

    /// Decrypt `data`, pushing the events of every complete frame to `out`.
    ///
    /// A peer TERMINATION surfaces as [`CodecError::Terminated`] after any
    /// preceding blocks of the same frame have been delivered.
    pub fn decode(&mut self, data: &[u8], now_secs: u32, out: &mut Vec<Inbound>) -> Result<(), CodecError> {
        self.pending.extend_from_slice(data);
        loop {
            let len = match self.frame_len {
                Some(len) => len,
                None => {
                    if self.pending.len() < 2 {
                        return Ok(());
                    }
                    let len = self.recv_len.deobfuscate([self.pending[0], self.pending[1]]) as usize;
                    self.pending.drain(..2);
                    if len < MAC_SIZE {
                        return Err(CodecError::ProtocolViolation(format!("frame length {len}")));
                    }
                    self.frame_len = Some(len);
                    len
                }
            };
            if self.pending.len() < len {
                return Ok(());
            }
            self.frame_len = None;
            let ct: Vec<u8> = self.pending.drain(..len).collect();
            let payload = self
                .recv
                .decrypt_with_ad(&[], &ct)
                .map_err(|_| CodecError::AuthenticationFailure)?;
            self.frames_received += 1;
            trace!(len, frames = self.frames_received, "frame received");
            self.dispatch(parse_blocks(&payload)?, now_secs, out)?;
        }
    }

    fn dispatch(&mut self, blocks: Vec<Block>, now_secs: u32, out: &mut Vec<Inbound>) -> Result<(), CodecError> {
        for block in blocks {
            match block {
                Block::DateTime(ts) => {
                    let skew = now_secs as i64 - ts as i64;
                    if skew.abs() > MAX_SKEW_SECS {
                        return Err(CodecError::ClockSkewExceeded { skew_secs: skew });
                    }
                    out.push(Inbound::ClockSkew(skew));
                }
                Block::Options(theirs) => {
                    self.apply_peer_options(&theirs);
                    out.push(Inbound::Options(theirs));
                }
                Block::RouterInfo { info, .. } => out.push(Inbound::RouterInfo(info)),
                Block::I2np(msg) => out.push(Inbound::Message(msg)),
                Block::Termination { valid_frames, reason } => {
                    debug!(valid_frames, reason, "peer terminated");
                    return Err(CodecError::Terminated { reason });
                }
                Block::Padding(_) | Block::Unknown(_) => {}
            }
        }
        Ok(())
    }

    /// Wipe both cipher states.
    pub fn destroy(&mut self) {
        self.send.destroy();
        self.recv.destroy();
    }
}

impl std::fmt::Debug for Ntcp2Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ntcp2Codec")
            .field("send", &self.send)
            .field("recv", &self.recv)
            .field("frames_received", &self.frames_received)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload::REASON_TIMEOUT;
    use crate::crypto::derive_sip_keys;
    use proptest::prelude::*;

    fn pair() -> (Ntcp2Codec, Ntcp2Codec) {
        let (ab, ba) = derive_sip_keys(&[7u8; 32], &[8u8; 32]).unwrap();
        let alice = Ntcp2Codec::new(
            CipherState::new([1u8; 32]),
            CipherState::new([2u8; 32]),
            ab.clone(),
            ba.clone(),
        );
        let bob = Ntcp2Codec::new(
            CipherState::new([2u8; 32]),
            CipherState::new([1u8; 32]),
            ba,
            ab,
        );
        (alice, bob)
    }

    #[test]
    fn test_message_both_directions() {
        let (mut alice, mut bob) = pair();
        let m = I2npMessage::new(18, 1, 5_000, vec![3; 100]);
        let mut out = Vec::new();
        bob.decode(&alice.encode_message(&m).unwrap(), 0, &mut out).unwrap();
        alice.decode(&bob.encode_message(&m).unwrap(), 0, &mut out).unwrap();
        assert_eq!(out, vec![Inbound::Message(m.clone()), Inbound::Message(m)]);
        assert_eq!(bob.frames_received(), 1);
    }

    #[test]
    fn test_termination_surfaces_as_error() {
        let (mut alice, mut bob) = pair();
        let mut out = Vec::new();
        let frame = alice.encode_termination(REASON_TIMEOUT).unwrap();
        assert_eq!(
            bob.decode(&frame, 0, &mut out),
            Err(CodecError::Terminated { reason: REASON_TIMEOUT })
        );
    }

    #[test]
    fn test_tampered_frame_fails_auth() {
        let (mut alice, mut bob) = pair();
        let mut frame = alice.encode_datetime(100).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut out = Vec::new();
        assert_eq!(bob.decode(&frame, 100, &mut out), Err(CodecError::AuthenticationFailure));
    }

    #[test]
    fn test_short_frame_rejected() {
        let (mut alice, mut bob) = pair();
        // obfuscate a length of 10 with alice's send state
        let len = alice.send_len.obfuscate(10);
        let mut out = Vec::new();
        assert!(matches!(
            bob.decode(&len, 0, &mut out),
            Err(CodecError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_datetime_skew() {
        let (mut alice, mut bob) = pair();
        let mut out = Vec::new();
        bob.decode(&alice.encode_datetime(1_000).unwrap(), 990, &mut out).unwrap();
        assert_eq!(out, vec![Inbound::ClockSkew(-10)]);
        assert_eq!(
            bob.decode(&alice.encode_datetime(1_000).unwrap(), 1_061, &mut out),
            Err(CodecError::ClockSkewExceeded { skew_secs: 61 })
        );
    }

    #[test]
    fn test_options_update_policy() {
        let (mut alice, mut bob) = pair();
        let mut out = Vec::new();
        bob.our_options = PaddingOptions {
            recv_max: 0.0,
            ..PaddingOptions::default()
        };
        alice.decode(&bob.encode_options().unwrap(), 0, &mut out).unwrap();
        assert!(matches!(out[0], Inbound::Options(_)));
        assert_eq!(alice.policy().max, 0.0);
    }

    #[test]
    fn test_destroy_stops_encryption_keys() {
        let (mut alice, _) = pair();
        alice.destroy();
        assert!(!alice.send.has_key());
        assert!(!alice.recv.has_key());
    }

    proptest! {
        #[test]
        fn prop_stream_reassembly(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..6),
            split in 1usize..40,
        ) {
            let (mut alice, mut bob) = pair();
            let msgs: Vec<_> = payloads
                .into_iter()
                .enumerate()
                .map(|(i, p)| I2npMessage::new(1, i as u32, 2_000, p))
                .collect();
            let mut wire = Vec::new();
            for m in &msgs {
                wire.extend(alice.encode_message(m).unwrap());
            }
            let mut out = Vec::new();
            for chunk in wire.chunks(split) {
                bob.decode(chunk, 0, &mut out).unwrap();
            }
            let expected: Vec<_> = msgs.into_iter().map(Inbound::Message).collect();
            prop_assert_eq!(out, expected);
        }
    }
}
