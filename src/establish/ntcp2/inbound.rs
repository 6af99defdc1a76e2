//! Bob's side of the Noise handshake.

use std::mem;
use std::net::IpAddr;
use std::time::Instant;

use rand::{Rng, RngCore, thread_rng};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::codec::payload::parse_blocks;
use crate::codec::{Block, FrameCodec};
use crate::core::{
    EstablishError, IV_SIZE, KEY_SIZE, MAX_SKEW_SECS, MSG1_SIZE, MSG3P1_SIZE, NTCP2_INT_VERSION,
    OPTIONS2_SIZE, PADDING1_FAIL_MAX, PADDING2_MAX, TOTAL1_MAX,
};
use crate::crypto::HandshakeState;
use crate::establish::{Established, Step, peer_skew};
use crate::router::RouterInfo;
use crate::transport::TransportContext;

use super::{MIN_MSG3P2_SIZE, data_phase, deobfuscate_key, obfuscate_key, u16_at, u32_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Msg1,
    Padding1,
    Msg3,
    Stalling,
    Done,
}

/// Responder state.
pub struct InboundNtcp2 {
    stage: Stage,
    remote_ip: Option<IpAddr>,
    created: Instant,
    hs: Option<HandshakeState>,
    buf: Vec<u8>,
    msg2_iv: [u8; IV_SIZE],
    padlen1: usize,
    msg3p2_len: usize,
    skew_secs: i64,
    stall_remaining: usize,
    stall_error: Option<EstablishError>,
}

impl InboundNtcp2 {
    /// Fresh responder for a connection accepted at `created`.
    pub fn new(remote_ip: Option<IpAddr>, created: Instant) -> Self {
        Self {
            stage: Stage::Msg1,
            remote_ip,
            created,
            hs: None,
            buf: Vec::new(),
            msg2_iv: [0; IV_SIZE],
            padlen1: 0,
            msg3p2_len: 0,
            skew_secs: 0,
            stall_remaining: 0,
            stall_error: None,
        }
    }

    /// Whether a failed message 1 is being drained before failing.
    pub fn is_stalling(&self) -> bool {
        self.stage == Stage::Stalling
    }

    /// Feed received bytes.
    pub fn receive(&mut self, ctx: &TransportContext, src: &[u8]) -> Result<Step, EstablishError> {
        if self.stage == Stage::Stalling {
            return self.absorb(src.len());
        }
        self.buf.extend_from_slice(src);
        let mut output = Vec::new();

        if self.stage == Stage::Msg1 {
            if self.buf.len() < MSG1_SIZE {
                return Ok(Step::default());
            }
            let mut msg1: Vec<u8> = self.buf.drain(..MSG1_SIZE).collect();
            match self.process_msg1(ctx, &mut msg1) {
                Ok(()) => self.stage = Stage::Padding1,
                Err(e @ EstablishError::AuthenticationFailure(_)) => return self.stall(e),
                Err(e) => return Err(e),
            }
        }

        if self.stage == Stage::Padding1 {
            if self.buf.len() < self.padlen1 {
                return Ok(Step::default());
            }
            let pad: Vec<u8> = self.buf.drain(..self.padlen1).collect();
            if !pad.is_empty() {
                self.handshake()?.mix_hash(&pad);
            }
            output = self.build_msg2(ctx)?;
            self.stage = Stage::Msg3;
        }

        if self.stage == Stage::Msg3 {
            let msg3_len = MSG3P1_SIZE + self.msg3p2_len;
            if self.buf.len() >= msg3_len {
                let msg3: Vec<u8> = self.buf.drain(..msg3_len).collect();
                let (options, established) = self.process_msg3(ctx, &msg3)?;
                output.extend(options);
                return Ok(Step {
                    output,
                    established: Some(established),
                });
            }
            return Ok(Step {
                output,
                established: None,
            });
        }

        Err(EstablishError::ProtocolViolation("handshake finished".into()))
    }

    fn handshake(&mut self) -> Result<&mut HandshakeState, EstablishError> {
        self.hs
            .as_mut()
            .ok_or(EstablishError::ProtocolViolation("handshake destroyed".into()))
    }

    /// Absorb a random amount of further input before reporting `error`,
    /// so a prober cannot tell a bad message 1 from a slow handshake.
    fn stall(&mut self, error: EstablishError) -> Result<Step, EstablishError> {
        let buffered = self.buf.len();
        let n = thread_rng().gen_range(0..PADDING1_FAIL_MAX);
        self.destroy();
        if n <= buffered {
            return Err(error);
        }
        debug!(remote = ?self.remote_ip, bytes = n - buffered, "stalling failed message 1");
        self.stage = Stage::Stalling;
        self.stall_remaining = n - buffered;
        self.stall_error = Some(error);
        Ok(Step::default())
    }

    fn absorb(&mut self, len: usize) -> Result<Step, EstablishError> {
        self.stall_remaining = self.stall_remaining.saturating_sub(len);
        if self.stall_remaining > 0 {
            return Ok(Step::default());
        }
        self.stage = Stage::Done;
        Err(self
            .stall_error
            .take()
            .unwrap_or(EstablishError::AuthenticationFailure("message 1".into())))
    }

    fn process_msg1(&mut self, ctx: &TransportContext, msg1: &mut [u8]) -> Result<(), EstablishError> {
        if ctx.replay_cache().check_and_insert(&msg1[..KEY_SIZE]) {
            return Err(EstablishError::Replay);
        }
        self.msg2_iv = deobfuscate_key(msg1, &ctx.local().hash(), ctx.local().ntcp2_iv())?;
        let mut hs = HandshakeState::responder(ctx.local().static_keys());
        let options = hs
            .read_message(msg1)
            .map_err(|e| EstablishError::AuthenticationFailure(format!("message 1: {e}")))?;
        self.hs = Some(hs);

        if options[1] != NTCP2_INT_VERSION {
            return Err(EstablishError::ProtocolViolation(format!("version {}", options[1])));
        }
        let padlen1 = u16_at(&options, 2);
        if padlen1 > TOTAL1_MAX - MSG1_SIZE {
            return Err(EstablishError::ProtocolViolation(format!("message 1 padding {padlen1}")));
        }
        let msg3p2_len = u16_at(&options, 4);
        if msg3p2_len < MIN_MSG3P2_SIZE {
            return Err(EstablishError::ProtocolViolation(format!("message 3 length {msg3p2_len}")));
        }
        let ts_a = u32_at(&options, 8);
        let skew = peer_skew(ctx.clock().now(), ts_a, 0);
        if skew.abs() > MAX_SKEW_SECS {
            return Err(EstablishError::ClockSkewExceeded { skew_secs: skew });
        }
        self.padlen1 = padlen1;
        self.msg3p2_len = msg3p2_len;
        self.skew_secs = skew;
        debug!(remote = ?self.remote_ip, padlen1, msg3p2_len, skew_secs = skew, "noise message 1 verified");
        Ok(())
    }

    fn build_msg2(&mut self, ctx: &TransportContext) -> Result<Vec<u8>, EstablishError> {
        let mut rng = thread_rng();
        let padlen2 = rng.gen_range(0..PADDING2_MAX);
        let mut options = [0u8; OPTIONS2_SIZE];
        options[2..4].copy_from_slice(&(padlen2 as u16).to_be_bytes());
        options[8..12].copy_from_slice(&ctx.clock().now_secs().to_be_bytes());

        let iv = self.msg2_iv;
        let hs = self.handshake()?;
        let mut msg2 = hs.write_message(&options)?;
        obfuscate_key(&mut msg2, &ctx.local().hash(), &iv)?;
        if padlen2 > 0 {
            let start = msg2.len();
            msg2.resize(start + padlen2, 0);
            rng.fill_bytes(&mut msg2[start..]);
            hs.mix_hash(&msg2[start..]);
        }
        Ok(msg2)
    }

    /// Verify message 3. Returns our first data frame, an OPTIONS block
    /// answering the initiator's, along with the finished handshake.
    fn process_msg3(
        &mut self,
        ctx: &TransportContext,
        msg3: &[u8],
    ) -> Result<(Vec<u8>, Established), EstablishError> {
        let hs = self.handshake()?;
        let payload = hs
            .read_message(msg3)
            .map_err(|e| EstablishError::AuthenticationFailure(format!("message 3: {e}")))?;
        let remote_static = hs
            .remote_static()
            .copied()
            .ok_or(EstablishError::ProtocolViolation("no static key in message 3".into()))?;

        let blocks = parse_blocks(&payload).map_err(|e| EstablishError::ProtocolViolation(e.to_string()))?;
        let Some(Block::RouterInfo { info, .. }) = blocks.first() else {
            return Err(EstablishError::ProtocolViolation(
                "message 3 does not start with a router info".into(),
            ));
        };
        let ri = RouterInfo::from_bytes(info)?;
        ri.verify()
            .map_err(|_| EstablishError::AuthenticationFailure("router info signature".into()))?;
        let expected = ctx.config().network_id;
        if ri.network_id() != expected {
            return Err(EstablishError::NetworkMismatch {
                expected,
                actual: ri.network_id(),
            });
        }
        if ri.ntcp2_static_key() != Some(&remote_static) {
            return Err(EstablishError::AuthenticationFailure("static key mismatch".into()));
        }
        let peer = ri.hash();
        if peer == ctx.local().hash() {
            return Err(EstablishError::ProtocolViolation("connection from ourselves".into()));
        }
        if ctx.banlist().is_banned(&peer) {
            return Err(EstablishError::Banned);
        }

        let options = blocks.iter().find_map(|b| match b {
            Block::Options(o) => Some(*o),
            _ => None,
        });
        let mut codec = data_phase(self.handshake()?, options.as_ref())?;
        let options_frame = codec
            .encode_options()
            .map_err(|e| EstablishError::ProtocolViolation(format!("options frame: {e}")))?;
        info!(
            %peer,
            skew_secs = self.skew_secs,
            remote = ?self.remote_ip,
            elapsed_ms = self.created.elapsed().as_millis() as u64,
            "inbound noise handshake complete"
        );
        let established = Established {
            codec: FrameCodec::Ntcp2(codec),
            peer: ri.identity().clone(),
            peer_info: Some(ri),
            skew_secs: self.skew_secs,
            extra: mem::take(&mut self.buf),
        };
        self.destroy();
        Ok((options_frame, established))
    }

    /// Wipe key material and scratch buffers.
    pub fn destroy(&mut self) {
        if self.stage != Stage::Stalling {
            self.stage = Stage::Done;
        }
        if let Some(mut hs) = self.hs.take() {
            hs.destroy();
        }
        self.buf.zeroize();
    }
}

impl std::fmt::Debug for InboundNtcp2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundNtcp2")
            .field("stage", &self.stage)
            .field("remote_ip", &self.remote_ip)
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}
