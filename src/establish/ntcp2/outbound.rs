//! Alice's side of the Noise handshake.

use std::time::Instant;

use rand::{Rng, RngCore, thread_rng};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::codec::{Block, FrameCodec, PaddingOptions, payload::write_blocks};
use crate::core::{
    BLOCK_HEADER_SIZE, EstablishError, IV_SIZE, KEY_SIZE, MAC_SIZE, MAX_SKEW_SECS, MSG1_SIZE,
    MSG2_SIZE, NTCP2_INT_VERSION, OPTIONS1_SIZE, OPTIONS3_SIZE, PADDING1_MAX, PADDING3_MAX,
};
use crate::crypto::HandshakeState;
use crate::establish::{Established, Step, peer_skew};
use crate::router::{RouterIdentity, RouterInfo};
use crate::transport::TransportContext;

use super::{data_phase, deobfuscate_key, obfuscate_key, u16_at, u32_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Init,
    SentX,
    GotY,
    Done,
}

/// Initiator state.
pub struct OutboundNtcp2 {
    stage: Stage,
    peer: RouterIdentity,
    bob_static: [u8; KEY_SIZE],
    bob_iv: [u8; IV_SIZE],
    created: Instant,
    hs: Option<HandshakeState>,
    buf: Vec<u8>,
    padlen2: usize,
    padlen3: usize,
    skew_secs: i64,
}

impl OutboundNtcp2 {
    /// Initiator towards `peer`, which must publish an NTCP2 static key and IV.
    pub fn new(peer: &RouterInfo, created: Instant) -> Result<Self, EstablishError> {
        let addr = peer
            .best_address(true)
            .filter(|a| a.supports_ntcp2())
            .ok_or_else(|| EstablishError::ProtocolViolation("peer has no NTCP2 address".into()))?;
        let (Some(bob_static), Some(bob_iv)) = (addr.static_key, addr.iv) else {
            return Err(EstablishError::ProtocolViolation("peer has no NTCP2 address".into()));
        };
        if bob_static == [0; KEY_SIZE] || bob_iv == [0; IV_SIZE] {
            return Err(EstablishError::ProtocolViolation("zero NTCP2 key or IV".into()));
        }
        Ok(Self {
            stage: Stage::Init,
            peer: peer.identity().clone(),
            bob_static,
            bob_iv,
            created,
            hs: None,
            buf: Vec::new(),
            padlen2: 0,
            padlen3: thread_rng().gen_range(0..PADDING3_MAX),
            skew_secs: 0,
        })
    }

    fn msg3p2_len(&self, ri_size: usize) -> usize {
        (BLOCK_HEADER_SIZE + 1 + ri_size)
            + (BLOCK_HEADER_SIZE + OPTIONS3_SIZE)
            + (BLOCK_HEADER_SIZE + self.padlen3)
            + MAC_SIZE
    }

    /// Message 1 with its padding.
    pub fn prepare_outbound(&mut self, ctx: &TransportContext) -> Result<Vec<u8>, EstablishError> {
        if self.stage != Stage::Init {
            return Err(EstablishError::ProtocolViolation("message 1 already sent".into()));
        }
        let mut rng = thread_rng();
        let padlen1 = rng.gen_range(0..PADDING1_MAX);
        let ri_size = ctx.local().router_info().to_bytes().len();

        let mut options = [0u8; OPTIONS1_SIZE];
        options[1] = NTCP2_INT_VERSION;
        options[2..4].copy_from_slice(&(padlen1 as u16).to_be_bytes());
        options[4..6].copy_from_slice(&(self.msg3p2_len(ri_size) as u16).to_be_bytes());
        options[8..12].copy_from_slice(&ctx.clock().now_secs().to_be_bytes());

        let mut hs = HandshakeState::initiator(ctx.local().static_keys(), &self.bob_static);
        let mut msg1 = hs.write_message(&options)?;
        debug_assert_eq!(msg1.len(), MSG1_SIZE);
        self.bob_iv = obfuscate_key(&mut msg1, &self.peer.hash(), &self.bob_iv)?;

        if padlen1 > 0 {
            let start = msg1.len();
            msg1.resize(start + padlen1, 0);
            rng.fill_bytes(&mut msg1[start..]);
            hs.mix_hash(&msg1[start..]);
        }
        self.hs = Some(hs);
        self.stage = Stage::SentX;
        debug!(peer = %self.peer.hash(), padlen1, "sending noise message 1");
        Ok(msg1)
    }

    /// Feed received bytes.
    pub fn receive(&mut self, ctx: &TransportContext, src: &[u8]) -> Result<Step, EstablishError> {
        self.buf.extend_from_slice(src);
        if self.stage == Stage::SentX {
            if self.buf.len() < MSG2_SIZE {
                return Ok(Step::default());
            }
            let mut msg2: Vec<u8> = self.buf.drain(..MSG2_SIZE).collect();
            self.process_msg2(ctx, &mut msg2)?;
            self.stage = Stage::GotY;
        }
        match self.stage {
            Stage::GotY => {
                if self.buf.len() < self.padlen2 {
                    return Ok(Step::default());
                }
                if self.buf.len() > self.padlen2 {
                    return Err(EstablishError::ProtocolViolation(format!(
                        "{} extra bytes after message 2",
                        self.buf.len() - self.padlen2
                    )));
                }
                let pad = std::mem::take(&mut self.buf);
                if !pad.is_empty() {
                    self.handshake()?.mix_hash(&pad);
                }
                let (msg3, established) = self.send_msg3(ctx)?;
                Ok(Step {
                    output: msg3,
                    established: Some(established),
                })
            }
            Stage::Init => Err(EstablishError::ProtocolViolation("data before message 1".into())),
            Stage::Done => Err(EstablishError::ProtocolViolation("handshake finished".into())),
            Stage::SentX => Ok(Step::default()),
        }
    }

    fn handshake(&mut self) -> Result<&mut HandshakeState, EstablishError> {
        self.hs
            .as_mut()
            .ok_or(EstablishError::ProtocolViolation("handshake destroyed".into()))
    }

    fn process_msg2(&mut self, ctx: &TransportContext, msg2: &mut [u8]) -> Result<(), EstablishError> {
        let peer = self.peer.hash();
        deobfuscate_key(msg2, &peer, &self.bob_iv)?;
        let options2 = self
            .handshake()?
            .read_message(msg2)
            .map_err(|e| EstablishError::AuthenticationFailure(format!("message 2: {e}")))?;
        self.padlen2 = u16_at(&options2, 2);
        let ts_b = u32_at(&options2, 8);

        let now = ctx.clock().now();
        let rtt = self.created.elapsed().as_millis() as u64;
        let skew = peer_skew(now, ts_b, rtt);
        if skew.abs() > MAX_SKEW_SECS {
            return Err(EstablishError::ClockSkewExceeded { skew_secs: skew });
        }
        self.skew_secs = skew;
        debug!(%peer, skew_secs = skew, padlen2 = self.padlen2, "noise message 2 verified");
        Ok(())
    }

    fn send_msg3(&mut self, ctx: &TransportContext) -> Result<(Vec<u8>, Established), EstablishError> {
        let blocks = [
            Block::RouterInfo {
                flood: false,
                info: ctx.local().router_info().to_bytes(),
            },
            Block::Options(PaddingOptions::default()),
            Block::Padding(self.padlen3),
        ];
        let payload = write_blocks(&blocks);
        let hs = self.handshake()?;
        let msg3 = hs.write_message(&payload)?;
        // Bob's options arrive in his first data frame.
        let codec = data_phase(hs, None)?;

        info!(
            peer = %self.peer.hash(),
            skew_secs = self.skew_secs,
            "outbound noise handshake complete"
        );
        let established = Established {
            codec: FrameCodec::Ntcp2(codec),
            peer: self.peer.clone(),
            peer_info: None,
            skew_secs: self.skew_secs,
            extra: Vec::new(),
        };
        self.destroy();
        Ok((msg3, established))
    }

    /// Wipe key material and scratch buffers.
    pub fn destroy(&mut self) {
        self.stage = Stage::Done;
        if let Some(mut hs) = self.hs.take() {
            hs.destroy();
        }
        self.buf.zeroize();
    }
}

impl std::fmt::Debug for OutboundNtcp2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundNtcp2")
            .field("stage", &self.stage)
            .field("peer", &self.peer.hash())
            .finish_non_exhaustive()
    }
}
