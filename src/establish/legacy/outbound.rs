//! Alice's side of the legacy handshake.

use std::mem;
use std::time::Instant;

use rand::{RngCore, thread_rng};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::codec::{FrameCodec, LegacyCodec};
use crate::core::{
    EstablishError, HXY_SIZE, HXY_TSB_PAD_SIZE, IV_SIZE, NTCP1_MSG2_SIZE, XY_SIZE,
};
use crate::crypto::aes_cbc::{cbc_decrypt, cbc_encrypt, last_block};
use crate::crypto::{DhKeypair, SessionKey, sha256};
use crate::establish::{Established, Step, peer_skew};
use crate::router::RouterIdentity;
use crate::transport::TransportContext;

use super::{check_skew, round_up, signed_data};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Init,
    Msg2,
    Msg4,
    Done,
}

/// Initiator state.
pub struct OutboundLegacy {
    stage: Stage,
    peer: RouterIdentity,
    created: Instant,
    buf: Vec<u8>,
    dh: Option<DhKeypair>,
    x: [u8; XY_SIZE],
    y: [u8; XY_SIZE],
    hx_xor: [u8; HXY_SIZE],
    key: Option<SessionKey>,
    ts_a: u32,
    ts_b: u32,
    skew_secs: i64,
    msg2_tail: [u8; IV_SIZE],
    msg3_tail: [u8; IV_SIZE],
}

impl OutboundLegacy {
    /// Initiator towards `peer`, whose connection was opened at `created`.
    pub fn new(peer: RouterIdentity, created: Instant) -> Self {
        let dh = DhKeypair::generate();
        let x = *dh.public_value();
        let mut hx_xor = sha256(&x);
        for (a, b) in hx_xor.iter_mut().zip(peer.hash().as_bytes()) {
            *a ^= b;
        }
        Self {
            stage: Stage::Init,
            peer,
            created,
            buf: Vec::new(),
            dh: Some(dh),
            x,
            y: [0; XY_SIZE],
            hx_xor,
            key: None,
            ts_a: 0,
            ts_b: 0,
            skew_secs: 0,
            msg2_tail: [0; IV_SIZE],
            msg3_tail: [0; IV_SIZE],
        }
    }

    /// Message 1.
    pub fn prepare_outbound(&mut self) -> Result<Vec<u8>, EstablishError> {
        if self.stage != Stage::Init {
            return Err(EstablishError::ProtocolViolation("message 1 already sent".into()));
        }
        self.stage = Stage::Msg2;
        let mut msg1 = Vec::with_capacity(XY_SIZE + HXY_SIZE);
        msg1.extend_from_slice(&self.x);
        msg1.extend_from_slice(&self.hx_xor);
        Ok(msg1)
    }

    /// Feed received bytes.
    pub fn receive(&mut self, ctx: &TransportContext, src: &[u8]) -> Result<Step, EstablishError> {
        self.buf.extend_from_slice(src);
        match self.stage {
            Stage::Init => Err(EstablishError::ProtocolViolation("data before message 1".into())),
            Stage::Msg2 => {
                if self.buf.len() < NTCP1_MSG2_SIZE {
                    return Ok(Step::default());
                }
                let msg2: Vec<u8> = self.buf.drain(..NTCP1_MSG2_SIZE).collect();
                let msg3 = self.process_msg2(ctx, &msg2)?;
                self.stage = Stage::Msg4;
                // Bob waits for message 3, nothing else can be buffered
                Ok(Step {
                    output: msg3,
                    established: None,
                })
            }
            Stage::Msg4 => {
                let msg4_len = round_up(self.peer.signature_len());
                if self.buf.len() < msg4_len {
                    return Ok(Step::default());
                }
                let msg4: Vec<u8> = self.buf.drain(..msg4_len).collect();
                let established = self.verify_msg4(ctx, msg4)?;
                Ok(Step {
                    output: Vec::new(),
                    established: Some(established),
                })
            }
            Stage::Done => Err(EstablishError::ProtocolViolation("handshake finished".into())),
        }
    }

    fn process_msg2(&mut self, ctx: &TransportContext, msg2: &[u8]) -> Result<Vec<u8>, EstablishError> {
        self.y.copy_from_slice(&msg2[..XY_SIZE]);
        let dh = self
            .dh
            .as_ref()
            .ok_or(EstablishError::ProtocolViolation("handshake destroyed".into()))?;
        let key = dh.session_key(&self.y)?;

        let mut enc = [0u8; HXY_TSB_PAD_SIZE];
        enc.copy_from_slice(&msg2[XY_SIZE..]);
        self.msg2_tail = last_block(&enc)?;
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&self.y[XY_SIZE - IV_SIZE..]);
        cbc_decrypt(key.as_bytes(), &iv, &mut enc)?;

        let mut xy = Vec::with_capacity(2 * XY_SIZE);
        xy.extend_from_slice(&self.x);
        xy.extend_from_slice(&self.y);
        if sha256(&xy) != enc[..HXY_SIZE] {
            return Err(EstablishError::AuthenticationFailure("invalid H(X|Y)".into()));
        }
        self.ts_b = u32::from_be_bytes([enc[32], enc[33], enc[34], enc[35]]);

        let now = ctx.clock().now();
        let rtt = self.created.elapsed().as_millis() as u64;
        let peer = self.peer.hash();
        self.skew_secs = check_skew(ctx, &peer, peer_skew(now, self.ts_b, rtt))?;
        // read after a possible clock step so Bob sees the corrected time
        self.ts_a = ctx.clock().now_secs();
        debug!(%peer, skew_secs = self.skew_secs, "legacy message 2 verified");

        let sig = ctx
            .local()
            .sign(&signed_data(&self.x, &self.y, &peer, self.ts_a, self.ts_b));
        let ident = ctx.local().identity().as_bytes();
        let total = round_up(2 + ident.len() + 4 + sig.len());
        let mut msg3 = Vec::with_capacity(total);
        msg3.extend_from_slice(&(ident.len() as u16).to_be_bytes());
        msg3.extend_from_slice(ident);
        msg3.extend_from_slice(&self.ts_a.to_be_bytes());
        let pad_start = msg3.len();
        msg3.resize(total - sig.len(), 0);
        thread_rng().fill_bytes(&mut msg3[pad_start..]);
        msg3.extend_from_slice(&sig);

        let mut msg3_iv = [0u8; IV_SIZE];
        msg3_iv.copy_from_slice(&self.hx_xor[HXY_SIZE - IV_SIZE..]);
        cbc_encrypt(key.as_bytes(), &msg3_iv, &mut msg3)?;
        self.msg3_tail = last_block(&msg3)?;
        self.key = Some(key);
        Ok(msg3)
    }

    fn verify_msg4(&mut self, ctx: &TransportContext, mut msg4: Vec<u8>) -> Result<Established, EstablishError> {
        let key = self
            .key
            .take()
            .ok_or(EstablishError::ProtocolViolation("message 4 before message 2".into()))?;
        let recv_iv = last_block(&msg4)?;
        cbc_decrypt(key.as_bytes(), &self.msg2_tail, &mut msg4)?;
        let sig = &msg4[..self.peer.signature_len()];
        let data = signed_data(&self.x, &self.y, &ctx.local().hash(), self.ts_a, self.ts_b);
        self.peer
            .verify(&data, sig)
            .map_err(|_| EstablishError::AuthenticationFailure("message 4 signature".into()))?;

        let codec = LegacyCodec::new(&key, &self.msg3_tail, &recv_iv);
        info!(peer = %self.peer.hash(), skew_secs = self.skew_secs, "outbound legacy handshake verified");
        let established = Established {
            codec: FrameCodec::Legacy(codec),
            peer: self.peer.clone(),
            peer_info: None,
            skew_secs: self.skew_secs,
            extra: mem::take(&mut self.buf),
        };
        self.destroy();
        Ok(established)
    }

    /// Wipe key material and scratch buffers.
    pub fn destroy(&mut self) {
        self.stage = Stage::Done;
        self.dh = None;
        self.key = None;
        self.buf.zeroize();
        self.hx_xor.zeroize();
    }
}

impl std::fmt::Debug for OutboundLegacy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundLegacy")
            .field("stage", &self.stage)
            .field("peer", &self.peer.hash())
            .finish_non_exhaustive()
    }
}
