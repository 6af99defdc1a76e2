//! Bob's side of the legacy handshake.

use std::mem;
use std::net::IpAddr;
use std::time::Instant;

use rand::{RngCore, thread_rng};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::codec::{FrameCodec, LegacyCodec};
use crate::core::{
    AES_BLOCK_SIZE, DecodeError, EstablishError, HXY_SIZE, HXY_TSB_PAD_SIZE, IV_SIZE, MAX_RI_SIZE,
    MIN_RI_SIZE, NTCP1_MSG1_SIZE, XY_SIZE,
};
use crate::crypto::aes_cbc::{cbc_encrypt, last_block};
use crate::crypto::{CbcDecryptor, DhKeypair, SessionKey, sha256};
use crate::establish::{Established, Step, peer_skew};
use crate::router::{RouterIdentity, signature_len, signature_type};
use crate::transport::TransportContext;

use super::{check_skew, round_up, signed_data};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Msg1,
    Msg3,
    Done,
}

/// Responder state.
pub struct InboundLegacy {
    stage: Stage,
    remote_ip: Option<IpAddr>,
    created: Instant,
    buf: Vec<u8>,
    dh: Option<DhKeypair>,
    x: [u8; XY_SIZE],
    y: [u8; XY_SIZE],
    hx_xor: [u8; HXY_SIZE],
    key: Option<SessionKey>,
    ts_b: u32,
    msg2_tail: [u8; IV_SIZE],
    decryptor: Option<CbcDecryptor>,
    plain: Vec<u8>,
    last_cipher: [u8; IV_SIZE],
    ident_size: usize,
    expected: Option<usize>,
}

impl InboundLegacy {
    /// Fresh responder for a connection accepted at `created`.
    pub fn new(remote_ip: Option<IpAddr>, created: Instant) -> Self {
        let dh = DhKeypair::generate();
        let y = *dh.public_value();
        Self {
            stage: Stage::Msg1,
            remote_ip,
            created,
            buf: Vec::new(),
            dh: Some(dh),
            x: [0; XY_SIZE],
            y,
            hx_xor: [0; HXY_SIZE],
            key: None,
            ts_b: 0,
            msg2_tail: [0; IV_SIZE],
            decryptor: None,
            plain: Vec::new(),
            last_cipher: [0; IV_SIZE],
            ident_size: 0,
            expected: None,
        }
    }

    /// Feed received bytes.
    pub fn receive(&mut self, ctx: &TransportContext, src: &[u8]) -> Result<Step, EstablishError> {
        self.buf.extend_from_slice(src);
        let mut output = Vec::new();
        if self.stage == Stage::Msg1 {
            if self.buf.len() < NTCP1_MSG1_SIZE {
                return Ok(Step::default());
            }
            let msg1: Vec<u8> = self.buf.drain(..NTCP1_MSG1_SIZE).collect();
            output = self.process_msg1(ctx, &msg1)?;
            self.stage = Stage::Msg3;
        }
        if self.stage == Stage::Msg3 && self.read_msg3()? {
            let (msg4, established) = self.verify(ctx)?;
            output.extend_from_slice(&msg4);
            self.stage = Stage::Done;
            return Ok(Step {
                output,
                established: Some(established),
            });
        }
        Ok(Step {
            output,
            established: None,
        })
    }

    /// Check message 1 and build message 2.
    fn process_msg1(&mut self, ctx: &TransportContext, msg1: &[u8]) -> Result<Vec<u8>, EstablishError> {
        self.x.copy_from_slice(&msg1[..XY_SIZE]);
        self.hx_xor.copy_from_slice(&msg1[XY_SIZE..]);

        let mut expected = sha256(&self.x);
        for (e, h) in expected.iter_mut().zip(ctx.local().hash().as_bytes()) {
            *e ^= h;
        }
        if expected != self.hx_xor {
            return Err(EstablishError::AuthenticationFailure("invalid H(X) xor H(Bob)".into()));
        }
        if ctx.replay_cache().check_and_insert(&self.hx_xor) {
            return Err(EstablishError::Replay);
        }

        let dh = self
            .dh
            .as_ref()
            .ok_or(EstablishError::ProtocolViolation("handshake destroyed".into()))?;
        let key = dh.session_key(&self.x)?;

        let mut xy = Vec::with_capacity(2 * XY_SIZE);
        xy.extend_from_slice(&self.x);
        xy.extend_from_slice(&self.y);
        self.ts_b = ctx.clock().now_secs();
        let mut enc = [0u8; HXY_TSB_PAD_SIZE];
        enc[..HXY_SIZE].copy_from_slice(&sha256(&xy));
        enc[HXY_SIZE..HXY_SIZE + 4].copy_from_slice(&self.ts_b.to_be_bytes());
        thread_rng().fill_bytes(&mut enc[HXY_SIZE + 4..]);
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&self.y[XY_SIZE - IV_SIZE..]);
        cbc_encrypt(key.as_bytes(), &iv, &mut enc)?;
        self.msg2_tail = last_block(&enc)?;

        let mut msg3_iv = [0u8; IV_SIZE];
        msg3_iv.copy_from_slice(&self.hx_xor[HXY_SIZE - IV_SIZE..]);
        self.decryptor = Some(CbcDecryptor::new(key.as_bytes(), &msg3_iv));
        self.key = Some(key);

        debug!(ts_b = self.ts_b, "sending legacy message 2");
        let mut msg2 = Vec::with_capacity(XY_SIZE + HXY_TSB_PAD_SIZE);
        msg2.extend_from_slice(&self.y);
        msg2.extend_from_slice(&enc);
        Ok(msg2)
    }

    /// Decrypt whole message 3 blocks; true once it is complete.
    fn read_msg3(&mut self) -> Result<bool, EstablishError> {
        let decryptor = self
            .decryptor
            .as_mut()
            .ok_or(EstablishError::ProtocolViolation("message 3 before message 1".into()))?;
        while self.buf.len() >= AES_BLOCK_SIZE && self.expected.is_none_or(|e| self.plain.len() < e) {
            let mut block = [0u8; AES_BLOCK_SIZE];
            block.copy_from_slice(&self.buf[..AES_BLOCK_SIZE]);
            self.buf.drain(..AES_BLOCK_SIZE);
            self.last_cipher = block;
            decryptor.decrypt(&mut block)?;
            self.plain.extend_from_slice(&block);

            if self.ident_size == 0 {
                let sz = u16::from_be_bytes([self.plain[0], self.plain[1]]) as usize;
                if !(MIN_RI_SIZE..=MAX_RI_SIZE).contains(&sz) {
                    return Err(EstablishError::ProtocolViolation(format!("identity size {sz}")));
                }
                self.ident_size = sz;
            }
            if self.expected.is_none() {
                // the identity's certificate decides the signature length
                let sig_type = match signature_type(&self.plain[2..]) {
                    Ok(t) => t,
                    Err(DecodeError::UnexpectedEof) => continue,
                    Err(e) => return Err(e.into()),
                };
                let sig_len = signature_len(sig_type).ok_or(DecodeError::UnsupportedType(sig_type))?;
                self.expected = Some(round_up(2 + self.ident_size + 4 + sig_len));
                debug!(sig_type, sig_len, expected = ?self.expected, "legacy message 3 length");
            }
        }
        Ok(self.expected == Some(self.plain.len()))
    }

    /// Authenticate Alice and build message 4.
    fn verify(&mut self, ctx: &TransportContext) -> Result<(Vec<u8>, Established), EstablishError> {
        let sz = self.ident_size;
        let (ident, used) = RouterIdentity::from_bytes(&self.plain[2..2 + sz])?;
        if used != sz {
            return Err(EstablishError::ProtocolViolation(format!(
                "identity declares {sz} bytes, parsed {used}"
            )));
        }
        let off = 2 + sz;
        let ts_a = u32::from_be_bytes([
            self.plain[off],
            self.plain[off + 1],
            self.plain[off + 2],
            self.plain[off + 3],
        ]);
        let rtt = self.created.elapsed().as_millis() as u64;
        let skew = peer_skew(ctx.clock().now(), ts_a, rtt);

        let sig = &self.plain[self.plain.len() - ident.signature_len()..];
        let data = signed_data(&self.x, &self.y, &ctx.local().hash(), ts_a, self.ts_b);
        ident
            .verify(&data, sig)
            .map_err(|_| EstablishError::AuthenticationFailure("message 3 signature".into()))?;

        let peer = ident.hash();
        if ctx.banlist().is_banned_forever(&peer) {
            return Err(EstablishError::Banned);
        }
        let skew = check_skew(ctx, &peer, skew)?;

        let key = self
            .key
            .as_ref()
            .ok_or(EstablishError::ProtocolViolation("no session key".into()))?;
        let sig = ctx.local().sign(&signed_data(&self.x, &self.y, &peer, ts_a, self.ts_b));
        let mut msg4 = vec![0u8; round_up(sig.len())];
        msg4[..sig.len()].copy_from_slice(&sig);
        thread_rng().fill_bytes(&mut msg4[sig.len()..]);
        cbc_encrypt(key.as_bytes(), &self.msg2_tail, &mut msg4)?;

        let codec = LegacyCodec::new(key, &last_block(&msg4)?, &self.last_cipher);
        info!(%peer, skew_secs = skew, remote = ?self.remote_ip, "inbound legacy handshake verified");
        let established = Established {
            codec: FrameCodec::Legacy(codec),
            peer: ident,
            peer_info: None,
            skew_secs: skew,
            extra: mem::take(&mut self.buf),
        };
        self.destroy();
        Ok((msg4, established))
    }

    /// Wipe key material and scratch buffers.
    pub fn destroy(&mut self) {
        self.stage = Stage::Done;
        self.dh = None;
        self.key = None;
        self.decryptor = None;
        self.plain.zeroize();
        self.buf.zeroize();
        self.hx_xor.zeroize();
    }
}

impl std::fmt::Debug for InboundLegacy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundLegacy")
            .field("stage", &self.stage)
            .field("remote_ip", &self.remote_ip)
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::{RouterClock, TransportConfigBuilder};
    use crate::router::CERT_NULL;
    use crate::transport::context::testing::context_with;

    #[test]
    fn test_msg3_length_follows_signature_type() {
        let config = TransportConfigBuilder::new().ntcp2(false).build();
        let (ctx, _) = context_with(config.clone(), RouterClock::synchronized());
        let (alice_ctx, _) = context_with(config, RouterClock::synchronized());
        let mut bob = InboundLegacy::new(None, Instant::now());

        let alice = DhKeypair::generate();
        let x = *alice.public_value();
        let mut hx_xor = sha256(&x);
        for (e, h) in hx_xor.iter_mut().zip(ctx.local().hash().as_bytes()) {
            *e ^= h;
        }
        let mut msg1 = x.to_vec();
        msg1.extend_from_slice(&hx_xor);
        let msg2 = bob.receive(&ctx, &msg1).unwrap().output;
        let key = alice.session_key(&msg2[..XY_SIZE]).unwrap();

        // DSA-SHA1 identity: null certificate, 40-byte signature
        let mut ident = alice_ctx.local().identity().as_bytes()[..MIN_RI_SIZE].to_vec();
        ident[384..].copy_from_slice(&[CERT_NULL, 0, 0]);
        let mut msg3 = Vec::new();
        msg3.extend_from_slice(&(MIN_RI_SIZE as u16).to_be_bytes());
        msg3.extend_from_slice(&ident);
        msg3.extend_from_slice(&ctx.clock().now_secs().to_be_bytes());
        msg3.resize(round_up(msg3.len() + 40), 0);
        assert_eq!(msg3.len(), 448);
        let iv: [u8; IV_SIZE] = hx_xor[HXY_SIZE - IV_SIZE..].try_into().unwrap();
        cbc_encrypt(key.as_bytes(), &iv, &mut msg3).unwrap();

        // message 3 ends after the 40-byte signature; Bob judges it right away
        let result = bob.receive(&ctx, &msg3);
        assert_eq!(bob.expected, Some(448));
        assert!(
            matches!(result, Err(EstablishError::AuthenticationFailure(_))),
            "{result:?}"
        );
    }
}
