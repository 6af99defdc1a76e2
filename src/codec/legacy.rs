//! Legacy (NTCP1) data phase.
//!
//! ```text
//! message frame: size(2) | message(size) | random pad | adler32(4)   total % 16 == 0
//! meta frame:    0u16 | timestamp_s(4) | random(6) | adler32(4)      16 bytes
//! ```
//!
//! Frames are encrypted with AES-256-CBC, each direction chaining on its
//! last ciphertext block for the whole life of the connection. The AES key
//! schedules are zeroized when dropped.

use rand::{RngCore, thread_rng};
use tracing::trace;
use zeroize::Zeroize;

use crate::core::{
    AES_BLOCK_SIZE, CLOCK_FUDGE_FACTOR_MS, CodecError, CryptoError, I2npMessage, IV_SIZE,
    MAX_MSG_SIZE, META_SIZE,
};
use crate::crypto::{CbcDecryptor, CbcEncryptor, SessionKey};

use super::Inbound;

/// Round `len` up to a whole number of AES blocks.
fn round_up(len: usize) -> usize {
    len.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE
}

/// Chained AES-CBC frame codec with Adler-32 integrity.
pub struct LegacyCodec {
    /// `None` once destroyed.
    encryptor: Option<CbcEncryptor>,
    decryptor: Option<CbcDecryptor>,
    /// Ciphertext not yet forming a whole block.
    pending: Vec<u8>,
    /// Plaintext of the frame being reassembled.
    frame: Vec<u8>,
    /// Total size of the frame being reassembled, once known.
    expected: Option<usize>,
}

impl LegacyCodec {
    /// Start both chains from the handshake's final ciphertext blocks.
    pub fn new(key: &SessionKey, send_iv: &[u8; IV_SIZE], recv_iv: &[u8; IV_SIZE]) -> Self {
        Self {
            encryptor: Some(CbcEncryptor::new(key.as_bytes(), send_iv)),
            decryptor: Some(CbcDecryptor::new(key.as_bytes(), recv_iv)),
            pending: Vec::new(),
            frame: Vec::new(),
            expected: None,
        }
    }

    /// Encode and encrypt one message frame.
    pub fn encode_message(&mut self, msg: &I2npMessage) -> Result<Vec<u8>, CodecError> {
        let data = msg.to_bytes();
        if data.len() > MAX_MSG_SIZE {
            return Err(CodecError::Oversized(data.len()));
        }
        let total = round_up(2 + data.len() + 4);
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
        frame.extend_from_slice(&data);
        let pad_start = frame.len();
        frame.resize(total - 4, 0);
        thread_rng().fill_bytes(&mut frame[pad_start..]);
        let checksum = adler::adler32_slice(&frame);
        frame.extend_from_slice(&checksum.to_be_bytes());
        self.encryptor()?.encrypt(&mut frame)?;
        Ok(frame)
    }

    /// Encode the keepalive frame carrying our time.
    pub fn encode_meta(&mut self, now_secs: u32) -> Result<Vec<u8>, CodecError> {
        let mut frame = vec![0u8; META_SIZE];
        frame[2..6].copy_from_slice(&now_secs.to_be_bytes());
        thread_rng().fill_bytes(&mut frame[6..12]);
        let checksum = adler::adler32_slice(&frame[..12]);
        frame[12..].copy_from_slice(&checksum.to_be_bytes());
        self.encryptor()?.encrypt(&mut frame)?;
        Ok(frame)
    }

    /// Decrypt `data`, pushing every completed frame's event to `out`.
    ///
    /// Partial frames are buffered across calls. A checksum mismatch or an
    /// excessive keepalive skew is fatal.
    pub fn decode(&mut self, data: &[u8], now_secs: u32, out: &mut Vec<Inbound>) -> Result<(), CodecError> {
        self.pending.extend_from_slice(data);
        let whole = self.pending.len() / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
        if whole == 0 {
            return Ok(());
        }
        let mut blocks: Vec<u8> = self.pending.drain(..whole).collect();
        self.decryptor
            .as_mut()
            .ok_or(CodecError::Crypto(CryptoError::InvalidKey))?
            .decrypt(&mut blocks)?;

        for block in blocks.chunks_exact(AES_BLOCK_SIZE) {
            if self.expected.is_none() {
                let size = u16::from_be_bytes([block[0], block[1]]) as usize;
                if size == 0 {
                    out.push(Self::read_meta(block, now_secs)?);
                    continue;
                }
                if size > MAX_MSG_SIZE {
                    return Err(CodecError::Oversized(size));
                }
                self.expected = Some(round_up(2 + size + 4));
            }
            self.frame.extend_from_slice(block);
            if Some(self.frame.len()) == self.expected {
                out.push(self.finish_frame()?);
            }
        }
        Ok(())
    }

    fn encryptor(&mut self) -> Result<&mut CbcEncryptor, CodecError> {
        self.encryptor.as_mut().ok_or(CodecError::Crypto(CryptoError::InvalidKey))
    }

    /// Whether both directions still hold their key schedule.
    pub fn has_keys(&self) -> bool {
        self.encryptor.is_some() && self.decryptor.is_some()
    }

    /// Drop both key schedules and wipe buffered plaintext. Idempotent.
    pub fn destroy(&mut self) {
        self.encryptor = None;
        self.decryptor = None;
        self.pending.zeroize();
        self.frame.zeroize();
        self.expected = None;
    }

    fn read_meta(block: &[u8], now_secs: u32) -> Result<Inbound, CodecError> {
        let expected = adler::adler32_slice(&block[..12]);
        let got = u32::from_be_bytes([block[12], block[13], block[14], block[15]]);
        if expected != got {
            return Err(CodecError::BadChecksum);
        }
        let ts = u32::from_be_bytes([block[2], block[3], block[4], block[5]]);
        let skew = now_secs as i64 - ts as i64;
        trace!(skew_secs = skew, "meta frame received");
        if skew.abs() * 1000 > CLOCK_FUDGE_FACTOR_MS {
            return Err(CodecError::ClockSkewExceeded { skew_secs: skew });
        }
        Ok(Inbound::ClockSkew(skew))
    }

    fn finish_frame(&mut self) -> Result<Inbound, CodecError> {
        self.expected = None;
        let frame = std::mem::take(&mut self.frame);
        let body = frame.len() - 4;
        let expected = adler::adler32_slice(&frame[..body]);
        let got = u32::from_be_bytes([frame[body], frame[body + 1], frame[body + 2], frame[body + 3]]);
        if expected != got {
            return Err(CodecError::BadChecksum);
        }
        let size = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let msg = I2npMessage::from_bytes(&frame[2..2 + size])?;
        Ok(Inbound::Message(msg))
    }
}

impl std::fmt::Debug for LegacyCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyCodec")
            .field("keyed", &self.has_keys())
            .field("pending", &self.pending.len())
            .field("frame", &self.frame.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair() -> (LegacyCodec, LegacyCodec) {
        let key = SessionKey::from_bytes([5u8; 32]);
        let a_to_b = [1u8; 16];
        let b_to_a = [2u8; 16];
        (
            LegacyCodec::new(&key, &a_to_b, &b_to_a),
            LegacyCodec::new(&key, &b_to_a, &a_to_b),
        )
    }

    #[test]
    fn test_frame_layout() {
        let (mut a, _) = pair();
        let msg = I2npMessage::new(1, 2, 3, vec![0; 10]);
        let frame = a.encode_message(&msg).unwrap();
        // 2 + 26 + 4 rounded up to 16
        assert_eq!(frame.len(), 32);
    }

    #[test]
    fn test_meta_frame() {
        let (mut a, mut b) = pair();
        let meta = a.encode_meta(1_000).unwrap();
        assert_eq!(meta.len(), 16);
        let mut out = Vec::new();
        b.decode(&meta, 1_030, &mut out).unwrap();
        assert_eq!(out, vec![Inbound::ClockSkew(30)]);

        let meta = a.encode_meta(1_000).unwrap();
        assert_eq!(
            b.decode(&meta, 1_100, &mut out),
            Err(CodecError::ClockSkewExceeded { skew_secs: 100 })
        );
    }

    #[test]
    fn test_bit_flip_breaks_checksum() {
        let (mut a, mut b) = pair();
        let m = I2npMessage::new(1, 1, 0, vec![0xaa; 40]);
        let mut f = a.encode_message(&m).unwrap();
        // the last block carries the checksum and now decrypts to garbage
        let last = f.len() - 1;
        f[last] ^= 0x01;
        let mut out = Vec::new();
        assert_eq!(b.decode(&f, 0, &mut out), Err(CodecError::BadChecksum));
        assert!(out.is_empty());
    }

    #[test]
    fn test_bit_flip_in_first_block_hits_next_block() {
        let (mut a, mut b) = pair();
        let m = I2npMessage::new(1, 1, 0, vec![0xaa; 60]);
        let mut f = a.encode_message(&m).unwrap();
        // corrupting a ciphertext block flips the same bit of the next plaintext block
        f[20] ^= 0x80;
        let mut out = Vec::new();
        assert!(b.decode(&f, 0, &mut out).is_err());
    }

    #[test]
    fn test_destroy_drops_key_schedules() {
        let (mut a, mut b) = pair();
        let frame = a.encode_message(&I2npMessage::new(1, 1, 0, vec![1; 40])).unwrap();
        b.decode(&frame[..16], 0, &mut Vec::new()).unwrap();

        b.destroy();
        b.destroy();
        assert!(!b.has_keys());
        assert!(b.frame.is_empty() && b.pending.is_empty());
        assert_eq!(
            b.decode(&frame[16..], 0, &mut Vec::new()),
            Err(CodecError::Crypto(CryptoError::InvalidKey))
        );
        assert!(b.encode_meta(0).is_err());
    }

    #[test]
    fn test_oversized_rejected() {
        let (mut a, _) = pair();
        let m = I2npMessage::new(1, 1, 0, vec![0; MAX_MSG_SIZE]);
        assert!(matches!(a.encode_message(&m), Err(CodecError::Oversized(_))));
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_split(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..600), 1..5),
            split in 1usize..64,
        ) {
            let (mut a, mut b) = pair();
            let msgs: Vec<_> = payloads
                .into_iter()
                .enumerate()
                .map(|(i, p)| I2npMessage::new(3, i as u32, 1000, p))
                .collect();
            let mut wire = Vec::new();
            for m in &msgs {
                wire.extend(a.encode_message(m).unwrap());
            }
            let mut out = Vec::new();
            for chunk in wire.chunks(split) {
                b.decode(chunk, 0, &mut out).unwrap();
            }
            let got: Vec<_> = out
                .into_iter()
                .map(|e| match e {
                    Inbound::Message(m) => m,
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            prop_assert_eq!(got, msgs);
        }
    }
}
