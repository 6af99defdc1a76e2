//! Noise_XK handshake engine
//!
//! NTCP2 runs a Noise XK handshake with a few twists the generic libraries
//! do not expose: the initiator's ephemeral key is AES-obfuscated on the
//! wire, the padding following messages 1 and 2 is mixed into the
//! transcript hash, and the data phase derives its SipHash keys from the
//! final chaining key and handshake hash. This engine therefore exposes
//! [`HandshakeState::mix_hash`], [`HandshakeState::chaining_key`] and
//! [`HandshakeState::handshake_hash`].
//!
//! ```text
//! Noise_XK(s, rs):
//!   <- s
//!   ...
//!   -> e, es
//!   <- e, ee
//!   -> s, se
//! ```

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{CryptoError, HASH_SIZE, KEY_SIZE, MAC_SIZE, NOISE_PROTOCOL_NAME};

use super::StaticKeypair;

/// Role in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Initiator (Alice)
    Initiator,
    /// Responder (Bob)
    Responder,
}

#[derive(Clone, Copy, Debug)]
enum Token {
    E,
    S,
    Ee,
    Es,
    Se,
}

/// XK message patterns.
static XK_PATTERN: [&[Token]; 3] = [
    &[Token::E, Token::Es],
    &[Token::E, Token::Ee],
    &[Token::S, Token::Se],
];

/// ChaChaPoly cipher with a 64-bit counter nonce.
///
/// The nonce is 4 zero bytes followed by the little-endian counter.
pub struct CipherState {
    key: Option<[u8; KEY_SIZE]>,
    nonce: u64,
}

impl CipherState {
    /// A cipher state without a key; encryption is the identity.
    pub fn empty() -> Self {
        Self {
            key: None,
            nonce: 0,
        }
    }

    /// A keyed cipher state starting at nonce 0.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key: Some(key),
            nonce: 0,
        }
    }

    /// Whether a key is set.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Next nonce to be used.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    fn next_nonce(&mut self) -> Result<Nonce, CryptoError> {
        if self.nonce == u64::MAX {
            return Err(CryptoError::CounterExhaustion);
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce += 1;
        Ok(Nonce::from(nonce))
    }

    /// Encrypt `plaintext`, appending a 16-byte tag.
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some(key) = self.key else {
            return Ok(plaintext.to_vec());
        };
        let nonce = self.next_nonce()?;
        ChaCha20Poly1305::new(&key.into())
            .encrypt(&nonce, Payload { msg: plaintext, aad: ad })
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt and authenticate `ciphertext`.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some(key) = self.key else {
            return Ok(ciphertext.to_vec());
        };
        if ciphertext.len() < MAC_SIZE {
            return Err(CryptoError::InvalidLength(ciphertext.len()));
        }
        let nonce = self.next_nonce()?;
        ChaCha20Poly1305::new(&key.into())
            .decrypt(&nonce, Payload { msg: ciphertext, aad: ad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Wipe the key.
    pub fn destroy(&mut self) {
        if let Some(key) = self.key.as_mut() {
            key.zeroize();
        }
        self.key = None;
    }
}

impl Drop for CipherState {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("keyed", &self.has_key())
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// HKDF with the chaining key as salt and an empty info, split in two
/// 32-byte outputs.
pub fn hkdf2(ck: &[u8; HASH_SIZE], ikm: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(ck), ikm);
    let mut okm = [0u8; 64];
    hk.expand(&[], &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&okm[..32]);
    b.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((a, b))
}

/// Noise XK handshake state.
pub struct HandshakeState {
    role: Role,
    ck: [u8; HASH_SIZE],
    h: [u8; HASH_SIZE],
    cipher: CipherState,
    s: StaticSecret,
    s_pub: [u8; KEY_SIZE],
    e: Option<StaticSecret>,
    rs: Option<[u8; KEY_SIZE]>,
    re: Option<[u8; KEY_SIZE]>,
    message: usize,
}

impl HandshakeState {
    fn initialize(role: Role, local: &StaticKeypair) -> Self {
        let h: [u8; HASH_SIZE] = Sha256::digest(NOISE_PROTOCOL_NAME).into();
        let mut state = Self {
            role,
            ck: h,
            h,
            cipher: CipherState::empty(),
            s: StaticSecret::from(*local.private_key()),
            s_pub: *local.public_key(),
            e: None,
            rs: None,
            re: None,
            message: 0,
        };
        // empty prologue
        state.mix_hash(&[]);
        state
    }

    /// Start as initiator, knowing the responder's static key.
    pub fn initiator(local: &StaticKeypair, remote_static: &[u8; KEY_SIZE]) -> Self {
        let mut state = Self::initialize(Role::Initiator, local);
        state.rs = Some(*remote_static);
        state.mix_hash(remote_static);
        state
    }

    /// Start as responder.
    pub fn responder(local: &StaticKeypair) -> Self {
        let mut state = Self::initialize(Role::Responder, local);
        let s_pub = state.s_pub;
        state.mix_hash(&s_pub);
        state
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// h = SHA256(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn mix_key(&mut self, ikm: &[u8; KEY_SIZE]) -> Result<(), CryptoError> {
        let (ck, k) = hkdf2(&self.ck, ikm)?;
        self.ck = ck;
        self.cipher = CipherState::new(k);
        Ok(())
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let h = self.h;
        let ct = self.cipher.encrypt_with_ad(&h, plaintext)?;
        self.mix_hash(&ct);
        Ok(ct)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let h = self.h;
        let pt = self.cipher.decrypt_with_ad(&h, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(pt)
    }

    fn dh(secret: Option<&StaticSecret>, public: Option<&[u8; KEY_SIZE]>) -> Result<[u8; KEY_SIZE], CryptoError> {
        let secret = secret.ok_or(CryptoError::HandshakeState("missing local key"))?;
        let public = public.ok_or(CryptoError::HandshakeState("missing remote key"))?;
        Ok(*secret.diffie_hellman(&PublicKey::from(*public)).as_bytes())
    }

    fn mix_dh(&mut self, token: Token) -> Result<(), CryptoError> {
        let initiator = self.role == Role::Initiator;
        let mut shared = match token {
            Token::Ee => Self::dh(self.e.as_ref(), self.re.as_ref())?,
            Token::Es if initiator => Self::dh(self.e.as_ref(), self.rs.as_ref())?,
            Token::Es => Self::dh(Some(&self.s), self.re.as_ref())?,
            Token::Se if initiator => Self::dh(Some(&self.s), self.re.as_ref())?,
            Token::Se => Self::dh(self.e.as_ref(), self.rs.as_ref())?,
            Token::E | Token::S => return Err(CryptoError::HandshakeState("not a DH token")),
        };
        let result = self.mix_key(&shared);
        shared.zeroize();
        result
    }

    fn expect_turn(&self, writing: bool) -> Result<&'static [Token], CryptoError> {
        let pattern = XK_PATTERN
            .get(self.message)
            .ok_or(CryptoError::HandshakeState("handshake already complete"))?;
        // initiator writes messages 0 and 2
        let initiator_turn = self.message % 2 == 0;
        let ours = (self.role == Role::Initiator) == initiator_turn;
        if ours != writing {
            return Err(CryptoError::HandshakeState("out of turn"));
        }
        Ok(*pattern)
    }

    /// Write the next handshake message with `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let pattern = self.expect_turn(true)?;
        let mut out = Vec::new();
        for token in pattern {
            match token {
                Token::E => {
                    let e = StaticSecret::random_from_rng(OsRng);
                    let e_pub = PublicKey::from(&e).to_bytes();
                    self.e = Some(e);
                    self.mix_hash(&e_pub);
                    out.extend_from_slice(&e_pub);
                }
                Token::S => {
                    let s_pub = self.s_pub;
                    let ct = self.encrypt_and_hash(&s_pub)?;
                    out.extend_from_slice(&ct);
                }
                dh => self.mix_dh(*dh)?,
            }
        }
        let ct = self.encrypt_and_hash(payload)?;
        out.extend_from_slice(&ct);
        self.message += 1;
        Ok(out)
    }

    /// Read the next handshake message, returning its payload.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let pattern = self.expect_turn(false)?;
        let mut rest = message;
        for token in pattern {
            match token {
                Token::E => {
                    if rest.len() < KEY_SIZE {
                        return Err(CryptoError::InvalidLength(message.len()));
                    }
                    let mut re = [0u8; KEY_SIZE];
                    re.copy_from_slice(&rest[..KEY_SIZE]);
                    rest = &rest[KEY_SIZE..];
                    self.mix_hash(&re);
                    self.re = Some(re);
                }
                Token::S => {
                    let len = if self.cipher.has_key() { KEY_SIZE + MAC_SIZE } else { KEY_SIZE };
                    if rest.len() < len {
                        return Err(CryptoError::InvalidLength(message.len()));
                    }
                    let pt = self.decrypt_and_hash(&rest[..len])?;
                    rest = &rest[len..];
                    let mut rs = [0u8; KEY_SIZE];
                    rs.copy_from_slice(&pt);
                    self.rs = Some(rs);
                }
                dh => self.mix_dh(*dh)?,
            }
        }
        let payload = self.decrypt_and_hash(rest)?;
        self.message += 1;
        Ok(payload)
    }

    /// Whether all three messages have been processed.
    pub fn is_complete(&self) -> bool {
        self.message >= XK_PATTERN.len()
    }

    /// Current chaining key.
    pub fn chaining_key(&self) -> &[u8; HASH_SIZE] {
        &self.ck
    }

    /// Current transcript hash.
    pub fn handshake_hash(&self) -> &[u8; HASH_SIZE] {
        &self.h
    }

    /// Remote static key, once known.
    pub fn remote_static(&self) -> Option<&[u8; KEY_SIZE]> {
        self.rs.as_ref()
    }

    /// Our ephemeral public key, once generated.
    pub fn local_ephemeral(&self) -> Option<[u8; KEY_SIZE]> {
        self.e.as_ref().map(|e| PublicKey::from(e).to_bytes())
    }

    /// Derive the data phase ciphers: `(initiator -> responder, responder -> initiator)`.
    pub fn split(&self) -> Result<(CipherState, CipherState), CryptoError> {
        if !self.is_complete() {
            return Err(CryptoError::HandshakeState("split before completion"));
        }
        let (k1, k2) = hkdf2(&self.ck, &[])?;
        Ok((CipherState::new(k1), CipherState::new(k2)))
    }

    /// Wipe all key material. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.ck.zeroize();
        self.h.zeroize();
        self.cipher.destroy();
        self.e = None;
        self.re = None;
    }
}

impl Drop for HandshakeState {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeState")
            .field("role", &self.role)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (HandshakeState, HandshakeState, StaticKeypair) {
        let alice_kp = StaticKeypair::generate();
        let bob_kp = StaticKeypair::generate();
        let mut alice = HandshakeState::initiator(&alice_kp, bob_kp.public_key());
        let mut bob = HandshakeState::responder(&bob_kp);

        let m1 = alice.write_message(b"options1").unwrap();
        assert_eq!(bob.read_message(&m1).unwrap(), b"options1");
        alice.mix_hash(b"pad1");
        bob.mix_hash(b"pad1");

        let m2 = bob.write_message(b"options2").unwrap();
        assert_eq!(alice.read_message(&m2).unwrap(), b"options2");

        let m3 = alice.write_message(b"routerinfo").unwrap();
        assert_eq!(m3.len(), 48 + 10 + 16);
        assert_eq!(bob.read_message(&m3).unwrap(), b"routerinfo");
        (alice, bob, alice_kp)
    }

    #[test]
    fn test_handshake_roundtrip() {
        let (alice, bob, alice_kp) = run_handshake();
        assert!(alice.is_complete() && bob.is_complete());
        assert_eq!(alice.handshake_hash(), bob.handshake_hash());
        assert_eq!(alice.chaining_key(), bob.chaining_key());
        assert_eq!(bob.remote_static(), Some(alice_kp.public_key()));

        let (mut a_send, mut a_recv) = alice.split().unwrap();
        let (mut b_recv, mut b_send) = bob.split().unwrap();
        let ct = a_send.encrypt_with_ad(&[], b"data").unwrap();
        assert_eq!(b_recv.decrypt_with_ad(&[], &ct).unwrap(), b"data");
        let ct = b_send.encrypt_with_ad(&[], b"back").unwrap();
        assert_eq!(a_recv.decrypt_with_ad(&[], &ct).unwrap(), b"back");
    }

    #[test]
    fn test_handshake_wrong_key_fails() {
        let alice_kp = StaticKeypair::generate();
        let bob_kp = StaticKeypair::generate();
        let wrong = StaticKeypair::generate();
        let mut alice = HandshakeState::initiator(&alice_kp, wrong.public_key());
        let mut bob = HandshakeState::responder(&bob_kp);

        let m1 = alice.write_message(b"x").unwrap();
        assert_eq!(bob.read_message(&m1), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_out_of_turn() {
        let kp = StaticKeypair::generate();
        let mut bob = HandshakeState::responder(&kp);
        assert!(matches!(
            bob.write_message(b""),
            Err(CryptoError::HandshakeState(_))
        ));
        assert!(bob.split().is_err());
    }

    #[test]
    fn test_nonce_layout() {
        let mut a = CipherState::new([7u8; 32]);
        let mut b = CipherState::new([7u8; 32]);
        let c0 = a.encrypt_with_ad(b"ad", b"zero").unwrap();
        let c1 = a.encrypt_with_ad(b"ad", b"zero").unwrap();
        assert_ne!(c0, c1);
        assert_eq!(a.nonce(), 2);
        assert_eq!(b.decrypt_with_ad(b"ad", &c0).unwrap(), b"zero");
        // replaying an old record fails once the counter moved on
        assert_eq!(b.decrypt_with_ad(b"ad", &c0), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (mut alice, _, _) = run_handshake();
        alice.destroy();
        alice.destroy();
        assert_eq!(alice.chaining_key(), &[0u8; 32]);
    }
}
