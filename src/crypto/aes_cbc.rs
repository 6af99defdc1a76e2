//! AES-256-CBC without padding.
//!
//! Both handshake variants and the legacy data phase run CBC over whole
//! blocks and keep the IV chain alive between calls: each call continues
//! from the last ciphertext block of the previous one.

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, generic_array::GenericArray};

use crate::core::{AES_BLOCK_SIZE, CryptoError, IV_SIZE, KEY_SIZE};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Chained CBC encryptor.
pub struct CbcEncryptor {
    inner: Aes256CbcEnc,
}

impl CbcEncryptor {
    /// Start a chain at `iv`.
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            inner: Aes256CbcEnc::new(&GenericArray::from(*key), &GenericArray::from(*iv)),
        }
    }

    /// Encrypt `buf` in place; its length must be a multiple of 16.
    pub fn encrypt(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        check_blocks(buf.len())?;
        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.inner.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

/// Chained CBC decryptor.
pub struct CbcDecryptor {
    inner: Aes256CbcDec,
}

impl CbcDecryptor {
    /// Start a chain at `iv`.
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            inner: Aes256CbcDec::new(&GenericArray::from(*key), &GenericArray::from(*iv)),
        }
    }

    /// Decrypt `buf` in place; its length must be a multiple of 16.
    pub fn decrypt(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        check_blocks(buf.len())?;
        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.inner.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CbcEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CbcEncryptor(..)")
    }
}

impl std::fmt::Debug for CbcDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CbcDecryptor(..)")
    }
}

/// One-shot encryption.
pub fn cbc_encrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], buf: &mut [u8]) -> Result<(), CryptoError> {
    CbcEncryptor::new(key, iv).encrypt(buf)
}

/// One-shot decryption.
pub fn cbc_decrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], buf: &mut [u8]) -> Result<(), CryptoError> {
    CbcDecryptor::new(key, iv).decrypt(buf)
}

/// Last 16 bytes of `buf` as an IV.
pub fn last_block(buf: &[u8]) -> Result<[u8; IV_SIZE], CryptoError> {
    if buf.len() < IV_SIZE {
        return Err(CryptoError::InvalidLength(buf.len()));
    }
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&buf[buf.len() - IV_SIZE..]);
    Ok(iv)
}

fn check_blocks(len: usize) -> Result<(), CryptoError> {
    if len % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength(len));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];
    const IV: [u8; 16] = [0x24; 16];

    #[test]
    fn test_chained_equals_one_shot() {
        let plain: Vec<u8> = (0u8..64).collect();

        let mut whole = plain.clone();
        cbc_encrypt(&KEY, &IV, &mut whole).unwrap();

        let mut enc = CbcEncryptor::new(&KEY, &IV);
        let mut first = plain[..32].to_vec();
        let mut second = plain[32..].to_vec();
        enc.encrypt(&mut first).unwrap();
        enc.encrypt(&mut second).unwrap();
        assert_eq!(&whole[..32], &first[..]);
        assert_eq!(&whole[32..], &second[..]);

        // restarting from the last block continues the same chain
        let mut tail = plain[32..].to_vec();
        cbc_encrypt(&KEY, &last_block(&first).unwrap(), &mut tail).unwrap();
        assert_eq!(tail, second);

        let mut dec = CbcDecryptor::new(&KEY, &IV);
        dec.decrypt(&mut whole).unwrap();
        assert_eq!(whole, plain);
    }

    #[test]
    fn test_partial_block_rejected() {
        let mut buf = [0u8; 17];
        assert_eq!(
            cbc_encrypt(&KEY, &IV, &mut buf),
            Err(CryptoError::InvalidLength(17))
        );
        assert_eq!(last_block(&buf[..3]), Err(CryptoError::InvalidLength(3)));
    }
}
