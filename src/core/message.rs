//! Opaque I2NP message envelope.
//!
//! The transport never looks inside a message body. It only needs the
//! header to serialize it in one of two forms:
//!
//! ```text
//! full  (16 bytes): type(1) id(4) expiration_ms(8) size(2) checksum(1)
//! short  (9 bytes): type(1) id(4) expiration_s(4)
//! ```
//!
//! The short form is used inside NTCP2 I2NP blocks, where the AEAD
//! record already authenticates length and content.

use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use super::error::DecodeError;

/// Full header size.
pub const I2NP_HEADER_SIZE: usize = 16;

/// Short header size.
pub const I2NP_SHORT_HEADER_SIZE: usize = 9;

/// An application message carried over a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2npMessage {
    /// Message type.
    pub msg_type: u8,
    /// Unique id.
    pub id: u32,
    /// Expiration, milliseconds since the epoch.
    pub expiration: u64,
    /// Opaque body.
    pub payload: Vec<u8>,
}

impl I2npMessage {
    /// Create a message.
    pub fn new(msg_type: u8, id: u32, expiration: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            id,
            expiration,
            payload,
        }
    }

    /// Serialized size with the full header.
    pub fn size(&self) -> usize {
        I2NP_HEADER_SIZE + self.payload.len()
    }

    /// Serialized size with the short header.
    pub fn short_size(&self) -> usize {
        I2NP_SHORT_HEADER_SIZE + self.payload.len()
    }

    /// Serialize with the full header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.push(self.msg_type);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.push(Sha256::digest(&self.payload)[0]);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a message with the full header.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < I2NP_HEADER_SIZE {
            return Err(DecodeError::UnexpectedEof);
        }
        let msg_type = data[0];
        let id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let mut exp = [0u8; 8];
        exp.copy_from_slice(&data[5..13]);
        let expiration = u64::from_be_bytes(exp);
        let size = u16::from_be_bytes([data[13], data[14]]) as usize;
        let checksum = data[15];
        let body = &data[I2NP_HEADER_SIZE..];
        if body.len() < size {
            return Err(DecodeError::UnexpectedEof);
        }
        if body.len() > size {
            return Err(DecodeError::InvalidEncoding(format!(
                "{} trailing bytes after message",
                body.len() - size
            )));
        }
        if Sha256::digest(body)[0] != checksum {
            return Err(DecodeError::InvalidEncoding("bad message checksum".into()));
        }
        Ok(Self::new(msg_type, id, expiration, body.to_vec()))
    }

    /// Append the message with the short header.
    pub fn write_short(&self, out: &mut Vec<u8>) {
        out.push(self.msg_type);
        out.extend_from_slice(&self.id.to_be_bytes());
        let secs = ((self.expiration + 500) / 1000) as u32;
        out.extend_from_slice(&secs.to_be_bytes());
        out.extend_from_slice(&self.payload);
    }

    /// Parse a message with the short header. Expiration loses its
    /// sub-second part.
    pub fn from_short_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < I2NP_SHORT_HEADER_SIZE {
            return Err(DecodeError::UnexpectedEof);
        }
        let id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let secs = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        Ok(Self::new(
            data[0],
            id,
            secs as u64 * 1000,
            data[I2NP_SHORT_HEADER_SIZE..].to_vec(),
        ))
    }
}

/// A message queued for sending, with its priority and queue timestamp.
#[derive(Debug, Clone)]
pub struct OutNetMessage {
    message: I2npMessage,
    priority: u32,
    queued_at: Instant,
}

impl OutNetMessage {
    /// Wrap a message with a priority; higher goes first.
    pub fn new(message: I2npMessage, priority: u32) -> Self {
        Self {
            message,
            priority,
            queued_at: Instant::now(),
        }
    }

    /// The message.
    pub fn message(&self) -> &I2npMessage {
        &self.message
    }

    /// Priority; higher is sent first.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Time since the message was queued.
    pub fn queue_time(&self) -> Duration {
        self.queued_at.elapsed()
    }

    /// Unwrap the message.
    pub fn into_message(self) -> I2npMessage {
        self.message
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        if let Some(t) = self.queued_at.checked_sub(by) {
            self.queued_at = t;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_header_layout() {
        let msg = I2npMessage::new(20, 0xdeadbeef, 1_700_000_000_123, b"hello".to_vec());
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 21);
        assert_eq!(bytes[0], 20);
        assert_eq!(&bytes[1..5], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&bytes[13..15], &[0, 5]);
        assert_eq!(I2npMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_full_header_bad_checksum() {
        let msg = I2npMessage::new(1, 7, 0, vec![1, 2, 3]);
        let mut bytes = msg.to_bytes();
        bytes[15] ^= 0xff;
        assert!(matches!(
            I2npMessage::from_bytes(&bytes),
            Err(DecodeError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_short_header_truncates_millis() {
        let msg = I2npMessage::new(3, 42, 1_700_000_000_499, vec![9; 10]);
        let mut out = Vec::new();
        msg.write_short(&mut out);
        assert_eq!(out.len(), msg.short_size());
        let parsed = I2npMessage::from_short_bytes(&out).unwrap();
        assert_eq!(parsed.expiration, 1_700_000_000_000);
        assert_eq!(parsed.payload, msg.payload);
    }

    #[test]
    fn test_truncated() {
        assert_eq!(I2npMessage::from_bytes(&[0; 10]), Err(DecodeError::UnexpectedEof));
        assert_eq!(I2npMessage::from_short_bytes(&[0; 8]), Err(DecodeError::UnexpectedEof));
    }
}
