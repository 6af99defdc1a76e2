//! NTCP2 payload blocks.
//!
//! A payload is a sequence of `type(1) | len(2) | data(len)` blocks. Used
//! both inside message 3 and inside every data phase frame.
//!
//! Ordering rules:
//! - PADDING, if present, is the last block.
//! - After TERMINATION only PADDING may follow.

use rand::{RngCore, thread_rng};

use crate::core::{
    BLOCK_DATETIME, BLOCK_HEADER_SIZE, BLOCK_I2NP, BLOCK_OPTIONS, BLOCK_PADDING, BLOCK_ROUTERINFO,
    BLOCK_TERMINATION, CodecError, I2NP_SHORT_HEADER_SIZE, I2npMessage, OPTIONS3_SIZE,
    TERMINATION_SIZE,
};

use super::padding::PaddingOptions;

/// Termination reason: normal close.
pub const REASON_NORMAL: u8 = 0;
/// Termination reason: idle timeout.
pub const REASON_TIMEOUT: u8 = 2;
/// Termination reason: AEAD failure.
pub const REASON_AEAD: u8 = 4;
/// Termination reason: clock skew.
pub const REASON_SKEW: u8 = 7;
/// Termination reason: payload format error.
pub const REASON_FORMAT: u8 = 9;
/// Termination reason: banned.
pub const REASON_BANNED: u8 = 17;

/// One payload block.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    /// Sender's time, seconds.
    DateTime(u32),
    /// Padding and dummy traffic options.
    Options(PaddingOptions),
    /// A serialized router info. `flood` asks the receiver to flood it.
    RouterInfo {
        /// Flood request flag.
        flood: bool,
        /// Serialized record.
        info: Vec<u8>,
    },
    /// An application message with the short header.
    I2np(I2npMessage),
    /// Session termination.
    Termination {
        /// Frames received so far.
        valid_frames: u64,
        /// Reason code.
        reason: u8,
    },
    /// Random padding of the given length.
    Padding(usize),
    /// Unknown block type, skipped.
    Unknown(u8),
}

impl Block {
    /// Serialized size including the header.
    pub fn size(&self) -> usize {
        BLOCK_HEADER_SIZE
            + match self {
                Block::DateTime(_) => 4,
                Block::Options(_) => OPTIONS3_SIZE,
                Block::RouterInfo { info, .. } => 1 + info.len(),
                Block::I2np(msg) => msg.short_size(),
                Block::Termination { .. } => TERMINATION_SIZE,
                Block::Padding(len) => *len,
                Block::Unknown(_) => 0,
            }
    }

    /// Append this block to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        let len = (self.size() - BLOCK_HEADER_SIZE) as u16;
        let ty = match self {
            Block::DateTime(_) => BLOCK_DATETIME,
            Block::Options(_) => BLOCK_OPTIONS,
            Block::RouterInfo { .. } => BLOCK_ROUTERINFO,
            Block::I2np(_) => BLOCK_I2NP,
            Block::Termination { .. } => BLOCK_TERMINATION,
            Block::Padding(_) => BLOCK_PADDING,
            Block::Unknown(t) => *t,
        };
        out.push(ty);
        out.extend_from_slice(&len.to_be_bytes());
        match self {
            Block::DateTime(ts) => out.extend_from_slice(&ts.to_be_bytes()),
            Block::Options(opts) => out.extend_from_slice(&opts.to_bytes()),
            Block::RouterInfo { flood, info } => {
                out.push(u8::from(*flood));
                out.extend_from_slice(info);
            }
            Block::I2np(msg) => msg.write_short(out),
            Block::Termination {
                valid_frames,
                reason,
            } => {
                out.extend_from_slice(&valid_frames.to_be_bytes());
                out.push(*reason);
            }
            Block::Padding(len) => {
                let start = out.len();
                out.resize(start + len, 0);
                thread_rng().fill_bytes(&mut out[start..]);
            }
            Block::Unknown(_) => {}
        }
    }
}

/// Serialize a block list.
pub fn write_blocks(blocks: &[Block]) -> Vec<u8> {
    let mut out = Vec::with_capacity(blocks.iter().map(Block::size).sum());
    for block in blocks {
        block.write(&mut out);
    }
    out
}

fn violation(msg: impl Into<String>) -> CodecError {
    CodecError::ProtocolViolation(msg.into())
}

/// Parse a payload, enforcing the ordering rules.
pub fn parse_blocks(payload: &[u8]) -> Result<Vec<Block>, CodecError> {
    let mut blocks = Vec::new();
    let mut pos = 0;
    let mut terminated = false;
    while pos < payload.len() {
        if payload.len() - pos < BLOCK_HEADER_SIZE {
            return Err(violation("truncated block header"));
        }
        let ty = payload[pos];
        let len = u16::from_be_bytes([payload[pos + 1], payload[pos + 2]]) as usize;
        pos += BLOCK_HEADER_SIZE;
        if payload.len() - pos < len {
            return Err(violation(format!("block length {len} exceeds payload")));
        }
        let data = &payload[pos..pos + len];
        pos += len;

        if terminated && ty != BLOCK_PADDING {
            return Err(violation(format!("block {ty} after termination")));
        }

        let block = match ty {
            BLOCK_DATETIME => {
                if len != 4 {
                    return Err(violation(format!("datetime length {len}")));
                }
                Block::DateTime(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            BLOCK_OPTIONS => Block::Options(PaddingOptions::from_bytes(data)?),
            BLOCK_ROUTERINFO => {
                if len < 2 {
                    return Err(violation("empty router info block"));
                }
                Block::RouterInfo {
                    flood: data[0] & 0x01 != 0,
                    info: data[1..].to_vec(),
                }
            }
            BLOCK_I2NP => {
                if len < I2NP_SHORT_HEADER_SIZE {
                    return Err(violation(format!("i2np block length {len}")));
                }
                Block::I2np(I2npMessage::from_short_bytes(data)?)
            }
            BLOCK_TERMINATION => {
                if len != TERMINATION_SIZE {
                    return Err(violation(format!("termination length {len}")));
                }
                terminated = true;
                let mut frames = [0u8; 8];
                frames.copy_from_slice(&data[..8]);
                Block::Termination {
                    valid_frames: u64::from_be_bytes(frames),
                    reason: data[8],
                }
            }
            BLOCK_PADDING => {
                if pos != payload.len() {
                    return Err(violation("padding is not the last block"));
                }
                Block::Padding(len)
            }
            other => Block::Unknown(other),
        };
        blocks.push(block);
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_roundtrip() {
        let msg = I2npMessage::new(20, 77, 1_700_000_000_000, vec![1, 2, 3, 4]);
        let blocks = vec![
            Block::DateTime(1_700_000_000),
            Block::Options(PaddingOptions::default()),
            Block::RouterInfo {
                flood: false,
                info: vec![9; 20],
            },
            Block::I2np(msg),
            Block::Padding(5),
        ];
        let bytes = write_blocks(&blocks);
        assert_eq!(bytes.len(), blocks.iter().map(Block::size).sum::<usize>());
        assert_eq!(parse_blocks(&bytes).unwrap(), blocks);
    }

    #[test]
    fn test_padding_not_last_rejected() {
        let bytes = write_blocks(&[Block::Padding(4), Block::DateTime(1)]);
        assert!(matches!(
            parse_blocks(&bytes),
            Err(CodecError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_termination_rules() {
        let term = Block::Termination {
            valid_frames: 12,
            reason: REASON_NORMAL,
        };
        assert_eq!(term.size(), 3 + 9);
        let ok = write_blocks(&[term.clone(), Block::Padding(3)]);
        assert_eq!(parse_blocks(&ok).unwrap()[0], term);

        let bad = write_blocks(&[term, Block::DateTime(5)]);
        assert!(parse_blocks(&bad).is_err());

        // 8-byte termination is too short
        let short = [BLOCK_TERMINATION, 0, 8, 0, 0, 0, 0, 0, 0, 0, 1];
        assert!(parse_blocks(&short).is_err());

        // so is anything past the reason byte
        let long = [BLOCK_TERMINATION, 0, 12, 0, 0, 0, 0, 0, 0, 0, 5, 3, 0xaa, 0xbb, 0xcc];
        assert!(parse_blocks(&long).is_err());
    }

    #[test]
    fn test_datetime_exact_length() {
        let bytes = [BLOCK_DATETIME, 0, 5, 0, 0, 0, 1, 0];
        assert!(parse_blocks(&bytes).is_err());
        let bytes = [BLOCK_DATETIME, 0, 4, 0, 0, 0, 1];
        assert_eq!(parse_blocks(&bytes).unwrap(), vec![Block::DateTime(1)]);
    }

    #[test]
    fn test_unknown_block_skipped() {
        let bytes = [200, 0, 2, 7, 7, BLOCK_DATETIME, 0, 4, 0, 0, 0, 9];
        assert_eq!(
            parse_blocks(&bytes).unwrap(),
            vec![Block::Unknown(200), Block::DateTime(9)]
        );
    }

    #[test]
    fn test_truncated_header() {
        assert!(parse_blocks(&[BLOCK_DATETIME, 0]).is_err());
        assert!(parse_blocks(&[BLOCK_DATETIME, 0, 4, 1]).is_err());
    }
}
