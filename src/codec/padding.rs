//! Data phase padding and dummy traffic policy.
//!
//! Each side advertises a 12-byte options block:
//!
//! ```text
//! [0] tmin  [1] tmax  [2] rmin  [3] rmax     padding ratios, 4.4 fixed point
//! [4..6) tdummy  [6..8) rdummy               dummy bytes/s
//! [8..10) tdelay [10..12) rdelay             ms
//! ```
//!
//! The policy for our send direction merges our `t*` values with the
//! peer's `r*` values. When the merged range is inconsistent the smaller
//! value wins.

use rand::Rng;

use crate::core::{CodecError, OPTIONS3_SIZE};

/// Padding ratio floor we advertise, 4.4 fixed point.
pub const PADDING_MIN_DEFAULT: u8 = 0;

/// Padding ratio ceiling we advertise, 4.4 fixed point (1/16).
pub const PADDING_MAX_DEFAULT: u8 = 1;

/// Dummy traffic we advertise.
pub const DUMMY_DEFAULT: u16 = 0;

/// Delay we advertise.
pub const DELAY_DEFAULT: u16 = 0;

/// Random padding floor for small frames.
const PADDING_RAND_MIN: usize = 16;

/// Padding never exceeds this.
const PADDING_MAX: usize = 64;

/// Advertised padding and dummy traffic options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaddingOptions {
    /// Minimum send padding ratio.
    pub send_min: f32,
    /// Maximum send padding ratio.
    pub send_max: f32,
    /// Minimum receive padding ratio.
    pub recv_min: f32,
    /// Maximum receive padding ratio.
    pub recv_max: f32,
    /// Dummy traffic we send.
    pub send_dummy: u16,
    /// Dummy traffic we accept.
    pub recv_dummy: u16,
    /// Send delay.
    pub send_delay: u16,
    /// Receive delay.
    pub recv_delay: u16,
}

impl Default for PaddingOptions {
    fn default() -> Self {
        let min = from_fixed(PADDING_MIN_DEFAULT);
        let max = from_fixed(PADDING_MAX_DEFAULT);
        Self {
            send_min: min,
            send_max: max,
            recv_min: min,
            recv_max: max,
            send_dummy: DUMMY_DEFAULT,
            recv_dummy: DUMMY_DEFAULT,
            send_delay: DELAY_DEFAULT,
            recv_delay: DELAY_DEFAULT,
        }
    }
}

fn from_fixed(b: u8) -> f32 {
    b as f32 / 16.0
}

fn to_fixed(v: f32) -> u8 {
    (v * 16.0).round().clamp(0.0, 255.0) as u8
}

impl PaddingOptions {
    /// Parse an options block; extra bytes are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < OPTIONS3_SIZE {
            return Err(CodecError::ProtocolViolation(format!(
                "options block too short: {}",
                data.len()
            )));
        }
        let u16_at = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
        Ok(Self {
            send_min: from_fixed(data[0]),
            send_max: from_fixed(data[1]),
            recv_min: from_fixed(data[2]),
            recv_max: from_fixed(data[3]),
            send_dummy: u16_at(4),
            recv_dummy: u16_at(6),
            send_delay: u16_at(8),
            recv_delay: u16_at(10),
        })
    }

    /// Serialize to 12 bytes.
    pub fn to_bytes(&self) -> [u8; OPTIONS3_SIZE] {
        let mut out = [0u8; OPTIONS3_SIZE];
        out[0] = to_fixed(self.send_min);
        out[1] = to_fixed(self.send_max);
        out[2] = to_fixed(self.recv_min);
        out[3] = to_fixed(self.recv_max);
        out[4..6].copy_from_slice(&self.send_dummy.to_be_bytes());
        out[6..8].copy_from_slice(&self.recv_dummy.to_be_bytes());
        out[8..10].copy_from_slice(&self.send_delay.to_be_bytes());
        out[10..12].copy_from_slice(&self.recv_delay.to_be_bytes());
        out
    }

    /// Merge with the peer's advertisement into our send policy.
    pub fn merge(&self, theirs: &PaddingOptions) -> PaddingPolicy {
        let mut min = self.send_min.max(theirs.recv_min);
        let max = self.send_max.min(theirs.recv_max);
        if min > max {
            min = max;
        }
        PaddingPolicy {
            min,
            max,
            dummy: self.send_dummy.min(theirs.recv_dummy),
            delay: self.send_delay.min(theirs.recv_delay),
        }
    }
}

/// Effective padding policy for one direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaddingPolicy {
    /// Minimum padding ratio.
    pub min: f32,
    /// Maximum padding ratio.
    pub max: f32,
    /// Dummy traffic rate.
    pub dummy: u16,
    /// Delay.
    pub delay: u16,
}

impl Default for PaddingPolicy {
    fn default() -> Self {
        PaddingOptions::default().merge(&PaddingOptions::default())
    }
}

impl PaddingPolicy {
    /// Random padding length for a payload of `payload_len` bytes, capped so
    /// the frame stays within `room` bytes.
    pub fn padding_len(&self, payload_len: usize, room: usize) -> usize {
        let mut rng = rand::thread_rng();
        let lo = (payload_len as f32 * self.min) as usize;
        let hi = ((payload_len as f32 * self.max) as usize).max(PADDING_RAND_MIN);
        let len = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
        len.min(PADDING_MAX).min(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_layout() {
        let opts = PaddingOptions {
            send_min: 0.0,
            send_max: 0.5,
            recv_min: 0.0625,
            recv_max: 1.0,
            send_dummy: 3,
            recv_dummy: 4,
            send_delay: 5,
            recv_delay: 6,
        };
        let bytes = opts.to_bytes();
        assert_eq!(hex::encode(bytes), "000801100003000400050006");
        assert_eq!(PaddingOptions::from_bytes(&bytes).unwrap(), opts);
    }

    #[test]
    fn test_short_options_rejected() {
        assert!(matches!(
            PaddingOptions::from_bytes(&[0; 11]),
            Err(CodecError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_merge_prefers_smaller() {
        let ours = PaddingOptions {
            send_min: 0.5,
            send_max: 1.0,
            ..PaddingOptions::default()
        };
        let theirs = PaddingOptions {
            recv_min: 0.0,
            recv_max: 0.25,
            recv_dummy: 0,
            ..PaddingOptions::default()
        };
        let policy = ours.merge(&theirs);
        // inconsistent range collapses onto the smaller bound
        assert_eq!(policy.min, 0.25);
        assert_eq!(policy.max, 0.25);
        assert_eq!(policy.dummy, 0);
    }

    #[test]
    fn test_padding_len_bounded() {
        let policy = PaddingPolicy::default();
        for _ in 0..100 {
            assert!(policy.padding_len(1000, 65535) <= 64);
            assert!(policy.padding_len(1000, 3) <= 3);
        }
    }
}
