//! Data phase framing
//!
//! Once a handshake completes, a connection owns one [`FrameCodec`]:
//!
//! - [`legacy`]: AES-CBC frames with an Adler-32 suffix
//! - [`ntcp2`]: ChaChaPoly frames carrying [`payload`] blocks
//! - [`padding`]: the NTCP2 padding negotiation
//!
//! Both codecs accept arbitrary read chunks and emit [`Inbound`] events.

pub mod legacy;
pub mod ntcp2;
pub mod padding;
pub mod payload;

pub use legacy::LegacyCodec;
pub use ntcp2::Ntcp2Codec;
pub use padding::{PaddingOptions, PaddingPolicy};
pub use payload::Block;

use crate::core::{CodecError, I2npMessage};

/// Something decoded from the data phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// An application message.
    Message(I2npMessage),
    /// A keepalive reported this skew, local minus peer, seconds.
    ClockSkew(i64),
    /// The peer pushed a serialized router info.
    RouterInfo(Vec<u8>),
    /// The peer advertised new padding options.
    Options(PaddingOptions),
}

/// Codec of an established connection.
#[derive(Debug)]
pub enum FrameCodec {
    /// Variant A.
    Legacy(LegacyCodec),
    /// Variant B.
    Ntcp2(Ntcp2Codec),
}

impl FrameCodec {
    /// Protocol version: 1 for legacy, 2 for NTCP2.
    pub fn version(&self) -> u8 {
        match self {
            FrameCodec::Legacy(_) => 1,
            FrameCodec::Ntcp2(_) => 2,
        }
    }

    /// Frame one message.
    pub fn encode_message(&mut self, msg: &I2npMessage) -> Result<Vec<u8>, CodecError> {
        match self {
            FrameCodec::Legacy(c) => c.encode_message(msg),
            FrameCodec::Ntcp2(c) => c.encode_message(msg),
        }
    }

    /// Frame a keepalive carrying our time.
    pub fn encode_keepalive(&mut self, now_secs: u32) -> Result<Vec<u8>, CodecError> {
        match self {
            FrameCodec::Legacy(c) => c.encode_meta(now_secs),
            FrameCodec::Ntcp2(c) => c.encode_datetime(now_secs),
        }
    }

    /// Frame a termination notice. Legacy connections have none.
    pub fn encode_termination(&mut self, reason: u8) -> Result<Option<Vec<u8>>, CodecError> {
        match self {
            FrameCodec::Legacy(_) => Ok(None),
            FrameCodec::Ntcp2(c) => c.encode_termination(reason).map(Some),
        }
    }

    /// Feed received bytes.
    pub fn decode(&mut self, data: &[u8], now_secs: u32, out: &mut Vec<Inbound>) -> Result<(), CodecError> {
        match self {
            FrameCodec::Legacy(c) => c.decode(data, now_secs, out),
            FrameCodec::Ntcp2(c) => c.decode(data, now_secs, out),
        }
    }

    /// Wipe key material. Idempotent.
    pub fn destroy(&mut self) {
        match self {
            FrameCodec::Legacy(c) => c.destroy(),
            FrameCodec::Ntcp2(c) => c.destroy(),
        }
    }
}
