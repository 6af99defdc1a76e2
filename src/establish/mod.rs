//! Connection establishment
//!
//! A connection runs exactly one [`Establishment`] until the handshake
//! either produces a data phase codec or fails. Inbound connections do not
//! know which variant the peer speaks, so they start in
//! [`Establishment::Sniffing`] and pick a state machine once enough bytes
//! have arrived:
//!
//! - fewer than 64 bytes with NTCP2 enabled: keep waiting
//! - at least 288 bytes, or NTCP2 disabled: legacy
//! - otherwise: NTCP2
//!
//! Every exit path (success, failure, timeout) wipes the handshake's key
//! material through [`Establishment::destroy`].

pub mod legacy;
pub mod ntcp2;

pub use legacy::{InboundLegacy, OutboundLegacy};
pub use ntcp2::{InboundNtcp2, OutboundNtcp2};

use std::mem;
use std::net::IpAddr;
use std::time::Instant;

use tracing::{debug, trace};
use zeroize::Zeroize;

use crate::codec::FrameCodec;
use crate::core::{EstablishError, MSG1_SIZE, NTCP1_MSG1_SIZE};
use crate::router::{RouterIdentity, RouterInfo};
use crate::transport::TransportContext;

/// Result of feeding bytes to a handshake.
#[derive(Debug, Default)]
pub struct Step {
    /// Bytes to write to the peer, possibly empty.
    pub output: Vec<u8>,
    /// Set once the handshake completed.
    pub established: Option<Established>,
}

/// A completed handshake.
#[derive(Debug)]
pub struct Established {
    /// Data phase codec.
    pub codec: FrameCodec,
    /// Authenticated peer identity.
    pub peer: RouterIdentity,
    /// The peer's router info, when it sent one.
    pub peer_info: Option<RouterInfo>,
    /// Local minus peer clock, seconds.
    pub skew_secs: i64,
    /// Bytes received after the handshake; they belong to the data phase.
    pub extra: Vec<u8>,
}

/// Skew in seconds, local minus peer, from the peer's timestamp `ts_secs`
/// corrected by half the round trip.
pub(crate) fn peer_skew(now_ms: u64, ts_secs: u32, rtt_ms: u64) -> i64 {
    (now_ms as i64 - ts_secs as i64 * 1000 - rtt_ms as i64 / 2 + 500) / 1000
}

/// Bytes received before the handshake variant is known.
pub struct VersionSniffer {
    buf: Vec<u8>,
    remote_ip: Option<IpAddr>,
    created: Instant,
}

impl VersionSniffer {
    fn classify(&self, ntcp2_enabled: bool) -> Option<u8> {
        let len = self.buf.len();
        if !ntcp2_enabled || len >= NTCP1_MSG1_SIZE {
            Some(1)
        } else if len >= MSG1_SIZE {
            Some(2)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for VersionSniffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSniffer")
            .field("buffered", &self.buf.len())
            .field("remote_ip", &self.remote_ip)
            .finish()
    }
}

/// Handshake state of one connection.
#[derive(Debug)]
pub enum Establishment {
    /// Inbound, variant not known yet.
    Sniffing(VersionSniffer),
    /// Inbound legacy.
    LegacyInbound(InboundLegacy),
    /// Outbound legacy.
    LegacyOutbound(OutboundLegacy),
    /// Inbound Noise.
    Ntcp2Inbound(InboundNtcp2),
    /// Outbound Noise.
    Ntcp2Outbound(OutboundNtcp2),
    /// Completed; the codec has been handed out.
    Verified,
    /// Failed; no further input is accepted.
    Failed,
}

impl Establishment {
    /// State for a connection we accepted.
    pub fn inbound(remote_ip: Option<IpAddr>, created: Instant) -> Self {
        Establishment::Sniffing(VersionSniffer {
            buf: Vec::new(),
            remote_ip,
            created,
        })
    }

    /// State for a connection to `peer`, using NTCP2 when both sides support it.
    pub fn outbound(
        ctx: &TransportContext,
        peer: &RouterInfo,
        created: Instant,
    ) -> Result<Self, EstablishError> {
        let ntcp2 = ctx.config().ntcp2_enabled
            && peer.best_address(true).is_some_and(|a| a.supports_ntcp2());
        if ntcp2 {
            Ok(Establishment::Ntcp2Outbound(OutboundNtcp2::new(peer, created)?))
        } else {
            Ok(Establishment::LegacyOutbound(OutboundLegacy::new(
                peer.identity().clone(),
                created,
            )))
        }
    }

    /// First message of an outbound handshake.
    pub fn prepare_outbound(&mut self, ctx: &TransportContext) -> Result<Vec<u8>, EstablishError> {
        let result = match self {
            Establishment::LegacyOutbound(s) => s.prepare_outbound(),
            Establishment::Ntcp2Outbound(s) => s.prepare_outbound(ctx),
            _ => return Err(EstablishError::ProtocolViolation("not an outbound handshake".into())),
        };
        if result.is_err() {
            self.destroy();
        }
        result
    }

    /// Feed received bytes.
    ///
    /// On error the state is destroyed and becomes [`Establishment::Failed`];
    /// on success it becomes [`Establishment::Verified`].
    pub fn receive(&mut self, ctx: &TransportContext, data: &[u8]) -> Result<Step, EstablishError> {
        if let Establishment::Sniffing(sniffer) = self {
            sniffer.buf.extend_from_slice(data);
            let Some(version) = sniffer.classify(ctx.config().ntcp2_enabled) else {
                trace!(buffered = sniffer.buf.len(), "waiting for enough bytes to pick a handshake");
                return Ok(Step::default());
            };
            let mut buf = mem::take(&mut sniffer.buf);
            let (ip, created) = (sniffer.remote_ip, sniffer.created);
            debug!(version, buffered = buf.len(), remote = ?ip, "inbound handshake version");
            *self = if version == 1 {
                Establishment::LegacyInbound(InboundLegacy::new(ip, created))
            } else {
                Establishment::Ntcp2Inbound(InboundNtcp2::new(ip, created))
            };
            let result = self.receive(ctx, &buf);
            buf.zeroize();
            return result;
        }

        let result = match self {
            Establishment::LegacyInbound(s) => s.receive(ctx, data),
            Establishment::LegacyOutbound(s) => s.receive(ctx, data),
            Establishment::Ntcp2Inbound(s) => s.receive(ctx, data),
            Establishment::Ntcp2Outbound(s) => s.receive(ctx, data),
            Establishment::Sniffing(_) | Establishment::Verified | Establishment::Failed => {
                return Err(EstablishError::ProtocolViolation("handshake finished".into()));
            }
        };
        match result {
            Ok(step) => {
                if step.established.is_some() {
                    *self = Establishment::Verified;
                }
                Ok(step)
            }
            Err(e) => {
                self.destroy();
                Err(e)
            }
        }
    }

    /// 1 for legacy, 2 for NTCP2, `None` while sniffing.
    pub fn version(&self) -> Option<u8> {
        match self {
            Establishment::LegacyInbound(_) | Establishment::LegacyOutbound(_) => Some(1),
            Establishment::Ntcp2Inbound(_) | Establishment::Ntcp2Outbound(_) => Some(2),
            _ => None,
        }
    }

    /// Handshake completed.
    pub fn is_complete(&self) -> bool {
        matches!(self, Establishment::Verified)
    }

    /// Handshake failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Establishment::Failed)
    }

    /// A failed NTCP2 message 1 is being drained.
    pub fn is_stalling(&self) -> bool {
        matches!(self, Establishment::Ntcp2Inbound(s) if s.is_stalling())
    }

    /// Wipe key material. A verified handshake stays verified, anything
    /// else becomes failed. Idempotent.
    pub fn destroy(&mut self) {
        match self {
            Establishment::Sniffing(s) => s.buf.zeroize(),
            Establishment::LegacyInbound(s) => s.destroy(),
            Establishment::LegacyOutbound(s) => s.destroy(),
            Establishment::Ntcp2Inbound(s) => s.destroy(),
            Establishment::Ntcp2Outbound(s) => s.destroy(),
            Establishment::Verified | Establishment::Failed => return,
        }
        *self = Establishment::Failed;
    }
}
