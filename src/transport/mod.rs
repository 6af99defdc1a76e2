//! Transport layer
//!
//! Connections, the machinery that drives them, and the state they share:
//!
//! - [`Connection`]: one peer, from first handshake byte to close
//! - [`BandwidthLimiter`]: per-direction token buckets with deferred requests
//! - [`WorkerPool`]: reader and writer threads for handshake and cipher work
//! - [`TransportContext`]: config, router keys, clock, ban and replay filters
//! - [`EventPumper`]: the mio socket loop (requires the `transport` feature)
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │          TransportListener (router)            │
//! ├────────────────────────────────────────────────┤
//! │   Connection ── Establishment / FrameCodec     │  ← reader/writer pools
//! ├────────────────────────────────────────────────┤
//! │   BandwidthLimiter                             │
//! ├────────────────────────────────────────────────┤
//! │   EventPumper (mio)                            │  ← one thread
//! ├────────────────────────────────────────────────┤
//! │                     TCP                        │
//! └────────────────────────────────────────────────┘
//! ```

mod bandwidth;
mod connection;
pub(crate) mod context;
mod dispatch;
mod listener;
#[cfg(feature = "transport")]
mod pumper;
mod workers;

pub use bandwidth::{BandwidthLimiter, BandwidthRequest, Direction, RequestCompletion, RequestStatus};
pub use connection::{CloseReason, Connection, Origin};
pub use context::{Banlist, BlockedIpCounter, Blocklist, ReplayCache, TransportContext};
pub use dispatch::Dispatcher;
pub use listener::TransportListener;
#[cfg(feature = "transport")]
pub use listener::{ChannelListener, TransportEvent};
#[cfg(feature = "transport")]
pub use pumper::{EventPumper, PumperDispatcher, PumperHandle};
pub use workers::WorkerPool;
