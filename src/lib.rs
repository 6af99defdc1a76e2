//! # NTCP transport
//!
//! The TCP transport between I2P routers. Two wire variants share one
//! connection model:
//!
//! - **Legacy NTCP**: 2048-bit DH, station-to-station signatures, AES-256-CBC
//!   frames with an Adler-32 checksum
//! - **NTCP2**: Noise XK over X25519 with AES-obfuscated ephemeral keys,
//!   ChaCha20-Poly1305 frames with SipHash-masked lengths
//!
//! Inbound connections detect the variant from the first bytes.
//!
//! ## Feature Flags
//!
//! - `transport` (default): the mio socket pumper and the tokio event channel.
//!   Handshakes, codecs and connections are always built and can be driven in
//!   memory.
//!
//! ## Modules
//!
//! - [`core`](crate::core): errors, constants, configuration, clock, message envelope
//! - [`crypto`]: DH, AES-CBC, Noise XK, SipHash, key types
//! - [`router`]: router identities and published records
//! - [`establish`]: handshake state machines
//! - [`codec`]: data phase framing
//! - [`transport`]: connections, bandwidth, workers, pumper
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ntcp_transport::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TransportConfigBuilder::new().max_connections(512).build();
//! let clock = RouterClock::synchronized();
//! let local = LocalRouter::generate(config.network_id, Some("0.0.0.0:12345".parse()?), clock.now());
//! let (listener, mut events) = ChannelListener::new();
//! let ctx = TransportContext::new(config, local, clock, Arc::new(listener));
//!
//! let (pumper, _thread) = EventPumper::spawn(ctx)?;
//! pumper.listen("0.0.0.0:12345".parse()?)?;
//! while let Some(event) = events.blocking_recv() {
//!     if let TransportEvent::Message { message, .. } = event {
//!         println!("message {} type {}", message.id, message.msg_type);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
pub mod core;
pub mod crypto;
pub mod establish;
pub mod router;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        CodecError, EstablishError, I2npMessage, NtcpError, OutNetMessage, RouterClock,
        TransportConfig, TransportConfigBuilder, TransportError,
    };
    pub use crate::router::{LocalRouter, RouterHash, RouterIdentity, RouterInfo};
    pub use crate::transport::{
        CloseReason, Connection, Origin, TransportContext, TransportListener,
    };

    #[cfg(feature = "transport")]
    pub use crate::transport::{ChannelListener, EventPumper, PumperHandle, TransportEvent};
}

// Re-export commonly used items at crate root
pub use crate::core::{NtcpError, TransportConfig};
pub use crate::transport::{Connection, TransportContext};
