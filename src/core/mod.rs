//! Core types shared by every layer of the transport.
//!
//! - [`constants`]: wire sizes and timing bounds
//! - Error taxonomy ([`EstablishError`], [`CodecError`], [`TransportError`])
//! - [`TransportConfig`] and its builder
//! - [`RouterClock`], the adjustable router time source
//! - [`I2npMessage`] / [`OutNetMessage`], the opaque message envelope

mod clock;
mod config;
pub mod constants;
mod error;
mod message;

pub use clock::RouterClock;
pub use config::{TransportConfig, TransportConfigBuilder};
pub use constants::*;
pub use error::*;
pub use message::{I2NP_HEADER_SIZE, I2NP_SHORT_HEADER_SIZE, I2npMessage, OutNetMessage};
