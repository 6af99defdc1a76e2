//! Router records as seen by the transport.
//!
//! The network database owns router records; the transport only needs to
//! parse, verify and address them.

mod identity;
mod info;
mod local;

pub use identity::{
    CERT_KEY, CERT_NULL, IDENTITY_SIZE, RouterHash, RouterIdentity, SIG_TYPE_DSA_SHA1, SIG_TYPE_ED25519,
    signature_len, signature_type,
};
pub use info::{RouterAddress, RouterInfo};
pub use local::LocalRouter;
