//! Upward interface to the routing layer.

use std::sync::Arc;

use crate::core::{I2npMessage, OutNetMessage};
use crate::router::RouterIdentity;

use super::connection::Connection;

/// Callbacks from connections to whatever owns the transport.
///
/// Called from worker threads, never while a connection lock is held.
pub trait TransportListener: Send + Sync {
    /// Handshake finished; `skew_secs` is local minus peer.
    fn on_established(&self, con: &Arc<Connection>, peer: &RouterIdentity, skew_secs: i64);

    /// A message arrived.
    fn on_message(&self, con: &Arc<Connection>, message: I2npMessage);

    /// A queued message was written out, or dropped when `success` is false.
    fn on_send_complete(&self, con: &Arc<Connection>, message: OutNetMessage, success: bool);

    /// The connection closed. Called exactly once.
    fn on_closed(&self, con: &Arc<Connection>);

    /// The peer pushed a router info record.
    fn on_router_info(&self, con: &Arc<Connection>, info: Vec<u8>) {
        let _ = (con, info);
    }
}

#[cfg(feature = "transport")]
pub use channel::{ChannelListener, TransportEvent};

#[cfg(feature = "transport")]
mod channel {
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use tracing::trace;

    use crate::core::{I2npMessage, OutNetMessage};
    use crate::router::{RouterHash, RouterIdentity};
    use crate::transport::connection::Connection;

    use super::TransportListener;

    /// Events forwarded by [`ChannelListener`].
    #[derive(Debug)]
    pub enum TransportEvent {
        /// A connection finished its handshake.
        Established {
            /// The connection, usable for sending.
            connection: Arc<Connection>,
            /// Peer hash.
            peer: RouterHash,
            /// Local minus peer, seconds.
            skew_secs: i64,
        },
        /// A message arrived.
        Message {
            /// Connection id.
            connection_id: u64,
            /// The message.
            message: I2npMessage,
        },
        /// A queued message finished.
        SendComplete {
            /// Connection id.
            connection_id: u64,
            /// The message.
            message: OutNetMessage,
            /// Written out, or dropped.
            success: bool,
        },
        /// A router info record arrived.
        RouterInfo {
            /// Connection id.
            connection_id: u64,
            /// Serialized record.
            info: Vec<u8>,
        },
        /// A connection closed.
        Closed {
            /// Connection id.
            connection_id: u64,
        },
    }

    /// Forwards listener callbacks to an async consumer.
    #[derive(Debug, Clone)]
    pub struct ChannelListener {
        tx: mpsc::UnboundedSender<TransportEvent>,
    }

    impl ChannelListener {
        /// Create a listener and the receiving end of its channel.
        pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { tx }, rx)
        }

        fn emit(&self, event: TransportEvent) {
            if self.tx.send(event).is_err() {
                trace!("event receiver dropped");
            }
        }
    }

    impl TransportListener for ChannelListener {
        fn on_established(&self, con: &Arc<Connection>, peer: &RouterIdentity, skew_secs: i64) {
            self.emit(TransportEvent::Established {
                connection: con.clone(),
                peer: peer.hash(),
                skew_secs,
            });
        }

        fn on_message(&self, con: &Arc<Connection>, message: I2npMessage) {
            self.emit(TransportEvent::Message {
                connection_id: con.id(),
                message,
            });
        }

        fn on_send_complete(&self, con: &Arc<Connection>, message: OutNetMessage, success: bool) {
            self.emit(TransportEvent::SendComplete {
                connection_id: con.id(),
                message,
                success,
            });
        }

        fn on_closed(&self, con: &Arc<Connection>) {
            self.emit(TransportEvent::Closed {
                connection_id: con.id(),
            });
        }

        fn on_router_info(&self, con: &Arc<Connection>, info: Vec<u8>) {
            self.emit(TransportEvent::RouterInfo {
                connection_id: con.id(),
                info,
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::core::{I2npMessage, OutNetMessage};
    use crate::router::RouterIdentity;
    use crate::transport::connection::Connection;

    use super::TransportListener;

    /// Records every callback for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingListener {
        pub established: Mutex<Vec<(u64, RouterIdentity, i64)>>,
        pub messages: Mutex<Vec<(u64, I2npMessage)>>,
        pub sent: Mutex<Vec<(u64, u32, bool)>>,
        pub closed: Mutex<Vec<u64>>,
    }

    impl TransportListener for RecordingListener {
        fn on_established(&self, con: &Arc<Connection>, peer: &RouterIdentity, skew_secs: i64) {
            self.established.lock().push((con.id(), peer.clone(), skew_secs));
        }

        fn on_message(&self, con: &Arc<Connection>, message: I2npMessage) {
            self.messages.lock().push((con.id(), message));
        }

        fn on_send_complete(&self, con: &Arc<Connection>, message: OutNetMessage, success: bool) {
            self.sent.lock().push((con.id(), message.message().id, success));
        }

        fn on_closed(&self, con: &Arc<Connection>) {
            self.closed.lock().push(con.id());
        }
    }
}
