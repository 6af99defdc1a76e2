//! One NTCP connection.
//!
//! Implements the connection lifecycle:
//!
//! ```text
//! Establishing(Establishment) ──handshake──▶ Established(FrameCodec)
//!          │                                        │
//!          └──────────────── close() ───────────────┴──▶ Closed
//! ```
//!
//! The pumper copies socket bytes in with [`Connection::queue_read`] and
//! drains ciphertext with [`Connection::write_to`]. Handshake and cipher work
//! happens in [`Connection::process_read`] and
//! [`Connection::prepare_next_write`], which the [`Dispatcher`] runs on the
//! reader and writer pools.
//!
//! Locks are taken in the order phase, outbound, queues. Listener callbacks
//! run with no lock held.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::{Rng, thread_rng};
use tracing::{debug, info, trace, warn};

use crate::codec::{FrameCodec, Inbound};
use crate::core::{
    BACKLOG_GRACE, BACKLOG_QUEUE_TIME, CodecError, EstablishError, FIFO_AFTER,
    MAX_CONSECUTIVE_BACKLOG, OutNetMessage, PRIORITY_SCAN_LIMIT, TransportError,
};
use crate::establish::{Established, Establishment, Step};
use crate::router::{RouterIdentity, RouterInfo};

use super::bandwidth::{BandwidthRequest, Direction, RequestCompletion, RequestStatus};
use super::context::TransportContext;
use super::dispatch::Dispatcher;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted from a peer; we are Bob.
    Inbound,
    /// Opened by us; we are Alice.
    Outbound,
}

/// Why a connection is closed. Established NTCP2 connections send the
/// matching TERMINATION code before the socket is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the owner.
    Normal,
    /// The peer sent a TERMINATION block.
    TerminationReceived,
    /// Nothing sent or received for too long.
    IdleTimeout,
    /// The transport is shutting down.
    Shutdown,
    /// A data phase frame did not authenticate.
    AeadFailure,
    /// Keepalive skew out of bounds.
    ClockSkew,
    /// Malformed data phase frame.
    PayloadFormat,
    /// The peer is banned.
    Banned,
    /// The handshake failed.
    HandshakeFailed,
    /// The handshake did not finish in time.
    EstablishTimeout,
    /// The outbound queue stayed backed up.
    Backlogged,
    /// Socket error or EOF.
    Io,
}

impl CloseReason {
    /// NTCP2 termination reason code.
    pub fn termination_code(self) -> u8 {
        match self {
            CloseReason::Normal | CloseReason::Backlogged | CloseReason::Io => 0,
            CloseReason::TerminationReceived => 1,
            CloseReason::IdleTimeout | CloseReason::EstablishTimeout => 2,
            CloseReason::Shutdown => 3,
            CloseReason::AeadFailure => 4,
            CloseReason::ClockSkew => 7,
            CloseReason::PayloadFormat => 10,
            CloseReason::HandshakeFailed => 13,
            CloseReason::Banned => 17,
        }
    }

    // No point writing to a peer that already hung up or terminated.
    fn sends_termination(self) -> bool {
        !matches!(self, CloseReason::TerminationReceived | CloseReason::Io)
    }
}

impl From<&CodecError> for CloseReason {
    fn from(e: &CodecError) -> Self {
        match e {
            CodecError::Terminated { .. } => CloseReason::TerminationReceived,
            CodecError::ClockSkewExceeded { .. } => CloseReason::ClockSkew,
            CodecError::AuthenticationFailure | CodecError::Crypto(_) => CloseReason::AeadFailure,
            CodecError::ProtocolViolation(_) | CodecError::BadChecksum | CodecError::Oversized(_) => {
                CloseReason::PayloadFormat
            }
        }
    }
}

impl From<&EstablishError> for CloseReason {
    fn from(e: &EstablishError) -> Self {
        match e {
            EstablishError::Banned => CloseReason::Banned,
            EstablishError::ClockSkewExceeded { .. } => CloseReason::ClockSkew,
            _ => CloseReason::HandshakeFailed,
        }
    }
}

enum Phase {
    Establishing(Establishment),
    Established(FrameCodec),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkKind {
    Handshake,
    Keepalive,
    Message,
    Data,
}

/// Bytes waiting in a read or write queue, possibly behind a bandwidth
/// request.
struct Chunk {
    data: Vec<u8>,
    pos: usize,
    kind: ChunkKind,
    request: Option<Arc<BandwidthRequest>>,
}

impl Chunk {
    fn new(data: Vec<u8>, kind: ChunkKind, request: Option<Arc<BandwidthRequest>>) -> Self {
        Self {
            data,
            pos: 0,
            kind,
            request,
        }
    }

    fn is_ready(&self) -> bool {
        self.request
            .as_ref()
            .is_none_or(|r| r.status() == RequestStatus::Satisfied)
    }
}

#[derive(Default)]
struct Queues {
    reads: VecDeque<Chunk>,
    writes: VecDeque<Chunk>,
}

impl Queues {
    fn reads_throttled(&self) -> bool {
        self.reads.iter().any(|c| !c.is_ready())
    }

    fn writable(&self) -> bool {
        self.writes.front().is_some_and(Chunk::is_ready)
    }

    fn abort_all(&mut self) {
        for chunk in self.reads.iter().chain(self.writes.iter()) {
            if let Some(request) = &chunk.request {
                request.abort();
            }
        }
        self.reads.clear();
        self.writes.clear();
    }
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<OutNetMessage>,
    // Encoded and handed to the write queue, not yet fully written.
    current: Option<OutNetMessage>,
    consecutive_backlog: u32,
}

impl Outbound {
    fn queue_time(&self) -> Duration {
        self.current
            .as_ref()
            .or(self.queue.front())
            .map(OutNetMessage::queue_time)
            .unwrap_or_default()
    }
}

/// Pick the next message: plain FIFO once the head has waited too long,
/// otherwise the highest priority among the first few queued.
fn select_next(queue: &mut VecDeque<OutNetMessage>) -> Option<OutNetMessage> {
    if queue.front()?.queue_time() > FIFO_AFTER {
        return queue.pop_front();
    }
    let mut best = 0;
    for (i, msg) in queue.iter().enumerate().take(PRIORITY_SCAN_LIMIT) {
        if msg.priority() > queue[best].priority() {
            best = i;
        }
    }
    queue.remove(best)
}

struct Activity {
    established_at: Option<Instant>,
    last_send: Instant,
    last_receive: Instant,
    next_keepalive: Instant,
}

#[derive(Default)]
struct Stats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// A connection to one peer.
pub struct Connection {
    id: u64,
    origin: Origin,
    remote_addr: Option<SocketAddr>,
    created: Instant,
    ctx: Arc<TransportContext>,
    dispatcher: Arc<dyn Dispatcher>,
    this: Weak<Connection>,
    phase: Mutex<Phase>,
    outbound: Mutex<Outbound>,
    queues: Mutex<Queues>,
    peer: Mutex<Option<RouterIdentity>>,
    activity: Mutex<Activity>,
    skew_secs: AtomicI64,
    closed: AtomicBool,
    stats: Stats,
}

impl Connection {
    fn build(
        ctx: Arc<TransportContext>,
        dispatcher: Arc<dyn Dispatcher>,
        origin: Origin,
        remote_addr: Option<SocketAddr>,
        peer: Option<RouterIdentity>,
        establishment: Establishment,
        created: Instant,
    ) -> Arc<Self> {
        let id = ctx.next_connection_id();
        Arc::new_cyclic(|this| Self {
            id,
            origin,
            remote_addr,
            created,
            ctx,
            dispatcher,
            this: this.clone(),
            phase: Mutex::new(Phase::Establishing(establishment)),
            outbound: Mutex::new(Outbound::default()),
            queues: Mutex::new(Queues::default()),
            peer: Mutex::new(peer),
            activity: Mutex::new(Activity {
                established_at: None,
                last_send: created,
                last_receive: created,
                next_keepalive: created,
            }),
            skew_secs: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            stats: Stats::default(),
        })
    }

    /// A connection accepted from `remote_addr`. The handshake variant is
    /// picked once the first bytes arrive.
    pub fn inbound(
        ctx: Arc<TransportContext>,
        dispatcher: Arc<dyn Dispatcher>,
        remote_addr: Option<SocketAddr>,
    ) -> Arc<Self> {
        let created = Instant::now();
        let establishment = Establishment::inbound(remote_addr.map(|a| a.ip()), created);
        let con = Self::build(ctx, dispatcher, Origin::Inbound, remote_addr, None, establishment, created);
        debug!(id = con.id, remote = ?remote_addr, "inbound connection");
        con
    }

    /// A connection to `peer`, using NTCP2 when both sides support it.
    pub fn outbound(
        ctx: Arc<TransportContext>,
        dispatcher: Arc<dyn Dispatcher>,
        peer: &RouterInfo,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Arc<Self>, TransportError> {
        let hash = peer.hash();
        if ctx.banlist().is_banned(&hash) {
            return Err(EstablishError::Banned.into());
        }
        if remote_addr.is_some_and(|addr| ctx.blocklist().is_blocked(&addr.ip())) {
            return Err(TransportError::Blocklisted);
        }
        let created = Instant::now();
        let establishment = Establishment::outbound(&ctx, peer, created)?;
        let version = establishment.version();
        let con = Self::build(
            ctx,
            dispatcher,
            Origin::Outbound,
            remote_addr,
            Some(peer.identity().clone()),
            establishment,
            created,
        );
        debug!(id = con.id, peer = %hash, ?version, "outbound connection");
        Ok(con)
    }

    /// Connection id, unique per transport.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Which side opened the connection.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Whether the peer opened the connection.
    pub fn is_inbound(&self) -> bool {
        self.origin == Origin::Inbound
    }

    /// Remote socket address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The peer, known from the start for outbound connections and after the
    /// handshake for inbound ones.
    pub fn peer(&self) -> Option<RouterIdentity> {
        self.peer.lock().clone()
    }

    /// Handshake finished and the connection is open.
    pub fn is_established(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Established(_))
    }

    /// Closed for good.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Protocol version in use: 1 legacy, 2 NTCP2, `None` before it is known.
    pub fn version(&self) -> Option<u8> {
        match &*self.phase.lock() {
            Phase::Establishing(est) => est.version(),
            Phase::Established(codec) => Some(codec.version()),
            Phase::Closed => None,
        }
    }

    /// Clock skew, local minus peer, seconds.
    pub fn clock_skew_secs(&self) -> i64 {
        self.skew_secs.load(Ordering::Relaxed)
    }

    /// Time since the connection object was created.
    pub fn time_since_created(&self) -> Duration {
        self.created.elapsed()
    }

    /// Time since establishment, or since creation before that.
    pub fn uptime(&self) -> Duration {
        self.activity.lock().established_at.unwrap_or(self.created).elapsed()
    }

    /// Time since a message or keepalive was fully written.
    pub fn time_since_send(&self) -> Duration {
        self.activity.lock().last_send.elapsed()
    }

    /// Time since bytes were received.
    pub fn time_since_receive(&self) -> Duration {
        self.activity.lock().last_receive.elapsed()
    }

    /// Messages fully written.
    pub fn messages_sent(&self) -> u64 {
        self.stats.messages_sent.load(Ordering::Relaxed)
    }

    /// Messages received.
    pub fn messages_received(&self) -> u64 {
        self.stats.messages_received.load(Ordering::Relaxed)
    }

    /// Bytes written to the socket.
    pub fn bytes_sent(&self) -> u64 {
        self.stats.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes read from the socket.
    pub fn bytes_received(&self) -> u64 {
        self.stats.bytes_received.load(Ordering::Relaxed)
    }

    /// Messages queued, including one being written.
    pub fn outbound_queue_len(&self) -> usize {
        let out = self.outbound.lock();
        out.queue.len() + usize::from(out.current.is_some())
    }

    /// Bytes are ready to be written.
    pub fn has_pending_writes(&self) -> bool {
        self.queues.lock().writable()
    }

    /// The handshake has been running longer than `timeout`.
    pub fn establishment_expired(&self, timeout: Duration) -> bool {
        !self.is_closed() && !self.is_established() && self.created.elapsed() > timeout
    }

    fn owner(&self) -> Weak<dyn RequestCompletion> {
        self.this.clone()
    }

    /// Queue the first handshake message of an outbound connection.
    pub fn prepare_outbound(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut phase = self.phase.lock();
        let Phase::Establishing(est) = &mut *phase else {
            return Err(TransportError::Closed);
        };
        match est.prepare_outbound(&self.ctx) {
            Ok(msg1) => {
                self.queues
                    .lock()
                    .writes
                    .push_back(Chunk::new(msg1, ChunkKind::Handshake, None));
                drop(phase);
                self.dispatcher.wants_write(self);
                Ok(())
            }
            Err(e) => {
                drop(phase);
                self.establish_failed(&e);
                Err(e.into())
            }
        }
    }

    /// Copy bytes read from the socket and admit them through the inbound
    /// bandwidth limiter. Returns true when they were deferred, in which case
    /// the caller should stop reading until [`Dispatcher::wants_read`].
    pub fn queue_read(self: &Arc<Self>, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
        let request = self.ctx.bandwidth().request_inbound(data.len(), self.owner());
        let pending = (request.status() == RequestStatus::Pending).then(|| request.clone());
        self.queues
            .lock()
            .reads
            .push_back(Chunk::new(data.to_vec(), ChunkKind::Data, pending));
        // a refill may have granted it before the chunk was queued
        if request.status() == RequestStatus::Satisfied {
            self.dispatcher.schedule_read(self);
            return false;
        }
        trace!(id = self.id, len = data.len(), "read deferred by bandwidth limiter");
        true
    }

    /// Process every admitted read in order. Runs on a reader worker.
    pub fn process_read(self: &Arc<Self>) {
        while !self.is_closed() {
            let chunk = {
                let mut queues = self.queues.lock();
                if !queues.reads.front().is_some_and(Chunk::is_ready) {
                    return;
                }
                queues.reads.pop_front()
            };
            let Some(chunk) = chunk else {
                return;
            };
            if let Err(e) = self.recv(&chunk.data) {
                trace!(id = self.id, %e, "read processing stopped");
                return;
            }
        }
    }

    /// Feed received bytes to the handshake or the codec.
    pub fn recv(self: &Arc<Self>, data: &[u8]) -> Result<(), TransportError> {
        self.activity.lock().last_receive = Instant::now();
        let now_secs = self.ctx.clock().now_secs();
        let mut phase = self.phase.lock();
        match &mut *phase {
            Phase::Closed => Err(TransportError::Closed),
            Phase::Established(codec) => {
                let mut events = Vec::new();
                let result = codec.decode(data, now_secs, &mut events);
                drop(phase);
                self.deliver(events);
                result.map_err(|e| {
                    self.codec_failed(&e);
                    e.into()
                })
            }
            Phase::Establishing(est) => {
                let Step { output, established } = match est.receive(&self.ctx, data) {
                    Ok(step) => step,
                    Err(e) => {
                        drop(phase);
                        self.establish_failed(&e);
                        return Err(e.into());
                    }
                };
                let wrote = !output.is_empty();
                if wrote {
                    self.queues
                        .lock()
                        .writes
                        .push_back(Chunk::new(output, ChunkKind::Handshake, None));
                }
                let Some(done) = established else {
                    drop(phase);
                    if wrote {
                        self.dispatcher.wants_write(self);
                    }
                    return Ok(());
                };
                let Established {
                    mut codec,
                    peer,
                    peer_info,
                    skew_secs,
                    extra,
                } = done;
                let mut events = Vec::new();
                let decoded = if extra.is_empty() {
                    Ok(())
                } else {
                    codec.decode(&extra, now_secs, &mut events)
                };
                let version = codec.version();
                *phase = Phase::Established(codec);
                drop(phase);
                if wrote {
                    self.dispatcher.wants_write(self);
                }
                self.finish_establishment(peer, peer_info, skew_secs, version);
                self.deliver(events);
                decoded.map_err(|e| {
                    self.codec_failed(&e);
                    e.into()
                })
            }
        }
    }

    fn finish_establishment(
        self: &Arc<Self>,
        peer: RouterIdentity,
        peer_info: Option<RouterInfo>,
        skew_secs: i64,
        version: u8,
    ) {
        let now = Instant::now();
        let freq = self.ctx.config().meta_frequency;
        {
            let mut activity = self.activity.lock();
            activity.established_at = Some(now);
            activity.next_keepalive = now + keepalive_delay(freq);
        }
        self.skew_secs.store(skew_secs, Ordering::Relaxed);
        *self.peer.lock() = Some(peer.clone());
        info!(
            id = self.id,
            peer = %peer.hash(),
            origin = ?self.origin,
            version,
            skew_secs,
            "connection established"
        );
        if self.is_closed() {
            debug!(id = self.id, "closed before establishment was reported");
            return;
        }
        let listener = self.ctx.listener().clone();
        listener.on_established(self, &peer, skew_secs);
        if let Some(info) = peer_info {
            listener.on_router_info(self, info.to_bytes());
        }
        if self.outbound_queue_len() > 0 {
            self.dispatcher.schedule_write(self);
        }
    }

    fn deliver(self: &Arc<Self>, events: Vec<Inbound>) {
        for event in events {
            match event {
                Inbound::Message(msg) => {
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    trace!(id = self.id, msg_id = msg.id, len = msg.payload.len(), "message received");
                    self.ctx.listener().on_message(self, msg);
                }
                Inbound::ClockSkew(skew) => {
                    trace!(id = self.id, skew_secs = skew, "keepalive");
                    self.skew_secs.store(skew, Ordering::Relaxed);
                }
                Inbound::RouterInfo(info) => self.ctx.listener().on_router_info(self, info),
                Inbound::Options(options) => debug!(id = self.id, ?options, "peer padding options"),
            }
        }
    }

    fn establish_failed(self: &Arc<Self>, e: &EstablishError) {
        if e.is_skew() {
            warn!(id = self.id, remote = ?self.remote_addr, %e, "handshake failed on clock skew");
        } else {
            warn!(id = self.id, remote = ?self.remote_addr, %e, "handshake failed");
        }
        if let (true, Some(addr)) = (e.blocks_remote(), self.remote_addr) {
            self.ctx.blocklist().add(addr.ip());
        }
        self.close(CloseReason::from(e));
    }

    fn codec_failed(self: &Arc<Self>, e: &CodecError) {
        let peer = self.peer.lock().as_ref().map(RouterIdentity::hash);
        match e {
            CodecError::Terminated { reason } => {
                debug!(id = self.id, ?peer, reason, "terminated by peer");
            }
            _ => warn!(id = self.id, ?peer, %e, "data phase error"),
        }
        self.close(CloseReason::from(e));
    }

    fn too_backlogged(&self, out: &Outbound) -> bool {
        let queue_time = out.queue_time();
        if queue_time.is_zero() || self.uptime() < BACKLOG_GRACE {
            return false;
        }
        if queue_time > BACKLOG_QUEUE_TIME {
            warn!(
                id = self.id,
                queue_time_ms = queue_time.as_millis() as u64,
                queued = out.queue.len(),
                writing = out.current.is_some(),
                "too backlogged"
            );
            return true;
        }
        false
    }

    /// Queue `msg`. On error the message has already been reported through
    /// [`TransportListener::on_send_complete`](super::TransportListener::on_send_complete)
    /// as failed.
    pub fn send(self: &Arc<Self>, msg: OutNetMessage) -> Result<(), TransportError> {
        let mut out = self.outbound.lock();
        // close() marks the connection before draining the queue, so checking
        // under the lock guarantees the message is either drained or refused.
        if self.is_closed() {
            drop(out);
            self.ctx.listener().on_send_complete(self, msg, false);
            return Err(TransportError::Closed);
        }
        if self.too_backlogged(&out) {
            out.consecutive_backlog += 1;
            let count = out.consecutive_backlog;
            drop(out);
            self.ctx.listener().on_send_complete(self, msg, false);
            if count > MAX_CONSECUTIVE_BACKLOG {
                warn!(id = self.id, count, "backlogged for too long");
                self.close(CloseReason::Backlogged);
            }
            return Err(TransportError::Backlogged);
        }
        out.consecutive_backlog = 0;
        out.queue.push_back(msg);
        let idle = out.current.is_none();
        trace!(id = self.id, queued = out.queue.len(), "message queued");
        drop(out);
        if idle && self.is_established() {
            self.dispatcher.schedule_write(self);
        }
        Ok(())
    }

    /// Ask for a keepalive if one is due.
    pub fn check_keepalive(self: &Arc<Self>) {
        let due = Instant::now() >= self.activity.lock().next_keepalive;
        if due && self.is_established() {
            self.dispatcher.schedule_write(self);
        }
    }

    /// Encrypt the next queued message, and a keepalive if one is due, into
    /// the write queue. Runs on a writer worker.
    pub fn prepare_next_write(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let mut phase = self.phase.lock();
        let Phase::Established(codec) = &mut *phase else {
            return;
        };

        let mut failure = None;
        let mut handed_off = false;
        let now = Instant::now();
        let keepalive_due = {
            let mut activity = self.activity.lock();
            let due = now >= activity.next_keepalive;
            if due {
                activity.next_keepalive = now + keepalive_delay(self.ctx.config().meta_frequency);
            }
            due
        };
        if keepalive_due {
            match codec.encode_keepalive(self.ctx.clock().now_secs()) {
                Ok(frame) => {
                    trace!(id = self.id, "sending keepalive");
                    self.hand_off(frame, ChunkKind::Keepalive);
                    handed_off = true;
                }
                Err(e) => failure = Some(e),
            }
        }

        let mut dropped = None;
        if failure.is_none() {
            let mut out = self.outbound.lock();
            let next = if out.current.is_none() {
                select_next(&mut out.queue)
            } else {
                None
            };
            if let Some(msg) = next {
                match codec.encode_message(msg.message()) {
                    Ok(frame) => {
                        trace!(
                            id = self.id,
                            msg_id = msg.message().id,
                            priority = msg.priority(),
                            len = frame.len(),
                            "message encrypted"
                        );
                        out.current = Some(msg);
                        self.hand_off(frame, ChunkKind::Message);
                        handed_off = true;
                    }
                    Err(CodecError::Oversized(len)) => {
                        warn!(id = self.id, len, "message too large, dropped");
                        dropped = Some(msg);
                    }
                    Err(e) => {
                        out.queue.push_front(msg);
                        failure = Some(e);
                    }
                }
            }
        }
        drop(phase);

        if let Some(e) = failure {
            self.codec_failed(&e);
            return;
        }
        if let Some(msg) = dropped {
            self.ctx.listener().on_send_complete(self, msg, false);
            self.dispatcher.schedule_write(self);
        }
        if handed_off && self.has_pending_writes() {
            self.dispatcher.wants_write(self);
        }
    }

    // Called with the phase lock held so wire order matches cipher order.
    fn hand_off(&self, frame: Vec<u8>, kind: ChunkKind) {
        let request = self.ctx.bandwidth().request_outbound(frame.len(), self.owner());
        let request = (request.status() == RequestStatus::Pending).then_some(request);
        if request.is_some() {
            trace!(id = self.id, len = frame.len(), "write deferred by bandwidth limiter");
        }
        self.queues.lock().writes.push_back(Chunk::new(frame, kind, request));
    }

    /// Write admitted bytes to `w` until it would block or nothing admitted
    /// is left. Returns whether admitted bytes remain.
    pub fn write_to<W: Write>(self: &Arc<Self>, w: &mut W) -> io::Result<bool> {
        let mut completed = Vec::new();
        let mut written = 0u64;
        let result = {
            let mut queues = self.queues.lock();
            loop {
                let Some(chunk) = queues.writes.front_mut() else {
                    break Ok(false);
                };
                if !chunk.is_ready() {
                    break Ok(false);
                }
                match w.write(&chunk.data[chunk.pos..]) {
                    Ok(0) => break Ok(true),
                    Ok(n) => {
                        chunk.pos += n;
                        written += n as u64;
                        if chunk.pos == chunk.data.len() {
                            let kind = chunk.kind;
                            queues.writes.pop_front();
                            completed.push(kind);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break Err(e),
                }
            }
        };
        self.stats.bytes_sent.fetch_add(written, Ordering::Relaxed);
        if !completed.is_empty() {
            self.writes_completed(&completed);
        }
        result
    }

    fn writes_completed(self: &Arc<Self>, kinds: &[ChunkKind]) {
        let now = Instant::now();
        let messages = kinds.iter().filter(|k| **k == ChunkKind::Message).count();
        if kinds.iter().any(|k| matches!(k, ChunkKind::Message | ChunkKind::Keepalive)) {
            self.activity.lock().last_send = now;
        }
        if messages == 0 {
            return;
        }
        let (sent, more) = {
            let mut out = self.outbound.lock();
            (out.current.take(), !out.queue.is_empty())
        };
        if let Some(msg) = sent {
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            trace!(
                id = self.id,
                msg_id = msg.message().id,
                send_time_ms = msg.queue_time().as_millis() as u64,
                "message sent"
            );
            self.ctx.listener().on_send_complete(self, msg, true);
        }
        if more {
            self.dispatcher.schedule_write(self);
        }
    }

    /// Close the connection. Idempotent: only the first call releases key
    /// material, fails queued messages and notifies the listener.
    pub fn close(self: &Arc<Self>, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let final_bytes = {
            let mut phase = self.phase.lock();
            match mem::replace(&mut *phase, Phase::Closed) {
                Phase::Established(mut codec) => {
                    let bytes = if reason.sends_termination() {
                        codec.encode_termination(reason.termination_code()).ok().flatten()
                    } else {
                        None
                    };
                    codec.destroy();
                    bytes
                }
                Phase::Establishing(mut est) => {
                    est.destroy();
                    None
                }
                Phase::Closed => None,
            }
        };
        let failed: Vec<OutNetMessage> = {
            let mut out = self.outbound.lock();
            out.current.take().into_iter().chain(out.queue.drain(..)).collect()
        };
        self.queues.lock().abort_all();

        info!(
            id = self.id,
            ?reason,
            peer = ?self.peer.lock().as_ref().map(RouterIdentity::hash),
            uptime_ms = self.uptime().as_millis() as u64,
            sent = self.messages_sent(),
            received = self.messages_received(),
            failed = failed.len(),
            "connection closed"
        );
        self.dispatcher.deregister(self, final_bytes);
        let listener = self.ctx.listener().clone();
        for msg in failed {
            listener.on_send_complete(self, msg, false);
        }
        listener.on_closed(self);
    }
}

fn keepalive_delay(frequency: Duration) -> Duration {
    let ms = frequency.as_millis() as u64;
    Duration::from_millis(ms / 2 + thread_rng().gen_range(0..ms.max(1)))
}

impl RequestCompletion for Connection {
    fn complete(self: Arc<Self>, request: &Arc<BandwidthRequest>) {
        if self.is_closed() {
            return;
        }
        match request.direction() {
            Direction::Inbound => {
                self.dispatcher.schedule_read(&self);
                if !self.queues.lock().reads_throttled() {
                    self.dispatcher.wants_read(&self);
                }
            }
            Direction::Outbound => self.dispatcher.wants_write(&self),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crate::core::{I2npMessage, RouterClock, TransportConfig, TransportConfigBuilder};
    use crate::transport::context::testing::{context, context_with};
    use crate::transport::dispatch::manual::ManualDispatcher;
    use crate::transport::listener::recording::RecordingListener;

    struct Side {
        ctx: Arc<TransportContext>,
        listener: Arc<RecordingListener>,
        dispatcher: Arc<ManualDispatcher>,
    }

    impl Side {
        fn new(config: TransportConfig, clock: RouterClock) -> Self {
            let (ctx, listener) = context_with(config, clock);
            Self {
                ctx,
                listener,
                dispatcher: Arc::new(ManualDispatcher::default()),
            }
        }
    }

    fn message(id: u32, len: usize) -> I2npMessage {
        I2npMessage::new(20, id, 1_900_000_000_000, vec![id as u8; len])
    }

    // Virtual seconds handed to the bandwidth limiters; only ever grows.
    static TICKS: AtomicU64 = AtomicU64::new(0);

    /// Move bytes both ways until neither side has anything to say.
    fn pump(a: (&Side, &Arc<Connection>), b: (&Side, &Arc<Connection>)) {
        for _ in 0..400 {
            let tick = TICKS.fetch_add(10, Ordering::Relaxed) + 10;
            let later = Instant::now() + Duration::from_secs(tick);
            a.0.ctx.bandwidth().refill_at(later);
            b.0.ctx.bandwidth().refill_at(later);
            a.0.dispatcher.run();
            b.0.dispatcher.run();
            let mut moved = false;
            for (from, to) in [(a.1, b.1), (b.1, a.1)] {
                let mut wire = Vec::new();
                from.write_to(&mut wire).unwrap();
                if !wire.is_empty() {
                    moved = true;
                    to.queue_read(&wire);
                }
            }
            let busy = a.0.dispatcher.pending() + b.0.dispatcher.pending() > 0;
            let throttled = [a.1, b.1].iter().any(|c| !c.queues.lock().reads.is_empty());
            if !moved && !busy && !throttled {
                return;
            }
        }
        panic!("connections never went quiet");
    }

    fn connect(alice: &Side, bob: &Side) -> (Arc<Connection>, Arc<Connection>) {
        let a = Connection::outbound(
            alice.ctx.clone(),
            alice.dispatcher.clone(),
            bob.ctx.local().router_info(),
            None,
        )
        .unwrap();
        let b = Connection::inbound(
            bob.ctx.clone(),
            bob.dispatcher.clone(),
            Some("10.1.2.3:4567".parse().unwrap()),
        );
        a.prepare_outbound().unwrap();
        pump((alice, &a), (bob, &b));
        (a, b)
    }

    fn assert_end_to_end(config: TransportConfig, version: u8) {
        let alice = Side::new(config.clone(), RouterClock::synchronized());
        let bob = Side::new(config, RouterClock::with_offset(-15_000));
        let (a, b) = connect(&alice, &bob);

        assert!(a.is_established() && b.is_established());
        assert_eq!(a.version(), Some(version));
        assert_eq!(b.peer(), Some(alice.ctx.local().identity().clone()));
        assert!((a.clock_skew_secs() - 15).abs() <= 1, "alice skew {}", a.clock_skew_secs());
        assert!((b.clock_skew_secs() + 15).abs() <= 1, "bob skew {}", b.clock_skew_secs());
        assert_eq!(alice.listener.established.lock().len(), 1);
        assert_eq!(bob.listener.established.lock()[0].1, *alice.ctx.local().identity());

        let small = message(1, 10);
        let large = message(2, 5000);
        a.send(OutNetMessage::new(small.clone(), 100)).unwrap();
        a.send(OutNetMessage::new(large.clone(), 100)).unwrap();
        b.send(OutNetMessage::new(message(3, 1), 100)).unwrap();
        pump((&alice, &a), (&bob, &b));

        let received: Vec<_> = bob.listener.messages.lock().iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(received, vec![small, large]);
        assert_eq!(alice.listener.messages.lock().len(), 1);
        assert_eq!(*alice.listener.sent.lock(), vec![(a.id(), 1, true), (a.id(), 2, true)]);
        assert_eq!(a.messages_sent(), 2);
        assert_eq!(b.messages_received(), 2);
    }

    #[test]
    fn test_legacy_connections_end_to_end() {
        assert_end_to_end(TransportConfigBuilder::new().ntcp2(false).build(), 1);
    }

    #[test]
    fn test_ntcp2_connections_end_to_end() {
        assert_end_to_end(TransportConfig::default(), 2);
    }

    #[test]
    fn test_messages_queued_before_establishment_are_sent() {
        let alice = Side::new(TransportConfig::default(), RouterClock::synchronized());
        let bob = Side::new(TransportConfig::default(), RouterClock::synchronized());
        let a = Connection::outbound(
            alice.ctx.clone(),
            alice.dispatcher.clone(),
            bob.ctx.local().router_info(),
            None,
        )
        .unwrap();
        a.send(OutNetMessage::new(message(9, 100), 1)).unwrap();
        assert_eq!(alice.dispatcher.pending(), 0);

        let b = Connection::inbound(bob.ctx.clone(), bob.dispatcher.clone(), None);
        a.prepare_outbound().unwrap();
        pump((&alice, &a), (&bob, &b));
        assert_eq!(bob.listener.messages.lock().len(), 1);
        assert_eq!(a.outbound_queue_len(), 0);
    }

    #[test]
    fn test_throttled_reads_are_replayed() {
        let config = TransportConfigBuilder::new().bandwidth(64, 0).build();
        let alice = Side::new(TransportConfig::default(), RouterClock::synchronized());
        let bob = Side::new(config, RouterClock::synchronized());
        let (a, b) = connect(&alice, &bob);
        assert!(a.is_established() && b.is_established());
        assert!(*bob.dispatcher.read_wakeups.lock() > 0);

        a.send(OutNetMessage::new(message(5, 500), 1)).unwrap();
        pump((&alice, &a), (&bob, &b));
        assert_eq!(bob.listener.messages.lock().len(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (ctx, listener) = context();
        let bob = context().0;
        let dispatcher = Arc::new(ManualDispatcher::default());
        let con = Connection::outbound(ctx, dispatcher.clone(), bob.local().router_info(), None).unwrap();
        con.send(OutNetMessage::new(message(1, 10), 1)).unwrap();
        con.send(OutNetMessage::new(message(2, 10), 1)).unwrap();

        con.close(CloseReason::Normal);
        con.close(CloseReason::Normal);

        assert!(con.is_closed());
        assert_eq!(*listener.closed.lock(), vec![con.id()]);
        assert_eq!(*listener.sent.lock(), vec![(con.id(), 1, false), (con.id(), 2, false)]);
        assert_eq!(dispatcher.deregistered.lock().len(), 1);
        assert!(dispatcher.deregistered.lock()[0].1.is_none());
        assert!(matches!(con.recv(&[0; 64]), Err(TransportError::Closed)));
        assert!(matches!(
            con.send(OutNetMessage::new(message(3, 1), 1)),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_send_racing_close_is_reported() {
        let (ctx, listener) = context();
        let bob = context().0;
        let con = Connection::outbound(ctx, Arc::new(ManualDispatcher::default()), bob.local().router_info(), None)
            .unwrap();

        let held = con.outbound.lock();
        let sender = {
            let con = con.clone();
            thread::spawn(move || con.send(OutNetMessage::new(message(7, 10), 1)))
        };
        thread::sleep(Duration::from_millis(50));
        let closer = {
            let con = con.clone();
            thread::spawn(move || con.close(CloseReason::Normal))
        };
        while !con.is_closed() {
            thread::yield_now();
        }
        drop(held);
        closer.join().unwrap();

        assert!(matches!(sender.join().unwrap(), Err(TransportError::Closed)));
        assert_eq!(con.outbound_queue_len(), 0);
        assert_eq!(*listener.sent.lock(), vec![(con.id(), 7, false)]);
        assert_eq!(*listener.closed.lock(), vec![con.id()]);
    }

    #[test]
    fn test_established_not_reported_after_close() {
        let (ctx, listener) = context();
        let bob = context().0;
        let con = Connection::outbound(ctx, Arc::new(ManualDispatcher::default()), bob.local().router_info(), None)
            .unwrap();
        con.close(CloseReason::Shutdown);
        con.finish_establishment(bob.local().identity().clone(), None, 0, 2);

        assert!(listener.established.lock().is_empty());
        assert_eq!(*listener.closed.lock(), vec![con.id()]);
    }

    #[test]
    fn test_close_sends_termination_on_ntcp2_only() {
        for (config, expect_final) in [
            (TransportConfig::default(), true),
            (TransportConfigBuilder::new().ntcp2(false).build(), false),
        ] {
            let alice = Side::new(config.clone(), RouterClock::synchronized());
            let bob = Side::new(config, RouterClock::synchronized());
            let (a, b) = connect(&alice, &bob);
            a.close(CloseReason::IdleTimeout);
            let final_bytes = alice.dispatcher.deregistered.lock()[0].1.clone();
            assert_eq!(final_bytes.is_some(), expect_final);

            if let Some(bytes) = final_bytes {
                b.queue_read(&bytes);
                bob.dispatcher.run();
                assert!(b.is_closed());
                // the peer hung up on us, nothing more to say
                assert!(bob.dispatcher.deregistered.lock()[0].1.is_none());
            }
        }
    }

    #[test]
    fn test_failed_handshake_closes_and_blocklists() {
        let alice = Side::new(TransportConfigBuilder::new().network_id(7).build(), RouterClock::synchronized());
        let bob = Side::new(TransportConfig::default(), RouterClock::synchronized());
        let a = Connection::outbound(
            alice.ctx.clone(),
            alice.dispatcher.clone(),
            bob.ctx.local().router_info(),
            None,
        )
        .unwrap();
        let remote: SocketAddr = "10.9.9.9:1000".parse().unwrap();
        let b = Connection::inbound(bob.ctx.clone(), bob.dispatcher.clone(), Some(remote));
        a.prepare_outbound().unwrap();
        pump((&alice, &a), (&bob, &b));

        assert!(b.is_closed());
        assert!(!b.is_established());
        assert!(bob.ctx.blocklist().is_blocked(&remote.ip()));
        assert_eq!(*bob.listener.closed.lock(), vec![b.id()]);
        assert!(bob.listener.established.lock().is_empty());
    }

    #[test]
    fn test_expired_establishment() {
        let (ctx, _) = context();
        let con = Connection::inbound(ctx, Arc::new(ManualDispatcher::default()), None);
        assert!(!con.establishment_expired(Duration::from_secs(10)));
        assert!(con.establishment_expired(Duration::ZERO));
        con.close(CloseReason::EstablishTimeout);
        assert!(!con.establishment_expired(Duration::ZERO));
    }

    #[test]
    fn test_backlog_closes_after_repeated_failures() {
        let alice = Side::new(TransportConfig::default(), RouterClock::synchronized());
        let bob = Side::new(TransportConfig::default(), RouterClock::synchronized());
        let (a, _b) = connect(&alice, &bob);
        a.activity.lock().established_at = Instant::now().checked_sub(BACKLOG_GRACE + Duration::from_secs(1));

        let mut stale = OutNetMessage::new(message(1, 10), 1);
        stale.backdate(BACKLOG_QUEUE_TIME + Duration::from_secs(1));
        a.send(stale).unwrap();

        for n in 0..=MAX_CONSECUTIVE_BACKLOG {
            let result = a.send(OutNetMessage::new(message(100 + n, 10), 1));
            assert!(matches!(result, Err(TransportError::Backlogged)));
        }
        assert!(a.is_closed());
        let failed = alice.listener.sent.lock().iter().filter(|(_, _, ok)| !ok).count();
        assert_eq!(failed, MAX_CONSECUTIVE_BACKLOG as usize + 2);
    }

    #[test]
    fn test_select_next_prefers_priority_until_head_is_stale() {
        let mut queue: VecDeque<OutNetMessage> = [(1, 1), (2, 5), (3, 3)]
            .into_iter()
            .map(|(id, pri)| OutNetMessage::new(message(id, 1), pri))
            .collect();
        assert_eq!(select_next(&mut queue).unwrap().message().id, 2);
        assert_eq!(select_next(&mut queue).unwrap().message().id, 3);

        let mut queue: VecDeque<OutNetMessage> = VecDeque::new();
        let mut old = OutNetMessage::new(message(1, 1), 1);
        old.backdate(FIFO_AFTER + Duration::from_secs(1));
        queue.push_back(old);
        queue.push_back(OutNetMessage::new(message(2, 1), 9));
        assert_eq!(select_next(&mut queue).unwrap().message().id, 1);
        assert!(select_next(&mut VecDeque::new()).is_none());
    }

    #[test]
    fn test_keepalive_updates_peer_skew() {
        let alice = Side::new(TransportConfig::default(), RouterClock::synchronized());
        let bob = Side::new(TransportConfig::default(), RouterClock::with_offset(30_000));
        let (a, b) = connect(&alice, &bob);
        b.skew_secs.store(0, Ordering::Relaxed);

        a.activity.lock().next_keepalive = Instant::now();
        a.check_keepalive();
        pump((&alice, &a), (&bob, &b));
        assert!((b.clock_skew_secs() - 30).abs() <= 1, "skew {}", b.clock_skew_secs());
        assert!(a.activity.lock().next_keepalive > Instant::now());
    }

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::from(&CodecError::Terminated { reason: 3 }), CloseReason::TerminationReceived);
        assert_eq!(CloseReason::from(&CodecError::BadChecksum), CloseReason::PayloadFormat);
        assert_eq!(CloseReason::from(&EstablishError::Banned).termination_code(), 17);
        assert!(!CloseReason::Io.sends_termination());
    }

    #[cfg(feature = "transport")]
    #[tokio::test]
    async fn test_channel_listener_events() {
        use crate::transport::context::testing::context_for;
        use crate::transport::listener::{ChannelListener, TransportEvent};

        let (listener, mut rx) = ChannelListener::new();
        let actx = context_for(TransportConfig::default(), RouterClock::synchronized(), Arc::new(listener));
        let alice = Side {
            ctx: actx,
            listener: Arc::new(RecordingListener::default()),
            dispatcher: Arc::new(ManualDispatcher::default()),
        };
        let bob = Side::new(TransportConfig::default(), RouterClock::synchronized());
        let (a, b) = connect(&alice, &bob);
        b.send(OutNetMessage::new(message(4, 32), 1)).unwrap();
        pump((&alice, &a), (&bob, &b));
        a.close(CloseReason::Normal);

        match rx.recv().await {
            Some(TransportEvent::Established { connection, peer, .. }) => {
                assert_eq!(connection.id(), a.id());
                assert_eq!(peer, bob.ctx.local().hash());
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await {
            Some(TransportEvent::Message { message, .. }) => assert_eq!(message.id, 4),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed { connection_id }) if connection_id == a.id()));
    }
}
