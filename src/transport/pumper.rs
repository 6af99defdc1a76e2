//! Event pumper: one thread multiplexing every socket with mio.
//!
//! The pumper only moves bytes. Reads are copied out of pooled buffers into
//! [`Connection::queue_read`]; writes drain [`Connection::write_to`]. Anything
//! involving keys runs on the reader and writer pools through
//! [`PumperDispatcher`]. Other threads talk to the loop with [`PumperHandle`],
//! which queues a command and wakes the poll.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::core::{MAX_BUF_CACHE, MAX_ZERO_READS, READ_BUF_SIZE, TransportError};
use crate::router::RouterInfo;

use super::connection::{CloseReason, Connection};
use super::context::TransportContext;
use super::dispatch::Dispatcher;
use super::workers::WorkerPool;

const WAKE: Token = Token(0);

// Idle timeout moves toward max by this much per failsafe pass while there is
// room for more connections, and toward min by three times as much when not.
const IDLE_STEP: Duration = Duration::from_secs(1);

enum Command {
    Listen {
        addr: SocketAddr,
        response: Sender<io::Result<SocketAddr>>,
    },
    Connect {
        peer: Box<RouterInfo>,
        addr: SocketAddr,
        response: Sender<Result<Arc<Connection>, TransportError>>,
    },
    WantsWrite(u64),
    WantsRead(u64),
    Close {
        id: u64,
        final_bytes: Option<Vec<u8>>,
    },
    Shutdown,
}

struct Pools {
    readers: WorkerPool,
    writers: WorkerPool,
}

/// [`Dispatcher`] backed by the worker pools and the pumper's command queue.
pub struct PumperDispatcher {
    pools: RwLock<Option<Pools>>,
    commands: Sender<Command>,
    waker: Arc<Waker>,
}

impl PumperDispatcher {
    fn command(&self, command: Command) {
        if self.commands.send(command).is_ok() {
            if let Err(e) = self.waker.wake() {
                warn!(%e, "failed to wake pumper");
            }
        }
    }

    // Joins the workers; must not run on one of them.
    fn stop(&self) {
        let pools = self.pools.write().take();
        drop(pools);
    }
}

impl Dispatcher for PumperDispatcher {
    fn schedule_read(&self, con: &Arc<Connection>) {
        if let Some(pools) = &*self.pools.read() {
            pools.readers.schedule(con);
        }
    }

    fn schedule_write(&self, con: &Arc<Connection>) {
        if let Some(pools) = &*self.pools.read() {
            pools.writers.schedule(con);
        }
    }

    fn wants_write(&self, con: &Arc<Connection>) {
        self.command(Command::WantsWrite(con.id()));
    }

    fn wants_read(&self, con: &Arc<Connection>) {
        self.command(Command::WantsRead(con.id()));
    }

    fn deregister(&self, con: &Arc<Connection>, final_bytes: Option<Vec<u8>>) {
        self.command(Command::Close {
            id: con.id(),
            final_bytes,
        });
    }
}

impl std::fmt::Debug for PumperDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumperDispatcher")
            .field("running", &self.pools.read().is_some())
            .finish()
    }
}

/// Thread-safe handle to a running [`EventPumper`].
#[derive(Clone)]
pub struct PumperHandle {
    ctx: Arc<TransportContext>,
    commands: Sender<Command>,
    waker: Arc<Waker>,
}

impl PumperHandle {
    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = bounded(1);
        self.commands.send(make(tx)).ok()?;
        self.waker.wake().ok()?;
        rx.recv().ok()
    }

    /// Shared transport state.
    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    /// Accept connections on `addr`. Returns the bound address.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let bound = self
            .request(|response| Command::Listen { addr, response })
            .ok_or(TransportError::Closed)?;
        Ok(bound?)
    }

    /// Connect to the best address `peer` publishes.
    pub fn connect(&self, peer: &RouterInfo) -> Result<Arc<Connection>, TransportError> {
        let ntcp2 = self.ctx.config().ntcp2_enabled;
        let addr = peer
            .best_address(ntcp2)
            .map(|a| a.addr)
            .ok_or_else(|| TransportError::UnusableAddress(format!("{} publishes no address", peer.hash())))?;
        self.connect_to(peer, addr)
    }

    /// Connect to `peer` at `addr`.
    pub fn connect_to(&self, peer: &RouterInfo, addr: SocketAddr) -> Result<Arc<Connection>, TransportError> {
        let peer = Box::new(peer.clone());
        self.request(|response| Command::Connect { peer, addr, response })
            .ok_or(TransportError::Closed)?
    }

    /// Close every connection and stop the pumper thread.
    pub fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

impl std::fmt::Debug for PumperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumperHandle").field("ctx", &self.ctx).finish()
    }
}

struct Entry {
    stream: TcpStream,
    con: Arc<Connection>,
    registered: Option<Interest>,
    connected: bool,
    read_paused: bool,
    zero_reads: u32,
}

impl Entry {
    fn interest(&self) -> Option<Interest> {
        let read = !self.read_paused;
        let write = !self.connected || self.con.has_pending_writes();
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn update(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let wanted = self.interest();
        if wanted == self.registered {
            return Ok(());
        }
        match (self.registered, wanted) {
            (None, Some(i)) => registry.register(&mut self.stream, token, i)?,
            (Some(_), Some(i)) => registry.reregister(&mut self.stream, token, i)?,
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (None, None) => {}
        }
        self.registered = wanted;
        Ok(())
    }
}

enum Flow {
    Continue,
    Stop,
}

/// The socket loop. Create with [`EventPumper::new`] and drive with
/// [`EventPumper::run`], or use [`EventPumper::spawn`].
pub struct EventPumper {
    ctx: Arc<TransportContext>,
    poll: Poll,
    commands: Receiver<Command>,
    dispatcher: Arc<PumperDispatcher>,
    listeners: HashMap<Token, TcpListener>,
    entries: HashMap<Token, Entry>,
    tokens: HashMap<u64, Token>,
    next_token: usize,
    buffers: Vec<Vec<u8>>,
    idle_timeout: Duration,
    last_expire: Instant,
    last_failsafe: Instant,
    last_blocked_clear: Instant,
}

impl EventPumper {
    /// Create a pumper and the handle used to drive it.
    pub fn new(ctx: Arc<TransportContext>) -> io::Result<(Self, PumperHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        let (tx, rx) = unbounded();
        let config = ctx.config();
        let pools = Pools {
            readers: WorkerPool::readers(config.reader_threads)?,
            writers: WorkerPool::writers(config.writer_threads)?,
        };
        let dispatcher = Arc::new(PumperDispatcher {
            pools: RwLock::new(Some(pools)),
            commands: tx.clone(),
            waker: waker.clone(),
        });
        let now = Instant::now();
        let handle = PumperHandle {
            ctx: ctx.clone(),
            commands: tx,
            waker,
        };
        let pumper = Self {
            idle_timeout: config.max_idle_timeout,
            ctx,
            poll,
            commands: rx,
            dispatcher,
            listeners: HashMap::new(),
            entries: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
            buffers: Vec::new(),
            last_expire: now,
            last_failsafe: now,
            last_blocked_clear: now,
        };
        Ok((pumper, handle))
    }

    /// Start the loop on its own thread.
    pub fn spawn(ctx: Arc<TransportContext>) -> io::Result<(PumperHandle, JoinHandle<()>)> {
        let (pumper, handle) = Self::new(ctx)?;
        let join = thread::Builder::new()
            .name("ntcp-pumper".into())
            .spawn(move || pumper.run())?;
        Ok((handle, join))
    }

    /// Run until [`PumperHandle::shutdown`].
    pub fn run(mut self) {
        info!(router = %self.ctx.local().hash(), "pumper started");
        let mut events = Events::with_capacity(256);
        loop {
            if let Flow::Stop = self.process_commands() {
                break;
            }
            if let Err(e) = self.poll.poll(&mut events, Some(self.ctx.config().selector_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%e, "poll failed");
                break;
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKE {
                    continue;
                }
                if self.listeners.contains_key(&token) {
                    self.accept(token);
                    continue;
                }
                if event.is_writable() {
                    self.write(token);
                }
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    self.read(token, true);
                }
            }
            self.ctx.bandwidth().refill();
            self.timers();
        }
        self.shutdown();
    }

    fn process_commands(&mut self) -> Flow {
        let commands: Vec<Command> = self.commands.try_iter().collect();
        for command in commands {
            match command {
                Command::Listen { addr, response } => {
                    let _ = response.send(self.listen(addr));
                }
                Command::Connect { peer, addr, response } => {
                    let _ = response.send(self.connect(&peer, addr));
                }
                Command::WantsWrite(id) => {
                    if let Some(token) = self.tokens.get(&id).copied() {
                        self.write(token);
                    }
                }
                Command::WantsRead(id) => {
                    if let Some(token) = self.tokens.get(&id).copied() {
                        if let Some(entry) = self.entries.get_mut(&token) {
                            entry.read_paused = false;
                        }
                        self.read(token, false);
                    }
                }
                Command::Close { id, final_bytes } => self.remove(id, final_bytes),
                Command::Shutdown => return Flow::Stop,
            }
        }
        Flow::Continue
    }

    #[instrument(skip(self))]
    fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        let token = self.token();
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        self.listeners.insert(token, listener);
        info!(%local, "listening");
        Ok(local)
    }

    #[instrument(skip(self, peer), fields(peer = %peer.hash()))]
    fn connect(&mut self, peer: &RouterInfo, addr: SocketAddr) -> Result<Arc<Connection>, TransportError> {
        if self.entries.len() >= self.ctx.config().max_connections {
            return Err(TransportError::ConnectionLimit);
        }
        let dispatcher: Arc<dyn Dispatcher> = self.dispatcher.clone();
        let con = Connection::outbound(self.ctx.clone(), dispatcher, peer, Some(addr))?;
        let token = self.token();
        let registered = TcpStream::connect(addr).and_then(|stream| {
            let mut entry = Entry {
                stream,
                con: con.clone(),
                registered: None,
                connected: false,
                read_paused: false,
                zero_reads: 0,
            };
            entry.update(self.poll.registry(), token)?;
            Ok(entry)
        });
        let entry = match registered {
            Ok(entry) => entry,
            Err(e) => {
                con.close(CloseReason::Io);
                return Err(e.into());
            }
        };
        self.tokens.insert(con.id(), token);
        self.entries.insert(token, entry);
        if let Err(e) = con.prepare_outbound() {
            self.remove(con.id(), None);
            return Err(e);
        }
        debug!(id = con.id(), %addr, "connecting");
        Ok(con)
    }

    fn token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn refuses(&self, ip: &IpAddr) -> Option<&'static str> {
        if self.entries.len() >= self.ctx.config().max_connections {
            Some("connection limit")
        } else if self.ctx.blocklist().is_blocked(ip) {
            Some("blocklisted")
        } else if self.ctx.blocked_ips().count(ip) > 0 {
            Some("recently dropped without a message")
        } else {
            None
        }
    }

    #[instrument(skip(self))]
    fn accept(&mut self, token: Token) {
        let mut accepted = Vec::new();
        if let Some(listener) = self.listeners.get(&token) {
            loop {
                match listener.accept() {
                    Ok(pair) => accepted.push(pair),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(%e, "accept failed");
                        break;
                    }
                }
            }
        }
        for (stream, remote) in accepted {
            if let Some(why) = self.refuses(&remote.ip()) {
                debug!(%remote, why, "refusing inbound connection");
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                trace!(%e, "set_nodelay failed");
            }
            let dispatcher: Arc<dyn Dispatcher> = self.dispatcher.clone();
            let con = Connection::inbound(self.ctx.clone(), dispatcher, Some(remote));
            let token = self.token();
            let mut entry = Entry {
                stream,
                con: con.clone(),
                registered: None,
                connected: true,
                read_paused: false,
                zero_reads: 0,
            };
            if let Err(e) = entry.update(self.poll.registry(), token) {
                warn!(%e, "register failed");
                continue;
            }
            self.tokens.insert(con.id(), token);
            self.entries.insert(token, entry);
        }
    }

    fn buffer(&mut self) -> Vec<u8> {
        self.buffers.pop().unwrap_or_else(|| vec![0; READ_BUF_SIZE])
    }

    fn recycle(&mut self, buf: Vec<u8>) {
        if self.buffers.len() < MAX_BUF_CACHE {
            self.buffers.push(buf);
        }
    }

    // `polled` is false when reading on a grant rather than a readiness event;
    // finding nothing then is not a spurious wakeup.
    fn read(&mut self, token: Token, polled: bool) {
        let mut buf = self.buffer();
        let outcome = match self.entries.get_mut(&token) {
            Some(entry) => read_entry(entry, &mut buf),
            None => Ok(ReadOutcome::Drained),
        };
        self.recycle(buf);
        let Some(entry) = self.entries.get_mut(&token) else {
            return;
        };
        let con = entry.con.clone();
        match outcome {
            Ok(ReadOutcome::Drained) => {}
            Ok(ReadOutcome::Paused) => entry.read_paused = true,
            Ok(ReadOutcome::Empty) if !polled => {}
            Ok(ReadOutcome::Empty) => {
                entry.zero_reads += 1;
                if entry.zero_reads >= MAX_ZERO_READS {
                    debug!(id = con.id(), "too many empty reads");
                    con.close(CloseReason::Io);
                    return;
                }
            }
            Ok(ReadOutcome::Eof) => {
                trace!(id = con.id(), "eof");
                self.lost(&con);
                return;
            }
            Err(e) => {
                debug!(id = con.id(), %e, "read failed");
                self.lost(&con);
                return;
            }
        }
        if let Err(e) = entry.update(self.poll.registry(), token) {
            warn!(id = con.id(), %e, "reregister failed");
            con.close(CloseReason::Io);
        }
    }

    // The peer went away. An inbound peer that never sent a message gets a
    // strike against its address.
    fn lost(&mut self, con: &Arc<Connection>) {
        if con.is_inbound() && con.messages_received() == 0 {
            if let Some(addr) = con.remote_addr() {
                let strikes = self.ctx.blocked_ips().increment(addr.ip());
                debug!(id = con.id(), ip = %addr.ip(), strikes, "inbound dropped before any message");
            }
        }
        con.close(CloseReason::Io);
    }

    fn write(&mut self, token: Token) {
        let Some(entry) = self.entries.get_mut(&token) else {
            return;
        };
        let con = entry.con.clone();
        if !entry.connected {
            match entry.stream.take_error() {
                Ok(None) => {}
                Ok(Some(e)) | Err(e) => {
                    debug!(id = con.id(), %e, "connect failed");
                    con.close(CloseReason::Io);
                    return;
                }
            }
            match entry.stream.peer_addr() {
                Ok(_) => {
                    entry.connected = true;
                    if let Err(e) = entry.stream.set_nodelay(true) {
                        trace!(%e, "set_nodelay failed");
                    }
                    trace!(id = con.id(), "connected");
                }
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
                Err(e) => {
                    debug!(id = con.id(), %e, "connect failed");
                    con.close(CloseReason::Io);
                    return;
                }
            }
        }
        if let Err(e) = con.write_to(&mut entry.stream) {
            debug!(id = con.id(), %e, "write failed");
            con.close(CloseReason::Io);
            return;
        }
        if let Err(e) = entry.update(self.poll.registry(), token) {
            warn!(id = con.id(), %e, "reregister failed");
            con.close(CloseReason::Io);
        }
    }

    fn remove(&mut self, id: u64, final_bytes: Option<Vec<u8>>) {
        let Some(token) = self.tokens.remove(&id) else {
            return;
        };
        let Some(mut entry) = self.entries.remove(&token) else {
            return;
        };
        if entry.registered.is_some() {
            let _ = self.poll.registry().deregister(&mut entry.stream);
        }
        if let Some(bytes) = final_bytes.filter(|_| entry.connected) {
            // best effort, the socket is about to be dropped
            if let Err(e) = entry.stream.write_all(&bytes) {
                trace!(id, %e, "final write failed");
            }
        }
        let _ = entry.stream.shutdown(std::net::Shutdown::Both);
        trace!(id, open = self.entries.len(), "socket released");
    }

    fn timers(&mut self) {
        let now = Instant::now();
        let config = self.ctx.config().clone();
        if now.duration_since(self.last_expire) >= config.expire_check_interval {
            self.last_expire = now;
            self.expire(config.establish_timeout);
        }
        if now.duration_since(self.last_failsafe) >= config.failsafe_interval {
            self.last_failsafe = now;
            self.failsafe();
        }
        if now.duration_since(self.last_blocked_clear) >= config.blocked_ip_clear_interval {
            self.last_blocked_clear = now;
            self.ctx.blocked_ips().clear();
        }
    }

    fn expire(&mut self, timeout: Duration) {
        let expired: Vec<Arc<Connection>> = self
            .entries
            .values()
            .filter(|e| e.con.establishment_expired(timeout))
            .map(|e| e.con.clone())
            .collect();
        for con in expired {
            warn!(id = con.id(), remote = ?con.remote_addr(), "establishment timed out");
            con.close(CloseReason::EstablishTimeout);
        }
    }

    fn adjust_idle_timeout(&mut self) {
        let config = self.ctx.config();
        let has_capacity = self.entries.len() * 10 < config.max_connections * 9;
        self.idle_timeout = if has_capacity {
            (self.idle_timeout + IDLE_STEP).min(config.max_idle_timeout)
        } else {
            self.idle_timeout
                .saturating_sub(IDLE_STEP * 3)
                .max(config.min_idle_timeout)
        };
    }

    fn failsafe(&mut self) {
        self.adjust_idle_timeout();
        let idle_timeout = self.idle_timeout;
        let mut rearm = Vec::new();
        let mut idle = Vec::new();
        for (token, entry) in &self.entries {
            let con = &entry.con;
            if con.is_established() {
                let quiet = con.time_since_send().min(con.time_since_receive());
                if quiet > idle_timeout {
                    idle.push(con.clone());
                    continue;
                }
                con.check_keepalive();
            }
            if entry.connected && con.has_pending_writes() {
                rearm.push(*token);
            }
        }
        for con in idle {
            debug!(id = con.id(), ?idle_timeout, "idle");
            con.close(CloseReason::IdleTimeout);
        }
        for token in rearm {
            trace!(?token, "failsafe write");
            self.write(token);
        }
    }

    fn shutdown(&mut self) {
        let cons: Vec<Arc<Connection>> = self.entries.values().map(|e| e.con.clone()).collect();
        info!(connections = cons.len(), "pumper stopping");
        for con in cons {
            con.close(CloseReason::Shutdown);
        }
        // flush termination frames queued by the closes above
        for command in self.commands.try_iter().collect::<Vec<_>>() {
            if let Command::Close { id, final_bytes } = command {
                self.remove(id, final_bytes);
            }
        }
        self.listeners.clear();
        self.dispatcher.stop();
        info!("pumper stopped");
    }

    /// Current idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

enum ReadOutcome {
    // read until WouldBlock
    Drained,
    // the bandwidth limiter deferred a read; stop until it is granted
    Paused,
    // readable but nothing there
    Empty,
    Eof,
}

fn read_entry(entry: &mut Entry, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    if entry.read_paused {
        return Ok(ReadOutcome::Drained);
    }
    let mut total = 0usize;
    loop {
        match entry.stream.read(buf) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => {
                total += n;
                entry.zero_reads = 0;
                trace!(id = entry.con.id(), n, "read");
                if entry.con.queue_read(&buf[..n]) {
                    return Ok(ReadOutcome::Paused);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(if total == 0 { ReadOutcome::Empty } else { ReadOutcome::Drained });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

impl std::fmt::Debug for EventPumper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPumper")
            .field("listeners", &self.listeners.len())
            .field("connections", &self.entries.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::timeout;

    use crate::core::{I2npMessage, OutNetMessage, RouterClock, TransportConfig, TransportConfigBuilder};
    use crate::transport::context::testing::{context, context_for};
    use crate::transport::listener::{ChannelListener, TransportEvent};

    const WAIT: Duration = Duration::from_secs(10);

    async fn next(rx: &mut tokio::sync::mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn loopback(config: TransportConfig) {
        let (alice_listener, mut alice_rx) = ChannelListener::new();
        let (bob_listener, mut bob_rx) = ChannelListener::new();
        let alice = context_for(config.clone(), RouterClock::synchronized(), Arc::new(alice_listener));
        let bob = context_for(config, RouterClock::synchronized(), Arc::new(bob_listener));

        let (alice_pumper, alice_join) = EventPumper::spawn(alice).unwrap();
        let (bob_pumper, bob_join) = EventPumper::spawn(bob.clone()).unwrap();
        let addr = bob_pumper.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let con = alice_pumper.connect_to(bob.local().router_info(), addr).unwrap();
        let msg = I2npMessage::new(18, 77, 1_900_000_000_000, vec![0xab; 12_000]);
        con.send(OutNetMessage::new(msg.clone(), 10)).unwrap();

        assert!(matches!(next(&mut alice_rx).await, TransportEvent::Established { .. }));
        assert!(matches!(next(&mut bob_rx).await, TransportEvent::Established { .. }));
        loop {
            match next(&mut bob_rx).await {
                TransportEvent::Message { message, .. } => {
                    assert_eq!(message, msg);
                    break;
                }
                TransportEvent::RouterInfo { .. } => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
        match next(&mut alice_rx).await {
            TransportEvent::SendComplete { success, .. } => assert!(success),
            other => panic!("unexpected {other:?}"),
        }

        alice_pumper.shutdown();
        assert!(matches!(next(&mut alice_rx).await, TransportEvent::Closed { .. }));
        assert!(matches!(next(&mut bob_rx).await, TransportEvent::Closed { .. }));
        bob_pumper.shutdown();
        alice_join.join().unwrap();
        bob_join.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ntcp2_loopback() {
        loopback(TransportConfig::default()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_legacy_loopback() {
        loopback(TransportConfigBuilder::new().ntcp2(false).build()).await;
    }

    #[test]
    fn test_idle_timeout_adapts_to_capacity() {
        let (ctx, _) = context();
        let (mut pumper, handle) = EventPumper::new(ctx).unwrap();
        let config = handle.context().config().clone();
        assert_eq!(pumper.idle_timeout(), config.max_idle_timeout);

        pumper.adjust_idle_timeout();
        assert_eq!(pumper.idle_timeout(), config.max_idle_timeout);

        pumper.idle_timeout = config.min_idle_timeout + Duration::from_secs(2);
        pumper.adjust_idle_timeout();
        assert_eq!(pumper.idle_timeout(), config.min_idle_timeout + Duration::from_secs(3));
    }

    #[test]
    fn test_handle_after_shutdown() {
        let (ctx, _) = context();
        let (handle, join) = EventPumper::spawn(ctx).unwrap();
        handle.shutdown();
        join.join().unwrap();
        assert!(matches!(
            handle.listen("127.0.0.1:0".parse().unwrap()),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_buffer_pool_is_bounded() {
        let (ctx, _) = context();
        let (mut pumper, _handle) = EventPumper::new(ctx).unwrap();
        for _ in 0..MAX_BUF_CACHE + 10 {
            pumper.recycle(vec![0; READ_BUF_SIZE]);
        }
        assert_eq!(pumper.buffers.len(), MAX_BUF_CACHE);
        assert_eq!(pumper.buffer().len(), READ_BUF_SIZE);
    }
}
