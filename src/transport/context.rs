//! State shared by every connection of one transport instance.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::{REPLAY_KEY_SIZE, REPLAY_WINDOW, RouterClock, TransportConfig};
use crate::router::{LocalRouter, RouterHash};

use super::bandwidth::BandwidthLimiter;
use super::listener::TransportListener;

/// Banned router hashes, temporarily or forever.
#[derive(Debug, Default)]
pub struct Banlist {
    // None = forever
    entries: Mutex<HashMap<RouterHash, Option<Instant>>>,
}

impl Banlist {
    /// Ban `peer` for `duration`, or forever when `None`.
    ///
    /// A temporary ban never shortens an existing one.
    pub fn ban(&self, peer: RouterHash, duration: Option<Duration>) {
        let until = duration.map(|d| Instant::now() + d);
        let mut entries = self.entries.lock();
        let entry = entries.entry(peer).or_insert(until);
        match (*entry, until) {
            (None, _) => {}
            (Some(_), None) => *entry = None,
            (Some(old), Some(new)) => *entry = Some(old.max(new)),
        }
        info!(%peer, ?duration, "peer banned");
    }

    /// Lift any ban on `peer`.
    pub fn unban(&self, peer: &RouterHash) {
        self.entries.lock().remove(peer);
    }

    /// Whether `peer` is currently banned.
    pub fn is_banned(&self, peer: &RouterHash) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(peer) {
            Some(None) => true,
            Some(Some(until)) if *until > Instant::now() => true,
            Some(Some(_)) => {
                entries.remove(peer);
                false
            }
            None => false,
        }
    }

    /// Whether `peer` is banned with no expiry.
    pub fn is_banned_forever(&self, peer: &RouterHash) -> bool {
        matches!(self.entries.lock().get(peer), Some(None))
    }
}

/// Remote addresses refused without a handshake.
#[derive(Debug, Default)]
pub struct Blocklist {
    ips: Mutex<HashSet<IpAddr>>,
}

impl Blocklist {
    /// Block `ip`.
    pub fn add(&self, ip: IpAddr) {
        if self.ips.lock().insert(ip) {
            info!(%ip, "address blocklisted");
        }
    }

    /// Whether `ip` is blocked.
    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.ips.lock().contains(ip)
    }
}

/// Recently seen legacy msg1 XOR fields.
#[derive(Debug)]
pub struct ReplayCache {
    window: Duration,
    seen: Mutex<HashMap<[u8; REPLAY_KEY_SIZE], Instant>>,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(REPLAY_WINDOW)
    }
}

impl ReplayCache {
    /// Remember entries for `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `field` and report whether it was already present.
    pub fn check_and_insert(&self, field: &[u8]) -> bool {
        let mut key = [0u8; REPLAY_KEY_SIZE];
        let n = field.len().min(REPLAY_KEY_SIZE);
        key[..n].copy_from_slice(&field[..n]);
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.duration_since(*at) < self.window);
        seen.insert(key, now).is_some()
    }

    /// Entries currently remembered.
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counts remote addresses that opened an inbound connection and closed it
/// without sending a message. Cleared periodically by the pumper.
#[derive(Debug, Default)]
pub struct BlockedIpCounter {
    counts: Mutex<HashMap<IpAddr, u32>>,
}

impl BlockedIpCounter {
    /// Count one more strike against `ip`.
    pub fn increment(&self, ip: IpAddr) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(ip).or_insert(0);
        *count += 1;
        *count
    }

    /// Strikes against `ip`.
    pub fn count(&self, ip: &IpAddr) -> u32 {
        self.counts.lock().get(ip).copied().unwrap_or(0)
    }

    /// Forget every strike.
    pub fn clear(&self) {
        let mut counts = self.counts.lock();
        if !counts.is_empty() {
            debug!(entries = counts.len(), "clearing blocked ip counter");
            counts.clear();
        }
    }
}

/// Everything a connection needs besides its own state.
pub struct TransportContext {
    config: TransportConfig,
    local: LocalRouter,
    clock: RouterClock,
    banlist: Banlist,
    blocklist: Blocklist,
    replay: ReplayCache,
    blocked_ips: BlockedIpCounter,
    bandwidth: Arc<BandwidthLimiter>,
    listener: Arc<dyn TransportListener>,
    next_id: AtomicU64,
}

impl TransportContext {
    /// Create a context for `local`, reporting to `listener`.
    pub fn new(
        config: TransportConfig,
        local: LocalRouter,
        clock: RouterClock,
        listener: Arc<dyn TransportListener>,
    ) -> Arc<Self> {
        let bandwidth = Arc::new(BandwidthLimiter::new(
            config.inbound_bandwidth,
            config.outbound_bandwidth,
        ));
        Arc::new(Self {
            config,
            local,
            clock,
            banlist: Banlist::default(),
            blocklist: Blocklist::default(),
            replay: ReplayCache::default(),
            blocked_ips: BlockedIpCounter::default(),
            bandwidth,
            listener,
            next_id: AtomicU64::new(1),
        })
    }

    /// Configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Our router.
    pub fn local(&self) -> &LocalRouter {
        &self.local
    }

    /// Router clock.
    pub fn clock(&self) -> &RouterClock {
        &self.clock
    }

    /// Banned peers.
    pub fn banlist(&self) -> &Banlist {
        &self.banlist
    }

    /// Blocked addresses.
    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    /// Legacy msg1 replay cache.
    pub fn replay_cache(&self) -> &ReplayCache {
        &self.replay
    }

    /// Inbound strike counter.
    pub fn blocked_ips(&self) -> &BlockedIpCounter {
        &self.blocked_ips
    }

    /// Bandwidth limiter.
    pub fn bandwidth(&self) -> &Arc<BandwidthLimiter> {
        &self.bandwidth
    }

    /// Upward listener.
    pub fn listener(&self) -> &Arc<dyn TransportListener> {
        &self.listener
    }

    /// Allocate a connection id.
    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("router", &self.local.hash())
            .field("network_id", &self.config.network_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::core::{RouterClock, TransportConfig};
    use crate::router::LocalRouter;
    use crate::transport::listener::TransportListener;
    use crate::transport::listener::recording::RecordingListener;

    use super::TransportContext;

    /// Send `tracing` output through the test harness's captured stdout.
    /// Safe to call from every test.
    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    /// A context around a freshly generated router, reporting to `listener`.
    pub(crate) fn context_for(
        config: TransportConfig,
        clock: RouterClock,
        listener: Arc<dyn TransportListener>,
    ) -> Arc<TransportContext> {
        init_tracing();
        let addr = "127.0.0.1:9000".parse().unwrap();
        let local = LocalRouter::generate(config.network_id, Some(addr), clock.now());
        TransportContext::new(config, local, clock, listener)
    }

    pub(crate) fn context_with(
        config: TransportConfig,
        clock: RouterClock,
    ) -> (Arc<TransportContext>, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        (context_for(config, clock, listener.clone()), listener)
    }

    pub(crate) fn context() -> (Arc<TransportContext>, Arc<RecordingListener>) {
        context_with(TransportConfig::default(), RouterClock::synchronized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_install_test_subscriber() {
        let (ctx, _) = testing::context();
        testing::init_tracing();
        assert!(tracing::dispatcher::has_been_set());
        assert_eq!(ctx.config().network_id, TransportConfig::default().network_id);
    }

    #[test]
    fn test_banlist_expiry_and_forever() {
        let banlist = Banlist::default();
        let a = RouterHash([1; 32]);
        let b = RouterHash([2; 32]);
        banlist.ban(a, Some(Duration::ZERO));
        assert!(!banlist.is_banned(&a));
        banlist.ban(b, Some(Duration::from_secs(60)));
        assert!(banlist.is_banned(&b));
        assert!(!banlist.is_banned_forever(&b));
        banlist.ban(b, None);
        banlist.ban(b, Some(Duration::from_secs(1)));
        assert!(banlist.is_banned_forever(&b));
        banlist.unban(&b);
        assert!(!banlist.is_banned(&b));
    }

    #[test]
    fn test_replay_cache() {
        let cache = ReplayCache::default();
        assert!(!cache.check_and_insert(&[7; 32]));
        assert!(cache.check_and_insert(&[7; 32]));
        // only the first 8 bytes are keyed
        let mut other = [7u8; 32];
        other[20] = 0;
        assert!(cache.check_and_insert(&other));
        assert_eq!(cache.len(), 1);

        let expired = ReplayCache::new(Duration::ZERO);
        assert!(!expired.check_and_insert(&[1; 32]));
        assert!(!expired.check_and_insert(&[1; 32]));
    }

    #[test]
    fn test_blocked_ip_counter() {
        let counter = BlockedIpCounter::default();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(counter.increment(ip), 1);
        assert_eq!(counter.increment(ip), 2);
        counter.clear();
        assert_eq!(counter.count(&ip), 0);
    }
}
