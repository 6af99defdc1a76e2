//! Global bandwidth limiter.
//!
//! One token bucket per direction. A request that cannot be granted in
//! full takes what is available and waits in FIFO order for the rest;
//! [`BandwidthLimiter::refill`] tops the buckets up and completes waiting
//! requests, calling their owner back outside the bucket lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from peers.
    Inbound,
    /// Bytes written to peers.
    Outbound,
}

/// Progress of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Fully granted.
    Satisfied,
    /// Waiting for more tokens.
    Pending,
    /// Cancelled before completion.
    Aborted,
}

/// Receives completed requests.
pub trait RequestCompletion: Send + Sync {
    /// `request` was granted in full.
    fn complete(self: Arc<Self>, request: &Arc<BandwidthRequest>);
}

/// One admission request.
#[derive(Debug)]
pub struct BandwidthRequest {
    id: u64,
    direction: Direction,
    total: usize,
    state: Mutex<(usize, RequestStatus)>,
}

impl BandwidthRequest {
    fn new(id: u64, direction: Direction, total: usize) -> Self {
        Self {
            id,
            direction,
            total,
            state: Mutex::new((total, RequestStatus::Pending)),
        }
    }

    /// Request id, unique per limiter.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes requested.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Bytes still missing.
    pub fn pending_bytes(&self) -> usize {
        self.state.lock().0
    }

    /// Current status.
    pub fn status(&self) -> RequestStatus {
        self.state.lock().1
    }

    /// Cancel; a satisfied request stays satisfied.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if state.1 == RequestStatus::Pending {
            state.1 = RequestStatus::Aborted;
        }
    }

    /// Grant up to `available` bytes, returning how many were used.
    fn grant(&self, available: u64) -> u64 {
        let mut state = self.state.lock();
        if state.1 != RequestStatus::Pending {
            return 0;
        }
        let used = (state.0 as u64).min(available);
        state.0 -= used as usize;
        if state.0 == 0 {
            state.1 = RequestStatus::Satisfied;
        }
        used
    }
}

struct Waiting {
    request: Arc<BandwidthRequest>,
    owner: Weak<dyn RequestCompletion>,
}

struct Bucket {
    rate: u64,
    tokens: u64,
    last_refill: Instant,
    queue: VecDeque<Waiting>,
}

impl Bucket {
    fn new(rate: u64, now: Instant) -> Self {
        Self {
            rate,
            tokens: rate,
            last_refill: now,
            queue: VecDeque::new(),
        }
    }

    fn unlimited(&self) -> bool {
        self.rate == 0
    }

    fn add_tokens(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let added = (self.rate as u128 * elapsed.as_micros() / 1_000_000) as u64;
        if added > 0 {
            self.tokens = (self.tokens + added).min(self.rate);
            self.last_refill = now;
        }
    }

    /// Serve the queue in order; returns requests that became satisfied.
    fn drain(&mut self) -> Vec<Waiting> {
        let mut done = Vec::new();
        while let Some(head) = self.queue.front() {
            if head.request.status() == RequestStatus::Aborted {
                self.queue.pop_front();
                continue;
            }
            if self.unlimited() {
                head.request.grant(u64::MAX);
            } else {
                let used = head.request.grant(self.tokens);
                self.tokens -= used;
            }
            if head.request.status() != RequestStatus::Satisfied {
                break;
            }
            if let Some(w) = self.queue.pop_front() {
                done.push(w);
            }
        }
        done
    }
}

/// Token buckets for both directions.
pub struct BandwidthLimiter {
    inbound: Mutex<Bucket>,
    outbound: Mutex<Bucket>,
    next_id: AtomicU64,
}

impl BandwidthLimiter {
    /// Rates in bytes per second; 0 means unlimited.
    pub fn new(inbound_rate: u64, outbound_rate: u64) -> Self {
        let now = Instant::now();
        Self {
            inbound: Mutex::new(Bucket::new(inbound_rate, now)),
            outbound: Mutex::new(Bucket::new(outbound_rate, now)),
            next_id: AtomicU64::new(1),
        }
    }

    fn bucket(&self, direction: Direction) -> &Mutex<Bucket> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// Change a direction's rate.
    pub fn set_rate(&self, direction: Direction, rate: u64) {
        let mut bucket = self.bucket(direction).lock();
        bucket.rate = rate;
        bucket.tokens = bucket.tokens.min(rate);
    }

    /// Admit `len` read bytes.
    pub fn request_inbound(&self, len: usize, owner: Weak<dyn RequestCompletion>) -> Arc<BandwidthRequest> {
        self.request(Direction::Inbound, len, owner)
    }

    /// Admit `len` written bytes.
    pub fn request_outbound(&self, len: usize, owner: Weak<dyn RequestCompletion>) -> Arc<BandwidthRequest> {
        self.request(Direction::Outbound, len, owner)
    }

    fn request(&self, direction: Direction, len: usize, owner: Weak<dyn RequestCompletion>) -> Arc<BandwidthRequest> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Arc::new(BandwidthRequest::new(id, direction, len));
        let mut bucket = self.bucket(direction).lock();
        if bucket.queue.is_empty() || len == 0 {
            if bucket.unlimited() {
                request.grant(u64::MAX);
            } else {
                let used = request.grant(bucket.tokens);
                bucket.tokens -= used;
            }
        }
        if request.status() == RequestStatus::Pending {
            trace!(id, ?direction, len, missing = request.pending_bytes(), "bandwidth request deferred");
            bucket.queue.push_back(Waiting {
                request: request.clone(),
                owner,
            });
        }
        request
    }

    /// Requests waiting in `direction`.
    pub fn queued(&self, direction: Direction) -> usize {
        self.bucket(direction).lock().queue.len()
    }

    /// Refill both buckets from the wall clock and complete waiting requests.
    pub fn refill(&self) {
        self.refill_at(Instant::now());
    }

    /// Refill as of `now`.
    pub fn refill_at(&self, now: Instant) {
        let mut done = Vec::new();
        for direction in [Direction::Inbound, Direction::Outbound] {
            let mut bucket = self.bucket(direction).lock();
            bucket.add_tokens(now);
            done.extend(bucket.drain());
        }
        for w in done {
            if let Some(owner) = w.owner.upgrade() {
                owner.complete(&w.request);
            }
        }
    }
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("inbound_rate", &self.inbound.lock().rate)
            .field("outbound_rate", &self.outbound.lock().rate)
            .finish()
    }
}
