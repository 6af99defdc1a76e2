//! Router clock with an adjustable offset.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

/// Wall clock used for handshake timestamps and skew measurement.
///
/// The offset is applied on top of the system time. A clock that has never
/// been synchronized accepts exactly one forced step from a handshake; after
/// that it counts as synchronized and skew is enforced.
#[derive(Debug, Default)]
pub struct RouterClock {
    offset_ms: AtomicI64,
    updated: AtomicBool,
}

impl RouterClock {
    /// A clock that has never been synchronized.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock already synchronized by some external source.
    pub fn synchronized() -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            updated: AtomicBool::new(true),
        }
    }

    /// A synchronized clock running `offset_ms` ahead of system time.
    pub fn with_offset(offset_ms: i64) -> Self {
        Self {
            offset_ms: AtomicI64::new(offset_ms),
            updated: AtomicBool::new(true),
        }
    }

    /// Milliseconds since the epoch, offset applied.
    pub fn now(&self) -> u64 {
        let sys = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        (sys + self.offset_ms.load(Ordering::Relaxed)).max(0) as u64
    }

    /// Current time in seconds, rounded to nearest.
    pub fn now_secs(&self) -> u32 {
        ((self.now() + 500) / 1000) as u32
    }

    /// Current offset from system time.
    pub fn offset(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Whether the clock was ever synchronized successfully.
    pub fn updated_successfully(&self) -> bool {
        self.updated.load(Ordering::Acquire)
    }

    /// Mark the clock as synchronized without changing the offset.
    pub fn mark_updated(&self) {
        self.updated.store(true, Ordering::Release);
    }

    /// Set a new offset.
    ///
    /// Without `force`, the offset is only applied while the clock has not
    /// been synchronized. Returns whether the offset was applied.
    pub fn set_offset(&self, offset_ms: i64, force: bool) -> bool {
        if !force && self.updated_successfully() {
            return false;
        }
        let old = self.offset_ms.swap(offset_ms, Ordering::AcqRel);
        self.updated.store(true, Ordering::Release);
        info!(old_offset_ms = old, new_offset_ms = offset_ms, "router clock stepped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_applied() {
        let clock = RouterClock::with_offset(120_000);
        let sys = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
        let now = clock.now();
        assert!(now >= sys + 119_000 && now <= sys + 121_000);
    }

    #[test]
    fn test_single_step() {
        let clock = RouterClock::new();
        assert!(!clock.updated_successfully());
        assert!(clock.set_offset(-5000, false));
        assert!(clock.updated_successfully());
        assert!(!clock.set_offset(3000, false));
        assert_eq!(clock.offset(), -5000);
    }
}
