//! Transport configuration.

use std::time::Duration;

use super::constants::{ESTABLISH_TIMEOUT, META_FREQUENCY};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Network id; peers declaring another id are rejected.
    pub network_id: u8,

    /// Accept and initiate Noise (NTCP2) handshakes.
    pub ntcp2_enabled: bool,

    /// Maximum number of concurrent connections.
    pub max_connections: usize,

    /// Handshakes older than this are closed.
    pub establish_timeout: Duration,

    /// Interval of the pumper's failsafe sweep.
    pub failsafe_interval: Duration,

    /// Interval of the establishment timeout sweep.
    pub expire_check_interval: Duration,

    /// Readiness selection timeout.
    pub selector_timeout: Duration,

    /// Idle timeout floor, used when near the connection limit.
    pub min_idle_timeout: Duration,

    /// Idle timeout ceiling.
    pub max_idle_timeout: Duration,

    /// Threads in the reader pool.
    pub reader_threads: usize,

    /// Threads in the writer pool.
    pub writer_threads: usize,

    /// Inbound bandwidth in bytes per second, 0 for unlimited.
    pub inbound_bandwidth: u64,

    /// Outbound bandwidth in bytes per second, 0 for unlimited.
    pub outbound_bandwidth: u64,

    /// Average interval between keepalive frames.
    pub meta_frequency: Duration,

    /// The blocked IP counter is cleared this often.
    pub blocked_ip_clear_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            network_id: 2,
            ntcp2_enabled: true,
            max_connections: 256,
            establish_timeout: ESTABLISH_TIMEOUT,
            failsafe_interval: Duration::from_secs(2),
            expire_check_interval: Duration::from_secs(1),
            selector_timeout: Duration::from_millis(200),
            min_idle_timeout: Duration::from_secs(120),
            max_idle_timeout: Duration::from_secs(11 * 60),
            reader_threads: 4,
            writer_threads: 1,
            inbound_bandwidth: 0,
            outbound_bandwidth: 0,
            meta_frequency: META_FREQUENCY,
            blocked_ip_clear_interval: Duration::from_secs(3 * 60),
        }
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the network id.
    pub fn network_id(mut self, id: u8) -> Self {
        self.config.network_id = id;
        self
    }

    /// Enable or disable NTCP2.
    pub fn ntcp2(mut self, enabled: bool) -> Self {
        self.config.ntcp2_enabled = enabled;
        self
    }

    /// Set the maximum number of concurrent connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the establishment timeout.
    pub fn establish_timeout(mut self, timeout: Duration) -> Self {
        self.config.establish_timeout = timeout;
        self
    }

    /// Set the readiness selection timeout.
    pub fn selector_timeout(mut self, timeout: Duration) -> Self {
        self.config.selector_timeout = timeout;
        self
    }

    /// Set the idle timeout range.
    pub fn idle_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_idle_timeout = min;
        self.config.max_idle_timeout = max.max(min);
        self
    }

    /// Set worker pool sizes.
    pub fn worker_threads(mut self, readers: usize, writers: usize) -> Self {
        self.config.reader_threads = readers.max(1);
        self.config.writer_threads = writers.max(1);
        self
    }

    /// Set bandwidth limits in bytes per second (0 = unlimited).
    pub fn bandwidth(mut self, inbound: u64, outbound: u64) -> Self {
        self.config.inbound_bandwidth = inbound;
        self.config.outbound_bandwidth = outbound;
        self
    }

    /// Set the keepalive frequency.
    pub fn meta_frequency(mut self, frequency: Duration) -> Self {
        self.config.meta_frequency = frequency;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = TransportConfigBuilder::new()
            .network_id(99)
            .ntcp2(false)
            .worker_threads(0, 3)
            .idle_timeout(Duration::from_secs(60), Duration::from_secs(30))
            .build();
        assert_eq!(config.network_id, 99);
        assert!(!config.ntcp2_enabled);
        assert_eq!(config.reader_threads, 1);
        assert_eq!(config.writer_threads, 3);
        assert_eq!(config.max_idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.establish_timeout, Duration::from_secs(10));
        assert_eq!(config.selector_timeout, Duration::from_millis(200));
    }
}
