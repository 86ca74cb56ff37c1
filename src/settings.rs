//! Unified configuration for a streaming session.
//!
//! A single flattened struct instead of per-component config types: sessions
//! receive an explicit `RestreamSettings` value at construction, so multiple
//! sessions can run concurrently with different knobs and no ambient state.

use std::time::Duration;

/// Default User-Agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = "restream";

/// Default bandwidth ceiling in bits per second (10 Mb/s).
pub const DEFAULT_MAX_BANDWIDTH: u64 = 10_485_760;

/// Default size of the buffer filled to estimate bandwidth (1 MiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1_048_576;

/// Default capacity of the segment and error queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Unified settings for a streaming session.
#[derive(Debug, Clone)]
pub struct RestreamSettings {
    /// User-Agent header attached to every HTTP request.
    pub user_agent: String,

    /// Maximum allowed variant bandwidth in bits per second. Also seeds the
    /// bandwidth estimate before the first segment has been measured.
    pub max_bandwidth: u64,

    /// How many bytes of a segment to time when estimating bandwidth.
    pub read_buffer_size: usize,

    /// Capacity of the bounded segment and error queues. A full segment
    /// queue blocks the poller, which is the backpressure mechanism.
    pub queue_capacity: usize,

    /// Fixed wait between fetch retries. Constant by design: segments on a
    /// live server expire quickly, so backing off only loses content.
    pub retry_interval: Duration,
}

impl Default for RestreamSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_bandwidth: DEFAULT_MAX_BANDWIDTH,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl RestreamSettings {
    /// Sets the User-Agent header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the bandwidth ceiling in bits per second.
    pub fn with_max_bandwidth(mut self, max_bandwidth: u64) -> Self {
        self.max_bandwidth = max_bandwidth;
        self
    }

    /// Sets the bandwidth-probe buffer size in bytes.
    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    /// Sets the queue capacity.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Sets the fixed retry interval for failed fetches.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}
