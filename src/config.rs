use std::time::Duration;

/// Process-wide, read-only-after-init tuning for the forwarding engine.
///
/// Constructed once by the embedding process (typically from its own config
/// file or CLI flags — both out of scope for this crate) and shared across
/// sessions behind an `Arc`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes fetched per range sub-request (`S` in the design doc).
    pub host_range_fetch_limit_size: u64,
    /// Number of concurrent range workers per prefetch (`N`).
    pub host_range_concurrent_fetchers: u32,
    /// Verbose logging toggle, gates `log::debug!` call sites that would
    /// otherwise be noisy on a hot path.
    pub debug_enable: bool,
    /// First dial attempt timeout.
    pub dial_timeout: Duration,
    /// Second dial attempt timeout, used only after the first times out.
    pub dial_timeout_retry: Duration,
    /// Read deadline applied to every range worker socket read.
    pub read_timeout: Duration,
    /// Maximum redirect hops a single range sub-request will follow before
    /// giving up (the source followed redirects without bound).
    pub max_redirect_hops: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_range_fetch_limit_size: 256 * 1024,
            host_range_concurrent_fetchers: 4,
            debug_enable: false,
            dial_timeout: Duration::from_secs(2),
            dial_timeout_retry: Duration::from_secs(4),
            read_timeout: Duration::from_secs(30),
            max_redirect_hops: 5,
        }
    }
}
