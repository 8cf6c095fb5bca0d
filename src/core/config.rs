use std::time::Duration;

/// How long an outstanding lookup may wait for its first reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
/// How often expired lookups are collected.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
/// DHT context configuration.
pub struct Config {
    /// Deadline for the first outstanding request per lookup key. Every
    /// waiter receives an empty reply once it passes.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT].
    pub request_timeout: Duration,
    /// How often the cleanup pass runs. Timeouts are only observed at this
    /// granularity, which is fine against a multi-second request timeout.
    ///
    /// Defaults to [DEFAULT_CLEANUP_INTERVAL].
    pub cleanup_interval: Duration,
    /// How often to explore the network for new routers. Zero disables
    /// exploration.
    ///
    /// Defaults to 30 seconds.
    pub explore_interval: Duration,
    /// How many peers each exploration pass queries.
    ///
    /// Defaults to 3.
    pub explore_candidates: usize,
    /// How many near identities an exploratory lookup is answered with.
    ///
    /// Defaults to 4.
    pub exploratory_reply_count: usize,
    /// Upper bound on introduction sets in one tag lookup reply.
    ///
    /// Defaults to 8.
    pub tag_result_limit: usize,
    /// Clamp on the recursion budget accepted from remote lookups, and the
    /// budget given to lookups relayed for local paths.
    ///
    /// Defaults to 5.
    pub recursion_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            explore_interval: Duration::from_secs(30),
            explore_candidates: 3,
            exploratory_reply_count: 4,
            tag_result_limit: 8,
            recursion_limit: 5,
        }
    }
}
