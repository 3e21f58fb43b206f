//! Engine configuration constants and the per-process [`ApiConfig`].

use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of retries for a failed API request.
/// The server-side error budget is generous because transient gateway
/// failures and replication-lag throttling are routine on busy wikis.
pub const MAX_RETRIES: u32 = 25;

/// Initial wait before the first retry.
pub const INITIAL_RETRY_WAIT: Duration = Duration::from_secs(5);

/// Ceiling for the doubling retry wait.
pub const MAX_RETRY_WAIT: Duration = Duration::from_secs(120);

/// Maximum number of session-recovery replays for a single request.
/// Re-login replay does not consume the ordinary retry budget, so it
/// needs its own bound to terminate under persistent auth failure.
pub const MAX_LOGIN_REPLAYS: u32 = 3;

/// Default `maxlag` parameter sent with every request, in seconds.
pub const DEFAULT_MAXLAG: u32 = 5;

/// Expiry for cached module metadata (`action=paraminfo`) responses.
/// Module limits change only on server upgrades, so a long window is safe.
pub const MODULE_INFO_EXPIRY_DAYS: i64 = 30;

/// Minimum delay between read requests to one site.
/// Zero by default: `maxlag` is the primary load-shedding mechanism.
pub const MIN_THROTTLE: Duration = Duration::ZERO;

/// Minimum delay between write requests to one site.
pub const WRITE_THROTTLE: Duration = Duration::from_secs(10);

/// Ceiling for the throttle delay after lag extensions.
pub const MAX_THROTTLE: Duration = Duration::from_secs(60);

/// Actions that modify wiki content. Requests with these actions are
/// treated as writes by the throttle and blocked in simulation mode.
pub const WRITE_ACTIONS: &[&str] = &[
    "edit",
    "move",
    "rollback",
    "delete",
    "undelete",
    "protect",
    "block",
    "unblock",
    "watch",
    "patrol",
    "import",
    "userrights",
    "upload",
    "wbeditentity",
    "wbsetlabel",
    "wbsetdescription",
    "wbsetaliases",
    "wblinktitles",
    "wbsetsitelink",
    "wbcreateclaim",
    "wbremoveclaims",
    "wbsetclaimvalue",
    "wbsetreference",
    "wbremovereferences",
];

/// Calculate the doubled retry wait, capped at [`MAX_RETRY_WAIT`].
pub fn next_retry_wait(current: Duration) -> Duration {
    (current * 2).min(MAX_RETRY_WAIT)
}

/// Process-wide configuration shared by all sites of one engine instance.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// `maxlag` value injected into every request; `None` disables it.
    pub maxlag: Option<u32>,
    /// Retry budget per request.
    pub max_retries: u32,
    /// Initial backoff wait.
    pub retry_wait: Duration,
    /// When true, blocked actions return a synthetic success payload
    /// without any network call.
    pub simulate: bool,
    /// Actions refused in simulation mode.
    pub blocked_actions: Vec<String>,
    /// Use secure transport for login requests on SSL-capable families.
    pub use_ssl_on_login: bool,
    /// Use secure transport for all requests on SSL-capable families.
    pub use_ssl_always: bool,
    /// Directory for the disk-backed response cache.
    pub cache_dir: PathBuf,
    /// Expiry for cached module metadata.
    pub module_info_expiry: chrono::Duration,
    /// Minimum inter-request delay for reads.
    pub min_delay: Duration,
    /// Minimum inter-request delay for writes.
    pub write_delay: Duration,
    /// Ceiling for throttle delays.
    pub max_delay: Duration,
    /// Number of cooperating processes sharing this site's quota.
    /// Throttle delays scale by this factor.
    pub process_multiplier: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            maxlag: Some(DEFAULT_MAXLAG),
            max_retries: MAX_RETRIES,
            retry_wait: INITIAL_RETRY_WAIT,
            simulate: false,
            blocked_actions: WRITE_ACTIONS.iter().map(|s| s.to_string()).collect(),
            use_ssl_on_login: false,
            use_ssl_always: false,
            cache_dir: std::env::temp_dir().join("mwapi-cache"),
            module_info_expiry: chrono::Duration::days(MODULE_INFO_EXPIRY_DAYS),
            min_delay: MIN_THROTTLE,
            write_delay: WRITE_THROTTLE,
            max_delay: MAX_THROTTLE,
            process_multiplier: 1,
        }
    }
}

impl ApiConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial backoff wait.
    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    /// Override the `maxlag` parameter; `None` disables injection.
    pub fn with_maxlag(mut self, maxlag: Option<u32>) -> Self {
        self.maxlag = maxlag;
        self
    }

    /// Enable or disable simulation mode.
    pub fn with_simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    /// Set the cache directory.
    pub fn with_cache_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set throttle delays.
    pub fn with_throttle(mut self, min: Duration, write: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.write_delay = write;
        self.max_delay = max;
        self
    }
}
