//! Per-site request throttling.
//!
//! Enforces a minimum inter-request delay for one site and incorporates
//! server-reported replication lag: a `maxlag` response extends the next
//! delay instead of being treated as a failure. All requests for one site
//! share a single [`Throttle`] so the delay accounting is serialized.

use crate::config::ApiConfig;
use crate::shutdown::{sleep_or_shutdown, SharedShutdown};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct ThrottleState {
    /// Reserved slot: the next request may start at this instant.
    next_allowed: Option<Instant>,
    /// One-shot delay extension from a server-reported lag.
    lag_extension: Duration,
}

/// Minimum-delay enforcement between requests to one site.
pub struct Throttle {
    min_delay: Duration,
    write_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    /// Create a throttle with explicit delay bounds.
    ///
    /// `multiplier` models cooperating processes sharing the same quota:
    /// each process spaces its requests that many times further apart.
    pub fn new(
        min_delay: Duration,
        write_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Self {
        Self {
            min_delay,
            write_delay,
            max_delay,
            multiplier: multiplier.max(1),
            state: Mutex::new(ThrottleState {
                next_allowed: None,
                lag_extension: Duration::ZERO,
            }),
        }
    }

    /// Create a throttle from the engine configuration.
    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(
            config.min_delay,
            config.write_delay,
            config.max_delay,
            config.process_multiplier,
        )
    }

    /// Record a server-reported lag of `seconds`; the next delay is
    /// extended by at least that much (capped at the delay ceiling).
    pub async fn lag(&self, seconds: u64) {
        let mut state = self.state.lock().await;
        let extension = Duration::from_secs(seconds).min(self.max_delay);
        if extension > state.lag_extension {
            state.lag_extension = extension;
        }
        debug!(lag_seconds = seconds, "Extended throttle delay for server lag");
    }

    /// Compute the required wait for the next request and sleep it.
    ///
    /// Returns `false` if shutdown was requested before the wait elapsed.
    /// The slot is reserved under the lock before sleeping, so concurrent
    /// callers on one site space out rather than dog-pile.
    pub async fn wait_for_turn(&self, write: bool, shutdown: Option<&SharedShutdown>) -> bool {
        let wait = {
            let mut state = self.state.lock().await;
            let base = if write { self.write_delay } else { self.min_delay };
            let delay = (base * self.multiplier + state.lag_extension).min(self.max_delay);
            state.lag_extension = Duration::ZERO;

            let now = Instant::now();
            let wait = match state.next_allowed {
                Some(at) if at > now => at - now,
                _ => Duration::ZERO,
            };
            state.next_allowed = Some(now + wait + delay);
            wait
        };

        if wait.is_zero() {
            return true;
        }
        debug!(wait_ms = wait.as_millis() as u64, write, "Throttling request");
        sleep_or_shutdown(wait, shutdown).await
    }
}
