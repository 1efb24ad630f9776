use std::time::Duration;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(100);
/// While partitions relocate, writers can be held back for about a minute before they retry, so
/// a single liveness attempt gets a generous budget.
pub const DEFAULT_LIVENESS_ATTEMPT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CONVERGENCE_RETRY: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(6 * 60);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(60);

/// Timing knobs shared by the harness components.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Delay between two evaluations of a busy-poll predicate.
    pub check_interval: Duration,
    /// Budget of one liveness polling attempt.
    pub liveness_attempt: Duration,
    /// Budget for a refresh to succeed on every partition.
    pub refresh_timeout: Duration,
    /// Budget of the count retry phase after a mismatch.
    pub convergence_retry: Duration,
    /// How long `stop()` waits for writers to drain.
    pub stop_grace: Duration,
    /// Budget of each topology wait in the scenarios.
    pub health_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            liveness_attempt: DEFAULT_LIVENESS_ATTEMPT,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            convergence_retry: DEFAULT_CONVERGENCE_RETRY,
            stop_grace: DEFAULT_STOP_GRACE,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

impl HarnessConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_liveness_attempt(mut self, budget: Duration) -> Self {
        self.liveness_attempt = budget;
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_convergence_retry(mut self, budget: Duration) -> Self {
        self.convergence_retry = budget;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }
}
