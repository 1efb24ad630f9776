use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Fixed-interval condition wait.
///
/// Evaluates a predicate every `check_interval` until it holds or the budget is spent. Running
/// out of budget is a normal outcome reported as `false`, never an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BusyPoll {
    check_interval: Duration,
}

impl BusyPoll {
    pub fn new(check_interval: Duration) -> Self {
        Self { check_interval }
    }

    #[inline]
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Returns `true` as soon as `predicate` yields `true`, or `false` once `max_wait` has
    /// elapsed. The predicate is evaluated one last time when the budget runs out.
    pub async fn wait_until<F, Fut>(&self, mut predicate: F, max_wait: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        loop {
            if predicate().await {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                return false;
            }
            tokio::time::sleep(self.check_interval.min(max_wait - elapsed)).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const INTERVAL: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn returns_once_predicate_holds() {
        let poll = BusyPoll::new(INTERVAL);
        let start = Instant::now();
        let ready_at = Duration::from_secs(2);

        let held = poll
            .wait_until(|| async move { start.elapsed() >= ready_at }, Duration::from_secs(10))
            .await;

        assert!(held);
        let elapsed = start.elapsed();
        assert!(elapsed >= ready_at);
        assert!(elapsed < ready_at + INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn false_predicate_times_out_at_budget() {
        let poll = BusyPoll::new(INTERVAL);
        let evaluations = AtomicUsize::new(0);
        let start = Instant::now();

        let held = poll
            .wait_until(
                || {
                    evaluations.fetch_add(1, Ordering::SeqCst);
                    async { false }
                },
                Duration::from_secs(1),
            )
            .await;

        assert!(!held);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        // one evaluation per interval plus the final one at expiry
        assert_eq!(evaluations.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn last_sleep_is_clamped_to_budget() {
        let poll = BusyPoll::new(Duration::from_secs(1));
        let start = Instant::now();

        let held = poll
            .wait_until(|| async { false }, Duration::from_millis(2500))
            .await;

        assert!(!held);
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn immediate_success_does_not_sleep() {
        let poll = BusyPoll::new(Duration::from_secs(60));
        let start = Instant::now();
        assert!(poll.wait_until(|| async { true }, Duration::ZERO).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
