use crate::client::{Query, StoreClient};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::utils::BusyPoll;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Waits for the store to show a growing number of documents while the workload runs.
pub struct LivenessWaiter<C> {
    client: Arc<C>,
    collection: String,
    poll: BusyPoll,
    attempt_budget: Duration,
}

impl<C: StoreClient> LivenessWaiter<C> {
    pub fn new(client: Arc<C>, collection: impl Into<String>, config: &HarnessConfig) -> Self {
        Self {
            client,
            collection: collection.into(),
            poll: BusyPoll::new(config.check_interval),
            attempt_budget: config.liveness_attempt,
        }
    }

    /// Blocks until more than `target` documents are visible and returns the last count seen.
    ///
    /// Slow progress is fine: as long as the count moved between two polling attempts another
    /// attempt is made. An attempt that ends on the same count as the previous one fails with
    /// [`HarnessError::StallDetected`].
    pub async fn wait_for_docs(&self, target: u64) -> HarnessResult<u64> {
        let last_known = Mutex::new(None);
        let mut last_start_count = None;
        loop {
            let reached = self
                .poll
                .wait_until(
                    || self.visible_exceeds(target, &last_known),
                    self.attempt_budget,
                )
                .await;
            let last_count = *last_known.lock().unwrap_or_else(PoisonError::into_inner);
            if reached {
                return Ok(last_count.unwrap_or_default());
            }

            if last_count == last_start_count {
                error!(target, ?last_count, "no progress while waiting for docs");
                return Err(HarnessError::StallDetected { target, last_count });
            }
            info!(
                target,
                ?last_count,
                budget = ?self.attempt_budget,
                "docs still advancing, waiting another round"
            );
            last_start_count = last_count;
        }
    }

    /// Whether more than `target` docs are visible. A successful count is recorded in
    /// `last_known`; a failed one leaves it untouched.
    async fn visible_exceeds(&self, target: u64, last_known: &Mutex<Option<u64>>) -> bool {
        match self.client.count(&self.collection, Query::MatchAll).await {
            Ok(response) => {
                *last_known.lock().unwrap_or_else(PoisonError::into_inner) = Some(response.total);
                debug!(visible = response.total, target, "docs visible for search");
                response.total > target
            }
            Err(err) => {
                warn!(%err, target, "count failed while waiting for docs");
                false
            }
        }
    }
}
