use crate::client::{CountResponse, PartitionStats, Query, StoreClient};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult, RoundMismatch, StoreResult};
use crate::utils::BusyPoll;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The outcome of a single count query during verification.
#[derive(Debug, Clone)]
pub struct CountRound {
    pub iteration: usize,
    pub response: StoreResult<CountResponse>,
}

impl CountRound {
    pub fn observed(&self) -> Option<u64> {
        self.response.as_ref().ok().map(|response| response.total)
    }

    fn mismatch(&self, expected: u64) -> Option<RoundMismatch> {
        let observed = self.observed();
        (observed != Some(expected)).then_some(RoundMismatch {
            iteration: self.iteration,
            observed,
        })
    }
}

/// Checks, once writes have stopped, that the store converges on the number of acknowledged
/// writes.
pub struct ConvergenceVerifier<C> {
    client: Arc<C>,
    collection: String,
    poll: BusyPoll,
    refresh_timeout: Duration,
    retry_budget: Duration,
}

impl<C: StoreClient> ConvergenceVerifier<C> {
    pub fn new(client: Arc<C>, collection: impl Into<String>, config: &HarnessConfig) -> Self {
        Self {
            client,
            collection: collection.into(),
            poll: BusyPoll::new(config.check_interval),
            refresh_timeout: config.refresh_timeout,
            retry_budget: config.convergence_retry,
        }
    }

    /// Refreshes the collection until a refresh succeeds on every partition.
    pub async fn refresh_and_assert(&self) -> HarnessResult<()> {
        let refreshed = self
            .poll
            .wait_until(|| self.try_refresh(), self.refresh_timeout)
            .await;
        if refreshed {
            return Ok(());
        }
        error!(timeout = ?self.refresh_timeout, "refresh never succeeded on all partitions");
        Err(HarnessError::ConvergenceTimeout {
            timeout: self.refresh_timeout,
        })
    }

    async fn try_refresh(&self) -> bool {
        match self.client.refresh(&self.collection).await {
            Ok(summary) if summary.is_complete() => {
                debug!(partitions = summary.total_partitions, "refresh complete");
                true
            }
            Ok(summary) => {
                info!(
                    total = summary.total_partitions,
                    successful = summary.successful_partitions,
                    "refresh incomplete"
                );
                false
            }
            Err(err) => {
                warn!(%err, "refresh failed");
                false
            }
        }
    }

    /// Runs `iterations` count queries and expects each to return `expected_count`.
    ///
    /// When any round disagrees, the partition counts are logged and the full set of rounds is
    /// repeated until one pass agrees or the retry budget runs out. The verdict is always taken
    /// from the original rounds: a mismatch that later converges still fails, with
    /// `converged_on_retry` set so transient propagation lag can be told apart from loss.
    pub async fn iterate_assert_count(
        &self,
        expected_shards: u32,
        expected_count: u64,
        iterations: usize,
    ) -> HarnessResult<()> {
        let mut rounds = Vec::with_capacity(iterations);
        for iteration in 0..iterations {
            let response = self.client.count(&self.collection, Query::MatchAll).await;
            log_count_round(expected_shards, expected_count, iteration, &response);
            rounds.push(CountRound {
                iteration,
                response,
            });
        }

        if rounds.iter().all(|round| round.mismatch(expected_count).is_none()) {
            info!(iterations, expected_count, "all count rounds matched");
            return Ok(());
        }

        let partitions = self.dump_partitions().await;

        info!(budget = ?self.retry_budget, "count mismatch, waiting for the store to converge");
        let converged = self
            .poll
            .wait_until(
                || self.all_rounds_match(expected_count, iterations),
                self.retry_budget,
            )
            .await;
        if converged {
            warn!("counts converged on retry, failing on the original rounds");
        } else {
            error!(budget = ?self.retry_budget, "counts did not converge");
        }

        let mismatches = rounds
            .iter()
            .filter_map(|round| round.mismatch(expected_count))
            .collect::<Vec<_>>();
        for mismatch in &mismatches {
            error!(
                iteration = mismatch.iteration,
                observed = ?mismatch.observed,
                expected = expected_count,
                "original count round mismatched"
            );
        }
        Err(HarnessError::CountMismatch {
            expected: expected_count,
            mismatches,
            converged_on_retry: converged,
            partitions,
        })
    }

    async fn all_rounds_match(&self, expected_count: u64, iterations: usize) -> bool {
        let mut matched = true;
        for _ in 0..iterations {
            match self.client.count(&self.collection, Query::MatchAll).await {
                Ok(response) if response.total == expected_count => {}
                Ok(response) => {
                    debug!(returned = response.total, expected_count, "retry round mismatched");
                    matched = false;
                }
                Err(err) => {
                    debug!(%err, "retry round failed");
                    matched = false;
                }
            }
        }
        matched
    }

    async fn dump_partitions(&self) -> Vec<PartitionStats> {
        match self.client.partition_stats(&self.collection).await {
            Ok(partitions) => {
                for partition in &partitions {
                    info!(
                        shard = partition.partition_id,
                        count = partition.doc_count,
                        primary = partition.is_primary,
                        node = ?partition.node,
                        "{partition}"
                    );
                }
                partitions
            }
            Err(err) => {
                warn!(%err, "could not collect partition stats");
                Vec::new()
            }
        }
    }
}

fn log_count_round(
    expected_shards: u32,
    expected_count: u64,
    iteration: usize,
    response: &StoreResult<CountResponse>,
) {
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            warn!(iteration, %err, "count request failed");
            return;
        }
    };
    info!(
        iteration,
        successful_shards = response.successful_shards,
        expected = expected_shards,
        "successful shards"
    );
    info!(
        iteration,
        failed_shards = response.failed_shards,
        "failed shards (expected 0)"
    );
    if !response.shard_failures.is_empty() {
        info!(iteration, failures = ?response.shard_failures, "shard failures");
    }
    info!(
        iteration,
        returned = response.total,
        expected = expected_count,
        "returned documents"
    );
}
