use crate::client::{HealthPredicate, TopologyDriver};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::liveness::LivenessWaiter;
use crate::verify::ConvergenceVerifier;
use crate::workload::{WorkloadGenerator, WorkloadOptions};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Number of count rounds used for the final verification.
pub const VERIFY_ITERATIONS: usize = 10;

/// Topology changes performed while the workload is running.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// Start on one node with one replica configured, then allow a second node so replicas get
    /// allocated under load.
    AllocateBackups,
    /// Like [`Scenario::AllocateBackups`], but grow to four nodes so primaries relocate as well.
    RelocatePrimaries,
    /// Grow from two to four nodes, then shut nodes down one by one until a single node is left.
    NodeShutdown,
    /// Without replicas, keep moving shards between one and two nodes, then add replicas once
    /// writes have stopped.
    Relocating,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::AllocateBackups,
        Scenario::RelocatePrimaries,
        Scenario::NodeShutdown,
        Scenario::Relocating,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::AllocateBackups => "allocate-backups",
            Scenario::RelocatePrimaries => "relocate-primaries",
            Scenario::NodeShutdown => "node-shutdown",
            Scenario::Relocating => "relocating",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown scenario [{0}]")]
pub struct UnknownScenario(String);

impl FromStr for Scenario {
    type Err = UnknownScenario;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| UnknownScenario(s.to_string()))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScenarioParams {
    pub shards: u32,
    /// Number of documents that must be visible before writes stop.
    pub total_docs: u64,
    pub writers: usize,
    /// Docs indexed between two topology changes in [`Scenario::Relocating`].
    pub relocation_step: u64,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            shards: 3,
            total_docs: 2000,
            writers: 5,
            relocation_step: 500,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    /// Writes acknowledged by the store, all of which were found again.
    pub indexed_docs: u64,
    pub ids_issued: u64,
}

/// Drives one [`Scenario`] against a store: creates the collection, keeps a workload running
/// while the topology changes, then verifies that every acknowledged write is visible.
pub struct ScenarioRunner<C> {
    client: Arc<C>,
    collection: String,
    config: HarnessConfig,
    liveness: LivenessWaiter<C>,
    verifier: ConvergenceVerifier<C>,
}

impl<C: TopologyDriver> ScenarioRunner<C> {
    pub fn new(client: Arc<C>, collection: impl Into<String>, config: HarnessConfig) -> Self {
        let collection = collection.into();
        Self {
            liveness: LivenessWaiter::new(client.clone(), collection.clone(), &config),
            verifier: ConvergenceVerifier::new(client.clone(), collection.clone(), &config),
            client,
            collection,
            config,
        }
    }

    pub async fn run(
        &self,
        scenario: Scenario,
        params: ScenarioParams,
    ) -> HarnessResult<ScenarioReport> {
        info!(%scenario, ?params, collection = %self.collection, "running scenario");
        self.create_collection(scenario, &params).await?;

        let mut indexer = self.spawn_indexer(&params)?;
        let driven = self.drive(scenario, &params, &indexer).await;
        // Writers are drained on every path, the first error wins.
        let stopped = self.stop_indexer(&mut indexer).await;
        if let (Err(_), Err(err)) = (&driven, &stopped) {
            warn!(%err, "stopping writers failed after the scenario had already failed");
        }
        driven?;
        stopped?;

        self.settle(scenario).await?;

        info!("refreshing the collection");
        self.verifier.refresh_and_assert().await?;
        info!("verifying indexed content");
        self.verifier
            .iterate_assert_count(
                params.shards,
                indexer.total_successful_writes(),
                VERIFY_ITERATIONS,
            )
            .await?;

        let report = ScenarioReport {
            scenario,
            indexed_docs: indexer.total_successful_writes(),
            ids_issued: indexer.ids_issued(),
        };
        info!(?report, "scenario passed");
        Ok(report)
    }

    async fn create_collection(
        &self,
        scenario: Scenario,
        params: &ScenarioParams,
    ) -> HarnessResult<()> {
        let (replicas, nodes) = match scenario {
            Scenario::AllocateBackups | Scenario::RelocatePrimaries => (1, 1),
            Scenario::NodeShutdown => (1, 2),
            Scenario::Relocating => (0, 3),
        };
        self.client
            .create_collection(&self.collection, params.shards, replicas, nodes)
            .await?;
        Ok(())
    }

    fn spawn_indexer(&self, params: &ScenarioParams) -> HarnessResult<WorkloadGenerator> {
        let options = WorkloadOptions::default()
            .with_writers(params.writers)
            .with_stop_grace(self.config.stop_grace);
        WorkloadGenerator::spawn(self.client.clone(), self.collection.clone(), options)
    }

    /// Topology changes performed while the writers are running.
    async fn drive(
        &self,
        scenario: Scenario,
        params: &ScenarioParams,
        indexer: &WorkloadGenerator,
    ) -> HarnessResult<()> {
        match scenario {
            Scenario::AllocateBackups => self.grow_while_indexing(params, indexer, 2).await,
            Scenario::RelocatePrimaries => self.grow_while_indexing(params, indexer, 4).await,
            Scenario::NodeShutdown => self.shrink_while_indexing(params, indexer).await,
            Scenario::Relocating => self.relocate_while_indexing(params, indexer).await,
        }
    }

    /// Topology changes performed once the writers have stopped.
    async fn settle(&self, scenario: Scenario) -> HarnessResult<()> {
        match scenario {
            Scenario::AllocateBackups | Scenario::RelocatePrimaries => Ok(()),
            Scenario::NodeShutdown => {
                self.wait_for_health(HealthPredicate::yellow().with_min_nodes(1))
                    .await
            }
            Scenario::Relocating => {
                info!("raising replicas to 1 and allowing all nodes to hold the collection");
                self.allow_nodes(3).await?;
                self.client.set_replicas(&self.collection, 1).await?;
                self.wait_for_health(HealthPredicate::green()).await
            }
        }
    }

    /// Index a tenth of the docs, flush, then index another tenth.
    async fn index_and_flush(
        &self,
        params: &ScenarioParams,
        indexer: &WorkloadGenerator,
    ) -> HarnessResult<()> {
        let mut wait_for = params.total_docs / 10;
        self.index_until(indexer, wait_for).await?;
        info!("flushing the collection");
        self.client.flush(&self.collection).await?;
        wait_for += params.total_docs / 10;
        self.index_until(indexer, wait_for).await
    }

    async fn grow_while_indexing(
        &self,
        params: &ScenarioParams,
        indexer: &WorkloadGenerator,
        grow_to: u32,
    ) -> HarnessResult<()> {
        self.index_and_flush(params, indexer).await?;

        self.allow_nodes(grow_to).await?;
        self.wait_for_health(HealthPredicate::green().with_min_nodes(grow_to))
            .await?;
        self.index_until(indexer, params.total_docs).await
    }

    async fn shrink_while_indexing(
        &self,
        params: &ScenarioParams,
        indexer: &WorkloadGenerator,
    ) -> HarnessResult<()> {
        self.index_and_flush(params, indexer).await?;

        self.allow_nodes(4).await?;
        self.wait_for_health(HealthPredicate::green().with_min_nodes(4))
            .await?;
        self.index_until(indexer, params.total_docs).await?;

        for nodes in [3, 2] {
            self.allow_nodes(nodes).await?;
            self.wait_for_health(HealthPredicate::green().with_min_nodes(nodes))
                .await?;
        }
        // a single node cannot hold the replicas
        self.allow_nodes(1).await?;
        self.wait_for_health(HealthPredicate::yellow().with_min_nodes(1))
            .await
    }

    async fn relocate_while_indexing(
        &self,
        params: &ScenarioParams,
        indexer: &WorkloadGenerator,
    ) -> HarnessResult<()> {
        let step = params.relocation_step.max(1);
        let mut allowed = 2;
        let mut target = 0;
        while target < params.total_docs {
            indexer.assert_no_failures()?;
            self.index_until(indexer, target).await?;
            // alternate between one and two nodes
            allowed = 2 / allowed;
            self.allow_nodes(allowed).await?;
            self.wait_for_health(HealthPredicate::green()).await?;
            target += step;
        }
        Ok(())
    }

    async fn index_until(&self, indexer: &WorkloadGenerator, docs: u64) -> HarnessResult<()> {
        info!(docs, "waiting for docs to be indexed");
        self.liveness.wait_for_docs(docs).await?;
        indexer.assert_no_failures()?;
        info!(docs, "docs indexed");
        Ok(())
    }

    async fn stop_indexer(&self, indexer: &mut WorkloadGenerator) -> HarnessResult<()> {
        info!("marking and waiting for writers to stop");
        indexer.stop().await?;
        info!(
            indexed = indexer.total_successful_writes(),
            "writers stopped"
        );
        Ok(())
    }

    async fn allow_nodes(&self, nodes: u32) -> HarnessResult<()> {
        info!(nodes, collection = %self.collection, "allowing nodes");
        self.client.allow_nodes(&self.collection, nodes).await?;
        Ok(())
    }

    async fn wait_for_health(&self, condition: HealthPredicate) -> HarnessResult<()> {
        info!(%condition, "waiting for cluster health");
        let timed_out = self
            .client
            .wait_for_topology(&self.collection, condition, self.config.health_timeout)
            .await?;
        if timed_out {
            return Err(HarnessError::TopologyTimeout { condition });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{FaultPlan, SimCluster, SimOptions};
    use crate::test_support::init_logging;
    use std::time::Duration;

    const COLLECTION: &str = "test";

    fn params() -> ScenarioParams {
        ScenarioParams {
            shards: 3,
            total_docs: 300,
            writers: 3,
            relocation_step: 100,
        }
    }

    async fn run(
        options: SimOptions,
        scenario: Scenario,
    ) -> (Arc<SimCluster>, HarnessResult<ScenarioReport>) {
        init_logging();
        let cluster = Arc::new(SimCluster::new(options));
        let runner = ScenarioRunner::new(cluster.clone(), COLLECTION, HarnessConfig::default());
        let result = runner.run(scenario, params()).await;
        (cluster, result)
    }

    #[tokio::test(start_paused = true)]
    async fn every_scenario_preserves_all_writes() {
        for scenario in Scenario::ALL {
            let (cluster, result) = run(SimOptions::default(), scenario).await;
            let report = result.unwrap_or_else(|err| panic!("{scenario} failed: {err}"));

            assert_eq!(report.scenario, scenario);
            assert!(report.indexed_docs > params().total_docs);
            assert_eq!(report.indexed_docs, report.ids_issued);
            assert_eq!(cluster.stored_docs(COLLECTION).unwrap(), report.indexed_docs);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn grown_cluster_ends_green() {
        let (cluster, result) = run(SimOptions::default(), Scenario::RelocatePrimaries).await;
        result.unwrap();

        let health = cluster.health(COLLECTION).unwrap();
        assert!(HealthPredicate::green().with_min_nodes(4).matches(&health));
        assert!(cluster.flushed_docs(COLLECTION).unwrap() >= params().total_docs / 10);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_scenario_drains_in_flight_writes() {
        init_logging();
        let cluster = Arc::new(SimCluster::new(SimOptions {
            write_latency: Duration::from_secs(1),
            // counts never catch up with the writes
            refresh_interval: Duration::from_secs(24 * 60 * 60),
            ..SimOptions::default()
        }));
        let config = HarnessConfig::default().with_liveness_attempt(Duration::from_secs(2));
        let runner = ScenarioRunner::new(cluster.clone(), COLLECTION, config);

        let result = runner.run(Scenario::AllocateBackups, params()).await;
        assert!(matches!(
            result,
            Err(HarnessError::StallDetected {
                last_count: Some(0),
                ..
            })
        ));

        let started = cluster.write_attempts();
        assert!(started >= params().writers as u64);
        assert_eq!(cluster.stored_docs(COLLECTION).unwrap(), started);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_writes_fail_the_scenario() {
        let options = SimOptions {
            faults: FaultPlan {
                fail_every_nth_write: Some(50),
                ..FaultPlan::default()
            },
            ..SimOptions::default()
        };
        let (_, result) = run(options, Scenario::AllocateBackups).await;
        assert!(matches!(
            result,
            Err(HarnessError::AggregateWriteFailure { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_count_fails_verification_even_after_convergence() {
        let options = SimOptions {
            faults: FaultPlan {
                under_reported_counts: 1,
                ..FaultPlan::default()
            },
            ..SimOptions::default()
        };
        let (_, result) = run(options, Scenario::Relocating).await;
        match result {
            Err(HarnessError::CountMismatch {
                mismatches,
                converged_on_retry,
                partitions,
                ..
            }) => {
                assert_eq!(mismatches.len(), 1);
                assert_eq!(mismatches[0].iteration, 0);
                assert!(converged_on_retry);
                // three primaries and three replicas
                assert_eq!(partitions.len(), 6);
            }
            other => panic!("expected count mismatch, got {other:?}"),
        }
    }

    async fn limited_run(
        faults: FaultPlan,
    ) -> (WorkloadGenerator, ConvergenceVerifier<SimCluster>) {
        init_logging();
        let cluster = Arc::new(SimCluster::new(SimOptions {
            faults,
            ..SimOptions::default()
        }));
        cluster.create_collection(COLLECTION, 3, 0, 2).await.unwrap();
        let options = WorkloadOptions::default()
            .with_writers(5)
            .with_write_limit(1000);
        let mut generator =
            WorkloadGenerator::spawn(cluster.clone(), COLLECTION, options).unwrap();

        let config = HarnessConfig::default();
        while generator.ids_issued() < 1000 {
            tokio::time::sleep(config.check_interval).await;
        }
        let _ = generator.stop().await;

        let verifier = ConvergenceVerifier::new(cluster, COLLECTION, &config);
        verifier.refresh_and_assert().await.unwrap();
        (generator, verifier)
    }

    #[tokio::test(start_paused = true)]
    async fn limited_workload_is_counted_exactly() {
        let (generator, verifier) = limited_run(FaultPlan::default()).await;

        assert_eq!(generator.total_successful_writes(), 1000);
        verifier
            .iterate_assert_count(3, 1000, VERIFY_ITERATIONS)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_writes_are_not_counted() {
        let faults = FaultPlan {
            fail_every_nth_write: Some(100),
            ..FaultPlan::default()
        };
        let (mut generator, verifier) = limited_run(faults).await;

        match generator.stop().await {
            Err(HarnessError::AggregateWriteFailure { failures }) => assert_eq!(failures.len(), 10),
            other => panic!("expected aggregate failure, got {other:?}"),
        }
        assert_eq!(generator.total_successful_writes(), 990);
        verifier
            .iterate_assert_count(3, 990, VERIFY_ITERATIONS)
            .await
            .unwrap();
    }

    #[test]
    fn scenario_names_round_trip() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>(), Ok(scenario));
        }
        assert_eq!(
            "split-brain".parse::<Scenario>(),
            Err(UnknownScenario("split-brain".into()))
        );
    }
}
