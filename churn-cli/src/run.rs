use anyhow::Context;
use churn::scenario::{Scenario, ScenarioParams, ScenarioRunner};
use churn::sim::{FaultPlan, SimCluster, SimOptions};
use churn::HarnessConfig;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const COLLECTION: &str = "test";

#[derive(Args)]
pub struct RunCommand {
    /// One of allocate-backups, relocate-primaries, node-shutdown, relocating
    scenario: Scenario,

    #[arg(long, default_value_t = 3, help = "Number of shards of the collection")]
    shards: u32,

    #[arg(long, default_value_t = 2000, help = "Docs that must be visible before writes stop")]
    docs: u64,

    #[arg(short, long, default_value_t = 5, help = "Number of concurrent writers")]
    writers: usize,

    #[arg(long, default_value_t = 500, help = "Docs indexed between two relocations")]
    relocation_step: u64,

    #[arg(long, default_value_t = 4, help = "Nodes in the simulated cluster")]
    nodes: u32,

    #[arg(long, default_value_t = 200, help = "Time a moved shard copy needs to start, in ms")]
    relocation_time_ms: u64,

    #[arg(long, help = "Reject every n-th write attempt")]
    fail_every: Option<u64>,

    #[arg(long, default_value_t = 0, help = "Under-report this many counts after a refresh")]
    under_report: u32,

    #[arg(long, default_value_t = 100, help = "Busy-poll check interval, in ms")]
    check_interval_ms: u64,

    #[arg(long, default_value_t = 300, help = "Budget of one liveness attempt, in seconds")]
    liveness_secs: u64,

    #[arg(long, default_value_t = 300, help = "Budget for a refresh to reach all shards, in seconds")]
    refresh_secs: u64,

    #[arg(long, default_value_t = 300, help = "Budget of the count retry phase, in seconds")]
    convergence_secs: u64,

    #[arg(long, default_value_t = 60, help = "Budget of each health wait, in seconds")]
    health_secs: u64,

    #[arg(short, long, help = "Log at debug level")]
    pub verbose: bool,
}

impl RunCommand {
    fn sim_options(&self) -> SimOptions {
        SimOptions {
            nodes: self.nodes,
            relocation_time: Duration::from_millis(self.relocation_time_ms),
            faults: FaultPlan {
                fail_every_nth_write: self.fail_every,
                under_reported_counts: self.under_report,
            },
            ..SimOptions::default()
        }
    }

    fn config(&self) -> HarnessConfig {
        HarnessConfig::default()
            .with_check_interval(Duration::from_millis(self.check_interval_ms))
            .with_liveness_attempt(Duration::from_secs(self.liveness_secs))
            .with_refresh_timeout(Duration::from_secs(self.refresh_secs))
            .with_convergence_retry(Duration::from_secs(self.convergence_secs))
            .with_health_timeout(Duration::from_secs(self.health_secs))
    }

    pub async fn execute(self) -> anyhow::Result<()> {
        let params = ScenarioParams {
            shards: self.shards,
            total_docs: self.docs,
            writers: self.writers,
            relocation_step: self.relocation_step,
        };
        let cluster = Arc::new(SimCluster::new(self.sim_options()));
        let runner = ScenarioRunner::new(cluster.clone(), COLLECTION, self.config());

        let report = runner
            .run(self.scenario, params)
            .await
            .with_context(|| format!("Scenario {} failed", self.scenario))?;

        let health = cluster
            .health(COLLECTION)
            .context("Could not read final cluster health")?;
        info!(
            scenario = %report.scenario,
            indexed = report.indexed_docs,
            issued = report.ids_issued,
            status = %health.status,
            nodes = health.nodes,
            "scenario passed"
        );
        println!(
            "{}: {} docs indexed and verified ({} ids issued), final health {}",
            report.scenario, report.indexed_docs, report.ids_issued, health.status
        );
        Ok(())
    }
}
