use crate::client::{
    ClusterHealth, CountResponse, HealthPredicate, HealthStatus, PartitionStats, Query,
    RefreshSummary, StoreClient, TopologyDriver,
};
use crate::doc_id::DocId;
use crate::error::{StoreError, StoreResult};
use crate::sim::FaultPlan;
use crate::utils::BusyPoll;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const TOPOLOGY_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Settings of a [`SimCluster`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SimOptions {
    /// Number of nodes in the cluster. Collections may be restricted to a prefix of them.
    pub nodes: u32,
    /// Time every write spends in flight before it is applied.
    pub write_latency: Duration,
    /// Time a moved primary or a newly assigned replica needs before it is started.
    pub relocation_time: Duration,
    /// Counts refresh the collection lazily once this much time has passed since the last refresh.
    pub refresh_interval: Duration,
    pub faults: FaultPlan,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            nodes: 4,
            write_latency: Duration::from_millis(1),
            relocation_time: Duration::from_millis(200),
            refresh_interval: Duration::from_secs(1),
            faults: FaultPlan::default(),
        }
    }
}

/// Placement of one copy of a shard.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct ShardCopy {
    node: Option<u32>,
    /// The copy is started once the clock passes this instant.
    ready_at: Instant,
}

impl ShardCopy {
    fn is_started(&self, now: Instant) -> bool {
        self.node.is_some() && self.ready_at <= now
    }

    fn is_relocating(&self, now: Instant) -> bool {
        self.node.is_some() && self.ready_at > now
    }

    /// Moves the copy to `node`. A copy that changes node has to recover for `delay`.
    fn assign(&mut self, node: Option<u32>, now: Instant, delay: Duration) {
        if self.node == node {
            return;
        }
        self.node = node;
        self.ready_at = now + delay;
    }
}

#[derive(Debug)]
struct SimShard {
    id: u32,
    docs: HashSet<DocId>,
    /// Number of docs visible to counts as of the last refresh.
    visible: u64,
    primary: ShardCopy,
    replicas: Vec<ShardCopy>,
}

impl SimShard {
    fn refresh(&mut self) {
        self.visible = self.docs.len() as u64;
    }
}

#[derive(Debug)]
struct SimCollection {
    allowed_nodes: u32,
    replicas: u32,
    shards: Vec<SimShard>,
    last_refresh: Instant,
    flushed_docs: u64,
}

impl SimCollection {
    fn route(&mut self, doc_id: DocId) -> &mut SimShard {
        let hash = crc32fast::hash(doc_id.to_string().as_bytes());
        let idx = hash as usize % self.shards.len();
        &mut self.shards[idx]
    }

    /// Spreads primaries round-robin over the allowed nodes and puts each replica on a distinct
    /// other node. Replicas that do not fit stay unassigned.
    fn reallocate(&mut self, now: Instant, delay: Duration) {
        let allowed = self.allowed_nodes;
        let replicas = self.replicas as usize;
        for shard in &mut self.shards {
            let primary_node = shard.id % allowed;
            shard.primary.assign(Some(primary_node), now, delay);

            let candidates = (1..allowed)
                .map(|offset| (primary_node + offset) % allowed)
                .collect::<Vec<_>>();
            shard.replicas.resize(
                replicas,
                ShardCopy {
                    node: None,
                    ready_at: now,
                },
            );
            for (idx, replica) in shard.replicas.iter_mut().enumerate() {
                replica.assign(candidates.get(idx).copied(), now, delay);
            }
        }
    }

    fn health(&self, now: Instant) -> ClusterHealth {
        let copies = || {
            self.shards
                .iter()
                .flat_map(|shard| std::iter::once(&shard.primary).chain(shard.replicas.iter()))
        };
        let relocating_partitions = copies().filter(|copy| copy.is_relocating(now)).count() as u32;
        let unassigned_replicas = copies().filter(|copy| copy.node.is_none()).count() as u32;
        let status = if relocating_partitions == 0 && unassigned_replicas == 0 {
            HealthStatus::Green
        } else {
            HealthStatus::Yellow
        };
        ClusterHealth {
            status,
            nodes: self.allowed_nodes,
            relocating_partitions,
            unassigned_replicas,
        }
    }
}

/// In-memory replicated store with shards, replicas and node placement.
///
/// Writes go to the primary of the shard the document id hashes to, and wait while that primary
/// is relocating. Written documents only show up in counts after a refresh. Topology changes
/// through [`TopologyDriver`] move shard copies around, and every moved copy takes
/// [`SimOptions::relocation_time`] to start.
pub struct SimCluster {
    options: SimOptions,
    collections: Mutex<HashMap<String, SimCollection>>,
    write_attempts: AtomicU64,
    under_reports_left: AtomicU32,
    /// Under-reporting only starts once someone asked for an explicit refresh.
    refresh_requested: AtomicBool,
}

impl SimCluster {
    pub fn new(options: SimOptions) -> Self {
        Self {
            under_reports_left: AtomicU32::new(options.faults.under_reported_counts),
            options,
            collections: Mutex::new(HashMap::new()),
            write_attempts: AtomicU64::new(0),
            refresh_requested: AtomicBool::new(false),
        }
    }

    fn collections(&self) -> MutexGuard<'_, HashMap<String, SimCollection>> {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_collection<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut SimCollection) -> T,
    ) -> StoreResult<T> {
        let mut collections = self.collections();
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| StoreError::NoSuchCollection(name.to_string()))?;
        Ok(f(collection))
    }

    pub fn health(&self, collection: &str) -> StoreResult<ClusterHealth> {
        let now = Instant::now();
        self.with_collection(collection, |c| c.health(now))
    }

    /// Number of documents stored in the collection, visible or not.
    pub fn stored_docs(&self, collection: &str) -> StoreResult<u64> {
        self.with_collection(collection, |c| {
            c.shards.iter().map(|shard| shard.docs.len() as u64).sum()
        })
    }

    /// Number of write requests received, rejected ones included.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::Acquire)
    }

    /// Number of documents covered by the last flush.
    pub fn flushed_docs(&self, collection: &str) -> StoreResult<u64> {
        self.with_collection(collection, |c| c.flushed_docs)
    }

    /// Claims one of the scripted under-reported counts, if any are left.
    fn take_under_report(&self) -> bool {
        if !self.refresh_requested.load(Ordering::Acquire) {
            return false;
        }
        self.under_reports_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl StoreClient for SimCluster {
    async fn write(&self, collection: &str, doc_id: DocId, _payload: &[u8]) -> StoreResult<()> {
        let attempt = self.write_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if self.options.faults.should_reject(attempt) {
            return Err(StoreError::Rejected(format!(
                "injected failure on write attempt {attempt}"
            )));
        }
        tokio::time::sleep(self.options.write_latency).await;

        loop {
            let relocating_until = self.with_collection(collection, |c| {
                let shard = c.route(doc_id);
                let now = Instant::now();
                if shard.primary.is_started(now) {
                    shard.docs.insert(doc_id);
                    None
                } else {
                    Some(shard.primary.ready_at)
                }
            })?;
            match relocating_until {
                None => return Ok(()),
                Some(deadline) => tokio::time::sleep_until(deadline).await,
            }
        }
    }

    async fn count(&self, collection: &str, query: Query) -> StoreResult<CountResponse> {
        let Query::MatchAll = query;
        let refresh_interval = self.options.refresh_interval;
        let mut response = self.with_collection(collection, |c| {
            let now = Instant::now();
            if now.duration_since(c.last_refresh) >= refresh_interval {
                c.shards.iter_mut().for_each(SimShard::refresh);
                c.last_refresh = now;
            }
            let shards = c.shards.len() as u32;
            CountResponse {
                total: c.shards.iter().map(|shard| shard.visible).sum(),
                total_shards: shards,
                successful_shards: shards,
                failed_shards: 0,
                shard_failures: Vec::new(),
            }
        })?;
        if self.take_under_report() {
            debug!(total = response.total, "under-reporting count by one");
            response.total = response.total.saturating_sub(1);
        }
        Ok(response)
    }

    async fn refresh(&self, collection: &str) -> StoreResult<RefreshSummary> {
        self.refresh_requested.store(true, Ordering::Release);
        self.with_collection(collection, |c| {
            let now = Instant::now();
            let mut successful_partitions = 0;
            for shard in c.shards.iter_mut().filter(|s| s.primary.is_started(now)) {
                shard.refresh();
                successful_partitions += 1;
            }
            c.last_refresh = now;
            RefreshSummary {
                total_partitions: c.shards.len() as u32,
                successful_partitions,
            }
        })
    }

    async fn partition_stats(&self, collection: &str) -> StoreResult<Vec<PartitionStats>> {
        self.with_collection(collection, |c| {
            let now = Instant::now();
            let mut stats = Vec::new();
            for shard in &c.shards {
                stats.push(PartitionStats {
                    partition_id: shard.id,
                    doc_count: shard.visible,
                    is_primary: true,
                    node: shard.primary.node,
                });
                for replica in &shard.replicas {
                    stats.push(PartitionStats {
                        partition_id: shard.id,
                        doc_count: if replica.is_started(now) { shard.visible } else { 0 },
                        is_primary: false,
                        node: replica.node,
                    });
                }
            }
            stats
        })
    }

    async fn wait_for_topology(
        &self,
        collection: &str,
        condition: HealthPredicate,
        timeout: Duration,
    ) -> StoreResult<bool> {
        self.health(collection)?;
        let reached = BusyPoll::new(TOPOLOGY_CHECK_INTERVAL)
            .wait_until(
                || async move {
                    self.health(collection)
                        .map_or(false, |health| condition.matches(&health))
                },
                timeout,
            )
            .await;
        let health = self.health(collection)?;
        debug!(%condition, ?health, reached, "topology wait finished");
        Ok(!reached)
    }
}

#[async_trait::async_trait]
impl TopologyDriver for SimCluster {
    async fn create_collection(
        &self,
        collection: &str,
        shards: u32,
        replicas: u32,
        nodes: u32,
    ) -> StoreResult<()> {
        if shards == 0 {
            return Err(StoreError::Rejected("a collection needs at least one shard".into()));
        }
        let mut collections = self.collections();
        if collections.contains_key(collection) {
            return Err(StoreError::Rejected(format!(
                "collection [{collection}] already exists"
            )));
        }
        let now = Instant::now();
        let unplaced = ShardCopy {
            node: None,
            ready_at: now,
        };
        let mut created = SimCollection {
            allowed_nodes: nodes.clamp(1, self.options.nodes.max(1)),
            replicas,
            shards: (0..shards)
                .map(|id| SimShard {
                    id,
                    docs: HashSet::new(),
                    visible: 0,
                    primary: unplaced,
                    replicas: Vec::new(),
                })
                .collect(),
            last_refresh: now,
            flushed_docs: 0,
        };
        // Initial placement starts immediately.
        created.reallocate(now, Duration::ZERO);
        info!(collection, shards, replicas, nodes = created.allowed_nodes, "created collection");
        collections.insert(collection.to_string(), created);
        Ok(())
    }

    async fn flush(&self, collection: &str) -> StoreResult<()> {
        self.with_collection(collection, |c| {
            c.flushed_docs = c.shards.iter().map(|shard| shard.docs.len() as u64).sum();
            debug!(collection, docs = c.flushed_docs, "flushed collection");
        })
    }

    async fn allow_nodes(&self, collection: &str, nodes: u32) -> StoreResult<()> {
        let delay = self.options.relocation_time;
        let max_nodes = self.options.nodes.max(1);
        self.with_collection(collection, |c| {
            c.allowed_nodes = nodes.clamp(1, max_nodes);
            c.reallocate(Instant::now(), delay);
            info!(collection, nodes = c.allowed_nodes, "restricted collection to nodes");
        })
    }

    async fn set_replicas(&self, collection: &str, replicas: u32) -> StoreResult<()> {
        let delay = self.options.relocation_time;
        self.with_collection(collection, |c| {
            c.replicas = replicas;
            c.reallocate(Instant::now(), delay);
            info!(collection, replicas, "updated replica count");
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const COLLECTION: &str = "test";

    async fn cluster(options: SimOptions, shards: u32, replicas: u32, nodes: u32) -> SimCluster {
        let cluster = SimCluster::new(options);
        cluster
            .create_collection(COLLECTION, shards, replicas, nodes)
            .await
            .expect("Could not create collection");
        cluster
    }

    async fn write_docs(cluster: &SimCluster, seqs: std::ops::Range<u64>) {
        for seq in seqs {
            cluster
                .write(COLLECTION, DocId::new(seq, 0), b"{}")
                .await
                .expect("Could not write doc");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writes_become_visible_on_refresh() {
        let cluster = cluster(SimOptions::default(), 3, 0, 1).await;
        write_docs(&cluster, 0..30).await;

        let count = cluster.count(COLLECTION, Query::MatchAll).await.unwrap();
        assert_eq!(count.total, 0);
        assert_eq!(count.successful_shards, 3);

        let refresh = cluster.refresh(COLLECTION).await.unwrap();
        assert!(refresh.is_complete());
        let count = cluster.count(COLLECTION, Query::MatchAll).await.unwrap();
        assert_eq!(count.total, 30);

        let stats = cluster.partition_stats(COLLECTION).await.unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.iter().map(|s| s.doc_count).sum::<u64>(), 30);
        // crc32 routing spreads 30 ids over more than one shard
        assert!(stats.iter().filter(|s| s.doc_count > 0).count() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn counts_refresh_lazily_after_the_interval() {
        let cluster = cluster(SimOptions::default(), 2, 0, 1).await;
        write_docs(&cluster, 0..10).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        let count = cluster.count(COLLECTION, Query::MatchAll).await.unwrap();
        assert_eq!(count.total, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn rewriting_a_doc_does_not_duplicate_it() {
        let cluster = cluster(SimOptions::default(), 2, 0, 1).await;
        write_docs(&cluster, 0..5).await;
        write_docs(&cluster, 0..5).await;
        assert_eq!(cluster.stored_docs(COLLECTION).unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn relocating_primary_holds_writes_back() {
        let options = SimOptions {
            relocation_time: Duration::from_secs(2),
            ..SimOptions::default()
        };
        // both shards start on node 0; allowing a second node moves shard 1 there
        let cluster = cluster(options, 2, 0, 1).await;
        assert_eq!(cluster.health(COLLECTION).unwrap().status, HealthStatus::Green);

        cluster.allow_nodes(COLLECTION, 2).await.unwrap();
        let health = cluster.health(COLLECTION).unwrap();
        assert_eq!(health.status, HealthStatus::Yellow);
        assert_eq!(health.relocating_partitions, 1);

        let refresh = cluster.refresh(COLLECTION).await.unwrap();
        assert_eq!(refresh.total_partitions, 2);
        assert_eq!(refresh.successful_partitions, 1);

        let start = Instant::now();
        write_docs(&cluster, 0..20).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(cluster.stored_docs(COLLECTION).unwrap(), 20);
        assert_eq!(cluster.health(COLLECTION).unwrap().status, HealthStatus::Green);
        assert!(cluster.refresh(COLLECTION).await.unwrap().is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn replicas_need_a_second_node() {
        let cluster = cluster(SimOptions::default(), 2, 1, 1).await;
        let health = cluster.health(COLLECTION).unwrap();
        assert_eq!(health.status, HealthStatus::Yellow);
        assert_eq!(health.unassigned_replicas, 2);

        cluster.allow_nodes(COLLECTION, 2).await.unwrap();
        let timed_out = cluster
            .wait_for_topology(
                COLLECTION,
                HealthPredicate::green().with_min_nodes(2),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(!timed_out);

        let stats = cluster.partition_stats(COLLECTION).await.unwrap();
        assert_eq!(stats.iter().filter(|s| !s.is_primary).count(), 2);
        assert!(stats
            .iter()
            .filter(|s| !s.is_primary)
            .all(|s| s.node.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn topology_wait_reports_timeout() {
        let cluster = cluster(SimOptions::default(), 1, 1, 1).await;
        let start = Instant::now();
        let timed_out = cluster
            .wait_for_topology(COLLECTION, HealthPredicate::green(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(timed_out);
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        let missing = cluster
            .wait_for_topology("missing", HealthPredicate::green(), Duration::from_secs(1))
            .await;
        assert_eq!(missing, Err(StoreError::NoSuchCollection("missing".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn injected_faults_reject_writes_and_skew_counts() {
        let options = SimOptions {
            faults: FaultPlan {
                fail_every_nth_write: Some(4),
                under_reported_counts: 1,
            },
            ..SimOptions::default()
        };
        let cluster = cluster(options, 2, 0, 1).await;
        let mut rejected = 0;
        for seq in 1..=12 {
            if cluster.write(COLLECTION, DocId::new(seq, 0), b"{}").await.is_err() {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 3);

        cluster.refresh(COLLECTION).await.unwrap();
        let first = cluster.count(COLLECTION, Query::MatchAll).await.unwrap();
        let second = cluster.count(COLLECTION, Query::MatchAll).await.unwrap();
        assert_eq!(first.total, 8);
        assert_eq!(second.total, 9);
    }

    #[tokio::test]
    async fn duplicate_collection_is_rejected() {
        let cluster = cluster(SimOptions::default(), 1, 0, 1).await;
        assert!(matches!(
            cluster.create_collection(COLLECTION, 1, 0, 1).await,
            Err(StoreError::Rejected(_))
        ));
        assert!(matches!(
            cluster.count("missing", Query::MatchAll).await,
            Err(StoreError::NoSuchCollection(_))
        ));
    }
}
