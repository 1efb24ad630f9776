use crate::doc_id::DocId;
use crate::error::StoreResult;
use std::fmt;
use std::time::Duration;

/// Queries the harness issues against the store.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Query {
    #[default]
    MatchAll,
}

/// Result of a count request, including how many partitions answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountResponse {
    pub total: u64,
    pub total_shards: u32,
    pub successful_shards: u32,
    pub failed_shards: u32,
    pub shard_failures: Vec<String>,
}

/// Result of a refresh (visibility flush) request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub total_partitions: u32,
    pub successful_partitions: u32,
}

impl RefreshSummary {
    /// Whether every partition took part in the refresh.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.total_partitions == self.successful_partitions
    }
}

/// Per-partition document count, used for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    pub partition_id: u32,
    pub doc_count: u64,
    pub is_primary: bool,
    /// Node currently holding this copy, if assigned.
    pub node: Option<u32>,
}

impl fmt::Display for PartitionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shard [{}] - count {}, primary {}",
            self.partition_id, self.doc_count, self.is_primary
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthStatus {
    Red,
    Yellow,
    Green,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Red => "RED",
            HealthStatus::Yellow => "YELLOW",
            HealthStatus::Green => "GREEN",
        };
        f.write_str(name)
    }
}

/// Snapshot of the cluster as seen by one collection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClusterHealth {
    pub status: HealthStatus,
    /// Nodes the collection may currently be allocated to.
    pub nodes: u32,
    pub relocating_partitions: u32,
    pub unassigned_replicas: u32,
}

/// Condition to wait for, e.g. "GREEN with at least 2 nodes".
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HealthPredicate {
    pub min_status: HealthStatus,
    pub min_nodes: Option<u32>,
}

impl HealthPredicate {
    pub fn green() -> Self {
        Self {
            min_status: HealthStatus::Green,
            min_nodes: None,
        }
    }

    pub fn yellow() -> Self {
        Self {
            min_status: HealthStatus::Yellow,
            min_nodes: None,
        }
    }

    pub fn with_min_nodes(mut self, nodes: u32) -> Self {
        self.min_nodes = Some(nodes);
        self
    }

    pub fn matches(&self, health: &ClusterHealth) -> bool {
        health.status >= self.min_status && self.min_nodes.map_or(true, |n| health.nodes >= n)
    }
}

impl fmt::Display for HealthPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.min_nodes {
            Some(nodes) => write!(f, "{} with nodes >= {nodes}", self.min_status),
            None => write!(f, "{}", self.min_status),
        }
    }
}

/// The capabilities the harness needs from the store under test.
///
/// Implementations own all consistency guarantees; the harness calls these concurrently from
/// every writer and from the verifier without any locking of its own.
#[async_trait::async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Writes a single document and waits for the acknowledgement.
    async fn write(&self, collection: &str, doc_id: DocId, payload: &[u8]) -> StoreResult<()>;

    /// Counts the documents currently visible to `query`.
    async fn count(&self, collection: &str, query: Query) -> StoreResult<CountResponse>;

    /// Makes every acknowledged write visible to reads.
    async fn refresh(&self, collection: &str) -> StoreResult<RefreshSummary>;

    async fn partition_stats(&self, collection: &str) -> StoreResult<Vec<PartitionStats>>;

    /// Blocks until the cluster satisfies `condition` or `timeout` elapses.
    /// Returns `true` when the wait timed out.
    async fn wait_for_topology(
        &self,
        collection: &str,
        condition: HealthPredicate,
        timeout: Duration,
    ) -> StoreResult<bool>;
}

/// Topology changes used by the canned scenarios. Not needed by the core engine.
#[async_trait::async_trait]
pub trait TopologyDriver: StoreClient {
    async fn create_collection(
        &self,
        collection: &str,
        shards: u32,
        replicas: u32,
        nodes: u32,
    ) -> StoreResult<()>;

    /// Persists in-memory state of the collection (a hard commit, not a visibility refresh).
    async fn flush(&self, collection: &str) -> StoreResult<()>;

    /// Restricts the collection to the first `nodes` nodes of the cluster.
    async fn allow_nodes(&self, collection: &str, nodes: u32) -> StoreResult<()>;

    async fn set_replicas(&self, collection: &str, replicas: u32) -> StoreResult<()>;
}
