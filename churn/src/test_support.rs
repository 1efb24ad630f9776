//! Scriptable [`StoreClient`] double shared by the unit tests.

use crate::client::{
    CountResponse, HealthPredicate, PartitionStats, Query, RefreshSummary, StoreClient,
};
use crate::doc_id::DocId;
use crate::error::{StoreError, StoreResult};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Routes harness logs through the test harness' captured output.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub(crate) struct ScriptedStore {
    /// Fail writes whose sequence number is a multiple of this.
    pub fail_every: Option<u64>,
    /// Panic on the write with this sequence number.
    pub panic_on: Option<u64>,
    /// Never complete any write.
    pub hang_writes: bool,
    pub shards: u32,
    pub written: Mutex<HashSet<DocId>>,
    /// Totals returned by upcoming count calls before falling back to `fixed_count`.
    pub count_script: Mutex<VecDeque<StoreResult<u64>>>,
    /// Count returned once the script is exhausted; the number of writes when `None`.
    pub fixed_count: Option<u64>,
    pub refresh_script: Mutex<VecDeque<StoreResult<RefreshSummary>>>,
    pub count_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub stats_calls: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self {
            shards: 1,
            ..Default::default()
        }
    }

    pub fn script_counts(&self, counts: impl IntoIterator<Item = StoreResult<u64>>) {
        self.count_script.lock().unwrap().extend(counts);
    }

    pub fn script_refreshes(&self, refreshes: impl IntoIterator<Item = StoreResult<RefreshSummary>>) {
        self.refresh_script.lock().unwrap().extend(refreshes);
    }

    pub fn written(&self) -> HashSet<DocId> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StoreClient for ScriptedStore {
    async fn write(&self, _collection: &str, doc_id: DocId, _payload: &[u8]) -> StoreResult<()> {
        if self.hang_writes {
            std::future::pending::<()>().await;
        }
        if self.panic_on == Some(doc_id.seq()) {
            panic!("scripted panic on {doc_id}");
        }
        if let Some(n) = self.fail_every {
            if doc_id.seq() % n == 0 {
                return Err(StoreError::Rejected(format!("scripted failure on {doc_id}")));
            }
        }
        self.written.lock().unwrap().insert(doc_id);
        Ok(())
    }

    async fn count(&self, _collection: &str, _query: Query) -> StoreResult<CountResponse> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.count_script.lock().unwrap().pop_front();
        let total = match scripted {
            Some(result) => result?,
            None => self
                .fixed_count
                .unwrap_or_else(|| self.written.lock().unwrap().len() as u64),
        };
        Ok(CountResponse {
            total,
            total_shards: self.shards,
            successful_shards: self.shards,
            failed_shards: 0,
            shard_failures: Vec::new(),
        })
    }

    async fn refresh(&self, _collection: &str) -> StoreResult<RefreshSummary> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.refresh_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(RefreshSummary {
            total_partitions: self.shards,
            successful_partitions: self.shards,
        }))
    }

    async fn partition_stats(&self, _collection: &str) -> StoreResult<Vec<PartitionStats>> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..self.shards)
            .map(|partition_id| PartitionStats {
                partition_id,
                doc_count: 0,
                is_primary: true,
                node: Some(0),
            })
            .collect())
    }

    async fn wait_for_topology(
        &self,
        _collection: &str,
        _condition: HealthPredicate,
        _timeout: Duration,
    ) -> StoreResult<bool> {
        Ok(false)
    }
}
