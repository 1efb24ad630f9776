use crate::client::{HealthPredicate, PartitionStats};
use crate::doc_id::DocId;
use std::fmt;
use std::time::Duration;

/// Enumeration of the errors a [`StoreClient`](crate::StoreClient) can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No partition could take the request, e.g. a shard without an assigned primary.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("no such collection [{0}]")]
    NoSuchCollection(String),

    #[error("store request timed out after {0:?}")]
    Timeout(Duration),
}

/// A specialized `Result` type for store client operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Why a single write attempt did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFailureKind {
    /// The store returned an error for the write.
    Store(StoreError),
    /// The writer task itself panicked.
    Panicked(String),
}

/// A write that a writer task gave up on. Captured for diagnostics, never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    /// Index of the writer task that observed the failure.
    pub writer: usize,
    /// Document being written, if the failure happened inside a write.
    pub doc_id: Option<DocId>,
    pub kind: WriteFailureKind,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.doc_id, &self.kind) {
            (Some(doc_id), WriteFailureKind::Store(err)) => {
                write!(f, "writer {} failed on doc [{doc_id}]: {err}", self.writer)
            }
            (None, WriteFailureKind::Store(err)) => {
                write!(f, "writer {} failed: {err}", self.writer)
            }
            (_, WriteFailureKind::Panicked(msg)) => {
                write!(f, "writer {} panicked: {msg}", self.writer)
            }
        }
    }
}

/// One count round whose result did not match the expected total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundMismatch {
    pub iteration: usize,
    /// `None` when the count request itself failed.
    pub observed: Option<u64>,
}

/// Enumeration of the ways a harness run can fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HarnessError {
    #[error("writer count must be at least 1")]
    InvalidWriterCount,

    /// One or more writes failed while the workload was running.
    #[error("{} write(s) failed, first: {}", .failures.len(), first_failure(.failures))]
    AggregateWriteFailure { failures: Vec<WriteFailure> },

    /// Writers did not drain within the grace period.
    #[error("timeout while waiting for writers to stop: {running} still running after {grace:?}")]
    StopTimeout { grace: Duration, running: usize },

    /// The visible count did not move across a whole polling attempt.
    #[error("failed to reach {target} docs, stalled at {last_count:?}")]
    StallDetected { target: u64, last_count: Option<u64> },

    /// A refresh never succeeded on every partition.
    #[error("refresh did not succeed on all partitions within {timeout:?}")]
    ConvergenceTimeout { timeout: Duration },

    /// At least one of the original count rounds disagreed with the expected total.
    #[error(
        "expected {expected} docs but {} of the original rounds disagreed (converged on retry: {converged_on_retry})",
        .mismatches.len()
    )]
    CountMismatch {
        expected: u64,
        mismatches: Vec<RoundMismatch>,
        converged_on_retry: bool,
        partitions: Vec<PartitionStats>,
    },

    #[error("cluster did not reach {condition} in time")]
    TopologyTimeout { condition: HealthPredicate },

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn first_failure(failures: &[WriteFailure]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<none>".to_string())
}

/// A specialized `Result` type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;
