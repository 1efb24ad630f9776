mod cluster;

pub use cluster::*;

/// Failures a [`SimCluster`] injects on purpose.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Reject every n-th write attempt, counted across all writers.
    pub fail_every_nth_write: Option<u64>,
    /// Under-report this many count reads by one document, as a lagging replica would. Only
    /// counts issued after the first explicit refresh are affected.
    pub under_reported_counts: u32,
}

impl FaultPlan {
    /// Whether the write with the 1-based attempt number `attempt` must be rejected.
    #[inline]
    pub fn should_reject(&self, attempt: u64) -> bool {
        self.fail_every_nth_write
            .map_or(false, |n| n > 0 && attempt % n == 0)
    }
}
