use async_trait::async_trait;
use rebound_common::{JobId, ScheduledJob};

/// Durable key-value persistence for scheduled jobs
///
/// Jobs are keyed by their [`JobId`]; writing a job with an id that already
/// exists replaces it. Implementations must make a successful `put` durable
/// enough to be returned by `scan_all` after a restart.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Persist a job, replacing any existing job with the same id
    async fn put(&self, job: &ScheduledJob) -> crate::Result<()>;

    /// Fetch a job by id
    async fn get(&self, id: &JobId) -> crate::Result<Option<ScheduledJob>>;

    /// Remove a job, returning whether it existed
    async fn delete(&self, id: &JobId) -> crate::Result<bool>;

    /// Every persisted job, ordered by fire time and then insertion sequence
    async fn scan_all(&self) -> crate::Result<Vec<ScheduledJob>>;

    /// Make every completed write durable
    async fn flush(&self) -> crate::Result<()> {
        Ok(())
    }
}

/// Ordering used by `scan_all` implementations
pub(crate) fn sort_jobs(jobs: &mut [ScheduledJob]) {
    jobs.sort_by(|a, b| {
        a.fire_at_ms
            .cmp(&b.fire_at_ms)
            .then(a.sequence.cmp(&b.sequence))
            .then(a.id.cmp(&b.id))
    });
}
