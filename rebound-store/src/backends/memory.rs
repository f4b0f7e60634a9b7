use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use rebound_common::{JobId, ScheduledJob};

use crate::{
    StoreError,
    store::{JobStore, sort_jobs},
};

/// In-memory job store
///
/// Jobs live in a `HashMap` behind an `RwLock`. Nothing survives the process,
/// so this is meant for tests and for brokers that accept losing pending
/// redeliveries on restart.
///
/// # Capacity Management
/// With a capacity set, a `put` of a new id fails once the store is full.
/// Replacing an existing id never counts against the limit.
#[derive(Debug, Clone)]
pub struct MemoryJobStore {
    pub(crate) jobs: Arc<RwLock<HashMap<JobId, ScheduledJob>>>,
    /// Maximum number of jobs to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            capacity: None,
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            capacity: Some(capacity),
        }
    }

    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn put(&self, job: &ScheduledJob) -> crate::Result<()> {
        let mut jobs = self.jobs.write()?;

        if let Some(capacity) = self.capacity
            && !jobs.contains_key(&job.id)
            && jobs.len() >= capacity
        {
            return Err(StoreError::CapacityExceeded {
                len: jobs.len(),
                capacity,
            });
        }

        jobs.insert(job.id, job.clone());

        Ok(())
    }

    async fn get(&self, id: &JobId) -> crate::Result<Option<ScheduledJob>> {
        Ok(self.jobs.read()?.get(id).cloned())
    }

    async fn delete(&self, id: &JobId) -> crate::Result<bool> {
        Ok(self.jobs.write()?.remove(id).is_some())
    }

    async fn scan_all(&self) -> crate::Result<Vec<ScheduledJob>> {
        let mut jobs: Vec<_> = self.jobs.read()?.values().cloned().collect();
        sort_jobs(&mut jobs);
        Ok(jobs)
    }
}
