use std::collections::{BTreeSet, HashMap, HashSet};

use rebound_common::{JobId, ScheduledJob};

/// In-memory view of every pending job, ordered by `(fire_at_ms, sequence)`.
///
/// A job id is in at most one of `jobs` or `reserved` at a time. An id may
/// additionally be in `firing` while a newer job for the same message is
/// being scheduled. `cancelled` only ever holds ids that are in `firing`.
#[derive(Debug, Default)]
pub(crate) struct PendingIndex {
    jobs: HashMap<JobId, ScheduledJob>,
    order: BTreeSet<(u64, u64, JobId)>,
    reserved: HashSet<JobId>,
    firing: HashSet<JobId>,
    cancelled: HashSet<JobId>,
}

impl PendingIndex {
    /// Whether a job with this id is pending or about to be.
    pub(crate) fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id) || self.reserved.contains(id)
    }

    pub(crate) fn is_firing(&self, id: &JobId) -> bool {
        self.firing.contains(id)
    }

    /// Claim an id ahead of persisting it, returning `false` if it is taken.
    pub(crate) fn reserve(&mut self, id: JobId) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.reserved.insert(id)
    }

    pub(crate) fn release(&mut self, id: &JobId) {
        self.reserved.remove(id);
    }

    /// Make a job pending, replacing any older job with the same id.
    pub(crate) fn insert(&mut self, job: ScheduledJob) {
        self.reserved.remove(&job.id);
        self.remove(&job.id);
        self.order.insert((job.fire_at_ms, job.sequence, job.id));
        self.jobs.insert(job.id, job);
    }

    pub(crate) fn remove(&mut self, id: &JobId) -> Option<ScheduledJob> {
        let job = self.jobs.remove(id)?;
        self.order.remove(&(job.fire_at_ms, job.sequence, job.id));
        Some(job)
    }

    /// Move every job due at `now_ms` into the firing set, earliest first.
    pub(crate) fn take_due(&mut self, now_ms: u64) -> Vec<ScheduledJob> {
        let mut due = Vec::new();

        while let Some(&(fire_at_ms, sequence, id)) = self.order.first() {
            if fire_at_ms > now_ms {
                break;
            }
            self.order.remove(&(fire_at_ms, sequence, id));
            if let Some(job) = self.jobs.remove(&id) {
                self.firing.insert(id);
                due.push(job);
            }
        }

        due
    }

    /// Mark a job that is firing right now as cancelled.
    ///
    /// Returns `false` if the job is not firing.
    pub(crate) fn cancel_firing(&mut self, id: &JobId) -> bool {
        self.firing.contains(id) && {
            self.cancelled.insert(*id);
            true
        }
    }

    pub(crate) fn is_cancelled(&self, id: &JobId) -> bool {
        self.cancelled.contains(id)
    }

    /// Finish firing `id`, returning `true` if no newer job replaced it.
    pub(crate) fn finish(&mut self, id: &JobId) -> bool {
        self.firing.remove(id);
        self.cancelled.remove(id);
        !self.contains(id)
    }

    pub(crate) fn jobs(&self) -> impl Iterator<Item = &ScheduledJob> {
        self.jobs.values()
    }

    pub(crate) fn get(&self, id: &JobId) -> Option<&ScheduledJob> {
        self.jobs.get(id)
    }

    pub(crate) fn next_fire_at(&self) -> Option<u64> {
        self.order.first().map(|&(fire_at_ms, _, _)| fire_at_ms)
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }
}
