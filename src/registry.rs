use crate::conductor::Conductor;
use crate::error::{PregelError, Result};
use crate::message::JobId;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Live jobs of a conductor node, by id.
pub struct JobRegistry {
    next_id: AtomicU64,
    jobs: RwLock<BTreeMap<JobId, Arc<Conductor>>>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(JobRegistry {
            next_id: AtomicU64::new(1),
            jobs: RwLock::new(BTreeMap::new()),
        })
    }

    /// Ids are never reused.
    pub fn next_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn insert(&self, conductor: Arc<Conductor>) {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conductor.id(), conductor);
    }

    pub fn get(&self, job: JobId) -> Result<Arc<Conductor>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job)
            .cloned()
            .ok_or(PregelError::JobNotFound(job))
    }

    pub fn remove(&self, job: JobId) -> Option<Arc<Conductor>> {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job)
    }

    pub fn jobs(&self) -> Vec<JobId> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn conductors(&self) -> Vec<Arc<Conductor>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Drops the settled jobs whose retention ran out at `now`, releasing
    /// their workers first.
    pub fn reap(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let expired: Vec<Arc<Conductor>> = self
            .conductors()
            .into_iter()
            .filter(|conductor| conductor.expired(now))
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for conductor in expired {
            conductor.release();
            if self.remove(conductor.id()).is_some() {
                info!(job = %conductor.id(), "job expired");
                reaped.push(conductor.id());
            }
        }
        reaped
    }
}
