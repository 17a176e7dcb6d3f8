//! Registry of the jobs that exist per organization.
//!
//! A transition for a job the registry does not know is rejected with
//! `RepositoryError::NotFound`. Persistent backends keep the registry next
//! to their execution rows (a `scheduled_jobs` table, a Redis set); the
//! in-memory backend uses [`InMemoryJobRegistry`].

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use runledger_core::{JobId, OrganizationId};

use crate::repository::{RepositoryError, RepositoryResult};

pub trait JobRegistry: Send + Sync {
    /// Register `job_id` for `organization_id`. Registering twice is a no-op.
    fn register(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<()>;

    fn contains(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<bool>;

    /// Fail with `NotFound` unless the job is registered.
    fn require(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<()> {
        if self.contains(job_id, organization_id)? {
            Ok(())
        } else {
            Err(RepositoryError::not_found(job_id, organization_id))
        }
    }
}

impl<R> JobRegistry for Arc<R>
where
    R: JobRegistry + ?Sized,
{
    fn register(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<()> {
        (**self).register(job_id, organization_id)
    }

    fn contains(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<bool> {
        (**self).contains(job_id, organization_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryJobRegistry {
    jobs: RwLock<HashSet<(OrganizationId, JobId)>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRegistry for InMemoryJobRegistry {
    fn register(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| RepositoryError::illegal_state("job registry lock poisoned"))?;
        jobs.insert((organization_id, job_id));
        Ok(())
    }

    fn contains(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<bool> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| RepositoryError::illegal_state("job registry lock poisoned"))?;
        Ok(jobs.contains(&(organization_id, job_id)))
    }
}
