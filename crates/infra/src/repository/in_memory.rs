use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use runledger_core::{
    render_error, ExecutionKey, JobExecution, JobId, OrganizationId, Success,
};

use super::lifecycle::Lifecycle;
use super::record::{ExecutionRecord, Transition};
use super::r#trait::{JobExecutionRepository, RepositoryError, RepositoryResult};
use crate::registry::{InMemoryJobRegistry, JobRegistry};

type History<T> = BTreeMap<DateTime<Utc>, ExecutionRecord<T>>;

/// In-memory execution repository.
///
/// Intended for tests/dev and as the reference backend. Each job's history is
/// a `BTreeMap` ordered by `scheduled`, so "last" queries walk it backwards.
#[derive(Debug)]
pub struct InMemoryExecutionRepository<T, R = InMemoryJobRegistry> {
    lifecycle: Lifecycle,
    registry: R,
    histories: RwLock<HashMap<(OrganizationId, JobId), History<T>>>,
}

impl<T> InMemoryExecutionRepository<T, InMemoryJobRegistry> {
    pub fn new() -> Self {
        Self::with_registry(InMemoryJobRegistry::new())
    }
}

impl<T> Default for InMemoryExecutionRepository<T, InMemoryJobRegistry> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> InMemoryExecutionRepository<T, R> {
    pub fn with_registry(registry: R) -> Self {
        Self {
            lifecycle: Lifecycle::new("InMemoryExecutionRepository"),
            registry,
            histories: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }
}

impl<T, R> InMemoryExecutionRepository<T, R>
where
    T: Clone + Send + Sync,
    R: JobRegistry,
{
    fn apply(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        transition: Transition<T>,
    ) -> RepositoryResult<ExecutionRecord<T>> {
        self.lifecycle.ensure_open()?;
        self.registry.require(job_id, organization_id)?;

        let key = ExecutionKey::new(job_id, organization_id, scheduled);
        let state = transition.target_state();
        debug!(
            job_id = %job_id,
            organization_id = %organization_id,
            scheduled = %key.scheduled(),
            state = %state,
            "upserting execution"
        );

        let mut histories = self
            .histories
            .write()
            .map_err(|_| RepositoryError::illegal_state("execution store lock poisoned"))?;
        let history = histories.entry((organization_id, job_id)).or_default();

        let row = ExecutionRecord::apply(
            history.get(&key.scheduled()),
            key,
            transition,
            runledger_core::execution::now(),
        );
        history.insert(key.scheduled(), row.clone());
        Ok(row)
    }

    /// Latest row of the job's history matching `filter`, by `scheduled`.
    fn find_last<F>(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        filter: F,
    ) -> RepositoryResult<Option<ExecutionRecord<T>>>
    where
        F: Fn(&ExecutionRecord<T>) -> bool,
    {
        self.lifecycle.ensure_open()?;
        let histories = self
            .histories
            .read()
            .map_err(|_| RepositoryError::illegal_state("execution store lock poisoned"))?;

        Ok(histories
            .get(&(organization_id, job_id))
            .and_then(|history| history.values().rev().find(|row| filter(row)).cloned()))
    }
}

impl<T, R> JobExecutionRepository<T> for InMemoryExecutionRepository<T, R>
where
    T: Clone + Send + Sync,
    R: JobRegistry,
{
    fn open(&self) -> RepositoryResult<()> {
        self.lifecycle.open()
    }

    fn close(&self) -> RepositoryResult<()> {
        self.lifecycle.close()
    }

    fn job_started(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        self.apply(job_id, organization_id, scheduled, Transition::Start)
            .map(|_| ())
    }

    fn job_succeeded(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        result: T,
    ) -> RepositoryResult<Success<T>> {
        self.apply(job_id, organization_id, scheduled, Transition::Succeed(result))?
            .into_success(Ok)
    }

    fn job_failed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        error: &anyhow::Error,
    ) -> RepositoryResult<()> {
        self.apply(
            job_id,
            organization_id,
            scheduled,
            Transition::Fail(render_error(error)),
        )
        .map(|_| ())
    }

    fn get_last_scheduled(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>> {
        self.find_last(job_id, organization_id, |_| true)?
            .map(|row| row.into_execution(Ok))
            .transpose()
    }

    fn get_last_completed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>> {
        self.find_last(job_id, organization_id, ExecutionRecord::is_terminal)?
            .map(|row| row.into_execution(Ok))
            .transpose()
    }

    fn get_last_success(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<Success<T>>> {
        self.find_last(job_id, organization_id, ExecutionRecord::is_success)?
            .map(|row| row.into_success(Ok))
            .transpose()
    }

    fn get_last_success_batch(
        &self,
        job_ids: &HashSet<JobId>,
        organization_id: OrganizationId,
        cutoff: NaiveDate,
    ) -> RepositoryResult<HashMap<JobId, Success<T>>> {
        self.lifecycle.ensure_open()?;
        let histories = self
            .histories
            .read()
            .map_err(|_| RepositoryError::illegal_state("execution store lock poisoned"))?;

        let mut successes = HashMap::new();
        for &job_id in job_ids {
            if !self.registry.contains(job_id, organization_id)? {
                continue;
            }
            let Some(history) = histories.get(&(organization_id, job_id)) else {
                continue;
            };
            let latest = history
                .values()
                .rev()
                .take_while(|row| row.key.is_on_or_after(cutoff))
                .find(|row| row.is_success());
            if let Some(row) = latest {
                successes.insert(job_id, row.clone().into_success(Ok)?);
            }
        }
        Ok(successes)
    }
}
