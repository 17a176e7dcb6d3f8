//! Caller-side helper that records runs of a job through a repository.
//!
//! Schedulers call [`ExecutionTracker::run`] around a job's business logic:
//! the occurrence is marked started, the closure runs, and exactly one of
//! `job_succeeded`/`job_failed` follows.

use std::collections::HashSet;
use std::marker::PhantomData;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};

use runledger_core::{render_error, JobId, OrganizationId, Success};

use crate::repository::{JobExecutionRepository, RepositoryResult};

pub struct ExecutionTracker<R, T> {
    repository: R,
    _result: PhantomData<fn() -> T>,
}

impl<R, T> ExecutionTracker<R, T>
where
    R: JobExecutionRepository<T>,
{
    pub fn new(repository: R) -> Self {
        Self {
            repository,
            _result: PhantomData,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Run `job` for the occurrence at `scheduled` and record the outcome.
    ///
    /// The outer `Result` reports repository failures; the inner one is the
    /// job's own outcome, with the live error handed back after it has been
    /// recorded.
    pub fn run<F>(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        job: F,
    ) -> RepositoryResult<Result<Success<T>, anyhow::Error>>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        self.repository
            .job_started(job_id, organization_id, scheduled)?;
        debug!(job_id = %job_id, organization_id = %organization_id, scheduled = %scheduled, "job started");

        match job() {
            Ok(result) => {
                let success = self
                    .repository
                    .job_succeeded(job_id, organization_id, scheduled, result)?;
                info!(
                    job_id = %job_id,
                    organization_id = %organization_id,
                    scheduled = %scheduled,
                    "job succeeded"
                );
                Ok(Ok(success))
            }
            Err(error) => {
                self.repository
                    .job_failed(job_id, organization_id, scheduled, &error)?;
                warn!(
                    job_id = %job_id,
                    organization_id = %organization_id,
                    scheduled = %scheduled,
                    error = %render_error(&error),
                    "job failed"
                );
                Ok(Err(error))
            }
        }
    }

    /// Whether the job's latest completed occurrence is at or after `scheduled`.
    pub fn already_completed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let scheduled = runledger_core::execution::normalize(scheduled);
        Ok(self
            .repository
            .get_last_completed(job_id, organization_id)?
            .is_some_and(|last| last.scheduled() >= scheduled))
    }

    /// The subset of `job_ids` without a success scheduled on or after `cutoff`.
    pub fn jobs_due(
        &self,
        job_ids: &HashSet<JobId>,
        organization_id: OrganizationId,
        cutoff: NaiveDate,
    ) -> RepositoryResult<HashSet<JobId>> {
        let succeeded = self
            .repository
            .get_last_success_batch(job_ids, organization_id, cutoff)?;
        let due: HashSet<JobId> = job_ids
            .iter()
            .filter(|id| !succeeded.contains_key(id))
            .copied()
            .collect();

        debug!(
            organization_id = %organization_id,
            requested = job_ids.len(),
            due = due.len(),
            "filtered jobs due"
        );
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use runledger_core::{ExecutionState, JobExecution};

    use crate::registry::JobRegistry;
    use crate::repository::InMemoryExecutionRepository;

    fn tracker() -> (ExecutionTracker<InMemoryExecutionRepository<u64>, u64>, OrganizationId) {
        let repository = InMemoryExecutionRepository::new();
        repository.open().unwrap();
        (ExecutionTracker::new(repository), OrganizationId::new())
    }

    fn register(tracker: &ExecutionTracker<InMemoryExecutionRepository<u64>, u64>, org: OrganizationId) -> JobId {
        let job_id = JobId::new();
        tracker.repository().registry().register(job_id, org).unwrap();
        job_id
    }

    #[test]
    fn successful_run_is_recorded() {
        let (tracker, org) = tracker();
        let job_id = register(&tracker, org);
        let scheduled = runledger_core::execution::now();

        let success = tracker.run(job_id, org, scheduled, || Ok(42)).unwrap().unwrap();
        assert_eq!(success.result, 42);

        let last = tracker.repository().get_last_completed(job_id, org).unwrap().unwrap();
        assert_eq!(last, JobExecution::Success(success));
    }

    #[test]
    fn failed_run_records_rendered_error_and_returns_it() {
        let (tracker, org) = tracker();
        let job_id = register(&tracker, org);
        let scheduled = runledger_core::execution::now();

        let outcome = tracker
            .run(job_id, org, scheduled, || Err(anyhow::anyhow!("report query timed out")))
            .unwrap();
        let error = outcome.unwrap_err();

        let last = tracker.repository().get_last_completed(job_id, org).unwrap().unwrap();
        assert_eq!(last.state(), ExecutionState::Failure);
        assert_eq!(last.as_failure().unwrap().error, render_error(&error));
    }

    #[test]
    fn unknown_job_fails_before_running() {
        let (tracker, org) = tracker();
        let mut ran = false;

        let err = tracker
            .run(JobId::new(), org, runledger_core::execution::now(), || {
                ran = true;
                Ok(1)
            })
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!ran);
    }

    #[test]
    fn already_completed_compares_scheduled() {
        let (tracker, org) = tracker();
        let job_id = register(&tracker, org);
        let t0 = runledger_core::execution::now() - Duration::hours(2);
        let t1 = t0 + Duration::hours(1);

        assert!(!tracker.already_completed(job_id, org, t0).unwrap());
        tracker.run(job_id, org, t0, || Ok(1)).unwrap().unwrap();

        assert!(tracker.already_completed(job_id, org, t0).unwrap());
        assert!(!tracker.already_completed(job_id, org, t1).unwrap());
    }

    #[test]
    fn jobs_due_excludes_recent_successes() {
        let (tracker, org) = tracker();
        let done = register(&tracker, org);
        let failed = register(&tracker, org);
        let never_ran = register(&tracker, org);
        let today = runledger_core::execution::now();

        tracker.run(done, org, today, || Ok(1)).unwrap().unwrap();
        tracker
            .run(failed, org, today, || Err(anyhow::anyhow!("boom")))
            .unwrap()
            .unwrap_err();

        let all = HashSet::from([done, failed, never_ran]);
        let due = tracker.jobs_due(&all, org, today.date_naive()).unwrap();
        assert_eq!(due, HashSet::from([failed, never_ran]));
    }
}
