use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use runledger_core::{JobExecution, JobId, OrganizationId, Success};

use crate::codec::CodecError;

/// Result type returned by every repository operation.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Job execution repository error.
///
/// ## Error Categories
///
/// - **NotFound**: the job is not registered for the organization
/// - **IllegalState**: the operation is not allowed in the current open/closed state
/// - **Storage**: the backend failed (timeout, connectivity, constraint violation);
///   the backend's own error is kept as the source so callers can inspect it
/// - **Concurrency**: a newer write to the same occurrence won; the transition was not stored
/// - **Serialization**: a payload or a stored row could not be encoded/decoded
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("job {job_id} not found for organization {organization_id}")]
    NotFound {
        job_id: JobId,
        organization_id: OrganizationId,
    },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error(transparent)]
    Storage(Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    pub fn not_found(job_id: JobId, organization_id: OrganizationId) -> Self {
        Self::NotFound {
            job_id,
            organization_id,
        }
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn concurrency(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage(Box::new(err))
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency(_))
    }
}

impl From<CodecError> for RepositoryError {
    fn from(value: CodecError) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Storage-agnostic record of job executions, generic over the job's result type.
///
/// Every occurrence of a job is addressed by `(job_id, organization_id, scheduled)`
/// and holds one row whose state is `Started`, `Success` or `Failure`.
///
/// ## Lifecycle
///
/// Repositories start closed. `open()` must be called before any other
/// operation and `close()` makes further operations illegal until the next
/// `open()`. Opening an open repository or closing a closed one is an error.
///
/// ## Transition Semantics
///
/// - `job_started()` creates the row (or restarts an existing one): state
///   `Started`, `started_at = now`, completion data cleared
/// - `job_succeeded()` / `job_failed()` overwrite the completion data of the
///   row in place and never touch `started_at`
/// - a transition is applied with a single atomic write; a row always reflects
///   exactly one transition
///
/// ## Query Semantics
///
/// Queries order a job's history by `scheduled`, never by call time, and
/// return `None` when there is no matching row.
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - reject transitions for unregistered jobs with `RepositoryError::NotFound`
/// - keep organizations isolated (every read and write is partitioned by organization)
/// - propagate storage errors without retrying
/// - fetch `get_last_success_batch()` in a single round trip where the backend allows
pub trait JobExecutionRepository<T>: Send + Sync {
    /// Open / connect to the repository.
    fn open(&self) -> RepositoryResult<()>;

    /// Close the repository.
    fn close(&self) -> RepositoryResult<()>;

    /// Record that the occurrence scheduled at `scheduled` has started running.
    fn job_started(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
    ) -> RepositoryResult<()>;

    /// Record that the occurrence completed with `result`.
    fn job_succeeded(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        result: T,
    ) -> RepositoryResult<Success<T>>;

    /// Record that the occurrence aborted with `error`.
    ///
    /// The error is stored as the text produced by [`runledger_core::render_error`].
    fn job_failed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        error: &anyhow::Error,
    ) -> RepositoryResult<()>;

    /// The most recently scheduled execution in any state (possibly still running).
    fn get_last_scheduled(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>>;

    /// The most recently scheduled execution that completed, successfully or not.
    fn get_last_completed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>>;

    /// The most recently scheduled successful execution.
    fn get_last_success(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<Success<T>>>;

    /// The most recent success of each job in `job_ids` scheduled on or after
    /// `cutoff` (UTC date).
    ///
    /// Jobs that do not exist or have no qualifying success are absent from the map.
    fn get_last_success_batch(
        &self,
        job_ids: &HashSet<JobId>,
        organization_id: OrganizationId,
        cutoff: NaiveDate,
    ) -> RepositoryResult<HashMap<JobId, Success<T>>>;
}

impl<T, S> JobExecutionRepository<T> for Arc<S>
where
    S: JobExecutionRepository<T> + ?Sized,
{
    fn open(&self) -> RepositoryResult<()> {
        (**self).open()
    }

    fn close(&self) -> RepositoryResult<()> {
        (**self).close()
    }

    fn job_started(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        (**self).job_started(job_id, organization_id, scheduled)
    }

    fn job_succeeded(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        result: T,
    ) -> RepositoryResult<Success<T>> {
        (**self).job_succeeded(job_id, organization_id, scheduled, result)
    }

    fn job_failed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        error: &anyhow::Error,
    ) -> RepositoryResult<()> {
        (**self).job_failed(job_id, organization_id, scheduled, error)
    }

    fn get_last_scheduled(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>> {
        (**self).get_last_scheduled(job_id, organization_id)
    }

    fn get_last_completed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>> {
        (**self).get_last_completed(job_id, organization_id)
    }

    fn get_last_success(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<Success<T>>> {
        (**self).get_last_success(job_id, organization_id)
    }

    fn get_last_success_batch(
        &self,
        job_ids: &HashSet<JobId>,
        organization_id: OrganizationId,
        cutoff: NaiveDate,
    ) -> RepositoryResult<HashMap<JobId, Success<T>>> {
        (**self).get_last_success_batch(job_ids, organization_id, cutoff)
    }
}
