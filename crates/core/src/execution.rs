//! Recorded state of one scheduled occurrence of a job.
//!
//! An occurrence is addressed by an [`ExecutionKey`]. Its recorded state is a
//! closed sum type, [`JobExecution`], with one variant per lifecycle state:
//!
//! - [`Started`]: the run began and has not reported back yet
//! - [`Success`]: the run completed and produced a result `T`
//! - [`Failure`]: the run completed with an error, stored as rendered text
//!
//! None of the variants is final: a later transition for the same key
//! overwrites the previous one in place.

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{JobId, OrganizationId};

/// Timestamp resolution shared by every backend (microseconds).
const TIMESTAMP_PRECISION: u16 = 6;

/// Normalize an instant to the resolution the ledger stores.
pub fn normalize(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.trunc_subsecs(TIMESTAMP_PRECISION)
}

/// Current wall-clock time at ledger resolution.
pub fn now() -> DateTime<Utc> {
    normalize(Utc::now())
}

/// Identity of one occurrence of one job for one tenant.
///
/// `scheduled` is the logical time the occurrence was intended to run, not
/// the wall-clock time of any call. It is both the identity and the ordering
/// axis of a job's history.
///
/// Fields are only reachable through accessors: every key, including one
/// read back from storage, goes through [`ExecutionKey::new`] and so holds a
/// microsecond-truncated `scheduled`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "StoredKey")]
pub struct ExecutionKey {
    job_id: JobId,
    organization_id: OrganizationId,
    scheduled: DateTime<Utc>,
}

#[derive(Deserialize)]
struct StoredKey {
    job_id: JobId,
    organization_id: OrganizationId,
    scheduled: DateTime<Utc>,
}

impl From<StoredKey> for ExecutionKey {
    fn from(raw: StoredKey) -> Self {
        Self::new(raw.job_id, raw.organization_id, raw.scheduled)
    }
}

impl ExecutionKey {
    pub fn new(job_id: JobId, organization_id: OrganizationId, scheduled: DateTime<Utc>) -> Self {
        Self {
            job_id,
            organization_id,
            scheduled: normalize(scheduled),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    pub fn scheduled(&self) -> DateTime<Utc> {
        self.scheduled
    }

    /// Calendar date (UTC) of the scheduled instant.
    pub fn scheduled_date(&self) -> NaiveDate {
        self.scheduled.date_naive()
    }

    /// Whether the occurrence falls on or after `cutoff` (compared in UTC).
    pub fn is_on_or_after(&self, cutoff: NaiveDate) -> bool {
        self.scheduled_date() >= cutoff
    }
}

/// Discriminant of a [`JobExecution`], as persisted by backends.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Started,
    Success,
    Failure,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Started => "started",
            ExecutionState::Success => "success",
            ExecutionState::Failure => "failure",
        }
    }

    /// `Success` and `Failure` are terminal: the occurrence completed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Success | ExecutionState::Failure)
    }
}

impl core::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ExecutionState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(ExecutionState::Started),
            "success" => Ok(ExecutionState::Success),
            "failure" => Ok(ExecutionState::Failure),
            other => Err(DomainError::validation(format!(
                "unknown execution state '{other}'"
            ))),
        }
    }
}

/// An execution that has been started but not yet completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub key: ExecutionKey,
    pub started_at: DateTime<Utc>,
}

/// An execution that completed with a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Success<T> {
    pub key: ExecutionKey,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub result: T,
}

/// An execution that completed with an error.
///
/// `error` holds the fully rendered diagnostic (see [`crate::render_error`]),
/// not a live error value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub key: ExecutionKey,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: String,
}

impl Started {
    pub fn scheduled(&self) -> DateTime<Utc> {
        self.key.scheduled
    }
}

impl<T> Success<T> {
    pub fn job_id(&self) -> JobId {
        self.key.job_id
    }

    pub fn scheduled(&self) -> DateTime<Utc> {
        self.key.scheduled
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Success<U> {
        Success {
            key: self.key,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: f(self.result),
        }
    }
}

impl Failure {
    pub fn scheduled(&self) -> DateTime<Utc> {
        self.key.scheduled
    }
}

/// Recorded state of one occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobExecution<T> {
    Started(Started),
    Success(Success<T>),
    Failure(Failure),
}

impl<T> JobExecution<T> {
    pub fn key(&self) -> &ExecutionKey {
        match self {
            JobExecution::Started(s) => &s.key,
            JobExecution::Success(s) => &s.key,
            JobExecution::Failure(f) => &f.key,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.key().job_id
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.key().organization_id
    }

    pub fn scheduled(&self) -> DateTime<Utc> {
        self.key().scheduled
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        match self {
            JobExecution::Started(s) => s.started_at,
            JobExecution::Success(s) => s.started_at,
            JobExecution::Failure(f) => f.started_at,
        }
    }

    /// Completion time; `None` while the occurrence is still `Started`.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobExecution::Started(_) => None,
            JobExecution::Success(s) => Some(s.completed_at),
            JobExecution::Failure(f) => Some(f.completed_at),
        }
    }

    pub fn state(&self) -> ExecutionState {
        match self {
            JobExecution::Started(_) => ExecutionState::Started,
            JobExecution::Success(_) => ExecutionState::Success,
            JobExecution::Failure(_) => ExecutionState::Failure,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn as_success(&self) -> Option<&Success<T>> {
        match self {
            JobExecution::Success(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            JobExecution::Failure(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_success(self) -> Option<Success<T>> {
        match self {
            JobExecution::Success(s) => Some(s),
            _ => None,
        }
    }

    /// Dispatch to the visitor method matching this state.
    pub fn accept<V>(&self, visitor: &mut V) -> V::Output
    where
        V: JobExecutionVisitor<T> + ?Sized,
    {
        match self {
            JobExecution::Started(s) => visitor.visit_started(s),
            JobExecution::Success(s) => visitor.visit_success(s),
            JobExecution::Failure(f) => visitor.visit_failure(f),
        }
    }
}

impl<T> From<Success<T>> for JobExecution<T> {
    fn from(value: Success<T>) -> Self {
        JobExecution::Success(value)
    }
}

/// Exhaustive handler over the states of a [`JobExecution`].
///
/// Implementors must handle every state; adding a state is a compile error
/// for every visitor.
pub trait JobExecutionVisitor<T> {
    type Output;

    fn visit_started(&mut self, state: &Started) -> Self::Output;

    fn visit_success(&mut self, state: &Success<T>) -> Self::Output;

    fn visit_failure(&mut self, state: &Failure) -> Self::Output;

    /// Convenience wrapper around `execution.accept(self)`.
    fn visit(&mut self, execution: &JobExecution<T>) -> Self::Output {
        execution.accept(self)
    }
}
