//! Flat storage row for one execution and the transition rules applied to it.
//!
//! Backends that read-modify-write rows (in-memory, Redis) apply transitions
//! through [`ExecutionRecord::apply`] so they share one implementation of
//! the state machine. The Postgres backend expresses the same rules in its
//! upsert statements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use runledger_core::{
    ExecutionKey, ExecutionState, Failure, JobExecution, Started, Success,
};

use super::r#trait::{RepositoryError, RepositoryResult};

/// A state transition requested by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<R> {
    Start,
    Succeed(R),
    /// Carries the already rendered error text.
    Fail(String),
}

impl<R> Transition<R> {
    pub fn target_state(&self) -> ExecutionState {
        match self {
            Transition::Start => ExecutionState::Started,
            Transition::Succeed(_) => ExecutionState::Success,
            Transition::Fail(_) => ExecutionState::Failure,
        }
    }
}

/// One execution row, with the payload in its stored representation `R`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord<R> {
    pub key: ExecutionKey,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<R>,
    pub error: Option<String>,
    /// Time of the write that produced this row (last-write-wins ordering).
    pub updated_at: DateTime<Utc>,
}

impl<R> ExecutionRecord<R> {
    /// Apply `transition` to the current row for `key` (if any) at time `now`.
    ///
    /// - `Start` resets the row: `started_at = now`, completion data cleared
    /// - `Succeed`/`Fail` keep `started_at` and replace completion data wholesale
    /// - a completion without a prior start uses `now` as `started_at`
    pub fn apply(
        existing: Option<&ExecutionRecord<R>>,
        key: ExecutionKey,
        transition: Transition<R>,
        now: DateTime<Utc>,
    ) -> Self {
        let state = transition.target_state();
        let started_at = match (&transition, existing) {
            (Transition::Start, _) | (_, None) => now,
            (_, Some(current)) => current.started_at,
        };

        let (completed_at, result, error) = match transition {
            Transition::Start => (None, None, None),
            Transition::Succeed(result) => (Some(now), Some(result), None),
            Transition::Fail(error) => (Some(now), None, Some(error)),
        };

        Self {
            key,
            state,
            started_at,
            completed_at,
            result,
            error,
            updated_at: now,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ExecutionState::Success
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Convert the row into its typed execution, decoding the stored payload.
    pub fn into_execution<T, F>(self, decode: F) -> RepositoryResult<JobExecution<T>>
    where
        F: FnOnce(R) -> RepositoryResult<T>,
    {
        let key = self.key;
        match self.state {
            ExecutionState::Started => Ok(JobExecution::Started(Started {
                key,
                started_at: self.started_at,
            })),
            ExecutionState::Success => {
                let completed_at = self.completed_at.ok_or_else(|| corrupt(&key, "completed_at"))?;
                let result = self.result.ok_or_else(|| corrupt(&key, "result"))?;
                Ok(JobExecution::Success(Success {
                    key,
                    started_at: self.started_at,
                    completed_at,
                    result: decode(result)?,
                }))
            }
            ExecutionState::Failure => {
                let completed_at = self.completed_at.ok_or_else(|| corrupt(&key, "completed_at"))?;
                let error = self.error.ok_or_else(|| corrupt(&key, "error"))?;
                Ok(JobExecution::Failure(Failure {
                    key,
                    started_at: self.started_at,
                    completed_at,
                    error,
                }))
            }
        }
    }

    /// Convert a row known to be a success (e.g. filtered by the query).
    pub fn into_success<T, F>(self, decode: F) -> RepositoryResult<Success<T>>
    where
        F: FnOnce(R) -> RepositoryResult<T>,
    {
        let key = self.key;
        let state = self.state;
        self.into_execution(decode)?.into_success().ok_or_else(|| {
            RepositoryError::serialization(format!(
                "execution {}/{} at {} is {state}, expected success",
                key.organization_id(), key.job_id(), key.scheduled()
            ))
        })
    }
}

fn corrupt(key: &ExecutionKey, field: &str) -> RepositoryError {
    RepositoryError::serialization(format!(
        "execution {}/{} at {} is missing {field}",
        key.organization_id(), key.job_id(), key.scheduled()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use runledger_core::{JobId, OrganizationId};

    fn test_key() -> ExecutionKey {
        ExecutionKey::new(JobId::new(), OrganizationId::new(), runledger_core::execution::now())
    }

    #[test]
    fn start_creates_started_row() {
        let key = test_key();
        let now = runledger_core::execution::now();
        let row = ExecutionRecord::<u32>::apply(None, key, Transition::Start, now);

        assert_eq!(row.state, ExecutionState::Started);
        assert_eq!(row.started_at, now);
        assert_eq!(row.completed_at, None);
        assert_eq!(row.result, None);
        assert_eq!(row.error, None);
    }

    #[test]
    fn failure_after_success_replaces_payload_and_keeps_start() {
        let key = test_key();
        let t0 = runledger_core::execution::now();
        let t1 = t0 + Duration::seconds(1);
        let t2 = t0 + Duration::seconds(2);

        let started = ExecutionRecord::apply(None, key, Transition::Start, t0);
        let succeeded = ExecutionRecord::apply(Some(&started), key, Transition::Succeed(42u32), t1);
        let failed = ExecutionRecord::apply(Some(&succeeded), key, Transition::Fail("boom".into()), t2);

        assert_eq!(failed.state, ExecutionState::Failure);
        assert_eq!(failed.started_at, t0);
        assert_eq!(failed.completed_at, Some(t2));
        assert_eq!(failed.result, None);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn restart_clears_completion_data() {
        let key = test_key();
        let t0 = runledger_core::execution::now();
        let t1 = t0 + Duration::seconds(5);

        let succeeded = ExecutionRecord::apply(None, key, Transition::Succeed(1u32), t0);
        let restarted = ExecutionRecord::apply(Some(&succeeded), key, Transition::Start, t1);

        assert_eq!(restarted.state, ExecutionState::Started);
        assert_eq!(restarted.started_at, t1);
        assert_eq!(restarted.completed_at, None);
        assert_eq!(restarted.result, None);
    }

    #[test]
    fn completion_without_start_uses_completion_time() {
        let key = test_key();
        let now = runledger_core::execution::now();
        let row = ExecutionRecord::apply(None, key, Transition::Succeed(3u32), now);
        assert_eq!(row.started_at, now);
        assert_eq!(row.completed_at, Some(now));
    }

    #[test]
    fn corrupt_success_row_is_a_serialization_error() {
        let key = test_key();
        let now = runledger_core::execution::now();
        let mut row = ExecutionRecord::apply(None, key, Transition::Succeed(3u32), now);
        row.result = None;

        let err = row.into_execution(Ok).unwrap_err();
        assert!(matches!(err, RepositoryError::Serialization(_)));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Succeed(u32),
        Fail(String),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            any::<u32>().prop_map(Step::Succeed),
            "[a-z]{1,12}".prop_map(Step::Fail),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: completions never move `started_at`, and exactly one of
        /// result/error is present, always from the latest completion.
        #[test]
        fn completions_preserve_start_and_hold_one_payload(
            steps in prop::collection::vec(step(), 1..20)
        ) {
            let key = test_key();
            let t0 = runledger_core::execution::now();
            let mut row = ExecutionRecord::apply(None, key, Transition::Start, t0);

            for (i, s) in steps.into_iter().enumerate() {
                let now = t0 + Duration::milliseconds(i as i64 + 1);
                row = match s.clone() {
                    Step::Succeed(v) => ExecutionRecord::apply(Some(&row), key, Transition::Succeed(v), now),
                    Step::Fail(e) => ExecutionRecord::apply(Some(&row), key, Transition::Fail(e), now),
                };

                prop_assert_eq!(row.started_at, t0);
                prop_assert_eq!(row.completed_at, Some(now));
                prop_assert!(row.result.is_some() != row.error.is_some());
                match s {
                    Step::Succeed(v) => prop_assert_eq!(row.result, Some(v)),
                    Step::Fail(e) => prop_assert_eq!(row.error.as_deref(), Some(e.as_str())),
                }
            }
        }
    }
}
