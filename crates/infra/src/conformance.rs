//! Behavioral conformance suite for [`JobExecutionRepository`] backends.
//!
//! Every backend must pass the same cases. A backend supplies a
//! [`ConformanceHarness`] and either calls [`run_all`] or expands
//! [`execution_repository_conformance!`](crate::execution_repository_conformance)
//! to get one `#[test]` per case.
//!
//! Each case uses fresh job and organization ids, so harnesses backed by a
//! shared database do not need to clean up between cases.

use std::collections::HashSet;
use std::fmt::Debug;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use runledger_core::{
    render_error, Failure, JobExecution, JobExecutionVisitor, JobId, OrganizationId, Started,
    Success,
};

use crate::repository::JobExecutionRepository;

/// Backend-specific hooks used by the conformance cases.
pub trait ConformanceHarness {
    type Result: Clone + PartialEq + Debug;
    type Repository: JobExecutionRepository<Self::Result>;

    /// A result value distinct from every other value returned so far.
    fn new_result(&mut self) -> Self::Result;

    /// A repository in the closed state.
    fn repository(&mut self) -> Self::Repository;

    /// Make `job_id` a known job of `organization_id` in the store behind `repository`.
    fn ensure_job_exists(
        &mut self,
        repository: &Self::Repository,
        job_id: JobId,
        organization_id: OrganizationId,
    );
}

/// Result payload shaped like an alert evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleResult {
    pub evaluation_id: Uuid,
    pub firing: bool,
    pub series: Vec<String>,
}

impl SampleResult {
    pub fn random() -> Self {
        let evaluation_id = Uuid::now_v7();
        Self {
            evaluation_id,
            firing: evaluation_id.as_bytes()[15] % 2 == 0,
            series: vec![format!("cpu/{evaluation_id}"), "memory".to_string()],
        }
    }
}

struct ExpectStarted;

impl<T> JobExecutionVisitor<T> for ExpectStarted {
    type Output = Started;

    fn visit_started(&mut self, state: &Started) -> Started {
        state.clone()
    }

    fn visit_success(&mut self, state: &Success<T>) -> Started {
        panic!("expected started execution, got success scheduled at {}", state.scheduled())
    }

    fn visit_failure(&mut self, state: &Failure) -> Started {
        panic!("expected started execution, got failure: {}", state.error)
    }
}

struct ExpectSuccess;

impl<T: Clone> JobExecutionVisitor<T> for ExpectSuccess {
    type Output = Success<T>;

    fn visit_started(&mut self, state: &Started) -> Success<T> {
        panic!("expected success, got started execution scheduled at {}", state.scheduled())
    }

    fn visit_success(&mut self, state: &Success<T>) -> Success<T> {
        state.clone()
    }

    fn visit_failure(&mut self, state: &Failure) -> Success<T> {
        panic!("expected success, got failure: {}", state.error)
    }
}

struct ExpectFailure;

impl<T> JobExecutionVisitor<T> for ExpectFailure {
    type Output = Failure;

    fn visit_started(&mut self, state: &Started) -> Failure {
        panic!("expected failure, got started execution scheduled at {}", state.scheduled())
    }

    fn visit_success(&mut self, state: &Success<T>) -> Failure {
        panic!("expected failure, got success scheduled at {}", state.scheduled())
    }

    fn visit_failure(&mut self, state: &Failure) -> Failure {
        state.clone()
    }
}

fn opened<H: ConformanceHarness>(harness: &mut H) -> H::Repository {
    let repository = harness.repository();
    repository.open().expect("open repository");
    repository
}

fn registered_job<H: ConformanceHarness>(
    harness: &mut H,
    repository: &H::Repository,
    organization_id: OrganizationId,
) -> JobId {
    let job_id = JobId::new();
    harness.ensure_job_exists(repository, job_id, organization_id);
    job_id
}

fn last_scheduled<T, R>(repository: &R, job_id: JobId, organization_id: OrganizationId) -> JobExecution<T>
where
    R: JobExecutionRepository<T>,
{
    repository
        .get_last_scheduled(job_id, organization_id)
        .expect("get_last_scheduled")
        .expect("an execution")
}

fn last_completed<T, R>(repository: &R, job_id: JobId, organization_id: OrganizationId) -> JobExecution<T>
where
    R: JobExecutionRepository<T>,
{
    repository
        .get_last_completed(job_id, organization_id)
        .expect("get_last_completed")
        .expect("a completed execution")
}

fn start_of_today() -> DateTime<Utc> {
    Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn evaluation_error() -> anyhow::Error {
    anyhow::anyhow!("query returned malformed series").context("alert evaluation failed")
}

/// A started occurrence is the last scheduled and is not completed.
pub fn job_started<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let scheduled = runledger_core::execution::now();

    repository.job_started(job_id, org, scheduled).expect("job_started");

    let started = ExpectStarted.visit(&last_scheduled::<H::Result, _>(&repository, job_id, org));
    assert_eq!(started.key.job_id(), job_id);
    assert_eq!(started.key.organization_id(), org);
    assert_eq!(started.scheduled(), scheduled);
    assert!(repository
        .get_last_completed(job_id, org)
        .expect("get_last_completed")
        .is_none());
    assert!(repository
        .get_last_success(job_id, org)
        .expect("get_last_success")
        .is_none());

    repository.close().expect("close repository");
}

/// A succeeded occurrence is returned with its result and both timestamps.
pub fn job_succeeded<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let scheduled = runledger_core::execution::now();
    let result = harness.new_result();

    repository.job_started(job_id, org, scheduled).expect("job_started");
    let started_at = last_scheduled::<H::Result, _>(&repository, job_id, org).started_at();

    let returned = repository
        .job_succeeded(job_id, org, scheduled, result.clone())
        .expect("job_succeeded");
    assert_eq!(returned.result, result);

    let success = repository
        .get_last_success(job_id, org)
        .expect("get_last_success")
        .expect("a success");
    assert_eq!(success.job_id(), job_id);
    assert_eq!(success.scheduled(), scheduled);
    assert_eq!(success.result, result);
    assert_eq!(success.started_at, started_at);
    assert!(success.completed_at >= started_at);
    assert_eq!(success, returned);

    let completed = ExpectSuccess.visit(&last_completed::<H::Result, _>(&repository, job_id, org));
    assert_eq!(completed, success);

    repository.close().expect("close repository");
}

/// Occurrences scheduled long ago are stored and returned like any other.
pub fn job_scheduled_in_the_past<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let scheduled = DateTime::parse_from_rfc3339("2019-01-01T00:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc);
    let result = harness.new_result();

    repository.job_started(job_id, org, scheduled).expect("job_started");
    repository
        .job_succeeded(job_id, org, scheduled, result.clone())
        .expect("job_succeeded");

    let success = repository
        .get_last_success(job_id, org)
        .expect("get_last_success")
        .expect("a success");
    assert_eq!(success.scheduled(), scheduled);
    assert_eq!(success.result, result);

    repository.close().expect("close repository");
}

/// A failure stores the fully rendered error.
pub fn job_failed<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let scheduled = runledger_core::execution::now();
    let error = evaluation_error();

    repository.job_started(job_id, org, scheduled).expect("job_started");
    repository
        .job_failed(job_id, org, scheduled, &error)
        .expect("job_failed");

    let failure = ExpectFailure.visit(&last_completed::<H::Result, _>(&repository, job_id, org));
    assert_eq!(failure.scheduled(), scheduled);
    assert_eq!(failure.error, render_error(&error));
    assert!(failure.error.contains("alert evaluation failed"));
    assert!(failure.error.contains("query returned malformed series"));
    assert!(repository
        .get_last_success(job_id, org)
        .expect("get_last_success")
        .is_none());

    repository.close().expect("close repository");
}

/// Four hourly runs: two failures then two successes.
pub fn job_multiple_runs<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let base = runledger_core::execution::now() - Duration::hours(4);
    let runs: Vec<_> = (0..4).map(|i| base + Duration::hours(i)).collect();

    for (i, &scheduled) in runs.iter().enumerate() {
        repository.job_started(job_id, org, scheduled).expect("job_started");
        if i < 2 {
            repository
                .job_failed(job_id, org, scheduled, &evaluation_error())
                .expect("job_failed");
        } else {
            repository
                .job_succeeded(job_id, org, scheduled, harness.new_result())
                .expect("job_succeeded");
        }
    }

    let completed = last_completed::<H::Result, _>(&repository, job_id, org);
    assert_eq!(completed.scheduled(), runs[3]);
    ExpectSuccess.visit(&completed);

    repository.close().expect("close repository");
}

/// Ordering follows `scheduled`, not the order calls were made in.
pub fn results_ordered_by_scheduled<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let base = runledger_core::execution::now() - Duration::days(1);
    let runs: Vec<_> = (0..4).map(|i| base + Duration::minutes(i * 15)).collect();

    let mut latest_result = None;
    for &i in &[2usize, 0, 3, 1] {
        let result = harness.new_result();
        repository.job_started(job_id, org, runs[i]).expect("job_started");
        repository
            .job_succeeded(job_id, org, runs[i], result.clone())
            .expect("job_succeeded");
        if i == 3 {
            latest_result = Some(result);
        }
    }

    let completed = last_completed::<H::Result, _>(&repository, job_id, org);
    assert_eq!(completed.scheduled(), runs[3]);
    let success = repository
        .get_last_success(job_id, org)
        .expect("get_last_success")
        .expect("a success");
    assert_eq!(Some(success.result), latest_result);
    assert_eq!(last_scheduled::<H::Result, _>(&repository, job_id, org).scheduled(), runs[3]);

    repository.close().expect("close repository");
}

/// Several jobs of one organization keep their own results.
pub fn distinct_results_per_job<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let scheduled = runledger_core::execution::now();

    let mut expected = Vec::new();
    for _ in 0..5 {
        let job_id = registered_job(harness, &repository, org);
        let result = harness.new_result();
        repository.job_started(job_id, org, scheduled).expect("job_started");
        repository
            .job_succeeded(job_id, org, scheduled, result.clone())
            .expect("job_succeeded");
        expected.push((job_id, result));
    }

    for (job_id, result) in expected {
        let success = repository
            .get_last_success(job_id, org)
            .expect("get_last_success")
            .expect("a success");
        assert_eq!(success.job_id(), job_id);
        assert_eq!(success.result, result);
    }

    repository.close().expect("close repository");
}

/// Success then failure then success on one key: one payload at a time and
/// `started_at` never moves.
pub fn state_change<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let scheduled = runledger_core::execution::now();
    let first = harness.new_result();
    let second = harness.new_result();
    let error = evaluation_error();

    repository.job_started(job_id, org, scheduled).expect("job_started");
    let started_at = last_scheduled::<H::Result, _>(&repository, job_id, org).started_at();

    repository
        .job_succeeded(job_id, org, scheduled, first.clone())
        .expect("job_succeeded");
    let success = ExpectSuccess.visit(&last_completed::<H::Result, _>(&repository, job_id, org));
    assert_eq!(success.result, first);
    assert_eq!(success.started_at, started_at);

    repository
        .job_failed(job_id, org, scheduled, &error)
        .expect("job_failed");
    let failure = ExpectFailure.visit(&last_completed::<H::Result, _>(&repository, job_id, org));
    assert_eq!(failure.error, render_error(&error));
    assert_eq!(failure.started_at, started_at);
    assert!(failure.completed_at >= success.completed_at);
    assert!(repository
        .get_last_success(job_id, org)
        .expect("get_last_success")
        .is_none());

    repository
        .job_succeeded(job_id, org, scheduled, second.clone())
        .expect("job_succeeded");
    let success = ExpectSuccess.visit(&last_completed::<H::Result, _>(&repository, job_id, org));
    assert_eq!(success.result, second);
    assert_eq!(success.started_at, started_at);

    repository.close().expect("close repository");
}

/// Completions applied to one key in a mixed order, with and without a
/// prior start: each leaves only its own payload and `started_at` stays put.
pub fn alternating_completions_keep_started_at<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let steps = [false, true, false, false, true, true, false];

    for with_start in [true, false] {
        let job_id = registered_job(harness, &repository, org);
        let scheduled = runledger_core::execution::now() - Duration::minutes(30);
        if with_start {
            repository.job_started(job_id, org, scheduled).expect("job_started");
        }

        let mut started_at = None;
        for (n, &succeed) in steps.iter().enumerate() {
            let expected_result = harness.new_result();
            let error = anyhow::anyhow!("evaluation {n} failed");
            if succeed {
                repository
                    .job_succeeded(job_id, org, scheduled, expected_result.clone())
                    .expect("job_succeeded");
            } else {
                repository
                    .job_failed(job_id, org, scheduled, &error)
                    .expect("job_failed");
            }

            let last = last_completed::<H::Result, _>(&repository, job_id, org);
            let first_start = *started_at.get_or_insert(last.started_at());
            assert_eq!(last.started_at(), first_start, "started_at moved at step {n}");
            assert_eq!(
                last_scheduled::<H::Result, _>(&repository, job_id, org),
                last,
                "step {n}"
            );

            let success = repository
                .get_last_success(job_id, org)
                .expect("get_last_success");
            if succeed {
                assert_eq!(ExpectSuccess.visit(&last).result, expected_result);
                assert_eq!(success.map(|s| s.result), Some(expected_result));
            } else {
                assert_eq!(ExpectFailure.visit(&last).error, render_error(&error));
                assert!(success.is_none(), "a success survived the failure at step {n}");
            }
        }
    }

    repository.close().expect("close repository");
}

/// A completion without a prior start creates the row.
pub fn success_without_start<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let scheduled = runledger_core::execution::now();
    let result = harness.new_result();

    repository
        .job_succeeded(job_id, org, scheduled, result.clone())
        .expect("job_succeeded");

    let success = repository
        .get_last_success(job_id, org)
        .expect("get_last_success")
        .expect("a success");
    assert_eq!(success.result, result);
    assert_eq!(success.started_at, success.completed_at);

    repository.close().expect("close repository");
}

/// Starting an existing occurrence again resets it.
pub fn restart_resets_started_at<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let scheduled = runledger_core::execution::now();

    repository.job_started(job_id, org, scheduled).expect("job_started");
    let first_start = last_scheduled::<H::Result, _>(&repository, job_id, org).started_at();
    repository
        .job_succeeded(job_id, org, scheduled, harness.new_result())
        .expect("job_succeeded");

    std::thread::sleep(std::time::Duration::from_millis(5));
    repository.job_started(job_id, org, scheduled).expect("job_started");

    let restarted = ExpectStarted.visit(&last_scheduled::<H::Result, _>(&repository, job_id, org));
    assert_eq!(restarted.scheduled(), scheduled);
    assert!(restarted.started_at > first_start);
    assert!(repository
        .get_last_completed(job_id, org)
        .expect("get_last_completed")
        .is_none());

    repository.close().expect("close repository");
}

/// A newer occurrence that is still running does not hide the last
/// completion, and a newer failure does not hide the last success.
pub fn newer_incomplete_runs_are_skipped<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let t0 = runledger_core::execution::now() - Duration::hours(3);
    let t1 = t0 + Duration::hours(1);
    let t2 = t0 + Duration::hours(2);
    let result = harness.new_result();

    repository.job_started(job_id, org, t0).expect("job_started");
    repository
        .job_succeeded(job_id, org, t0, result.clone())
        .expect("job_succeeded");
    repository.job_started(job_id, org, t1).expect("job_started");
    repository
        .job_failed(job_id, org, t1, &evaluation_error())
        .expect("job_failed");
    repository.job_started(job_id, org, t2).expect("job_started");

    assert_eq!(last_scheduled::<H::Result, _>(&repository, job_id, org).scheduled(), t2);
    let completed = ExpectFailure.visit(&last_completed::<H::Result, _>(&repository, job_id, org));
    assert_eq!(completed.scheduled(), t1);
    let success = repository
        .get_last_success(job_id, org)
        .expect("get_last_success")
        .expect("a success");
    assert_eq!(success.scheduled(), t0);
    assert_eq!(success.result, result);

    repository.close().expect("close repository");
}

/// Transitions never leak across occurrences or organizations.
pub fn isolation_across_keys<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org_x = OrganizationId::new();
    let org_y = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org_x);
    harness.ensure_job_exists(&repository, job_id, org_y);

    let t1 = runledger_core::execution::now() - Duration::hours(1);
    let t2 = t1 + Duration::minutes(30);
    let result_x = harness.new_result();
    let result_y = harness.new_result();

    repository.job_started(job_id, org_x, t1).expect("job_started");
    repository
        .job_succeeded(job_id, org_x, t1, result_x.clone())
        .expect("job_succeeded");
    repository.job_started(job_id, org_y, t1).expect("job_started");
    repository
        .job_succeeded(job_id, org_y, t1, result_y.clone())
        .expect("job_succeeded");

    repository.job_started(job_id, org_x, t2).expect("job_started");
    repository
        .job_failed(job_id, org_x, t2, &evaluation_error())
        .expect("job_failed");
    repository.job_started(job_id, org_y, t2).expect("job_started");

    let success_x = repository
        .get_last_success(job_id, org_x)
        .expect("get_last_success")
        .expect("a success");
    assert_eq!(success_x.scheduled(), t1);
    assert_eq!(success_x.result, result_x);

    let success_y = repository
        .get_last_success(job_id, org_y)
        .expect("get_last_success")
        .expect("a success");
    assert_eq!(success_y.result, result_y);
    ExpectStarted.visit(&last_scheduled::<H::Result, _>(&repository, job_id, org_y));
    ExpectFailure.visit(&last_scheduled::<H::Result, _>(&repository, job_id, org_x));

    let stranger = OrganizationId::new();
    assert!(repository
        .get_last_scheduled(job_id, stranger)
        .expect("get_last_scheduled")
        .is_none());

    repository.close().expect("close repository");
}

/// Transitions for unknown jobs or the wrong organization are rejected.
pub fn unknown_job_is_not_found<H: ConformanceHarness>(harness: &mut H) {
    let repository = opened(harness);
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let scheduled = runledger_core::execution::now();

    let unknown = JobId::new();
    let err = repository
        .job_started(unknown, org, scheduled)
        .expect_err("unknown job must be rejected");
    assert!(err.is_not_found(), "unexpected error: {err}");

    let other_org = OrganizationId::new();
    let err = repository
        .job_succeeded(job_id, other_org, scheduled, harness.new_result())
        .expect_err("wrong organization must be rejected");
    assert!(err.is_not_found(), "unexpected error: {err}");

    let err = repository
        .job_failed(unknown, org, scheduled, &evaluation_error())
        .expect_err("unknown job must be rejected");
    assert!(err.is_not_found(), "unexpected error: {err}");

    assert!(repository
        .get_last_scheduled(unknown, org)
        .expect("get_last_scheduled")
        .is_none());

    repository.close().expect("close repository");
}

/// Operations outside the open state, double open and double close fail.
pub fn lifecycle_is_enforced<H: ConformanceHarness>(harness: &mut H) {
    let repository = harness.repository();
    let org = OrganizationId::new();
    let job_id = registered_job(harness, &repository, org);
    let scheduled = runledger_core::execution::now();

    let err = repository
        .get_last_scheduled(job_id, org)
        .expect_err("closed repository must reject queries");
    assert!(err.is_illegal_state(), "unexpected error: {err}");
    let err = repository
        .job_started(job_id, org, scheduled)
        .expect_err("closed repository must reject transitions");
    assert!(err.is_illegal_state(), "unexpected error: {err}");
    assert!(repository.close().expect_err("double close").is_illegal_state());

    repository.open().expect("open repository");
    assert!(repository.open().expect_err("double open").is_illegal_state());
    repository.job_started(job_id, org, scheduled).expect("job_started");
    repository.close().expect("close repository");

    let err = repository
        .get_last_success_batch(&HashSet::from([job_id]), org, scheduled.date_naive())
        .expect_err("closed repository must reject batch queries");
    assert!(err.is_illegal_state(), "unexpected error: {err}");
}

/// Five jobs with three daily successes each, plus distractors.
pub fn last_success_batch<H: ConformanceHarness>(harness: &mut H) {
    const RUNS_PER_JOB: i64 = 3;

    let repository = opened(harness);
    let org = OrganizationId::new();
    let today = start_of_today();

    let job_ids: Vec<_> = (0..5)
        .map(|_| registered_job(harness, &repository, org))
        .collect();
    for &job_id in &job_ids {
        for i in 0..RUNS_PER_JOB {
            let scheduled = today - Duration::days(RUNS_PER_JOB - 1 - i);
            repository.job_started(job_id, org, scheduled).expect("job_started");
            repository
                .job_succeeded(job_id, org, scheduled, harness.new_result())
                .expect("job_succeeded");
        }
    }

    // A newer failure must not displace the last success.
    let tomorrow = today + Duration::days(1);
    repository.job_started(job_ids[0], org, tomorrow).expect("job_started");
    repository
        .job_failed(job_ids[0], org, tomorrow, &evaluation_error())
        .expect("job_failed");

    // Succeeds but is never requested.
    let extra_job = registered_job(harness, &repository, org);
    repository.job_started(extra_job, org, today).expect("job_started");
    repository
        .job_succeeded(extra_job, org, today, harness.new_result())
        .expect("job_succeeded");

    // Requested, but only ever failed.
    let failed_job = registered_job(harness, &repository, org);
    repository.job_started(failed_job, org, today).expect("job_started");
    repository
        .job_failed(failed_job, org, today, &evaluation_error())
        .expect("job_failed");

    let nonexistent = JobId::new();
    let mut requested: HashSet<JobId> = job_ids.iter().copied().collect();
    requested.insert(failed_job);
    requested.insert(nonexistent);

    let first_day = (today - Duration::days(RUNS_PER_JOB - 1)).date_naive();
    let successes = repository
        .get_last_success_batch(&requested, org, first_day)
        .expect("get_last_success_batch");

    assert_eq!(successes.len(), job_ids.len());
    for job_id in &job_ids {
        let success = successes.get(job_id).expect("a success for every populated job");
        assert_eq!(success.job_id(), *job_id);
        assert_eq!(success.scheduled(), today);
        let single = repository
            .get_last_success(*job_id, org)
            .expect("get_last_success")
            .expect("a success");
        assert_eq!(&single, success);
    }
    assert!(!successes.contains_key(&extra_job));
    assert!(!successes.contains_key(&failed_job));
    assert!(!successes.contains_key(&nonexistent));

    let after_all = tomorrow.date_naive();
    let successes = repository
        .get_last_success_batch(&requested, org, after_all)
        .expect("get_last_success_batch");
    assert!(successes.is_empty());

    let other_org = repository
        .get_last_success_batch(&requested, OrganizationId::new(), first_day)
        .expect("get_last_success_batch");
    assert!(other_org.is_empty());

    repository.close().expect("close repository");
}

/// Runs every case against `harness`.
pub fn run_all<H: ConformanceHarness>(harness: &mut H) {
    job_started(harness);
    job_succeeded(harness);
    job_scheduled_in_the_past(harness);
    job_failed(harness);
    job_multiple_runs(harness);
    results_ordered_by_scheduled(harness);
    distinct_results_per_job(harness);
    state_change(harness);
    alternating_completions_keep_started_at(harness);
    success_without_start(harness);
    restart_resets_started_at(harness);
    newer_incomplete_runs_are_skipped(harness);
    isolation_across_keys(harness);
    unknown_job_is_not_found(harness);
    lifecycle_is_enforced(harness);
    last_success_batch(harness);
}

/// Expands to one `#[test]` per conformance case, each with a fresh harness
/// built from `$harness`.
#[macro_export]
macro_rules! execution_repository_conformance {
    (@cases $harness:expr; $($case:ident),+ $(,)?) => {
        $(
            #[test]
            fn $case() {
                let mut harness = $harness;
                $crate::conformance::$case(&mut harness);
            }
        )+
    };
    ($harness:expr) => {
        $crate::execution_repository_conformance!(@cases $harness;
            job_started,
            job_succeeded,
            job_scheduled_in_the_past,
            job_failed,
            job_multiple_runs,
            results_ordered_by_scheduled,
            distinct_results_per_job,
            state_change,
            alternating_completions_keep_started_at,
            success_without_start,
            restart_resets_started_at,
            newer_incomplete_runs_are_skipped,
            isolation_across_keys,
            unknown_job_is_not_found,
            lifecycle_is_enforced,
            last_success_batch,
        );
    };
}
