//! Postgres-backed job execution repository.
//!
//! Executions live in `job_executions`, keyed by
//! `(organization_id, job_id, scheduled)`. Jobs a tenant may record executions
//! for are listed in `scheduled_jobs`; the execution table references it.
//!
//! ## Atomicity
//!
//! Every transition is one `INSERT ... SELECT ... WHERE EXISTS ... ON CONFLICT
//! DO UPDATE` statement. The `EXISTS` guard doubles as the job existence check:
//! when it filters the row out, nothing is written and the call fails with
//! `RepositoryError::NotFound`. Racing transitions on the same key resolve as
//! last-committed-wins; a row always holds exactly one of them.
//!
//! ## Error Mapping
//!
//! | Failure | RepositoryError |
//! |---------|-----------------|
//! | guard filtered the upsert (unknown job) | `NotFound` |
//! | any `sqlx::Error` | `Storage` (the `sqlx::Error` is the source) |
//! | undecodable row or result payload | `Serialization` |
//!
//! ## Runtime
//!
//! `JobExecutionRepository` is synchronous while sqlx is async. The repository
//! holds a `tokio::runtime::Handle` and blocks on it. Called from inside a
//! multi-threaded runtime it uses `block_in_place`; calling it from a
//! current-thread runtime is rejected with `IllegalState`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, instrument, Span};
use uuid::Uuid;

use runledger_core::{
    render_error, ExecutionKey, ExecutionState, JobExecution, JobId, OrganizationId, Success,
};

use super::lifecycle::Lifecycle;
use super::record::ExecutionRecord;
use super::r#trait::{JobExecutionRepository, RepositoryError, RepositoryResult};
use crate::codec::{JsonCodec, ResultCodec};
use crate::registry::JobRegistry;

/// DDL for the tables this backend needs, applied in order by [`migrate`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_jobs (
        organization_id UUID NOT NULL,
        job_id          UUID NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (organization_id, job_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_executions (
        organization_id UUID NOT NULL,
        job_id          UUID NOT NULL,
        scheduled       TIMESTAMPTZ NOT NULL,
        state           TEXT NOT NULL CHECK (state IN ('started', 'success', 'failure')),
        started_at      TIMESTAMPTZ NOT NULL,
        completed_at    TIMESTAMPTZ NULL,
        result          TEXT NULL,
        error           TEXT NULL,
        updated_at      TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (organization_id, job_id, scheduled),
        FOREIGN KEY (organization_id, job_id)
            REFERENCES scheduled_jobs (organization_id, job_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS job_executions_success_idx
        ON job_executions (organization_id, job_id, scheduled DESC)
        WHERE state = 'success'
    "#,
];

/// Create the backend's tables and indexes if they are missing.
pub async fn migrate(pool: &PgPool) -> RepositoryResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| storage_error("migrate", e))?;
    }
    Ok(())
}

const SELECT_EXECUTION: &str = r#"
    SELECT
        organization_id,
        job_id,
        scheduled,
        state,
        started_at,
        completed_at,
        result,
        error,
        updated_at
    FROM job_executions
"#;

/// Postgres-backed job execution repository.
///
/// Results are stored as the text produced by the codec `C` (JSON by default).
/// `Send + Sync`; the pool handles connection sharing.
pub struct PostgresExecutionRepository<T, C = JsonCodec<T>> {
    pool: Arc<PgPool>,
    runtime: Handle,
    codec: C,
    lifecycle: Lifecycle,
    _result: PhantomData<fn() -> T>,
}

impl<T> PostgresExecutionRepository<T, JsonCodec<T>> {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self::with_codec(pool, runtime, JsonCodec::new())
    }
}

impl<T, C> PostgresExecutionRepository<T, C> {
    pub fn with_codec(pool: PgPool, runtime: Handle, codec: C) -> Self {
        Self::from_shared(Arc::new(pool), runtime, codec)
    }

    /// Build on a pool shared with other components (e.g. a [`PostgresJobRegistry`]).
    pub fn from_shared(pool: Arc<PgPool>, runtime: Handle, codec: C) -> Self {
        Self {
            pool,
            runtime,
            codec,
            lifecycle: Lifecycle::new("PostgresExecutionRepository"),
            _result: PhantomData,
        }
    }

    pub fn pool(&self) -> &Arc<PgPool> {
        &self.pool
    }
}

impl<T, C> PostgresExecutionRepository<T, C>
where
    C: ResultCodec<T>,
{
    #[instrument(
        skip(self),
        fields(job_id = %job_id, organization_id = %organization_id, scheduled = %scheduled),
        err
    )]
    pub async fn record_started(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let now = runledger_core::execution::now();
        debug!(state = %ExecutionState::Started, "upserting execution");

        let result = sqlx::query(
            r#"
            INSERT INTO job_executions (
                organization_id, job_id, scheduled, state, started_at, updated_at
            )
            SELECT $1, $2, $3, 'started', $4, $4
            WHERE EXISTS (
                SELECT 1 FROM scheduled_jobs WHERE organization_id = $1 AND job_id = $2
            )
            ON CONFLICT (organization_id, job_id, scheduled) DO UPDATE SET
                state = EXCLUDED.state,
                started_at = EXCLUDED.started_at,
                completed_at = NULL,
                result = NULL,
                error = NULL,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(scheduled)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_error("job_started", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found(job_id, organization_id));
        }
        Ok(())
    }

    #[instrument(
        skip(self, result),
        fields(job_id = %job_id, organization_id = %organization_id, scheduled = %scheduled),
        err
    )]
    pub async fn record_succeeded(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        result: T,
    ) -> RepositoryResult<Success<T>> {
        let encoded = self.codec.encode(&result)?;
        let now = runledger_core::execution::now();
        debug!(state = %ExecutionState::Success, "upserting execution");

        let row = sqlx::query(
            r#"
            INSERT INTO job_executions (
                organization_id, job_id, scheduled, state, started_at, completed_at, result, updated_at
            )
            SELECT $1, $2, $3, 'success', $4, $4, $5, $4
            WHERE EXISTS (
                SELECT 1 FROM scheduled_jobs WHERE organization_id = $1 AND job_id = $2
            )
            ON CONFLICT (organization_id, job_id, scheduled) DO UPDATE SET
                state = EXCLUDED.state,
                completed_at = EXCLUDED.completed_at,
                result = EXCLUDED.result,
                error = NULL,
                updated_at = EXCLUDED.updated_at
            RETURNING started_at, completed_at
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(scheduled)
        .bind(now)
        .bind(&encoded)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage_error("job_succeeded", e))?
        .ok_or_else(|| RepositoryError::not_found(job_id, organization_id))?;

        let started_at: DateTime<Utc> = row
            .try_get("started_at")
            .map_err(|e| storage_error("job_succeeded", e))?;
        let completed_at: DateTime<Utc> = row
            .try_get("completed_at")
            .map_err(|e| storage_error("job_succeeded", e))?;

        Ok(Success {
            key: ExecutionKey::new(job_id, organization_id, scheduled),
            started_at,
            completed_at,
            result,
        })
    }

    #[instrument(
        skip(self, error),
        fields(job_id = %job_id, organization_id = %organization_id, scheduled = %scheduled),
        err
    )]
    pub async fn record_failed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        error: String,
    ) -> RepositoryResult<()> {
        let now = runledger_core::execution::now();
        debug!(state = %ExecutionState::Failure, "upserting execution");

        let result = sqlx::query(
            r#"
            INSERT INTO job_executions (
                organization_id, job_id, scheduled, state, started_at, completed_at, error, updated_at
            )
            SELECT $1, $2, $3, 'failure', $4, $4, $5, $4
            WHERE EXISTS (
                SELECT 1 FROM scheduled_jobs WHERE organization_id = $1 AND job_id = $2
            )
            ON CONFLICT (organization_id, job_id, scheduled) DO UPDATE SET
                state = EXCLUDED.state,
                completed_at = EXCLUDED.completed_at,
                result = NULL,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(scheduled)
        .bind(now)
        .bind(&error)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_error("job_failed", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found(job_id, organization_id));
        }
        Ok(())
    }

    /// Latest execution of the job, optionally restricted to some states.
    #[instrument(
        skip(self),
        fields(job_id = %job_id, organization_id = %organization_id),
        err
    )]
    pub async fn fetch_last(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        states: &[ExecutionState],
    ) -> RepositoryResult<Option<JobExecution<T>>> {
        let states: Vec<&str> = states.iter().map(ExecutionState::as_str).collect();
        let sql = format!(
            "{SELECT_EXECUTION}
            WHERE organization_id = $1 AND job_id = $2 AND state = ANY($3)
            ORDER BY scheduled DESC
            LIMIT 1"
        );

        let row = sqlx::query(&sql)
            .bind(organization_id.as_uuid())
            .bind(job_id.as_uuid())
            .bind(&states)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage_error("fetch_last", e))?;

        row.map(|row| self.decode_row(&row)?.into_execution(|raw| self.decode_result(&raw)))
            .transpose()
    }

    /// Most recent success per job on or after `cutoff`, in one statement.
    #[instrument(
        skip(self, job_ids),
        fields(
            organization_id = %organization_id,
            requested = job_ids.len(),
            cutoff = %cutoff,
            found = tracing::field::Empty
        ),
        err
    )]
    pub async fn fetch_last_success_batch(
        &self,
        job_ids: &HashSet<JobId>,
        organization_id: OrganizationId,
        cutoff: NaiveDate,
    ) -> RepositoryResult<HashMap<JobId, Success<T>>> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let ids: Vec<Uuid> = job_ids.iter().map(|id| *id.as_uuid()).collect();
        let cutoff_instant = cutoff.and_time(NaiveTime::MIN).and_utc();

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (e.job_id)
                e.organization_id,
                e.job_id,
                e.scheduled,
                e.state,
                e.started_at,
                e.completed_at,
                e.result,
                e.error,
                e.updated_at
            FROM job_executions e
            JOIN scheduled_jobs j
                ON j.organization_id = e.organization_id AND j.job_id = e.job_id
            WHERE e.organization_id = $1
              AND e.job_id = ANY($2)
              AND e.state = 'success'
              AND e.scheduled >= $3
            ORDER BY e.job_id, e.scheduled DESC
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(&ids)
        .bind(cutoff_instant)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage_error("get_last_success_batch", e))?;

        let mut successes = HashMap::with_capacity(rows.len());
        for row in rows {
            let success = self
                .decode_row(&row)?
                .into_success(|raw| self.decode_result(&raw))?;
            successes.insert(success.job_id(), success);
        }

        Span::current().record("found", successes.len());
        Ok(successes)
    }

    fn decode_row(&self, row: &sqlx::postgres::PgRow) -> RepositoryResult<ExecutionRecord<String>> {
        ExecutionRow::from_row(row)
            .map_err(|e| RepositoryError::serialization(format!("failed to read execution row: {e}")))?
            .try_into()
    }

    fn decode_result(&self, raw: &str) -> RepositoryResult<T> {
        Ok(self.codec.decode(raw)?)
    }

    fn block_on<F, O>(&self, operation: F) -> RepositoryResult<O>
    where
        F: Future<Output = RepositoryResult<O>>,
    {
        block_on(&self.runtime, operation)
    }
}

impl<T, C> JobExecutionRepository<T> for PostgresExecutionRepository<T, C>
where
    T: Send + Sync,
    C: ResultCodec<T>,
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
        self.lifecycle.ensure_open()?;
        let scheduled = runledger_core::execution::normalize(scheduled);
        self.block_on(self.record_started(job_id, organization_id, scheduled))
    }

    fn job_succeeded(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        result: T,
    ) -> RepositoryResult<Success<T>> {
        self.lifecycle.ensure_open()?;
        let scheduled = runledger_core::execution::normalize(scheduled);
        self.block_on(self.record_succeeded(job_id, organization_id, scheduled, result))
    }

    fn job_failed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        error: &anyhow::Error,
    ) -> RepositoryResult<()> {
        self.lifecycle.ensure_open()?;
        let scheduled = runledger_core::execution::normalize(scheduled);
        self.block_on(self.record_failed(job_id, organization_id, scheduled, render_error(error)))
    }

    fn get_last_scheduled(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>> {
        self.lifecycle.ensure_open()?;
        self.block_on(self.fetch_last(
            job_id,
            organization_id,
            &[ExecutionState::Started, ExecutionState::Success, ExecutionState::Failure],
        ))
    }

    fn get_last_completed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>> {
        self.lifecycle.ensure_open()?;
        self.block_on(self.fetch_last(
            job_id,
            organization_id,
            &[ExecutionState::Success, ExecutionState::Failure],
        ))
    }

    fn get_last_success(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<Success<T>>> {
        self.lifecycle.ensure_open()?;
        let last = self.block_on(self.fetch_last(job_id, organization_id, &[ExecutionState::Success]))?;
        Ok(last.and_then(JobExecution::into_success))
    }

    fn get_last_success_batch(
        &self,
        job_ids: &HashSet<JobId>,
        organization_id: OrganizationId,
        cutoff: NaiveDate,
    ) -> RepositoryResult<HashMap<JobId, Success<T>>> {
        self.lifecycle.ensure_open()?;
        self.block_on(self.fetch_last_success_batch(job_ids, organization_id, cutoff))
    }
}

/// Job registry backed by the `scheduled_jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresJobRegistry {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobRegistry {
    pub fn new(pool: Arc<PgPool>, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub async fn insert(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (organization_id, job_id)
            VALUES ($1, $2)
            ON CONFLICT (organization_id, job_id) DO NOTHING
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_error("register_job", e))?;
        Ok(())
    }

    pub async fn exists(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM scheduled_jobs WHERE organization_id = $1 AND job_id = $2
            ) AS present
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(job_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| storage_error("job_exists", e))?;

        row.try_get("present")
            .map_err(|e| storage_error("job_exists", e))
    }
}

impl JobRegistry for PostgresJobRegistry {
    fn register(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<()> {
        block_on(&self.runtime, self.insert(job_id, organization_id))
    }

    fn contains(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<bool> {
        block_on(&self.runtime, self.exists(job_id, organization_id))
    }
}

/// Run `operation` to completion on `runtime` from synchronous code.
pub(crate) fn block_on<F, O>(runtime: &Handle, operation: F) -> RepositoryResult<O>
where
    F: Future<Output = RepositoryResult<O>>,
{
    match Handle::try_current() {
        Err(_) => runtime.block_on(operation),
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| runtime.block_on(operation))
        }
        Ok(_) => Err(RepositoryError::illegal_state(
            "PostgresExecutionRepository cannot block inside a current-thread tokio runtime",
        )),
    }
}

fn storage_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    error!(operation, error = %err, "postgres operation failed");
    RepositoryError::storage(err)
}

struct ExecutionRow {
    organization_id: Uuid,
    job_id: Uuid,
    scheduled: DateTime<Utc>,
    state: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<String>,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ExecutionRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ExecutionRow {
            organization_id: row.try_get("organization_id")?,
            job_id: row.try_get("job_id")?,
            scheduled: row.try_get("scheduled")?,
            state: row.try_get("state")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ExecutionRow> for ExecutionRecord<String> {
    type Error = RepositoryError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<ExecutionState>()
            .map_err(|e| RepositoryError::serialization(e.to_string()))?;

        Ok(ExecutionRecord {
            key: ExecutionKey::new(
                JobId::from_uuid(row.job_id),
                OrganizationId::from_uuid(row.organization_id),
                row.scheduled,
            ),
            state,
            started_at: row.started_at,
            completed_at: row.completed_at,
            result: row.result,
            error: row.error,
            updated_at: row.updated_at,
        })
    }
}
