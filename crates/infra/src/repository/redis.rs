//! Redis-backed job execution repository (feature `redis`).
//!
//! ## Layout
//!
//! - **Job set**: `{prefix}:jobs:{organization_id}`, the registered job ids
//! - **Execution hash**: `{prefix}:executions:{organization_id}:{job_id}`,
//!   one field per occurrence (`scheduled` as RFC 3339 with microseconds),
//!   each value a JSON [`ExecutionRecord`] holding the codec-encoded result
//!
//! ## Consistency
//!
//! A transition runs inside `WATCH`/`MULTI`/`EXEC` on the execution hash and
//! the job set, so the existence check, the read of the current row and the
//! write are one atomic step. Rows carry `updated_at`; a transition whose
//! timestamp is older than the stored row is discarded (last-write-wins by
//! timestamp) and reported as `RepositoryError::Concurrency`, so a caller
//! never receives a row that was not persisted. Reads served by replicas may
//! lag the primary.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use tracing::{debug, error, instrument, warn};

use runledger_core::{render_error, ExecutionKey, JobExecution, JobId, OrganizationId, Success};

use super::lifecycle::Lifecycle;
use super::record::{ExecutionRecord, Transition};
use super::r#trait::{JobExecutionRepository, RepositoryError, RepositoryResult};
use crate::codec::{JsonCodec, ResultCodec};
use crate::registry::JobRegistry;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "runledger";

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn jobs(&self, organization_id: OrganizationId) -> String {
        format!("{}:jobs:{}", self.prefix, organization_id)
    }

    fn executions(&self, organization_id: OrganizationId, job_id: JobId) -> String {
        format!("{}:executions:{}:{}", self.prefix, organization_id, job_id)
    }

    fn field(scheduled: DateTime<Utc>) -> String {
        scheduled.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

enum Outcome {
    Missing,
    Written(ExecutionRecord<String>),
    Stale(RepositoryError),
    Corrupt(RepositoryError),
}

/// Redis-backed job execution repository.
pub struct RedisExecutionRepository<T, C = JsonCodec<T>> {
    client: Arc<redis::Client>,
    keys: Keys,
    codec: C,
    lifecycle: Lifecycle,
    _result: PhantomData<fn() -> T>,
}

impl<T> RedisExecutionRepository<T, JsonCodec<T>> {
    /// Create a repository for `redis_url` (e.g. `redis://localhost:6379`).
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> RepositoryResult<Self> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| storage_error("connect", e))?;
        Ok(Self::with_codec(Arc::new(client), prefix, JsonCodec::new()))
    }
}

impl<T, C> RedisExecutionRepository<T, C> {
    pub fn with_codec(client: Arc<redis::Client>, prefix: Option<String>, codec: C) -> Self {
        Self {
            client,
            keys: Keys {
                prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            },
            codec,
            lifecycle: Lifecycle::new("RedisExecutionRepository"),
            _result: PhantomData,
        }
    }

    /// Registry sharing this repository's client and key prefix.
    pub fn registry(&self) -> RedisJobRegistry {
        RedisJobRegistry {
            client: Arc::clone(&self.client),
            keys: self.keys.clone(),
        }
    }

    fn connection(&self) -> RepositoryResult<redis::Connection> {
        self.client
            .get_connection()
            .map_err(|e| storage_error("connect", e))
    }
}

impl<T, C> RedisExecutionRepository<T, C>
where
    C: ResultCodec<T>,
{
    #[instrument(
        skip(self, transition),
        fields(job_id = %job_id, organization_id = %organization_id, scheduled = %scheduled),
        err
    )]
    fn apply(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        transition: Transition<String>,
    ) -> RepositoryResult<ExecutionRecord<String>> {
        self.lifecycle.ensure_open()?;

        let key = ExecutionKey::new(job_id, organization_id, scheduled);
        let jobs_key = self.keys.jobs(organization_id);
        let executions_key = self.keys.executions(organization_id, job_id);
        let field = Keys::field(key.scheduled());
        let member = job_id.to_string();
        debug!(state = %transition.target_state(), "upserting execution");

        let mut con = self.connection()?;
        let mut outcome = Outcome::Missing;
        redis::transaction(&mut con, &[&executions_key, &jobs_key], |con, pipe| {
            let known: bool = redis::cmd("SISMEMBER")
                .arg(&jobs_key)
                .arg(&member)
                .query(con)?;
            if !known {
                outcome = Outcome::Missing;
                return Ok(Some(()));
            }

            let stored: Option<String> = redis::cmd("HGET")
                .arg(&executions_key)
                .arg(&field)
                .query(con)?;
            let current = match stored.as_deref().map(decode_record).transpose() {
                Ok(current) => current,
                Err(e) => {
                    outcome = Outcome::Corrupt(e);
                    return Ok(Some(()));
                }
            };

            let now = runledger_core::execution::now();
            let row = ExecutionRecord::apply(current.as_ref(), key, transition.clone(), now);
            if let Err(e) = ensure_not_superseded(current.as_ref(), &row) {
                outcome = Outcome::Stale(e);
                return Ok(Some(()));
            }

            let payload = match serde_json::to_string(&row) {
                Ok(payload) => payload,
                Err(e) => {
                    outcome = Outcome::Corrupt(RepositoryError::serialization(e.to_string()));
                    return Ok(Some(()));
                }
            };

            let committed: Option<()> = pipe
                .cmd("HSET")
                .arg(&executions_key)
                .arg(&field)
                .arg(payload)
                .ignore()
                .query(con)?;
            if committed.is_some() {
                outcome = Outcome::Written(row);
            }
            Ok(committed)
        })
        .map_err(|e| storage_error("upsert", e))?;

        match outcome {
            Outcome::Written(row) => Ok(row),
            Outcome::Stale(e) => {
                warn!(error = %e, "discarding transition");
                Err(e)
            }
            Outcome::Missing => Err(RepositoryError::not_found(job_id, organization_id)),
            Outcome::Corrupt(e) => {
                error!(error = %e, "failed to upsert execution");
                Err(e)
            }
        }
    }

    /// Every stored occurrence of the job, in no particular order.
    fn load_history(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Vec<ExecutionRecord<String>>> {
        self.lifecycle.ensure_open()?;
        let mut con = self.connection()?;

        let values: Vec<String> = redis::cmd("HVALS")
            .arg(self.keys.executions(organization_id, job_id))
            .query(&mut con)
            .map_err(|e| storage_error("load_history", e))?;

        values.iter().map(|raw| decode_record(raw)).collect()
    }

    fn find_last<F>(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        filter: F,
    ) -> RepositoryResult<Option<JobExecution<T>>>
    where
        F: Fn(&ExecutionRecord<String>) -> bool,
    {
        self.load_history(job_id, organization_id)?
            .into_iter()
            .filter(|row| filter(row))
            .max_by_key(|row| row.key.scheduled())
            .map(|row| row.into_execution(|raw| self.decode_result(&raw)))
            .transpose()
    }

    fn decode_result(&self, raw: &str) -> RepositoryResult<T> {
        Ok(self.codec.decode(raw)?)
    }
}

impl<T, C> JobExecutionRepository<T> for RedisExecutionRepository<T, C>
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
        let encoded = self.codec.encode(&result)?;
        let row = self.apply(job_id, organization_id, scheduled, Transition::Succeed(encoded))?;
        Ok(row.into_success(|_| Ok(()))?.map(|()| result))
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
        self.find_last(job_id, organization_id, |_| true)
    }

    fn get_last_completed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>> {
        self.find_last(job_id, organization_id, ExecutionRecord::is_terminal)
    }

    fn get_last_success(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<Success<T>>> {
        Ok(self
            .find_last(job_id, organization_id, ExecutionRecord::is_success)?
            .and_then(JobExecution::into_success))
    }

    /// One pipeline: `SISMEMBER` + `HVALS` per requested job.
    fn get_last_success_batch(
        &self,
        job_ids: &HashSet<JobId>,
        organization_id: OrganizationId,
        cutoff: NaiveDate,
    ) -> RepositoryResult<HashMap<JobId, Success<T>>> {
        self.lifecycle.ensure_open()?;
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let ids: Vec<JobId> = job_ids.iter().copied().collect();
        let jobs_key = self.keys.jobs(organization_id);
        let mut pipe = redis::pipe();
        for job_id in &ids {
            pipe.cmd("SISMEMBER").arg(&jobs_key).arg(job_id.to_string());
            pipe.cmd("HVALS").arg(self.keys.executions(organization_id, *job_id));
        }

        let mut con = self.connection()?;
        let replies: Vec<redis::Value> = pipe
            .query(&mut con)
            .map_err(|e| storage_error("get_last_success_batch", e))?;

        let mut successes = HashMap::new();
        for (job_id, reply) in ids.into_iter().zip(replies.chunks_exact(2)) {
            let known: bool = redis::from_redis_value(&reply[0])
                .map_err(|e| storage_error("get_last_success_batch", e))?;
            if !known {
                continue;
            }
            let values: Vec<String> = redis::from_redis_value(&reply[1])
                .map_err(|e| storage_error("get_last_success_batch", e))?;

            let mut latest: Option<ExecutionRecord<String>> = None;
            for raw in &values {
                let row = decode_record(raw)?;
                if row.is_success()
                    && row.key.is_on_or_after(cutoff)
                    && latest.as_ref().map_or(true, |l| row.key.scheduled() > l.key.scheduled())
                {
                    latest = Some(row);
                }
            }
            if let Some(row) = latest {
                successes.insert(job_id, row.into_success(|raw| self.decode_result(&raw))?);
            }
        }
        Ok(successes)
    }
}

/// Job registry backed by the per-organization job set.
#[derive(Debug, Clone)]
pub struct RedisJobRegistry {
    client: Arc<redis::Client>,
    keys: Keys,
}

impl RedisJobRegistry {
    pub fn new(client: Arc<redis::Client>, prefix: Option<String>) -> Self {
        Self {
            client,
            keys: Keys {
                prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            },
        }
    }
}

impl JobRegistry for RedisJobRegistry {
    fn register(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<()> {
        let mut con = self
            .client
            .get_connection()
            .map_err(|e| storage_error("connect", e))?;
        let _: i64 = redis::cmd("SADD")
            .arg(self.keys.jobs(organization_id))
            .arg(job_id.to_string())
            .query(&mut con)
            .map_err(|e| storage_error("register_job", e))?;
        Ok(())
    }

    fn contains(&self, job_id: JobId, organization_id: OrganizationId) -> RepositoryResult<bool> {
        let mut con = self
            .client
            .get_connection()
            .map_err(|e| storage_error("connect", e))?;
        redis::cmd("SISMEMBER")
            .arg(self.keys.jobs(organization_id))
            .arg(job_id.to_string())
            .query(&mut con)
            .map_err(|e| storage_error("job_exists", e))
    }
}

fn decode_record(raw: &str) -> RepositoryResult<ExecutionRecord<String>> {
    serde_json::from_str(raw)
        .map_err(|e| RepositoryError::serialization(format!("corrupt execution row: {e}")))
}

/// Reject `row` when the stored row was written after it.
fn ensure_not_superseded(
    current: Option<&ExecutionRecord<String>>,
    row: &ExecutionRecord<String>,
) -> RepositoryResult<()> {
    match current {
        Some(stored) if stored.updated_at > row.updated_at => Err(RepositoryError::concurrency(format!(
            "execution {}/{} at {} was updated at {}, after this transition",
            row.key.organization_id(),
            row.key.job_id(),
            Keys::field(row.key.scheduled()),
            Keys::field(stored.updated_at),
        ))),
        _ => Ok(()),
    }
}

fn storage_error(operation: &str, err: redis::RedisError) -> RepositoryError {
    error!(operation, error = %err, "redis operation failed");
    RepositoryError::storage(err)
}
