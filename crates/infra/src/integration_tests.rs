//! Integration tests for the persistent backends and concurrent use.
//!
//! The Postgres suite runs when `DATABASE_URL` is set and the Redis suite
//! (feature `redis`) when `REDIS_URL` is set; otherwise they are skipped.
//!
//! Verifies:
//! - Every backend passes the shared conformance cases
//! - Concurrent transitions on one occurrence leave a row written by exactly
//!   one of them, with or without the last-success cache
//! - Organizations stay isolated under concurrent writers

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use chrono::Duration;
    use runledger_core::{JobExecution, JobId, OrganizationId};

    use crate::conformance::{self, ConformanceHarness, SampleResult};
    use crate::registry::JobRegistry;
    use crate::repository::{
        CachingExecutionRepository, InMemoryExecutionRepository, JobExecutionRepository,
    };

    fn init_tracing() {
        runledger_observability::init();
    }

    mod postgres {
        use std::sync::Arc;

        use sqlx::PgPool;
        use tokio::runtime::Runtime;

        use super::*;
        use crate::codec::JsonCodec;
        use crate::repository::postgres::{self, PostgresExecutionRepository, PostgresJobRegistry};

        struct PostgresHarness {
            runtime: Runtime,
            pool: Arc<PgPool>,
        }

        impl PostgresHarness {
            fn connect(url: &str) -> Self {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                    .unwrap();
                let pool = runtime.block_on(async {
                    let pool = PgPool::connect(url).await.unwrap();
                    postgres::migrate(&pool).await.unwrap();
                    pool
                });
                Self {
                    runtime,
                    pool: Arc::new(pool),
                }
            }
        }

        impl ConformanceHarness for PostgresHarness {
            type Result = SampleResult;
            type Repository = PostgresExecutionRepository<SampleResult>;

            fn new_result(&mut self) -> SampleResult {
                SampleResult::random()
            }

            fn repository(&mut self) -> Self::Repository {
                PostgresExecutionRepository::from_shared(
                    Arc::clone(&self.pool),
                    self.runtime.handle().clone(),
                    JsonCodec::new(),
                )
            }

            fn ensure_job_exists(
                &mut self,
                repository: &Self::Repository,
                job_id: JobId,
                organization_id: OrganizationId,
            ) {
                PostgresJobRegistry::new(Arc::clone(repository.pool()), self.runtime.handle().clone())
                    .register(job_id, organization_id)
                    .unwrap();
            }
        }

        #[test]
        fn postgres_backend_conforms() {
            let Ok(url) = std::env::var(crate::config::DATABASE_URL_ENV) else {
                eprintln!("DATABASE_URL not set; skipping postgres conformance");
                return;
            };
            init_tracing();

            let mut harness = PostgresHarness::connect(&url);
            conformance::run_all(&mut harness);
        }
    }

    #[cfg(feature = "redis")]
    mod redis {
        use uuid::Uuid;

        use super::*;
        use crate::repository::RedisExecutionRepository;

        struct RedisHarness {
            url: String,
            prefix: String,
        }

        impl ConformanceHarness for RedisHarness {
            type Result = SampleResult;
            type Repository = RedisExecutionRepository<SampleResult>;

            fn new_result(&mut self) -> SampleResult {
                SampleResult::random()
            }

            fn repository(&mut self) -> Self::Repository {
                RedisExecutionRepository::new(&self.url, Some(self.prefix.clone())).unwrap()
            }

            fn ensure_job_exists(
                &mut self,
                repository: &Self::Repository,
                job_id: JobId,
                organization_id: OrganizationId,
            ) {
                repository.registry().register(job_id, organization_id).unwrap();
            }
        }

        #[test]
        fn redis_backend_conforms() {
            let Ok(url) = std::env::var(crate::config::REDIS_URL_ENV) else {
                eprintln!("REDIS_URL not set; skipping redis conformance");
                return;
            };
            init_tracing();

            let mut harness = RedisHarness {
                url,
                prefix: format!("runledger-test-{}", Uuid::now_v7()),
            };
            conformance::run_all(&mut harness);
        }
    }

    /// Race eight workers through start + completion of one occurrence: even
    /// workers succeed with their id, odd ones fail with `worker {id} failed`.
    fn race_on_one_occurrence<R>(repository: Arc<R>, job_id: JobId, org: OrganizationId)
    where
        R: JobExecutionRepository<u32> + 'static,
    {
        let scheduled = runledger_core::execution::now() - Duration::minutes(5);

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let repository = Arc::clone(&repository);
                thread::spawn(move || {
                    repository.job_started(job_id, org, scheduled).unwrap();
                    if i % 2 == 0 {
                        repository.job_succeeded(job_id, org, scheduled, i).unwrap();
                    } else {
                        repository
                            .job_failed(job_id, org, scheduled, &anyhow::anyhow!("worker {i} failed"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let last = repository.get_last_scheduled(job_id, org).unwrap().unwrap();
        assert_eq!(last.scheduled(), runledger_core::execution::normalize(scheduled));
        if let Some(completed_at) = last.completed_at() {
            assert!(last.started_at() <= completed_at);
        }

        match &last {
            JobExecution::Started(_) => {}
            JobExecution::Success(success) => {
                assert_eq!(success.result % 2, 0, "success written by an odd worker");
                assert!(success.result < 8);
            }
            JobExecution::Failure(failure) => {
                let worker: u32 = failure
                    .error
                    .strip_prefix("worker ")
                    .and_then(|rest| rest.split(' ').next())
                    .and_then(|id| id.parse().ok())
                    .unwrap_or_else(|| panic!("unexpected error text: {}", failure.error));
                assert_eq!(worker % 2, 1, "failure written by an even worker");
                assert!(failure.error.starts_with(&format!("worker {worker} failed")));
            }
        }

        // The last success, if any, is one an even worker issued.
        if let Some(success) = repository.get_last_success(job_id, org).unwrap() {
            assert_eq!(success.result % 2, 0);
            assert_eq!(success.scheduled(), last.scheduled());
        }
    }

    #[test]
    fn concurrent_transitions_on_one_occurrence_leave_one_transition() {
        init_tracing();
        let repository: Arc<InMemoryExecutionRepository<u32>> = Arc::new(InMemoryExecutionRepository::new());
        repository.open().unwrap();

        let org = OrganizationId::new();
        let job_id = JobId::new();
        repository.registry().register(job_id, org).unwrap();

        race_on_one_occurrence(repository, job_id, org);
    }

    #[test]
    fn concurrent_transitions_through_the_cache_leave_one_transition() {
        let repository = Arc::new(CachingExecutionRepository::new(
            InMemoryExecutionRepository::<u32>::new(),
        ));
        repository.open().unwrap();

        let org = OrganizationId::new();
        let job_id = JobId::new();
        repository.inner().registry().register(job_id, org).unwrap();

        race_on_one_occurrence(Arc::clone(&repository), job_id, org);

        // What the cache serves agrees with the store behind it.
        assert_eq!(
            repository.get_last_success(job_id, org).unwrap(),
            repository.inner().get_last_success(job_id, org).unwrap()
        );
    }

    #[test]
    fn concurrent_writers_stay_isolated_per_organization() {
        let repository: Arc<InMemoryExecutionRepository<u32>> = Arc::new(InMemoryExecutionRepository::new());
        repository.open().unwrap();
        let today = runledger_core::execution::now();

        let tenants: Vec<(OrganizationId, JobId)> = (0..6)
            .map(|_| {
                let org = OrganizationId::new();
                let job_id = JobId::new();
                repository.registry().register(job_id, org).unwrap();
                (org, job_id)
            })
            .collect();

        let handles: Vec<_> = tenants
            .iter()
            .enumerate()
            .map(|(n, &(org, job_id))| {
                let repository = Arc::clone(&repository);
                thread::spawn(move || {
                    for hour in 0..4 {
                        let scheduled = today - Duration::hours(hour);
                        repository.job_succeeded(job_id, org, scheduled, n as u32).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for (n, &(org, job_id)) in tenants.iter().enumerate() {
            let success = repository.get_last_success(job_id, org).unwrap().unwrap();
            assert_eq!(success.result, n as u32);
            assert_eq!(success.scheduled(), runledger_core::execution::normalize(today));

            let batch = repository
                .get_last_success_batch(&HashSet::from([job_id]), org, today.date_naive())
                .unwrap();
            assert_eq!(batch.len(), 1);

            // Another organization's registry entry does not leak into this one.
            let (other_org, _) = tenants[(n + 1) % tenants.len()];
            assert!(repository.get_last_success(job_id, other_org).unwrap().is_none());
        }
    }
}
