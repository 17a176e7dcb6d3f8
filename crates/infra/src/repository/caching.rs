//! Last-success cache in front of any [`JobExecutionRepository`].
//!
//! Schedulers ask "when did this job last succeed?" far more often than jobs
//! complete, so the decorator keeps each job's latest `Success` in memory for
//! a bounded time:
//!
//! - `get_last_success` is served from the cache when the entry is fresh
//! - `get_last_success_batch` answers cached jobs locally and sends only the
//!   misses to the inner repository, in one call
//! - `job_succeeded` moves a fresh entry forward when the new success is at
//!   least as recent; an expired entry is dropped instead, since the inner
//!   repository may hold a newer success than the one just written
//! - `job_started` / `job_failed` on the cached occurrence drop the entry
//!
//! Writes made by other processes become visible once entries expire.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use runledger_core::{JobExecution, JobId, OrganizationId, Success};

use super::lifecycle::Lifecycle;
use super::r#trait::{JobExecutionRepository, RepositoryError, RepositoryResult};

/// Default time an entry stays fresh.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

struct CacheEntry<T> {
    success: Success<T>,
    cached_at: Instant,
}

pub struct CachingExecutionRepository<R, T> {
    inner: R,
    ttl: Duration,
    lifecycle: Lifecycle,
    entries: RwLock<HashMap<(OrganizationId, JobId), CacheEntry<T>>>,
    /// Bumped under the entries lock by every write that passes through.
    writes: AtomicU64,
    _result: PhantomData<fn() -> T>,
}

impl<R, T> CachingExecutionRepository<R, T> {
    pub fn new(inner: R) -> Self {
        Self::with_ttl(inner, DEFAULT_TTL)
    }

    pub fn with_ttl(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            lifecycle: Lifecycle::new("CachingExecutionRepository"),
            entries: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
            _result: PhantomData,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Number of cached entries, fresh or not.
    pub fn cached_len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

impl<R, T> CachingExecutionRepository<R, T>
where
    T: Clone,
{
    fn lookup(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<Success<T>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RepositoryError::illegal_state("success cache lock poisoned"))?;

        Ok(entries
            .get(&(organization_id, job_id))
            .filter(|entry| self.is_fresh(entry))
            .map(|entry| entry.success.clone()))
    }

    fn is_fresh(&self, entry: &CacheEntry<T>) -> bool {
        entry.cached_at.elapsed() < self.ttl
    }

    fn write_entries(
        &self,
    ) -> RepositoryResult<RwLockWriteGuard<'_, HashMap<(OrganizationId, JobId), CacheEntry<T>>>> {
        self.entries
            .write()
            .map_err(|_| RepositoryError::illegal_state("success cache lock poisoned"))
    }

    /// Write counter to capture before reading from the inner repository.
    fn read_epoch(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    /// Cache `success`, read from the inner repository as the job's latest
    /// after `epoch` was captured.
    ///
    /// Skipped when a write went through since then (the read may predate
    /// it) or a fresh entry already holds a more recent occurrence.
    fn fill(&self, success: &Success<T>, epoch: u64) -> RepositoryResult<()> {
        let mut entries = self.write_entries()?;
        if self.writes.load(Ordering::Acquire) != epoch {
            return Ok(());
        }
        let slot = (success.key.organization_id(), success.key.job_id());
        let keep = entries
            .get(&slot)
            .is_some_and(|entry| self.is_fresh(entry) && entry.success.scheduled() > success.scheduled());
        if !keep {
            entries.insert(
                slot,
                CacheEntry {
                    success: success.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        Ok(())
    }

    /// Account for a success just written through to the inner repository.
    ///
    /// Only a fresh entry is known to hold the job's latest success, so only a
    /// fresh entry is moved forward. Without one the inner repository may hold
    /// a newer success than `success`; the slot is emptied and the next read
    /// fills it from there.
    fn advance(&self, success: &Success<T>) -> RepositoryResult<()> {
        let mut entries = self.write_entries()?;
        self.writes.fetch_add(1, Ordering::AcqRel);
        let slot = (success.key.organization_id(), success.key.job_id());
        let fresh = entries.get(&slot).map(|entry| self.is_fresh(entry));
        match fresh {
            Some(true) => {
                if let Some(entry) = entries
                    .get_mut(&slot)
                    .filter(|entry| entry.success.scheduled() <= success.scheduled())
                {
                    entry.success = success.clone();
                    entry.cached_at = Instant::now();
                }
            }
            Some(false) => {
                entries.remove(&slot);
                debug!(
                    job_id = %success.job_id(),
                    organization_id = %success.key.organization_id(),
                    "dropped expired cached success"
                );
            }
            None => {}
        }
        Ok(())
    }

    /// Drop the entry if it describes the occurrence at `scheduled`.
    fn forget(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let mut entries = self.write_entries()?;
        self.writes.fetch_add(1, Ordering::AcqRel);

        let scheduled = runledger_core::execution::normalize(scheduled);
        let slot = (organization_id, job_id);
        if entries
            .get(&slot)
            .is_some_and(|entry| entry.success.scheduled() == scheduled)
        {
            entries.remove(&slot);
            debug!(job_id = %job_id, organization_id = %organization_id, "evicted cached success");
        }
        Ok(())
    }
}

impl<R, T> JobExecutionRepository<T> for CachingExecutionRepository<R, T>
where
    R: JobExecutionRepository<T>,
    T: Clone + Send + Sync,
{
    fn open(&self) -> RepositoryResult<()> {
        self.lifecycle.open()?;
        if let Err(e) = self.inner.open() {
            self.lifecycle.close()?;
            return Err(e);
        }
        Ok(())
    }

    fn close(&self) -> RepositoryResult<()> {
        self.lifecycle.close()?;
        if let Err(e) = self.inner.close() {
            self.lifecycle.open()?;
            return Err(e);
        }
        self.write_entries()?.clear();
        Ok(())
    }

    fn job_started(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        self.lifecycle.ensure_open()?;
        self.inner.job_started(job_id, organization_id, scheduled)?;
        self.forget(job_id, organization_id, scheduled)
    }

    fn job_succeeded(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        result: T,
    ) -> RepositoryResult<Success<T>> {
        self.lifecycle.ensure_open()?;
        let success = self
            .inner
            .job_succeeded(job_id, organization_id, scheduled, result)?;
        self.advance(&success)?;
        Ok(success)
    }

    fn job_failed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
        scheduled: DateTime<Utc>,
        error: &anyhow::Error,
    ) -> RepositoryResult<()> {
        self.lifecycle.ensure_open()?;
        self.inner
            .job_failed(job_id, organization_id, scheduled, error)?;
        self.forget(job_id, organization_id, scheduled)
    }

    fn get_last_scheduled(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>> {
        self.lifecycle.ensure_open()?;
        self.inner.get_last_scheduled(job_id, organization_id)
    }

    fn get_last_completed(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<JobExecution<T>>> {
        self.lifecycle.ensure_open()?;
        self.inner.get_last_completed(job_id, organization_id)
    }

    fn get_last_success(
        &self,
        job_id: JobId,
        organization_id: OrganizationId,
    ) -> RepositoryResult<Option<Success<T>>> {
        self.lifecycle.ensure_open()?;
        if let Some(cached) = self.lookup(job_id, organization_id)? {
            return Ok(Some(cached));
        }

        let epoch = self.read_epoch();
        let success = self.inner.get_last_success(job_id, organization_id)?;
        if let Some(success) = &success {
            self.fill(success, epoch)?;
        }
        Ok(success)
    }

    fn get_last_success_batch(
        &self,
        job_ids: &HashSet<JobId>,
        organization_id: OrganizationId,
        cutoff: NaiveDate,
    ) -> RepositoryResult<HashMap<JobId, Success<T>>> {
        self.lifecycle.ensure_open()?;

        let mut successes = HashMap::new();
        let mut misses = HashSet::new();
        for &job_id in job_ids {
            match self.lookup(job_id, organization_id)? {
                // The cached entry is the job's latest success.
                Some(cached) if cached.key.is_on_or_after(cutoff) => {
                    successes.insert(job_id, cached);
                }
                Some(_) => {}
                None => {
                    misses.insert(job_id);
                }
            }
        }

        debug!(
            organization_id = %organization_id,
            hits = job_ids.len() - misses.len(),
            misses = misses.len(),
            "batch success lookup"
        );

        if !misses.is_empty() {
            let epoch = self.read_epoch();
            let fetched = self
                .inner
                .get_last_success_batch(&misses, organization_id, cutoff)?;
            for success in fetched.values() {
                self.fill(success, epoch)?;
            }
            successes.extend(fetched);
        }
        Ok(successes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::conformance::{ConformanceHarness, SampleResult};
    use crate::registry::{InMemoryJobRegistry, JobRegistry};
    use crate::repository::InMemoryExecutionRepository;

    type Inner = InMemoryExecutionRepository<SampleResult, Arc<InMemoryJobRegistry>>;

    #[derive(Default)]
    struct CachingHarness;

    impl ConformanceHarness for CachingHarness {
        type Result = SampleResult;
        type Repository = CachingExecutionRepository<Inner, SampleResult>;

        fn new_result(&mut self) -> Self::Result {
            SampleResult::random()
        }

        fn repository(&mut self) -> Self::Repository {
            CachingExecutionRepository::new(InMemoryExecutionRepository::with_registry(Arc::new(
                InMemoryJobRegistry::new(),
            )))
        }

        fn ensure_job_exists(
            &mut self,
            repository: &Self::Repository,
            job_id: JobId,
            organization_id: OrganizationId,
        ) {
            repository
                .inner()
                .registry()
                .register(job_id, organization_id)
                .expect("register job");
        }
    }

    crate::execution_repository_conformance!(CachingHarness);

    /// Counts reads that reach the wrapped repository.
    struct Counting {
        inner: Inner,
        single_reads: AtomicUsize,
        batch_reads: AtomicUsize,
        batch_sizes: std::sync::Mutex<Vec<usize>>,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                inner: InMemoryExecutionRepository::with_registry(Arc::new(InMemoryJobRegistry::new())),
                single_reads: AtomicUsize::new(0),
                batch_reads: AtomicUsize::new(0),
                batch_sizes: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl JobExecutionRepository<SampleResult> for Counting {
        fn open(&self) -> RepositoryResult<()> {
            self.inner.open()
        }

        fn close(&self) -> RepositoryResult<()> {
            self.inner.close()
        }

        fn job_started(&self, job_id: JobId, org: OrganizationId, scheduled: DateTime<Utc>) -> RepositoryResult<()> {
            self.inner.job_started(job_id, org, scheduled)
        }

        fn job_succeeded(
            &self,
            job_id: JobId,
            org: OrganizationId,
            scheduled: DateTime<Utc>,
            result: SampleResult,
        ) -> RepositoryResult<Success<SampleResult>> {
            self.inner.job_succeeded(job_id, org, scheduled, result)
        }

        fn job_failed(
            &self,
            job_id: JobId,
            org: OrganizationId,
            scheduled: DateTime<Utc>,
            error: &anyhow::Error,
        ) -> RepositoryResult<()> {
            self.inner.job_failed(job_id, org, scheduled, error)
        }

        fn get_last_scheduled(
            &self,
            job_id: JobId,
            org: OrganizationId,
        ) -> RepositoryResult<Option<JobExecution<SampleResult>>> {
            self.inner.get_last_scheduled(job_id, org)
        }

        fn get_last_completed(
            &self,
            job_id: JobId,
            org: OrganizationId,
        ) -> RepositoryResult<Option<JobExecution<SampleResult>>> {
            self.inner.get_last_completed(job_id, org)
        }

        fn get_last_success(
            &self,
            job_id: JobId,
            org: OrganizationId,
        ) -> RepositoryResult<Option<Success<SampleResult>>> {
            self.single_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_last_success(job_id, org)
        }

        fn get_last_success_batch(
            &self,
            job_ids: &HashSet<JobId>,
            org: OrganizationId,
            cutoff: NaiveDate,
        ) -> RepositoryResult<HashMap<JobId, Success<SampleResult>>> {
            self.batch_reads.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(job_ids.len());
            self.inner.get_last_success_batch(job_ids, org, cutoff)
        }
    }

    fn setup(jobs: usize) -> (CachingExecutionRepository<Counting, SampleResult>, OrganizationId, Vec<JobId>) {
        let repo = CachingExecutionRepository::new(Counting::new());
        repo.open().unwrap();
        let org = OrganizationId::new();
        let ids: Vec<_> = (0..jobs).map(|_| JobId::new()).collect();
        for &id in &ids {
            repo.inner().inner.registry().register(id, org).unwrap();
        }
        (repo, org, ids)
    }

    #[test]
    fn falls_back_to_inner_then_serves_from_cache() {
        let (repo, org, ids) = setup(1);
        let scheduled = runledger_core::execution::now();
        repo.inner()
            .job_succeeded(ids[0], org, scheduled, SampleResult::random())
            .unwrap();

        let first = repo.get_last_success(ids[0], org).unwrap().unwrap();
        let second = repo.get_last_success(ids[0], org).unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.inner().single_reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn success_moves_fresh_entry_forward() {
        let (repo, org, ids) = setup(1);
        let earlier = runledger_core::execution::now() - chrono::Duration::hours(1);
        repo.job_succeeded(ids[0], org, earlier, SampleResult::random()).unwrap();
        repo.get_last_success(ids[0], org).unwrap();
        assert_eq!(repo.inner().single_reads.load(Ordering::SeqCst), 1);

        let written = repo
            .job_succeeded(ids[0], org, runledger_core::execution::now(), SampleResult::random())
            .unwrap();

        let cached = repo.get_last_success(ids[0], org).unwrap().unwrap();
        assert_eq!(cached, written);
        assert_eq!(repo.inner().single_reads.load(Ordering::SeqCst), 1);

        let direct = repo.inner().get_last_success(ids[0], org).unwrap().unwrap();
        assert_eq!(direct, cached);
    }

    #[test]
    fn success_without_cached_entry_is_read_back_from_inner() {
        let (repo, org, ids) = setup(1);
        let written = repo
            .job_succeeded(ids[0], org, runledger_core::execution::now(), SampleResult::random())
            .unwrap();
        assert_eq!(repo.cached_len(), 0);

        assert_eq!(repo.get_last_success(ids[0], org).unwrap(), Some(written));
        assert_eq!(repo.inner().single_reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_overtaken_by_a_write_is_not_cached() {
        let (repo, org, ids) = setup(1);
        let latest = runledger_core::execution::now();
        repo.job_succeeded(ids[0], org, latest - chrono::Duration::hours(1), SampleResult::random())
            .unwrap();

        // A reader fetches the older success, then a newer one lands before it fills.
        let epoch = repo.read_epoch();
        let stale = repo.inner().get_last_success(ids[0], org).unwrap().unwrap();
        let newer = repo.job_succeeded(ids[0], org, latest, SampleResult::random()).unwrap();
        repo.fill(&stale, epoch).unwrap();

        assert_eq!(repo.cached_len(), 0);
        assert_eq!(repo.get_last_success(ids[0], org).unwrap(), Some(newer));
    }

    #[test]
    fn older_success_after_expiry_does_not_hide_newer_one() {
        let repo = CachingExecutionRepository::with_ttl(Counting::new(), Duration::from_millis(50));
        repo.open().unwrap();
        let org = OrganizationId::new();
        let job_id = JobId::new();
        repo.inner().inner.registry().register(job_id, org).unwrap();

        let latest = runledger_core::execution::now();
        let newer = repo.job_succeeded(job_id, org, latest, SampleResult::random()).unwrap();
        assert_eq!(repo.get_last_success(job_id, org).unwrap(), Some(newer.clone()));

        std::thread::sleep(Duration::from_millis(80));
        repo.job_succeeded(job_id, org, latest - chrono::Duration::hours(2), SampleResult::random())
            .unwrap();

        assert_eq!(repo.get_last_success(job_id, org).unwrap(), Some(newer.clone()));
        let batch = repo
            .get_last_success_batch(&HashSet::from([job_id]), org, latest.date_naive())
            .unwrap();
        assert_eq!(batch.get(&job_id), Some(&newer));
    }

    #[test]
    fn older_success_after_reopen_does_not_hide_newer_one() {
        let (repo, org, ids) = setup(1);
        let latest = runledger_core::execution::now();
        let newer = repo.job_succeeded(ids[0], org, latest, SampleResult::random()).unwrap();
        repo.get_last_success(ids[0], org).unwrap();

        repo.close().unwrap();
        assert_eq!(repo.cached_len(), 0);
        repo.open().unwrap();

        repo.job_succeeded(ids[0], org, latest - chrono::Duration::hours(2), SampleResult::random())
            .unwrap();
        assert_eq!(repo.get_last_success(ids[0], org).unwrap(), Some(newer));
    }

    #[test]
    fn failed_inner_open_leaves_decorator_closed() {
        let repo = CachingExecutionRepository::new(Counting::new());
        repo.inner().open().unwrap();

        assert!(repo.open().unwrap_err().is_illegal_state());
        assert!(repo
            .get_last_success(JobId::new(), OrganizationId::new())
            .unwrap_err()
            .is_illegal_state());

        repo.inner().close().unwrap();
        repo.open().unwrap();
        repo.close().unwrap();
    }

    #[test]
    fn older_success_does_not_replace_newer_entry() {
        let (repo, org, ids) = setup(1);
        let newer = runledger_core::execution::now();
        let older = newer - chrono::Duration::days(1);

        repo.job_succeeded(ids[0], org, newer, SampleResult::random()).unwrap();
        repo.job_succeeded(ids[0], org, older, SampleResult::random()).unwrap();

        let cached = repo.get_last_success(ids[0], org).unwrap().unwrap();
        assert_eq!(cached.scheduled(), newer);
    }

    #[test]
    fn failure_of_cached_occurrence_evicts_it() {
        let (repo, org, ids) = setup(1);
        let scheduled = runledger_core::execution::now();
        repo.job_succeeded(ids[0], org, scheduled, SampleResult::random()).unwrap();
        repo.get_last_success(ids[0], org).unwrap();
        assert_eq!(repo.cached_len(), 1);

        repo.job_failed(ids[0], org, scheduled, &anyhow::anyhow!("re-evaluation failed"))
            .unwrap();
        assert_eq!(repo.cached_len(), 0);
        assert!(repo.get_last_success(ids[0], org).unwrap().is_none());
    }

    #[test]
    fn expired_entries_are_refetched() {
        let repo = CachingExecutionRepository::with_ttl(Counting::new(), Duration::ZERO);
        repo.open().unwrap();
        let org = OrganizationId::new();
        let job_id = JobId::new();
        repo.inner().inner.registry().register(job_id, org).unwrap();
        repo.job_succeeded(job_id, org, runledger_core::execution::now(), SampleResult::random())
            .unwrap();

        repo.get_last_success(job_id, org).unwrap();
        repo.get_last_success(job_id, org).unwrap();
        assert_eq!(repo.inner().single_reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batch_reads_only_misses_from_inner() {
        let (repo, org, ids) = setup(6);
        let scheduled = runledger_core::execution::now();
        for &id in &ids {
            repo.inner()
                .job_succeeded(id, org, scheduled, SampleResult::random())
                .unwrap();
        }
        let cutoff = scheduled.date_naive();

        // Warm half of the jobs.
        let (cached, uncached) = ids.split_at(3);
        for &id in cached {
            repo.get_last_success(id, org).unwrap();
        }

        let cached_set: HashSet<_> = cached.iter().copied().collect();
        let from_cache = repo.get_last_success_batch(&cached_set, org, cutoff).unwrap();
        assert_eq!(from_cache.len(), 3);
        assert_eq!(repo.inner().batch_reads.load(Ordering::SeqCst), 0);

        let all: HashSet<_> = ids.iter().copied().collect();
        let mixed = repo.get_last_success_batch(&all, org, cutoff).unwrap();
        assert_eq!(mixed.len(), 6);
        assert_eq!(repo.inner().batch_reads.load(Ordering::SeqCst), 1);
        assert_eq!(*repo.inner().batch_sizes.lock().unwrap(), vec![uncached.len()]);

        let again = repo.get_last_success_batch(&all, org, cutoff).unwrap();
        assert_eq!(again, mixed);
        assert_eq!(repo.inner().batch_reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cached_success_before_cutoff_is_excluded() {
        let (repo, org, ids) = setup(1);
        let scheduled = runledger_core::execution::now() - chrono::Duration::days(3);
        repo.job_succeeded(ids[0], org, scheduled, SampleResult::random()).unwrap();
        repo.get_last_success(ids[0], org).unwrap();

        let cutoff = runledger_core::execution::now().date_naive();
        let batch = repo
            .get_last_success_batch(&HashSet::from([ids[0]]), org, cutoff)
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(repo.inner().batch_reads.load(Ordering::SeqCst), 0);
    }
}
