//! In-memory backend for the wq job engine.
//!
//! Jobs live in a map guarded by a single async mutex, so every backend
//! operation is atomic. Nothing survives the process; this is the default
//! backend and the reference for the [`Backend`] contract.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wq_core::{Engine, EngineConfig};
//! use wq_memory::MemoryBackend;
//!
//! #[tokio::main]
//! async fn main() -> wq_core::Result<()> {
//!     let backend = MemoryBackend::builder().max_retries(3).build();
//!     let engine = Engine::start(backend, EngineConfig::default());
//!     engine.shutdown().await
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use wq_core::{
    Backend, Claim, FingerprintGuard, Job, JobId, JobStatus, Result, WqError,
};

/// Retry ceiling applied to jobs that do not set their own.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    next_id: i64,
    fingerprints: FingerprintGuard,
    leased: HashSet<JobId>,
    closed: bool,
}

impl State {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or(WqError::JobNotFound(id))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(WqError::Storage("memory backend is shut down".to_string()));
        }
        Ok(())
    }
}

/// In-memory job storage.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    max_retries: u32,
}

impl MemoryBackend {
    /// Create a backend with the default retry ceiling.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a new builder.
    pub fn builder() -> MemoryBackendBuilder {
        MemoryBackendBuilder::default()
    }

    /// Retry ceiling applied to jobs without their own.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for MemoryBackend.
#[derive(Debug)]
pub struct MemoryBackendBuilder {
    max_retries: u32,
}

impl Default for MemoryBackendBuilder {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl MemoryBackendBuilder {
    /// Set the default retry ceiling.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Build the MemoryBackend.
    pub fn build(self) -> MemoryBackend {
        MemoryBackend {
            state: Arc::new(Mutex::new(State {
                next_id: 1,
                ..State::default()
            })),
            max_retries: self.max_retries,
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn store(&self, mut job: Job, override_fingerprint: bool) -> Result<JobId> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let claim = state
            .fingerprints
            .try_claim(job.fingerprint.as_deref(), override_fingerprint)?;

        let id = JobId(state.next_id);
        state.next_id += 1;

        job.id = id;
        job.status = JobStatus::New;
        state.fingerprints.record(job.fingerprint.as_deref(), id);

        if let Claim::Overridden { existing } = claim {
            tracing::debug!(
                job_id = %id,
                existing = %existing,
                fingerprint = ?job.fingerprint,
                "Stored job alongside pending job with same fingerprint"
            );
        }

        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn fetch_ready(&self, queue: &str, limit: usize) -> Result<Vec<Job>> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut ready: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.is_ready(now) && !state.leased.contains(&job.id))
            .collect();
        ready.sort_by_key(|job| (job.run_after, job.id));
        ready.truncate(limit);

        let jobs: Vec<Job> = ready.into_iter().cloned().collect();
        for job in &jobs {
            state.leased.insert(job.id);
        }
        Ok(jobs)
    }

    async fn mark_processed(&self, id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        job.status = JobStatus::Processed;
        let fingerprint = job.fingerprint.clone();

        state.fingerprints.release(fingerprint.as_deref(), id);
        state.leased.remove(&id);
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: JobId,
        run_after: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<JobStatus> {
        let mut state = self.state.lock().await;
        let default_ceiling = self.max_retries;
        let job = state.job_mut(id)?;

        job.retries = job.retries.saturating_add(1);
        job.last_error = Some(error.to_string());
        let ceiling = job.max_retries.unwrap_or(default_ceiling);

        match run_after {
            Some(at) if job.retries <= ceiling => {
                job.run_after = at;
                job.status = JobStatus::New;
            }
            _ => job.status = JobStatus::Failed,
        }

        let status = job.status;
        let fingerprint = job.fingerprint.clone();
        if status.is_terminal() {
            state.fingerprints.release(fingerprint.as_deref(), id);
        }
        state.leased.remove(&id);
        Ok(status)
    }

    async fn release(&self, id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.job_mut(id)?;
        state.leased.remove(&id);
        Ok(())
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.status == JobStatus::New)
            .count())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let leased = state.leased.len();
        state.leased.clear();
        tracing::info!(leased, jobs = state.jobs.len(), "Memory backend shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wq_core::Backoff;

    #[tokio::test]
    async fn test_store_assigns_increasing_ids() {
        let backend = MemoryBackend::new();
        let a = backend.store(Job::new("q"), false).await.unwrap();
        let b = backend.store(Job::new("q"), false).await.unwrap();
        assert!(a.is_assigned());
        assert!(b > a);

        let stored = backend.job(a).await.unwrap().unwrap();
        assert_eq!(stored.id, a);
        assert_eq!(stored.status, JobStatus::New);
    }

    #[tokio::test]
    async fn test_fetch_orders_by_run_after_then_id() {
        let backend = MemoryBackend::new();
        let past = Utc::now() - chrono::Duration::seconds(10);

        let late = backend.store(Job::new("q"), false).await.unwrap();
        let early = backend
            .store(Job::new("q").run_after(past), false)
            .await
            .unwrap();
        let tie = backend
            .store(Job::new("q").run_after(past), false)
            .await
            .unwrap();

        let jobs = backend.fetch_ready("q", 10).await.unwrap();
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![early, tie, late]);
    }

    #[tokio::test]
    async fn test_fetch_skips_future_and_other_queues() {
        let backend = MemoryBackend::new();
        backend
            .store(Job::new("q").run_in(Duration::from_secs(60)), false)
            .await
            .unwrap();
        backend.store(Job::new("other"), false).await.unwrap();

        assert!(backend.fetch_ready("q", 10).await.unwrap().is_empty());
        assert_eq!(backend.queue_len("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fetch_respects_limit_and_leases() {
        let backend = MemoryBackend::new();
        for _ in 0..3 {
            backend.store(Job::new("q"), false).await.unwrap();
        }

        let first = backend.fetch_ready("q", 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(backend.fetch_ready("q", 0).await.unwrap().is_empty());

        let second = backend.fetch_ready("q", 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(backend.fetch_ready("q", 10).await.unwrap().is_empty());

        backend.release(first[0].id).await.unwrap();
        let again = backend.fetch_ready("q", 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
    }

    #[tokio::test]
    async fn test_fingerprint_conflict() {
        let backend = MemoryBackend::new();
        let first = backend
            .store(Job::new("q").fingerprint("f"), false)
            .await
            .unwrap();

        let err = backend
            .store(Job::new("q").fingerprint("f"), false)
            .await
            .unwrap_err();
        match err {
            WqError::FingerprintConflict { fingerprint, existing } => {
                assert_eq!(fingerprint, "f");
                assert_eq!(existing, first);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Fingerprints are global across queues.
        assert!(backend
            .store(Job::new("other").fingerprint("f"), false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rejected_store_leaves_existing_job_untouched() {
        let backend = MemoryBackend::new();
        let run_after = Utc::now() + chrono::Duration::minutes(10);
        let first = backend
            .store(
                Job::new("q")
                    .fingerprint("f")
                    .insert("version", 1)
                    .run_after(run_after),
                false,
            )
            .await
            .unwrap();
        let before = backend.job(first).await.unwrap().unwrap();

        let rejected = backend
            .store(
                Job::new("q")
                    .fingerprint("f")
                    .insert("version", 2)
                    .run_after(Utc::now()),
                false,
            )
            .await;
        assert!(matches!(rejected, Err(WqError::FingerprintConflict { .. })));

        let after = backend.job(first).await.unwrap().unwrap();
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.payload.get("version"), Some(&serde_json::json!(1)));
        assert_eq!(after.run_after, run_after);
        assert_eq!(after.status, JobStatus::New);
        assert_eq!(backend.queue_len("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fingerprint_override_keeps_both() {
        let backend = MemoryBackend::new();
        let first = backend
            .store(Job::new("q").fingerprint("f"), false)
            .await
            .unwrap();
        let second = backend
            .store(Job::new("q").fingerprint("f"), true)
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(backend.queue_len("q").await.unwrap(), 2);
        assert_eq!(backend.fetch_ready("q", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fingerprint_freed_once_processed() {
        let backend = MemoryBackend::new();
        let id = backend
            .store(Job::new("q").fingerprint("f"), false)
            .await
            .unwrap();
        backend.fetch_ready("q", 1).await.unwrap();
        backend.mark_processed(id).await.unwrap();

        assert_eq!(
            backend.job(id).await.unwrap().unwrap().status,
            JobStatus::Processed
        );
        assert!(backend
            .store(Job::new("q").fingerprint("f"), false)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_fingerprint_held_while_retrying() {
        let backend = MemoryBackend::new();
        let id = backend
            .store(Job::new("q").fingerprint("f"), false)
            .await
            .unwrap();

        let status = backend
            .mark_failed(id, Some(Utc::now()), "boom")
            .await
            .unwrap();
        assert_eq!(status, JobStatus::New);
        assert!(backend
            .store(Job::new("q").fingerprint("f"), false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_concurrent_store_single_winner() {
        let backend = MemoryBackend::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.store(Job::new("q").fingerprint("same"), false).await
            }));
        }

        let mut stored = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => stored += 1,
                Err(WqError::FingerprintConflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(conflicts, 15);
    }

    #[tokio::test]
    async fn test_mark_failed_retries_until_ceiling() {
        let backend = MemoryBackend::builder().max_retries(2).build();
        let id = backend.store(Job::new("q"), false).await.unwrap();
        let retry_at = Utc::now() + chrono::Duration::seconds(30);

        assert_eq!(
            backend.mark_failed(id, Some(retry_at), "one").await.unwrap(),
            JobStatus::New
        );
        assert_eq!(
            backend.mark_failed(id, Some(retry_at), "two").await.unwrap(),
            JobStatus::New
        );
        assert_eq!(
            backend.mark_failed(id, Some(retry_at), "three").await.unwrap(),
            JobStatus::Failed
        );

        let job = backend.job(id).await.unwrap().unwrap();
        assert_eq!(job.retries, 3);
        assert_eq!(job.last_error.as_deref(), Some("three"));
        assert_eq!(backend.queue_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_per_job_ceiling_overrides_default() {
        let backend = MemoryBackend::new();
        let id = backend
            .store(Job::new("q").max_retries(0), false)
            .await
            .unwrap();
        let status = backend
            .mark_failed(id, Some(Utc::now()), "boom")
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_mark_failed_without_retry_is_terminal() {
        let backend = MemoryBackend::new();
        let id = backend
            .store(Job::new("q").fingerprint("f"), false)
            .await
            .unwrap();
        let status = backend.mark_failed(id, None, "fatal").await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert!(backend
            .store(Job::new("q").fingerprint("f"), false)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_repeated_failures_back_off_further() {
        let backend = MemoryBackend::builder().max_retries(6).build();
        let backoff = Backoff::seeded(7);
        let id = backend.store(Job::new("q"), false).await.unwrap();

        // First retry's jitter range overlaps the second's; compare from there on.
        let job = backend.job(id).await.unwrap().unwrap();
        let at = backoff.next_run_after(job.retries + 1, job.run_after);
        backend.mark_failed(id, Some(at), "boom").await.unwrap();

        let mut previous = at;
        let mut last_gap = chrono::Duration::zero();
        for _ in 0..4 {
            let job = backend.job(id).await.unwrap().unwrap();
            let at = backoff.next_run_after(job.retries + 1, job.run_after);
            backend.mark_failed(id, Some(at), "boom").await.unwrap();

            let job = backend.job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::New);
            let gap = job.run_after - previous;
            assert!(gap > last_gap, "gap {gap} should exceed {last_gap}");
            last_gap = gap;
            previous = job.run_after;
        }
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.mark_processed(JobId(99)).await,
            Err(WqError::JobNotFound(JobId(99)))
        ));
        assert!(backend.job(JobId(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_releases_leases_and_refuses_work() {
        let backend = MemoryBackend::new();
        let id = backend.store(Job::new("q"), false).await.unwrap();
        assert_eq!(backend.fetch_ready("q", 1).await.unwrap().len(), 1);

        backend.shutdown().await.unwrap();
        backend.shutdown().await.unwrap();

        assert!(matches!(
            backend.store(Job::new("q"), false).await,
            Err(WqError::Storage(_))
        ));
        assert!(backend.fetch_ready("q", 1).await.is_err());

        // In-flight executions can still settle their job.
        backend.mark_processed(id).await.unwrap();
        assert_eq!(
            backend.job(id).await.unwrap().unwrap().status,
            JobStatus::Processed
        );
    }

    #[tokio::test]
    async fn test_payload_survives_storage() {
        let backend = MemoryBackend::new();
        let id = backend
            .store(Job::new("q").insert("answer", 42), false)
            .await
            .unwrap();
        let job = backend.job(id).await.unwrap().unwrap();
        assert_eq!(job.payload.get("answer"), Some(&serde_json::json!(42)));
    }
}
