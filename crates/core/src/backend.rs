//! Backend abstraction for job storage.
//!
//! The engine only talks to storage through [`Backend`]. Every method is a
//! single atomic operation from the engine's point of view; the engine never
//! mutates a stored job's fields itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};

/// Backend trait for job storage operations.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Persist a new job and return its assigned id.
    ///
    /// Fails with `FingerprintConflict` when a job with the same non-empty
    /// fingerprint is pending and `override_fingerprint` is false. The
    /// fingerprint check and the insert must be atomic.
    async fn store(&self, job: Job, override_fingerprint: bool) -> Result<JobId>;

    /// Take up to `limit` ready jobs from `queue`.
    ///
    /// Ready means status `new` and `run_after <= now`. Jobs come back ordered
    /// by `run_after`, then by id. A returned job is leased to the caller and
    /// not returned again until it is marked or released.
    async fn fetch_ready(&self, queue: &str, limit: usize) -> Result<Vec<Job>>;

    /// Mark a job as processed.
    async fn mark_processed(&self, id: JobId) -> Result<()>;

    /// Record a failed attempt.
    ///
    /// With `run_after` set, the retry count is incremented and the job is
    /// re-queued as `new` at that time, unless the retry ceiling is reached,
    /// in which case it becomes `failed`. `None` fails the job permanently.
    /// Returns the resulting status.
    async fn mark_failed(
        &self,
        id: JobId,
        run_after: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<JobStatus>;

    /// Return a fetched job to the ready set without counting a failure.
    async fn release(&self, id: JobId) -> Result<()>;

    /// Look up a job by id.
    async fn job(&self, id: JobId) -> Result<Option<Job>>;

    /// Number of jobs in `new` status on `queue`, due or not.
    async fn queue_len(&self, queue: &str) -> Result<usize>;

    /// Release backend resources.
    async fn shutdown(&self) -> Result<()>;
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn store(&self, job: Job, override_fingerprint: bool) -> Result<JobId> {
        self.inner.store(job, override_fingerprint).await
    }

    async fn fetch_ready(&self, queue: &str, limit: usize) -> Result<Vec<Job>> {
        self.inner.fetch_ready(queue, limit).await
    }

    async fn mark_processed(&self, id: JobId) -> Result<()> {
        self.inner.mark_processed(id).await
    }

    async fn mark_failed(
        &self,
        id: JobId,
        run_after: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<JobStatus> {
        self.inner.mark_failed(id, run_after, error).await
    }

    async fn release(&self, id: JobId) -> Result<()> {
        self.inner.release(id).await
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.job(id).await
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        self.inner.queue_len(queue).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}
