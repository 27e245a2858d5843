//! Client for enqueueing jobs.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::backend::{Backend, SharedBackend};
use crate::error::{Result, WqError};
use crate::job::{Job, JobId};

/// Options for a single enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Store the job even when a pending job has the same fingerprint.
    pub override_matching_fingerprint: bool,
}

impl EnqueueOptions {
    /// Bypass the fingerprint conflict check. The pending job is left as is.
    pub fn override_matching_fingerprint() -> Self {
        Self {
            override_matching_fingerprint: true,
        }
    }
}

/// Client for enqueueing jobs to the queue.
///
/// Clients handed out by an [`Engine`](crate::Engine) wake its scheduler when
/// a job is due immediately and stop accepting jobs once it shuts down.
#[derive(Clone)]
pub struct Client<B: Backend + Clone = SharedBackend> {
    backend: B,
    wake: Option<Arc<Notify>>,
    closed: Arc<AtomicBool>,
}

impl Client<SharedBackend> {
    /// Create a new client with a shared backend.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_backend(SharedBackend::new(backend))
    }
}

impl<B: Backend + Clone> Client<B> {
    /// Create a new client with a specific backend.
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            wake: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn attached(backend: B, wake: Arc<Notify>, closed: Arc<AtomicBool>) -> Self {
        Self {
            backend,
            wake: Some(wake),
            closed,
        }
    }

    /// Enqueue a job.
    pub async fn enqueue(&self, job: Job) -> Result<JobId> {
        self.enqueue_with(job, EnqueueOptions::default()).await
    }

    /// Enqueue a job with options.
    ///
    /// Fails with `InvalidJob` before touching the backend when the job is
    /// malformed, and with `FingerprintConflict` when a pending job holds the
    /// same fingerprint and no override was requested.
    pub async fn enqueue_with(&self, job: Job, options: EnqueueOptions) -> Result<JobId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WqError::ShuttingDown);
        }
        job.validate()?;

        let queue = job.queue.clone();
        let due_now = job.run_after <= Utc::now();
        let job_id = self
            .backend
            .store(job, options.override_matching_fingerprint)
            .await?;

        if due_now {
            if let Some(wake) = &self.wake {
                wake.notify_one();
            }
        }

        tracing::debug!(job_id = %job_id, queue = %queue, "Job enqueued");
        Ok(job_id)
    }

    /// Look up a job by id.
    pub async fn job(&self, id: JobId) -> Result<Job> {
        self.backend
            .job(id)
            .await?
            .ok_or(WqError::JobNotFound(id))
    }

    /// Get the number of pending jobs on a queue.
    pub async fn queue_len(&self, queue: &str) -> Result<usize> {
        self.backend.queue_len(queue).await
    }
}
